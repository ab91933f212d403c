//! Session workspaces: cloning master include paths, diffing, merging back.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

/// Directory names never cloned, diffed or merged.
pub const EXCLUDED_DIRS: [&str; 5] = [".flowgate", ".git", "__pycache__", ".pytest_cache", "target"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

/// One file that differs between a workspace and master.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileChange {
    pub kind: ChangeKind,
    /// Path relative to the root, `/`-separated.
    pub relpath: String,
}

fn is_excluded(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name)),
        _ => false,
    }) || relative.extension().is_some_and(|ext| ext == "pyc")
}

fn relpath_string(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative paths of every regular file under `root/<include>` for each include path.
fn list_files(root: &Path, include_paths: &[String]) -> Result<BTreeSet<String>> {
    let mut files = BTreeSet::new();
    for include in include_paths {
        let base = root.join(include);
        if !base.exists() {
            continue;
        }
        for entry in WalkDir::new(&base).follow_links(false) {
            let entry = entry.with_context(|| format!("walk {}", base.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .with_context(|| format!("strip prefix {}", root.display()))?;
            if is_excluded(relative) {
                continue;
            }
            files.insert(relpath_string(relative));
        }
    }
    Ok(files)
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
    Ok(())
}

/// Copy every include path of `master` into a fresh `workspace`.
#[instrument(skip_all, fields(master = %master.display(), workspace = %workspace.display()))]
pub fn clone_master(master: &Path, workspace: &Path, include_paths: &[String]) -> Result<()> {
    fs::create_dir_all(workspace)
        .with_context(|| format!("create workspace {}", workspace.display()))?;
    let files = list_files(master, include_paths)?;
    for relpath in &files {
        copy_file(&master.join(relpath), &workspace.join(relpath))?;
    }
    debug!(files = files.len(), "cloned master include paths");
    Ok(())
}

/// Copy a whole directory tree (used for task starters).
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("strip prefix {}", src.display()))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create {}", target.display()))?;
        } else if entry.file_type().is_file() && !is_excluded(relative) {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Files under the include paths that differ between `workspace` and `master`,
/// sorted by path.
pub fn compute_changes(
    master: &Path,
    workspace: &Path,
    include_paths: &[String],
) -> Result<Vec<FileChange>> {
    let master_files = list_files(master, include_paths)?;
    let workspace_files = list_files(workspace, include_paths)?;
    let mut changes = Vec::new();
    for relpath in master_files.union(&workspace_files) {
        let kind = match (master_files.contains(relpath), workspace_files.contains(relpath)) {
            (false, true) => ChangeKind::Add,
            (true, false) => ChangeKind::Delete,
            _ => {
                let before = fs::read(master.join(relpath))
                    .with_context(|| format!("read master {relpath}"))?;
                let after = fs::read(workspace.join(relpath))
                    .with_context(|| format!("read workspace {relpath}"))?;
                if before == after {
                    continue;
                }
                ChangeKind::Modify
            }
        };
        changes.push(FileChange {
            kind,
            relpath: relpath.clone(),
        });
    }
    Ok(changes)
}

/// Original master contents for every path a merge touched.
#[derive(Debug)]
pub struct MergeBackup {
    master: PathBuf,
    originals: Vec<(String, Option<Vec<u8>>)>,
}

impl MergeBackup {
    pub fn touched(&self) -> Vec<String> {
        self.originals.iter().map(|(relpath, _)| relpath.clone()).collect()
    }

    /// Restore master to its state before the merge.
    #[instrument(skip_all, fields(master = %self.master.display(), files = self.originals.len()))]
    pub fn rollback(self) -> Result<()> {
        for (relpath, original) in self.originals.into_iter().rev() {
            let target = self.master.join(&relpath);
            match original {
                Some(bytes) => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("create {}", parent.display()))?;
                    }
                    fs::write(&target, bytes)
                        .with_context(|| format!("restore {}", target.display()))?;
                }
                None => {
                    if target.exists() {
                        fs::remove_file(&target)
                            .with_context(|| format!("remove {}", target.display()))?;
                    }
                }
            }
        }
        warn!("merge rolled back");
        Ok(())
    }
}

fn checked_relpath(relpath: &str) -> Result<&Path> {
    let path = Path::new(relpath);
    if path.is_absolute()
        || path
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(anyhow!("refusing to merge unsafe path {relpath}"));
    }
    Ok(path)
}

/// Apply `changes` from `workspace` onto `master`.
///
/// On any error the files already written are restored before returning.
#[instrument(skip_all, fields(master = %master.display(), changes = changes.len()))]
pub fn apply_changes(master: &Path, workspace: &Path, changes: &[FileChange]) -> Result<MergeBackup> {
    let mut backup = MergeBackup {
        master: master.to_path_buf(),
        originals: Vec::new(),
    };
    for change in changes {
        if let Err(err) = apply_one(master, workspace, change, &mut backup) {
            backup
                .rollback()
                .context("rollback after failed merge")?;
            return Err(err);
        }
    }
    debug!("applied workspace changes to master");
    Ok(backup)
}

fn apply_one(
    master: &Path,
    workspace: &Path,
    change: &FileChange,
    backup: &mut MergeBackup,
) -> Result<()> {
    let relative = checked_relpath(&change.relpath)?;
    let target = master.join(relative);
    let original = if target.is_file() {
        Some(fs::read(&target).with_context(|| format!("backup {}", target.display()))?)
    } else {
        None
    };
    backup.originals.push((change.relpath.clone(), original));
    match change.kind {
        ChangeKind::Add | ChangeKind::Modify => copy_file(&workspace.join(relative), &target),
        ChangeKind::Delete => {
            if target.exists() {
                fs::remove_file(&target)
                    .with_context(|| format!("delete {}", target.display()))?;
            }
            Ok(())
        }
    }
}
