//! Git adapter.
//!
//! Self-improve requires git on PATH: master's HEAD is recorded in the run
//! manifest and kept merges can be committed. Calls go through a small
//! explicit wrapper around `git` subprocesses.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Probe for a usable git binary.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the workdir is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .is_ok_and(|out| out.status.success())
    }

    pub fn init(&self) -> Result<()> {
        self.run_checked(&["init", "--quiet"])?;
        Ok(())
    }

    /// Full HEAD sha, or `None` for a repository without commits.
    pub fn head_sha(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Stage additions, modifications and deletions under `paths`.
    pub fn add_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes. Returns `Ok(false)` when nothing is staged.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "--quiet", "-m", message])?;
        Ok(true)
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn identity(git: &Git) {
        git.run_checked(&["config", "user.name", "flowgate tests"]).expect("name");
        git.run_checked(&["config", "user.email", "tests@flowgate.invalid"]).expect("email");
    }

    #[test]
    fn commits_only_when_something_is_staged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.init().expect("init");
        identity(&git);
        assert!(git.is_repo());
        assert_eq!(git.head_sha().expect("head"), None);
        assert!(!git.commit_staged("empty").expect("commit"));

        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/app.py"), "x = 1\n").expect("write");
        git.add_paths(&["src".to_string()]).expect("add");
        assert!(git.has_staged_changes().expect("staged"));
        assert!(git.commit_staged("add app").expect("commit"));
        assert!(git.head_sha().expect("head").is_some());
    }

    #[test]
    fn staging_picks_up_deletions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.init().expect("init");
        identity(&git);
        fs::write(temp.path().join("old.py"), "pass\n").expect("write");
        git.add_paths(&["old.py".to_string()]).expect("add");
        assert!(git.commit_staged("add old").expect("commit"));

        fs::remove_file(temp.path().join("old.py")).expect("remove");
        git.add_paths(&["old.py".to_string()]).expect("stage delete");
        assert!(git.commit_staged("remove old").expect("commit"));
    }
}
