//! Test-only helpers: scripted provider responses, a file-content test
//! runner, task directories and a git-backed master checkout.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::types::EvaluationResult;
use crate::io::evaluation::TestRunner;
use crate::io::git::Git;

pub const BROKEN_ADD: &str = "def add(a, b):\n    return a - b\n";
pub const FIXED_ADD: &str = "def add(a, b):\n    return a + b\n";
const ADD_TEST: &str = "from app import add\n\n\ndef test_add():\n    assert add(2, 3) == 5\n";

/// Terminal worker response with no artifacts.
pub fn status_response(status: &str, summary: &str) -> Value {
    json!({
        "status": status,
        "summary": summary,
        "artifacts": [],
        "metrics": {},
        "next_actions": [],
        "failure_signature": if status == "SUCCESS" { "" } else { "scripted" },
    })
}

/// Tool-call request writing `content` to `path` with the `file` tool.
pub fn write_file_call(path: &str, content: &str) -> Value {
    json!({
        "tool_calls": [{
            "tool": "file",
            "action": "write",
            "args": {"path": path, "content": content},
        }]
    })
}

/// Tool-call request writing several files in one round trip.
pub fn write_files_call(files: &[(&str, &str)]) -> Value {
    let calls: Vec<Value> = files
        .iter()
        .enumerate()
        .map(|(idx, (path, content))| {
            json!({
                "tool": "file",
                "action": "write",
                "args": {"path": path, "content": content},
                "call_id": format!("write-{idx}"),
            })
        })
        .collect();
    json!({ "tool_calls": calls })
}

/// Planner response proposing `steps` (each `{id, worker?, depends_on?}`).
pub fn plan_response(steps: Value) -> Value {
    json!({
        "status": "SUCCESS",
        "summary": "planned",
        "workflow": {"steps": steps},
    })
}

/// Complete experiment summary as a JSON string ready to be written.
pub fn experiment_summary(hypothesis: &str, baseline_failed: u64, post_failed: u64) -> String {
    let summary = json!({
        "causal_mechanism_hypothesis": hypothesis,
        "pass_condition": "all tests pass",
        "baseline_evaluation": {"ok": baseline_failed == 0, "passed": 0, "failed": baseline_failed},
        "post_change_evaluation": {"ok": post_failed == 0, "passed": 1, "failed": post_failed},
        "delta": {"failed": post_failed as i64 - baseline_failed as i64},
        "plan": ["inspect add", "fix operator"],
        "self_critique": "small change",
        "lessons": ["read the test first"],
    });
    summary.to_string()
}

/// Passes when the file at `relpath` contains `needle`.
#[derive(Debug, Clone)]
pub struct ContainsRunner {
    relpath: String,
    needle: String,
}

impl ContainsRunner {
    pub fn new(relpath: &str, needle: &str) -> Self {
        Self {
            relpath: relpath.to_string(),
            needle: needle.to_string(),
        }
    }
}

impl TestRunner for ContainsRunner {
    fn evaluate(&self, workdir: &Path, _targets: &[String]) -> Result<EvaluationResult> {
        let ok = fs::read_to_string(workdir.join(&self.relpath))
            .is_ok_and(|text| text.contains(&self.needle));
        Ok(EvaluationResult {
            ok,
            passed: u64::from(ok),
            failed: u64::from(!ok),
            failing_tests: if ok {
                Vec::new()
            } else {
                vec![format!("{}::contains", self.relpath)]
            },
            elapsed_s: 0.0,
        })
    }
}

/// Create `<tasks_dir>/<dirname>` with `task.json`, a broken `starter/app.py`
/// and `tests/test_app.py`.
pub fn write_task(tasks_dir: &Path, dirname: &str, task: Value) -> PathBuf {
    let dir = tasks_dir.join(dirname);
    fs::create_dir_all(dir.join("starter")).expect("create starter");
    fs::create_dir_all(dir.join("tests")).expect("create tests");
    fs::write(
        dir.join("task.json"),
        serde_json::to_string_pretty(&task).expect("serialize task"),
    )
    .expect("write task.json");
    fs::write(dir.join("starter/app.py"), BROKEN_ADD).expect("write starter");
    fs::write(dir.join("tests/test_app.py"), ADD_TEST).expect("write test");
    dir
}

/// Temporary master checkout with `src/app.py` (broken) and a test, committed
/// to a fresh git repository.
pub struct TestMaster {
    dir: TempDir,
}

impl TestMaster {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp master")?;
        let root = dir.path();
        fs::create_dir_all(root.join("src")).context("create src")?;
        fs::create_dir_all(root.join("tests")).context("create tests")?;
        fs::write(root.join("src/app.py"), BROKEN_ADD).context("write app.py")?;
        fs::write(root.join("tests/test_app.py"), ADD_TEST).context("write test")?;
        let git = Git::new(root);
        git.init()?;
        configure_identity(root)?;
        git.add_paths(&["src".to_string(), "tests".to_string()])?;
        git.commit_staged("initial master")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn read(&self, relpath: &str) -> String {
        fs::read_to_string(self.path().join(relpath)).unwrap_or_default()
    }
}

fn configure_identity(root: &Path) -> Result<()> {
    for (key, value) in [("user.name", "flowgate tests"), ("user.email", "tests@flowgate.invalid")] {
        let status = std::process::Command::new("git")
            .args(["config", key, value])
            .current_dir(root)
            .status()
            .with_context(|| format!("git config {key}"))?;
        anyhow::ensure!(status.success(), "git config {key} failed");
    }
    Ok(())
}
