//! CLI tests: spawn the flowgate binary and check exit codes and run output.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::json;

use flowgate::exit_codes;
use flowgate::task::TASK_RESULT_FILE;
use flowgate::test_support::write_task;

const CONFIG: &str = r#"
[provider]
kind = "mock"

[evaluation]
command = ["true"]
timeout_secs = 30

[workflow]
max_step_attempts = 1
"#;

fn flowgate(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_flowgate"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn flowgate")
}

fn only_run_dir(runs_dir: &Path) -> PathBuf {
    let mut dirs: Vec<PathBuf> = fs::read_dir(runs_dir)
        .expect("read runs")
        .map(|entry| entry.expect("entry").path())
        .filter(|path| path.is_dir())
        .collect();
    assert_eq!(dirs.len(), 1, "{dirs:?}");
    dirs.remove(0)
}

#[test]
fn unknown_task_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("flowgate.toml"), CONFIG).expect("config");

    let output = flowgate(temp.path(), &["run-task", "missing", "--tasks-dir", "tasks"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("task missing not found"));
}

#[test]
fn inspect_without_manifest_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = flowgate(temp.path(), &["inspect-run", "nowhere"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn unsuccessful_task_is_recorded_and_inspectable() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("flowgate.toml"), CONFIG).expect("config");
    write_task(
        &temp.path().join("tasks"),
        "01-add",
        json!({"id": "01-add", "goal": "Fix add", "steps": [{"id": "fix"}]}),
    );

    // the mock provider never finishes a step
    let output = flowgate(temp.path(), &["run-task", "01-add", "--tasks-dir", "tasks"]);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::UNSUCCESSFUL),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("status=FAILED"), "{stdout}");

    let run_dir = only_run_dir(&temp.path().join("runs"));
    assert!(run_dir.join("reports").join(TASK_RESULT_FILE).is_file());

    let inspect = flowgate(
        temp.path(),
        &["inspect-run", run_dir.to_str().expect("utf-8 path")],
    );
    assert_eq!(inspect.status.code(), Some(exit_codes::OK));
    let text = String::from_utf8_lossy(&inspect.stdout);
    assert!(text.contains("workflow: FAILED"), "{text}");
    assert!(text.contains("fix"));
}

#[test]
fn self_improve_requires_concrete_goal() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("flowgate.toml"), CONFIG).expect("config");
    let master = temp.path().join("master");
    fs::create_dir_all(master.join("src")).expect("master");

    let output = flowgate(
        temp.path(),
        &["self-improve", "fix it", "--master", "master", "--sessions", "2"],
    );

    assert_eq!(
        output.status.code(),
        Some(exit_codes::UNSUCCESSFUL),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("status=BLOCKED"), "{stdout}");
    assert!(stdout.contains("question:"));
}
