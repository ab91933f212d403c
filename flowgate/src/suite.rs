//! `run-suite`: every benchmark task under a directory, in name order.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, json};
use tracing::{info, instrument, warn};

use crate::execute::WorkflowServices;
use crate::io::fs_util::write_json;
use crate::io::run_context::RunContext;
use crate::task::{TaskRunReport, discover_tasks, load_task, run_task};

pub const SUITE_REPORT_FILE: &str = "suite-report.json";

/// One task's line in the suite report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteEntry {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskRunReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub run_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub tasks: Vec<SuiteEntry>,
}

impl SuiteReport {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Run every task in `tasks_dir`; task runs live under the suite's run directory.
///
/// A task that errors is recorded as failed and the suite continues.
#[instrument(skip_all, fields(tasks_dir = %tasks_dir.display()))]
pub fn run_suite(tasks_dir: &Path, runs_dir: &Path, services: &WorkflowServices<'_>) -> Result<SuiteReport> {
    let mut metadata = Map::new();
    metadata.insert("command".into(), json!("run-suite"));
    metadata.insert("tasks_dir".into(), json!(tasks_dir.display().to_string()));
    let suite = RunContext::create(runs_dir, metadata)?;
    let task_runs = suite.root().join("tasks");

    let mut tasks = Vec::new();
    for task_dir in discover_tasks(tasks_dir)? {
        let task_id = load_task(&task_dir)
            .map(|task| task.id)
            .unwrap_or_else(|_| task_dir.display().to_string());
        suite.trace().log("task_started", json!({"task_id": task_id}))?;
        let entry = match run_task(&task_dir, &task_runs, services) {
            Ok(report) => SuiteEntry {
                task_id,
                success: report.success,
                result: Some(report),
                error: None,
            },
            Err(err) => {
                warn!(task = %task_id, err = %format!("{err:#}"), "task errored");
                SuiteEntry {
                    task_id,
                    success: false,
                    result: None,
                    error: Some(format!("{err:#}")),
                }
            }
        };
        suite.trace().log(
            "task_finished",
            json!({"task_id": entry.task_id, "success": entry.success}),
        )?;
        tasks.push(entry);
    }

    let passed = tasks.iter().filter(|entry| entry.success).count();
    let report = SuiteReport {
        run_id: suite.run_id().to_string(),
        total: tasks.len(),
        passed,
        failed: tasks.len() - passed,
        tasks,
    };
    write_json(&suite.reports_dir().join(SUITE_REPORT_FILE), &report)?;
    info!(total = report.total, passed = report.passed, "suite finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::io::config::WorkflowConfig;
    use crate::io::provider::ScriptedProvider;
    use crate::test_support::{ContainsRunner, status_response, write_task};

    #[test]
    fn aggregates_task_results() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tasks = temp.path().join("tasks");
        write_task(&tasks, "01-ok", json!({"id": "ok", "goal": "g", "steps": [{"id": "s"}]}));
        write_task(&tasks, "02-bad", json!({"id": "bad", "goal": "g", "steps": [{"id": "s", "depends_on": ["s"]}]}));

        let provider = ScriptedProvider::new(vec![status_response("SUCCESS", "done")]);
        let workflow = WorkflowConfig::default();
        let services = WorkflowServices {
            provider: &provider,
            test_runner: Arc::new(ContainsRunner::new("app.py", "def add")),
            workflow: &workflow,
        };
        let report = run_suite(&tasks, &temp.path().join("runs"), &services).expect("suite");

        assert_eq!(report.total, 2);
        assert_eq!(report.passed, 1);
        assert!(!report.all_passed());
        assert_eq!(report.tasks[0].task_id, "ok");
        assert!(report.tasks[1].error.as_deref().is_some_and(|e| e.contains("invalid workflow")));
    }
}
