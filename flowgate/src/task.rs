//! Hierarchical runs of benchmark tasks: `run-task`, `resume-run`, `inspect-run`.
//!
//! A task directory holds `task.json` (`{id, goal, steps?, test_targets?}`),
//! a `starter/` tree and a `tests/` tree. Each run copies both into a fresh
//! workspace inside its run directory, so the task itself is never modified.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::agents::planner::{PlanOutcome, PlanRequest, Planner};
use crate::core::types::EvaluationResult;
use crate::core::workflow::{StepStatus, WorkflowEngine, WorkflowStatus, workflow_from_value};
use crate::execute::{RunTotals, WorkflowServices, call_totals, run_in_workspace};
use crate::io::fs_util::{read_json, write_json};
use crate::io::prompt::PromptBuilder;
use crate::io::run_context::RunContext;
use crate::io::workspace::copy_tree;

pub const TASK_FILE: &str = "task.json";
pub const TASK_RESULT_FILE: &str = "task-result.json";
pub const WORKSPACE_DIR: &str = "workspace";

/// Contents of `task.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub goal: String,
    /// Pre-planned steps; when absent the planner is asked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Value>>,
    #[serde(default)]
    pub test_targets: Vec<String>,
}

/// Outcome of one task run, written to `reports/task-result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunReport {
    pub task_id: String,
    pub run_id: String,
    pub run_root: PathBuf,
    pub workflow_status: WorkflowStatus,
    pub evaluation: Option<EvaluationResult>,
    pub model_calls: u64,
    pub tool_calls: u64,
    #[serde(default)]
    pub clarifying_questions: Vec<String>,
    pub success: bool,
}

/// Locate a task by directory name, falling back to the `id` in `task.json`.
pub fn find_task_dir(tasks_dir: &Path, task_id: &str) -> Result<Option<PathBuf>> {
    let direct = tasks_dir.join(task_id);
    if direct.join(TASK_FILE).is_file() {
        return Ok(Some(direct));
    }
    for dir in discover_tasks(tasks_dir)? {
        if load_task(&dir).is_ok_and(|task| task.id == task_id) {
            return Ok(Some(dir));
        }
    }
    Ok(None)
}

/// Every directory under `tasks_dir` holding a `task.json`, sorted by name.
pub fn discover_tasks(tasks_dir: &Path) -> Result<Vec<PathBuf>> {
    if !tasks_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(tasks_dir)
        .with_context(|| format!("read tasks dir {}", tasks_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("read entry in {}", tasks_dir.display()))?
            .path();
        if path.join(TASK_FILE).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub fn load_task(task_dir: &Path) -> Result<TaskDefinition> {
    read_json(&task_dir.join(TASK_FILE))
}

/// The task's own steps, or whatever the planner proposes.
fn initial_plan(
    task: &TaskDefinition,
    services: &WorkflowServices<'_>,
    run: &RunContext,
) -> Result<PlanOutcome> {
    if let Some(steps) = &task.steps {
        let spec = workflow_from_value(&task.goal, &json!({"steps": steps}))
            .with_context(|| format!("task {} has an invalid workflow", task.id))?;
        return Ok(PlanOutcome::Workflow(spec));
    }
    let prompts = PromptBuilder::default();
    Planner::new(services.provider, &prompts, Some(run.trace())).plan(&PlanRequest {
        goal: &task.goal,
        ..Default::default()
    })
}

/// Run a task in a fresh run directory under `runs_dir`.
#[instrument(skip_all, fields(task = %task_dir.display()))]
pub fn run_task(task_dir: &Path, runs_dir: &Path, services: &WorkflowServices<'_>) -> Result<TaskRunReport> {
    let task = load_task(task_dir)?;
    let mut metadata = Map::new();
    metadata.insert("command".into(), json!("run-task"));
    metadata.insert("task_id".into(), json!(task.id));
    metadata.insert("goal".into(), json!(task.goal));
    metadata.insert("test_targets".into(), json!(task.test_targets));
    let run = RunContext::create(runs_dir, metadata)?;
    info!(run_id = run.run_id(), task = %task.id, "starting task run");

    let workspace = run.root().join(WORKSPACE_DIR);
    for (source, target) in [
        (task_dir.join("starter"), workspace.clone()),
        (task_dir.join("tests"), workspace.join("tests")),
    ] {
        if source.is_dir() {
            copy_tree(&source, &target)?;
        } else {
            fs::create_dir_all(&target)
                .with_context(|| format!("create {}", target.display()))?;
        }
    }

    let mut engine = match initial_plan(&task, services, &run)? {
        PlanOutcome::Workflow(spec) => WorkflowEngine::new(spec)?,
        PlanOutcome::Blocked {
            clarifying_questions,
            ..
        } => {
            warn!("planner blocked the task");
            let report = TaskRunReport {
                task_id: task.id,
                run_id: run.run_id().to_string(),
                run_root: run.root().to_path_buf(),
                workflow_status: WorkflowStatus::Blocked,
                evaluation: None,
                model_calls: 1,
                tool_calls: 0,
                clarifying_questions,
                success: false,
            };
            finish_report(&run, &report)?;
            return Ok(report);
        }
    };
    let totals = run_in_workspace(services, &mut engine, &workspace, &task.test_targets, &run)?;
    evaluate_and_report(&run, &task.id, &workspace, &task.test_targets, services, totals)
}

/// Continue an interrupted run from its persisted workflow state.
#[instrument(skip_all, fields(run = %run_root.display()))]
pub fn resume_run(run_root: &Path, services: &WorkflowServices<'_>) -> Result<TaskRunReport> {
    let run = RunContext::open(run_root)?;
    let mut engine = WorkflowEngine::load(&run.workflow_state_path())?;
    let manifest = run.manifest()?;
    let task_id = manifest
        .metadata
        .get("task_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let test_targets: Vec<String> = manifest
        .metadata
        .get("test_targets")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .context("parse test_targets in run manifest")?
        .unwrap_or_default();

    let reset = engine.reset_interrupted();
    run.trace().log("run_resumed", json!({"reset_steps": reset}))?;
    info!(run_id = run.run_id(), reset = reset.len(), "resuming run");

    let workspace = run.root().join(WORKSPACE_DIR);
    let totals = run_in_workspace(services, &mut engine, &workspace, &test_targets, &run)?;
    evaluate_and_report(&run, &task_id, &workspace, &test_targets, services, totals)
}

fn evaluate_and_report(
    run: &RunContext,
    task_id: &str,
    workspace: &Path,
    test_targets: &[String],
    services: &WorkflowServices<'_>,
    totals: RunTotals,
) -> Result<TaskRunReport> {
    let evaluation = services
        .test_runner
        .evaluate(workspace, test_targets)
        .unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "evaluation failed");
            EvaluationResult::unavailable(&format!("{err:#}"))
        });
    run.trace().log("evaluation", serde_json::to_value(&evaluation)?)?;
    let report = TaskRunReport {
        task_id: task_id.to_string(),
        run_id: run.run_id().to_string(),
        run_root: run.root().to_path_buf(),
        workflow_status: totals.status,
        success: totals.status == WorkflowStatus::Succeeded && evaluation.ok,
        evaluation: Some(evaluation),
        model_calls: totals.model_calls,
        tool_calls: totals.tool_calls,
        clarifying_questions: Vec::new(),
    };
    finish_report(run, &report)?;
    Ok(report)
}

fn finish_report(run: &RunContext, report: &TaskRunReport) -> Result<()> {
    write_json(&run.reports_dir().join(TASK_RESULT_FILE), report)?;
    run.update_manifest("status", json!(report.workflow_status.as_str()))?;
    run.update_manifest("success", json!(report.success))
}

/// Per-step view for `inspect-run`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub step_id: String,
    pub worker: String,
    pub status: StepStatus,
    pub attempts: usize,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunInspection {
    pub run_id: String,
    pub manifest: Map<String, Value>,
    pub workflow_status: Option<WorkflowStatus>,
    pub steps: Vec<StepSummary>,
    pub model_calls: u64,
    pub tool_calls: u64,
}

impl RunInspection {
    /// Human-readable summary, one step per line.
    pub fn render(&self) -> String {
        let mut out = format!("run {}\n", self.run_id);
        for (key, value) in &self.manifest {
            out.push_str(&format!("  {key}: {value}\n"));
        }
        match self.workflow_status {
            Some(status) => out.push_str(&format!("workflow: {}\n", status.as_str())),
            None => out.push_str("workflow: (not started)\n"),
        }
        for step in &self.steps {
            out.push_str(&format!(
                "  {:<20} {:<10} attempts={}{}\n",
                step.step_id,
                step.status.as_str(),
                step.attempts,
                step.reason
                    .as_deref()
                    .map(|reason| format!("  ({reason})"))
                    .unwrap_or_default()
            ));
        }
        out.push_str(&format!(
            "calls: model={} tool={}\n",
            self.model_calls, self.tool_calls
        ));
        out
    }
}

/// Read a run's manifest and workflow state without changing anything.
pub fn inspect_run(run_root: &Path) -> Result<RunInspection> {
    let run = RunContext::open(run_root)?;
    let manifest = run.manifest()?;
    let state_path = run.workflow_state_path();
    if !state_path.exists() {
        return Ok(RunInspection {
            run_id: manifest.run_id,
            manifest: manifest.metadata,
            workflow_status: None,
            steps: Vec::new(),
            model_calls: 0,
            tool_calls: 0,
        });
    }
    let engine = WorkflowEngine::load(&state_path)
        .with_context(|| format!("inspect {}", run_root.display()))?;
    let steps = engine
        .spec()
        .steps
        .iter()
        .filter_map(|step| {
            engine.step_state(&step.step_id).map(|state| StepSummary {
                step_id: step.step_id.clone(),
                worker: step.worker.clone(),
                status: state.status,
                attempts: state.attempts.len(),
                reason: state.reason.clone(),
            })
        })
        .collect();
    let (model_calls, tool_calls) = call_totals(&engine);
    let workflow_status = engine.is_finished().then(|| engine.overall_status());
    Ok(RunInspection {
        run_id: manifest.run_id,
        manifest: manifest.metadata,
        workflow_status,
        steps,
        model_calls,
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::io::config::WorkflowConfig;
    use crate::io::provider::ScriptedProvider;
    use crate::test_support::{ContainsRunner, status_response, write_file_call, write_task};

    #[test]
    fn runs_task_with_its_own_steps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tasks = temp.path().join("tasks");
        let task_dir = write_task(
            &tasks,
            "01-add",
            json!({"id": "01-add", "goal": "Fix add", "steps": [{"id": "fix"}]}),
        );
        let provider = ScriptedProvider::new(vec![
            write_file_call("app.py", "def add(a, b):\n    return a + b\n"),
            status_response("SUCCESS", "fixed"),
        ]);
        let workflow = WorkflowConfig::default();
        let services = WorkflowServices {
            provider: &provider,
            test_runner: Arc::new(ContainsRunner::new("app.py", "a + b")),
            workflow: &workflow,
        };
        let report = run_task(&task_dir, &temp.path().join("runs"), &services).expect("run");

        assert!(report.success);
        assert_eq!(report.workflow_status, WorkflowStatus::Succeeded);
        assert!(report.run_root.join("reports").join(TASK_RESULT_FILE).is_file());
        assert!(report.run_root.join("workspace/tests/test_app.py").is_file());
        // the task's starter is untouched
        let starter = fs::read_to_string(task_dir.join("starter/app.py")).expect("starter");
        assert!(starter.contains("a - b"));

        let inspection = inspect_run(&report.run_root).expect("inspect");
        assert_eq!(inspection.workflow_status, Some(WorkflowStatus::Succeeded));
        assert_eq!(inspection.steps[0].attempts, 1);
        assert!(inspection.render().contains("fix"));
        assert_eq!(inspection.manifest["success"], json!(true));
    }

    #[test]
    fn finds_tasks_by_dir_or_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_task(temp.path(), "02-b", json!({"id": "b", "goal": "g"}));
        write_task(temp.path(), "01-a", json!({"id": "a", "goal": "g"}));
        fs::create_dir_all(temp.path().join("not-a-task")).expect("mkdir");

        let found = discover_tasks(temp.path()).expect("discover");
        assert_eq!(found, vec![temp.path().join("01-a"), temp.path().join("02-b")]);
        assert_eq!(
            find_task_dir(temp.path(), "b").expect("find"),
            Some(temp.path().join("02-b"))
        );
        assert_eq!(find_task_dir(temp.path(), "zzz").expect("find"), None);
    }

    #[test]
    fn resume_requires_state_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = RunContext::create(temp.path(), Map::new()).expect("run");
        let provider = ScriptedProvider::new(Vec::new());
        let workflow = WorkflowConfig::default();
        let services = WorkflowServices {
            provider: &provider,
            test_runner: Arc::new(ContainsRunner::new("app.py", "x")),
            workflow: &workflow,
        };
        let err = resume_run(run.root(), &services).unwrap_err();
        assert!(format!("{err:#}").contains("missing workflow state"));
    }
}
