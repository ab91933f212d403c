//! One exploration session: an isolated workspace driven through the
//! entrypoint loop (plan, execute, summarize, verify) until an attempt
//! verifies or the attempt budget runs out.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::agents::planner::{PlanOutcome, PlanRequest, Planner};
use crate::core::charter::path_charter;
use crate::core::clarify::clarifying_questions;
use crate::core::score::{Score, score_session};
use crate::core::types::EvaluationResult;
use crate::core::verification::{
    AttemptEvidence, REQUIRED_SUMMARY_FIELDS, Verification, verify_attempt,
};
use crate::core::workflow::{WorkflowEngine, WorkflowStatus};
use crate::execute::{WorkflowServices, run_in_workspace};
use crate::io::config::{SelfImproveConfig, WorkflowConfig};
use crate::io::evaluation::TestRunner;
use crate::io::input::{InputKind, InputPayload};
use crate::io::prompt::{EntrypointPrompt, PromptBuilder};
use crate::io::run_context::RunContext;
use crate::io::workspace::{clone_master, compute_changes};
use crate::self_improve::ProviderFactory;
use crate::self_improve::report::{EntrypointAttempt, SessionResult};

pub const SESSION_WORKSPACE_DIR: &str = "workspace";
pub const SESSION_RUN_DIR: &str = "run";

/// Everything a session reads; shared by all sessions of a batch.
pub struct SessionEnv<'a> {
    pub goal: &'a str,
    pub input: &'a InputPayload,
    pub master: &'a Path,
    pub sessions_dir: &'a Path,
    pub parent_run_id: &'a str,
    pub settings: &'a SelfImproveConfig,
    pub workflow: &'a WorkflowConfig,
    pub test_runner: &'a Arc<dyn TestRunner>,
    pub providers: &'a ProviderFactory,
    pub baseline: Option<&'a EvaluationResult>,
}

/// Workspace-relative location of an attempt's experiment summary.
pub fn summary_relpath(session_id: &str, attempt: u32) -> String {
    format!(".flowgate/experiments/{session_id}/attempt-{attempt}.json")
}

/// Prompt text for the optional input payload.
pub fn input_context(input: &InputPayload) -> Option<String> {
    match input.kind {
        InputKind::None => None,
        InputKind::Url => {
            let url = input.reference.as_deref().unwrap_or_default();
            if input.content.trim().is_empty() {
                Some(format!("Reference URL (content unavailable): {url}"))
            } else {
                Some(format!("Reference URL: {url}\n\n{}", input.content))
            }
        }
        InputKind::File | InputKind::Text => {
            Some(input.content.clone()).filter(|content| !content.trim().is_empty())
        }
    }
}

fn new_result(batch: usize, index: usize) -> SessionResult {
    let session_id = format!("{batch}-{index}");
    SessionResult {
        charter: path_charter(&session_id),
        session_id,
        index,
        workspace: None,
        run_root: None,
        workflow_status: WorkflowStatus::Failed,
        evaluation: None,
        score: Score::default(),
        model_calls: 0,
        tool_calls: 0,
        changed_files: Vec::new(),
        changes: Vec::new(),
        verification_ok: false,
        verification_reason: String::new(),
        entrypoint_attempts: 0,
        attempts: Vec::new(),
        clarifying_questions: Vec::new(),
        error: None,
    }
}

/// Run session `index` of `batch`. Failures are captured in the result.
#[instrument(skip_all, fields(session = %format!("{batch}-{index}")))]
pub fn run_session(env: &SessionEnv<'_>, batch: usize, index: usize) -> SessionResult {
    let mut result = new_result(batch, index);
    if let Some(questions) = clarifying_questions(env.goal, env.input.has_context()) {
        info!("goal is ambiguous, blocking session");
        result.workflow_status = WorkflowStatus::Blocked;
        result.verification_reason = "goal is ambiguous; clarification required".to_string();
        result.clarifying_questions = questions;
        result.score = score_session(false, None, 0, 0);
        return result;
    }

    if let Err(err) = drive_session(env, &mut result) {
        let message = format!("{err:#}");
        warn!(err = %message, "session aborted");
        result.verification_ok = false;
        result.verification_reason = format!("session error: {message}");
        result.error = Some(message);
    }
    result.score = score_session(
        result.verification_ok,
        result.evaluation.as_ref(),
        result.model_calls,
        result.tool_calls,
    );
    info!(
        status = result.workflow_status.as_str(),
        verified = result.verification_ok,
        attempts = result.entrypoint_attempts,
        "session finished"
    );
    result
}

fn drive_session(env: &SessionEnv<'_>, result: &mut SessionResult) -> Result<()> {
    let session_root = env.sessions_dir.join(&result.session_id);
    let workspace = session_root.join(SESSION_WORKSPACE_DIR);
    clone_master(env.master, &workspace, &env.settings.include_paths)?;
    result.workspace = Some(workspace.clone());
    let run_root = session_root.join(SESSION_RUN_DIR);
    fs::create_dir_all(&run_root)
        .with_context(|| format!("create session run dir {}", run_root.display()))?;
    result.run_root = Some(run_root.clone());

    let provider = (env.providers)(&result.session_id, &workspace)
        .with_context(|| format!("build provider for session {}", result.session_id))?;
    let services = WorkflowServices {
        provider: provider.as_ref(),
        test_runner: Arc::clone(env.test_runner),
        workflow: env.workflow,
    };
    let prompts = PromptBuilder::default();
    let charter = result.charter.describe();
    let input_text = input_context(env.input);
    let unavailable = EvaluationResult::unavailable("baseline unavailable");
    let baseline = env.baseline.unwrap_or(&unavailable);
    let max_attempts = env.settings.entrypoint_max_attempts.max(1);
    let mut feedback: Option<String> = None;

    for attempt in 1..=max_attempts {
        let summary_path = summary_relpath(&result.session_id, attempt);
        let goal = prompts.build_entrypoint(&EntrypointPrompt {
            goal: env.goal,
            charter: &charter,
            summary_path: &summary_path,
            required_fields: &REQUIRED_SUMMARY_FIELDS,
            attempt,
            max_attempts,
            baseline,
            feedback: feedback.as_deref(),
            input_context: input_text.as_deref(),
        })?;
        let mut metadata = Map::new();
        metadata.insert("command".into(), json!("self-improve-session"));
        metadata.insert("parent_run_id".into(), json!(env.parent_run_id));
        metadata.insert("session_id".into(), json!(result.session_id));
        metadata.insert("attempt".into(), json!(attempt));
        metadata.insert("charter".into(), serde_json::to_value(&result.charter)?);
        let run = RunContext::create_at(
            run_root.join(format!("attempt-{attempt}")),
            format!("{}-{}-a{attempt}", env.parent_run_id, result.session_id),
            metadata,
        )?;
        result.entrypoint_attempts = attempt;
        // the planner call itself
        result.model_calls += 1;

        // The entrypoint prompt already carries the charter and input.
        let plan = Planner::new(services.provider, &prompts, Some(run.trace())).plan(&PlanRequest {
            goal: &goal,
            ..Default::default()
        });
        let spec = match plan {
            Ok(PlanOutcome::Workflow(spec)) => spec,
            Ok(PlanOutcome::Blocked {
                summary,
                clarifying_questions,
            }) => {
                info!(attempt, "provider blocked the session");
                let verification = Verification {
                    ok: false,
                    reason: format!("provider blocked the plan: {summary}"),
                };
                result.workflow_status = WorkflowStatus::Blocked;
                result.verification_reason = verification.reason.clone();
                result.clarifying_questions = clarifying_questions;
                result.attempts.push(EntrypointAttempt {
                    attempt,
                    run_root: run.root().to_path_buf(),
                    workflow_status: WorkflowStatus::Blocked,
                    verification,
                    experiment_summary: None,
                    evaluation: None,
                    changed_files: Vec::new(),
                    model_calls: 1,
                    tool_calls: 0,
                });
                run.update_manifest("status", json!(WorkflowStatus::Blocked.as_str()))?;
                return Ok(());
            }
            Err(err) => {
                let reason = format!("planning failed: {err:#}");
                warn!(attempt, err = %reason, "planning failed");
                result.workflow_status = WorkflowStatus::Failed;
                result.verification_reason = reason.clone();
                result.attempts.push(EntrypointAttempt {
                    attempt,
                    run_root: run.root().to_path_buf(),
                    workflow_status: WorkflowStatus::Failed,
                    verification: Verification {
                        ok: false,
                        reason: reason.clone(),
                    },
                    experiment_summary: None,
                    evaluation: None,
                    changed_files: Vec::new(),
                    model_calls: 1,
                    tool_calls: 0,
                });
                run.update_manifest("status", json!(WorkflowStatus::Failed.as_str()))?;
                feedback = Some(reason);
                continue;
            }
        };

        let mut engine = WorkflowEngine::new(spec)?;
        let totals = run_in_workspace(
            &services,
            &mut engine,
            &workspace,
            &env.settings.test_targets,
            &run,
        )?;
        let evaluation = env
            .test_runner
            .evaluate(&workspace, &env.settings.test_targets)
            .unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "session evaluation failed");
                EvaluationResult::unavailable(&format!("{err:#}"))
            });
        let changes = compute_changes(env.master, &workspace, &env.settings.include_paths)?;
        let changed_files: Vec<String> = changes.iter().map(|c| c.relpath.clone()).collect();
        let summary = load_summary(&workspace, &summary_path);
        let verification = verify_attempt(&AttemptEvidence {
            workflow_status: totals.status,
            summary: summary.as_ref().map_err(String::as_str),
            changed_files: &changed_files,
            evaluation: &evaluation,
        });
        run.trace().log(
            "entrypoint_attempt",
            json!({
                "session_id": result.session_id,
                "attempt": attempt,
                "workflow_status": totals.status.as_str(),
                "changed_files": changed_files,
                "verification": verification,
            }),
        )?;
        run.update_manifest("status", json!(totals.status.as_str()))?;
        run.update_manifest("verification", serde_json::to_value(&verification)?)?;
        info!(
            attempt,
            verified = verification.ok,
            reason = %verification.reason,
            "entrypoint attempt finished"
        );

        let model_calls = totals.model_calls + 1;
        result.model_calls += totals.model_calls;
        result.tool_calls += totals.tool_calls;
        result.workflow_status = totals.status;
        result.evaluation = Some(evaluation.clone());
        result.changed_files = changed_files.clone();
        result.changes = changes;
        result.verification_ok = verification.ok;
        result.verification_reason = verification.reason.clone();
        result.attempts.push(EntrypointAttempt {
            attempt,
            run_root: run.root().to_path_buf(),
            workflow_status: totals.status,
            verification: verification.clone(),
            experiment_summary: summary.ok(),
            evaluation: Some(evaluation),
            changed_files,
            model_calls,
            tool_calls: totals.tool_calls,
        });
        if verification.ok {
            break;
        }
        feedback = Some(verification.reason);
    }
    Ok(())
}

/// Parse the experiment summary, or describe why it is unusable.
fn load_summary(workspace: &Path, relpath: &str) -> std::result::Result<Value, String> {
    let path: PathBuf = workspace.join(relpath);
    if !path.is_file() {
        return Err(format!("missing {relpath}"));
    }
    let text = fs::read_to_string(&path).map_err(|err| format!("read {relpath}: {err}"))?;
    serde_json::from_str(&text).map_err(|err| format!("parse {relpath}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::io::input::read_input_with;

    #[test]
    fn summary_paths_are_per_attempt() {
        assert_eq!(
            summary_relpath("2-3", 1),
            ".flowgate/experiments/2-3/attempt-1.json"
        );
    }

    #[test]
    fn url_input_context_includes_fetched_body() {
        let fetched = read_input_with(Some("https://example.com/issue/1"), |_| {
            Ok("add() returns a - b".to_string())
        })
        .expect("input");
        let context = input_context(&fetched).expect("context");
        assert!(context.contains("https://example.com/issue/1"));
        assert!(context.contains("add() returns a - b"));

        let unreachable = read_input_with(Some("https://example.com/issue/1"), |_| {
            anyhow::bail!("offline")
        })
        .expect("input");
        let context = input_context(&unreachable).expect("context");
        assert!(context.contains("content unavailable"));
        assert_eq!(input_context(&InputPayload::none()), None);
    }

    #[test]
    fn unreadable_summary_explains_itself() {
        let temp = tempfile::tempdir().expect("tempdir");
        let relpath = summary_relpath("1-1", 1);
        assert_eq!(
            load_summary(temp.path(), &relpath),
            Err(format!("missing {relpath}"))
        );
        let path = temp.path().join(&relpath);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{not json").expect("write");
        let err = load_summary(temp.path(), &relpath).unwrap_err();
        assert!(err.starts_with("parse "));
    }
}
