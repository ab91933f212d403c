//! Workflow driving loop.
//!
//! Repeatedly derives the READY set, dispatches those steps to workers with
//! bounded fan-out, gates re-attempts through the [`RetryGate`], blocks steps
//! whose dependencies can no longer succeed, and persists the snapshot after
//! every status change.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::agents::worker::{Assignment, Worker, WorkerConfig, WorkerContext};
use crate::core::delegation::DelegationGraph;
use crate::core::retry::{ProgressMetrics, RetryGate};
use crate::core::signature::compute_call_signature;
use crate::core::types::{WorkerOutput, WorkerStatus};
use crate::core::workflow::{AttemptRecord, StepSpec, StepStatus, WorkflowEngine, WorkflowStatus};
use crate::io::artifacts::ArtifactStore;
use crate::io::config::WorkflowConfig;
use crate::io::evaluation::TestRunner;
use crate::io::prompt::PromptBuilder;
use crate::io::provider::ReasoningProvider;
use crate::io::run_context::{RunContext, timestamp_now};
use crate::io::tools::{FileTool, TestTool, ToolRegistry};
use crate::io::workflow_store::validate_outputs;
use crate::pool::run_bounded;

/// Retrieval stages widen context on later attempts and then plateau.
pub const MAX_RETRIEVAL_STAGE: u32 = 3;

pub const SIG_OUTPUTS_SCHEMA: &str = "outputs-schema";

/// Collaborators for running a workflow inside a workspace.
#[derive(Clone)]
pub struct WorkflowServices<'a> {
    pub provider: &'a dyn ReasoningProvider,
    pub test_runner: Arc<dyn TestRunner>,
    pub workflow: &'a WorkflowConfig,
}

/// Drive `engine` with tools rooted at `workspace`, persisting under `run`.
///
/// Workers get the `file` tool over the workspace and the `tests` tool with
/// `test_targets` as default targets.
#[instrument(skip_all, fields(run = %run.run_id(), workspace = %workspace.display()))]
pub fn run_in_workspace(
    services: &WorkflowServices<'_>,
    engine: &mut WorkflowEngine,
    workspace: &Path,
    test_targets: &[String],
    run: &RunContext,
) -> Result<RunTotals> {
    let tools = ToolRegistry::new()
        .with(Arc::new(FileTool::new(workspace)))
        .with(Arc::new(TestTool::new(
            Arc::clone(&services.test_runner),
            workspace,
            test_targets.to_vec(),
        )));
    let delegation = Mutex::new(DelegationGraph::new());
    let prompts = PromptBuilder::default();
    let config = WorkerConfig::from_workflow(services.workflow);
    let artifacts = ArtifactStore::new(run.step_artifacts_dir());
    let state_path = run.workflow_state_path();
    let runner = WorkflowRunner {
        worker: WorkerContext {
            provider: services.provider,
            tools: &tools,
            delegation: &delegation,
            prompts: &prompts,
            trace: Some(run.trace()),
            config: &config,
        },
        artifacts: &artifacts,
        state_path: Some(&state_path),
        max_step_attempts: services.workflow.max_step_attempts,
        step_concurrency: services.workflow.step_concurrency,
    };
    runner.run(engine)
}

/// Everything the loop needs besides the engine itself.
pub struct WorkflowRunner<'a> {
    pub worker: WorkerContext<'a>,
    pub artifacts: &'a ArtifactStore,
    /// Where to persist the snapshot after each status change.
    pub state_path: Option<&'a Path>,
    pub max_step_attempts: u32,
    pub step_concurrency: usize,
}

/// Aggregate outcome of driving a workflow to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub status: WorkflowStatus,
    pub model_calls: u64,
    pub tool_calls: u64,
}

/// Result of all attempts made for one step in one dispatch.
#[derive(Debug)]
struct StepOutcome {
    step_id: String,
    attempts: Vec<AttemptRecord>,
    status: StepStatus,
    reason: String,
}

/// Sum `model_calls` and `tool_calls` over every recorded attempt.
pub fn call_totals(engine: &WorkflowEngine) -> (u64, u64) {
    engine
        .state()
        .steps
        .values()
        .flat_map(|state| state.attempts.iter())
        .fold((0, 0), |(model, tool), attempt| {
            (
                model + attempt.output.metric_u64("model_calls").unwrap_or(0),
                tool + attempt.output.metric_u64("tool_calls").unwrap_or(0),
            )
        })
}

/// Progress snapshot derived from a worker output and its artifact digest.
///
/// Only artifacts absent from `previous` count as new.
pub fn progress_metrics(
    output: &WorkerOutput,
    artifact_hash: &str,
    previous: Option<&AttemptRecord>,
) -> ProgressMetrics {
    let new_artifacts = match previous {
        Some(previous) => output
            .artifacts
            .iter()
            .filter(|artifact| !previous.output.artifacts.contains(artifact))
            .count(),
        None => output.artifacts.len(),
    };
    ProgressMetrics {
        failing_tests: output.metric_u64("failing_tests"),
        passed_tests: output.metric_u64("passed_tests"),
        new_artifacts: Some(new_artifacts as u64),
        artifact_delta_hash: Some(artifact_hash.to_string()),
        notes: output
            .metrics
            .get("notes")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Rebuild gate memory from attempts already recorded (resume).
fn gate_from_history(engine: &WorkflowEngine) -> RetryGate {
    let mut gate = RetryGate::new();
    for (step_id, state) in &engine.state().steps {
        for attempt in &state.attempts {
            gate.record_signature(&attempt.call_signature);
            if attempt.output.status != WorkerStatus::Success {
                gate.record_failure(step_id, &attempt.call_signature, &attempt.output.failure_signature);
            }
        }
    }
    gate
}

impl WorkflowRunner<'_> {
    fn log(&self, event_type: &str, payload: Value) -> Result<()> {
        match self.worker.trace {
            Some(trace) => trace.log(event_type, payload),
            None => Ok(()),
        }
    }

    fn persist(&self, engine: &WorkflowEngine) -> Result<()> {
        match self.state_path {
            Some(path) => engine.save(path),
            None => Ok(()),
        }
    }

    /// Drive `engine` until no step can make further progress.
    #[instrument(skip_all, fields(workflow = %engine.spec().workflow_id))]
    pub fn run(&self, engine: &mut WorkflowEngine) -> Result<RunTotals> {
        let gate = Mutex::new(gate_from_history(engine));
        self.log(
            "workflow_started",
            json!({
                "workflow_id": engine.spec().workflow_id,
                "goal": engine.spec().goal,
                "steps": engine.spec().steps.iter().map(|s| s.step_id.as_str()).collect::<Vec<_>>(),
            }),
        )?;
        self.persist(engine)?;

        loop {
            let blocked = engine.block_unreachable();
            if !blocked.is_empty() {
                debug!(?blocked, "blocked unreachable steps");
                self.log("steps_blocked", json!({"steps": blocked}))?;
                self.persist(engine)?;
            }

            let ready = engine.compute_ready();
            if ready.is_empty() {
                break;
            }
            let mut jobs = Vec::with_capacity(ready.len());
            for step in ready {
                engine.mark_status(&step.step_id, StepStatus::Running)?;
                self.log("step_started", json!({"step_id": step.step_id, "worker": step.worker}))?;
                let history = engine
                    .step_state(&step.step_id)
                    .map(|state| state.attempts.clone())
                    .unwrap_or_default();
                let dependencies = engine.dependency_outputs(&step.step_id);
                jobs.push((step, history, dependencies));
            }
            self.persist(engine)?;

            let goal = engine.spec().goal.clone();
            let outcomes = run_bounded(jobs, self.step_concurrency, |_, (step, history, deps)| {
                self.run_step(&goal, &step, history, &deps, &gate)
            })?;

            for outcome in outcomes {
                let outcome = outcome?;
                for attempt in outcome.attempts {
                    engine.record_attempt(&outcome.step_id, attempt)?;
                }
                engine.mark_status_with_reason(&outcome.step_id, outcome.status, &outcome.reason)?;
                self.log(
                    "step_finished",
                    json!({
                        "step_id": outcome.step_id,
                        "status": outcome.status.as_str(),
                        "reason": outcome.reason,
                    }),
                )?;
                self.persist(engine)?;
            }
        }

        let status = engine.overall_status();
        let (model_calls, tool_calls) = call_totals(engine);
        self.log(
            "workflow_finished",
            json!({
                "workflow_id": engine.spec().workflow_id,
                "status": status.as_str(),
                "model_calls": model_calls,
                "tool_calls": tool_calls,
            }),
        )?;
        info!(status = status.as_str(), "workflow finished");
        Ok(RunTotals {
            status,
            model_calls,
            tool_calls,
        })
    }

    /// Attempt one step until it succeeds, is denied a retry, or runs out of attempts.
    fn run_step(
        &self,
        goal: &str,
        step: &StepSpec,
        history: Vec<AttemptRecord>,
        dependencies: &Map<String, Value>,
        gate: &Mutex<RetryGate>,
    ) -> Result<StepOutcome> {
        let prior = history.len();
        let mut all = history;
        let key_inputs = json!({"inputs": step.inputs, "dependencies": dependencies});
        let first = u32::try_from(prior).unwrap_or(u32::MAX).saturating_add(1);
        let outcome = |status, reason: String, all: Vec<AttemptRecord>| StepOutcome {
            step_id: step.step_id.clone(),
            attempts: all.into_iter().skip(prior).collect(),
            status,
            reason,
        };

        for attempt in first..=self.max_step_attempts {
            let retrieval_stage = attempt.min(MAX_RETRIEVAL_STAGE);
            let signature = compute_call_signature(
                goal,
                &step.step_id,
                &step.worker,
                &key_inputs,
                &self.worker.config.strategy_id,
                retrieval_stage,
            );

            if let Some(last) = all.last() {
                let prev_metrics = all.len().checked_sub(2).map(|idx| &all[idx].metrics);
                let decision = gate
                    .lock()
                    .map_err(|_| anyhow!("retry gate lock poisoned"))?
                    .can_retry(
                        &step.step_id,
                        &signature,
                        &last.output.failure_signature,
                        prev_metrics,
                        Some(&last.metrics),
                    );
                if !decision.allow {
                    warn!(step = %step.step_id, attempt, reason = decision.reason, "retry denied");
                    self.log(
                        "retry_denied",
                        json!({"step_id": step.step_id, "attempt": attempt, "call_id": signature, "reason": decision.reason}),
                    )?;
                    return Ok(outcome(StepStatus::Failed, decision.reason.to_string(), all));
                }
            }
            gate.lock()
                .map_err(|_| anyhow!("retry gate lock poisoned"))?
                .record_signature(&signature);

            let previous_failure = all
                .last()
                .map(|last| format!("{} ({})", last.output.summary, last.output.failure_signature));
            let mut output = Worker::new(self.worker).run(&Assignment {
                goal,
                step,
                call_signature: &signature,
                attempt,
                retrieval_stage,
                previous_failure: previous_failure.as_deref(),
                dependencies,
            })?;

            let outputs_value = serde_json::to_value(&output)?;
            if output.status == WorkerStatus::Success
                && let Err(err) = validate_outputs(&step.outputs_schema, &outputs_value)
            {
                output.status = WorkerStatus::Failure;
                output.summary = format!("{err:#}");
                output.failure_signature = SIG_OUTPUTS_SCHEMA.to_string();
            }
            let artifact_hash = self.artifacts.write_step(
                &step.step_id,
                &serde_json::to_value(&output)?,
                &output.artifacts,
            )?;
            let duplicate = self
                .worker
                .delegation
                .lock()
                .map_err(|_| anyhow!("delegation graph lock poisoned"))?
                .record_artifacts(&signature, &artifact_hash);

            let status = output.status;
            let failure_signature = output.failure_signature.clone();
            self.log(
                "step_attempt",
                json!({
                    "step_id": step.step_id,
                    "attempt": attempt,
                    "call_id": signature,
                    "status": status.as_str(),
                    "failure_signature": failure_signature,
                    "artifact_hash": artifact_hash,
                    "duplicate": duplicate,
                }),
            )?;
            let metrics = progress_metrics(&output, &artifact_hash, all.last());
            all.push(AttemptRecord {
                call_signature: signature.clone(),
                worker_type: step.worker.clone(),
                metrics,
                output,
                artifact_hash: Some(artifact_hash),
                timestamp: timestamp_now(),
            });

            match status {
                WorkerStatus::Success => {
                    return Ok(outcome(StepStatus::Succeeded, format!("succeeded on attempt {attempt}"), all));
                }
                WorkerStatus::Blocked => {
                    return Ok(outcome(StepStatus::Blocked, "worker reported BLOCKED".to_string(), all));
                }
                WorkerStatus::Partial | WorkerStatus::Failure => {
                    gate.lock()
                        .map_err(|_| anyhow!("retry gate lock poisoned"))?
                        .record_failure(&step.step_id, &signature, &failure_signature);
                    if duplicate {
                        return Ok(outcome(
                            StepStatus::Failed,
                            "attempt reproduced an earlier result".to_string(),
                            all,
                        ));
                    }
                }
            }
        }
        let reason = format!("attempt budget exhausted ({})", self.max_step_attempts);
        Ok(outcome(StepStatus::Failed, reason, all))
    }
}
