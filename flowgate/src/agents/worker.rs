//! Tool-calling worker loop.
//!
//! A worker converses with the reasoning provider until it returns a terminal
//! status, invoking tools and delegating sub-goals to child workers along the
//! way. Provider failures never escape as errors: they become FAILURE outputs
//! so the driving loop can gate retries on them.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use crate::core::delegation::DelegationGraph;
use crate::core::signature::compute_call_signature;
use crate::core::types::{ToolCall, ToolResult, WorkerOutput, WorkerStatus, tool_calls_from_response};
use crate::core::workflow::StepSpec;
use crate::io::config::WorkflowConfig;
use crate::io::prompt::{PromptBuilder, WorkerPrompt};
use crate::io::provider::{Message, ProviderRequest, ProviderTimeout, ReasoningProvider, ToolDescriptor};
use crate::io::tools::ToolRegistry;
use crate::io::trace::TraceLogger;

/// Pseudo-tool name a worker uses to hand a sub-goal to a child worker.
pub const DELEGATE_TOOL: &str = "delegate";

pub const SIG_MAX_ITERATIONS: &str = "max-iterations";
pub const SIG_PROVIDER_TIMEOUT: &str = "provider-timeout";
pub const SIG_PROVIDER_ERROR: &str = "provider-error";
pub const SIG_WORKER_TIMEOUT: &str = "worker-timeout";

const RESPONSE_REMINDER: &str =
    "Respond with a JSON object containing either `tool_calls` or a terminal `status`.";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_iterations: u32,
    pub timeout: Duration,
    pub max_delegation_depth: u32,
    pub strategy_id: String,
}

impl WorkerConfig {
    pub fn from_workflow(cfg: &WorkflowConfig) -> Self {
        Self {
            max_iterations: cfg.worker_max_iterations,
            timeout: Duration::from_secs(cfg.worker_timeout_secs),
            max_delegation_depth: cfg.max_delegation_depth,
            strategy_id: cfg.strategy_id.clone(),
        }
    }
}

/// Shared collaborators for every worker of one workflow run.
#[derive(Clone, Copy)]
pub struct WorkerContext<'a> {
    pub provider: &'a dyn ReasoningProvider,
    pub tools: &'a ToolRegistry,
    pub delegation: &'a Mutex<DelegationGraph>,
    pub prompts: &'a PromptBuilder,
    pub trace: Option<&'a TraceLogger>,
    pub config: &'a WorkerConfig,
}

/// What a worker is asked to do for one step attempt.
#[derive(Debug, Clone, Copy)]
pub struct Assignment<'a> {
    pub goal: &'a str,
    pub step: &'a StepSpec,
    pub call_signature: &'a str,
    pub attempt: u32,
    pub retrieval_stage: u32,
    pub previous_failure: Option<&'a str>,
    pub dependencies: &'a Map<String, Value>,
}

#[derive(Debug, Default)]
struct LoopMetrics {
    model_calls: u64,
    tool_calls: u64,
    iterations: u64,
    records: Vec<Value>,
}

pub struct Worker<'a> {
    ctx: WorkerContext<'a>,
    depth: u32,
}

impl<'a> Worker<'a> {
    pub fn new(ctx: WorkerContext<'a>) -> Self {
        Self { ctx, depth: 0 }
    }

    fn child(&self) -> Self {
        Self {
            ctx: self.ctx,
            depth: self.depth + 1,
        }
    }

    fn log(&self, event_type: &str, payload: Value) -> Result<()> {
        match self.ctx.trace {
            Some(trace) => trace.log(event_type, payload),
            None => Ok(()),
        }
    }

    /// Run one step attempt to a terminal output.
    #[instrument(skip_all, fields(step = %assignment.step.step_id, attempt = assignment.attempt, depth = self.depth))]
    pub fn run(&self, assignment: &Assignment<'_>) -> Result<WorkerOutput> {
        let descriptors = self.descriptors();
        let system = self.ctx.prompts.build_worker(&WorkerPrompt {
            goal: assignment.goal,
            step: assignment.step,
            attempt: assignment.attempt,
            retrieval_stage: assignment.retrieval_stage,
            tools: &descriptors,
            previous_failure: assignment.previous_failure,
            inputs: &assignment.step.inputs,
            dependencies: assignment.dependencies,
        })?;
        let instruction = if assignment.step.description.is_empty() {
            format!("Complete step `{}`.", assignment.step.step_id)
        } else {
            assignment.step.description.clone()
        };
        let mut messages = vec![Message::system(system), Message::user(instruction)];
        let deadline = Instant::now() + self.ctx.config.timeout;
        let mut metrics = LoopMetrics::default();

        while metrics.iterations < u64::from(self.ctx.config.max_iterations) {
            if Instant::now() >= deadline {
                warn!("worker time budget exhausted");
                let output = WorkerOutput::failure("worker time budget exhausted", SIG_WORKER_TIMEOUT);
                return Ok(finish(output, metrics));
            }
            metrics.iterations += 1;
            let response = match self.ctx.provider.send(&ProviderRequest {
                messages: &messages,
                tools: &descriptors,
            }) {
                Ok(response) => response,
                Err(err) => {
                    metrics.model_calls += 1;
                    let signature = if err.downcast_ref::<ProviderTimeout>().is_some() {
                        SIG_PROVIDER_TIMEOUT
                    } else {
                        SIG_PROVIDER_ERROR
                    };
                    warn!(error = %err, signature, "provider call failed");
                    let output = WorkerOutput::failure(format!("provider call failed: {err:#}"), signature);
                    return Ok(finish(output, metrics));
                }
            };
            metrics.model_calls += 1;

            if let Some(output) = WorkerOutput::from_response(&response) {
                self.log(
                    "worker_model_response",
                    json!({
                        "step_id": assignment.step.step_id,
                        "call_id": assignment.call_signature,
                        "iteration": metrics.iterations,
                        "kind": "status",
                        "status": output.status.as_str(),
                    }),
                )?;
                return Ok(finish(output, metrics));
            }

            let Some(calls) = tool_calls_from_response(&response) else {
                self.log(
                    "worker_model_response",
                    json!({
                        "step_id": assignment.step.step_id,
                        "call_id": assignment.call_signature,
                        "iteration": metrics.iterations,
                        "kind": "unrecognized",
                    }),
                )?;
                messages.push(Message::assistant(response.to_string()));
                messages.push(Message::user(RESPONSE_REMINDER));
                continue;
            };
            self.log(
                "worker_model_response",
                json!({
                    "step_id": assignment.step.step_id,
                    "call_id": assignment.call_signature,
                    "iteration": metrics.iterations,
                    "kind": "tool_calls",
                    "tool_calls": calls.len(),
                }),
            )?;
            messages.push(Message::assistant(response.to_string()));
            for (idx, call) in calls.iter().enumerate() {
                let tool_call_id = call
                    .call_id
                    .clone()
                    .unwrap_or_else(|| format!("call-{}-{}", metrics.iterations, idx + 1));
                metrics.tool_calls += 1;
                let result = if call.tool == DELEGATE_TOOL {
                    self.delegate(assignment, call, &tool_call_id, &mut metrics)?
                } else {
                    self.ctx.tools.invoke(call)
                };
                metrics.records.push(json!({
                    "tool": call.tool,
                    "action": call.action,
                    "call_id": tool_call_id,
                    "ok": result.ok,
                    "elapsed_ms": result.elapsed_ms,
                }));
                self.log(
                    "worker_tool_result",
                    json!({
                        "step_id": assignment.step.step_id,
                        "call_id": assignment.call_signature,
                        "tool_call_id": tool_call_id,
                        "tool": call.tool,
                        "action": call.action,
                        "ok": result.ok,
                    }),
                )?;
                let content = json!({
                    "call_id": tool_call_id,
                    "ok": result.ok,
                    "summary": result.summary,
                    "data": result.data,
                    "error": result.error,
                });
                messages.push(Message::tool(&call.tool, content.to_string()));
            }
        }

        debug!(iterations = metrics.iterations, "worker ran out of iterations");
        let output = WorkerOutput {
            status: WorkerStatus::Partial,
            summary: format!(
                "no terminal status after {} iterations",
                self.ctx.config.max_iterations
            ),
            artifacts: Vec::new(),
            metrics: Map::new(),
            next_actions: Vec::new(),
            failure_signature: SIG_MAX_ITERATIONS.to_string(),
        };
        Ok(finish(output, metrics))
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors = self.ctx.tools.descriptors();
        if self.depth < self.ctx.config.max_delegation_depth {
            descriptors.push(ToolDescriptor {
                name: DELEGATE_TOOL.to_string(),
                actions: vec!["run".to_string()],
                description: "hand a sub-goal (args: goal, worker?) to a child worker".to_string(),
            });
        }
        descriptors
    }

    /// Run a child worker for a delegated sub-goal and report it as a tool result.
    fn delegate(
        &self,
        parent: &Assignment<'_>,
        call: &ToolCall,
        tool_call_id: &str,
        metrics: &mut LoopMetrics,
    ) -> Result<ToolResult> {
        let Some(goal) = call.args.get("goal").and_then(Value::as_str) else {
            return Ok(ToolResult::error("delegation refused", "missing string argument 'goal'"));
        };
        let worker = call
            .args
            .get("worker")
            .and_then(Value::as_str)
            .unwrap_or(parent.step.worker.as_str());
        if self.depth >= self.ctx.config.max_delegation_depth {
            self.log_delegation(parent, None, false, "max delegation depth reached")?;
            return Ok(ToolResult::error(
                "delegation refused",
                format!("max delegation depth {} reached", self.ctx.config.max_delegation_depth),
            ));
        }

        let child_step_id = format!("{}/{}", parent.step.step_id, tool_call_id);
        let child_signature = compute_call_signature(
            goal,
            &child_step_id,
            worker,
            &Value::Object(call.args.clone()),
            &self.ctx.config.strategy_id,
            parent.retrieval_stage,
        );
        let accepted = self
            .ctx
            .delegation
            .lock()
            .map_err(|_| anyhow!("delegation graph lock poisoned"))?
            .add_edge(parent.call_signature, &child_signature);
        if !accepted {
            self.log_delegation(parent, Some(&child_signature), false, "delegation cycle")?;
            return Ok(ToolResult::error(
                "delegation refused",
                "delegation would create a cycle",
            ));
        }
        self.log_delegation(parent, Some(&child_signature), true, "accepted")?;

        let mut step = StepSpec::new(&child_step_id, worker, &[]);
        step.description = goal.to_string();
        let child_assignment = Assignment {
            goal,
            step: &step,
            call_signature: &child_signature,
            attempt: 1,
            retrieval_stage: parent.retrieval_stage,
            previous_failure: None,
            dependencies: &Map::new(),
        };
        let output = self.child().run(&child_assignment)?;
        metrics.model_calls += output.metric_u64("model_calls").unwrap_or(0);
        metrics.tool_calls += output.metric_u64("tool_calls").unwrap_or(0);
        let data = serde_json::to_value(&output)?;
        if output.status == WorkerStatus::Success {
            Ok(ToolResult::ok(output.summary, data))
        } else {
            let mut result = ToolResult::error(
                output.summary.clone(),
                format!("child finished {}", output.status.as_str()),
            );
            result.data = data;
            Ok(result)
        }
    }

    fn log_delegation(
        &self,
        parent: &Assignment<'_>,
        child: Option<&str>,
        accepted: bool,
        reason: &str,
    ) -> Result<()> {
        self.log(
            "worker_delegation",
            json!({
                "step_id": parent.step.step_id,
                "parent": parent.call_signature,
                "child": child,
                "depth": self.depth + 1,
                "accepted": accepted,
                "reason": reason,
            }),
        )
    }
}

/// Merge loop counters into the output's metrics; counters win over reported values.
fn finish(mut output: WorkerOutput, metrics: LoopMetrics) -> WorkerOutput {
    output.metrics.insert("model_calls".into(), json!(metrics.model_calls));
    output.metrics.insert("tool_calls".into(), json!(metrics.tool_calls));
    output.metrics.insert("iteration_count".into(), json!(metrics.iterations));
    output
        .metrics
        .insert("tool_call_records".into(), Value::Array(metrics.records));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::io::provider::ScriptedProvider;
    use crate::io::tools::FileTool;
    use crate::io::trace::read_trace;

    struct Fixture {
        temp: tempfile::TempDir,
        tools: ToolRegistry,
        delegation: Mutex<DelegationGraph>,
        prompts: PromptBuilder,
        config: WorkerConfig,
        trace: TraceLogger,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let tools = ToolRegistry::new().with(Arc::new(FileTool::new(temp.path())));
            let trace = TraceLogger::new(temp.path().join("trace.jsonl"));
            Self {
                temp,
                tools,
                delegation: Mutex::new(DelegationGraph::new()),
                prompts: PromptBuilder::default(),
                config: WorkerConfig {
                    max_iterations: 4,
                    timeout: Duration::from_secs(30),
                    max_delegation_depth: 1,
                    strategy_id: "default".into(),
                },
                trace,
            }
        }

        fn run(&self, provider: &ScriptedProvider) -> WorkerOutput {
            let step = StepSpec::new("fix", "Implementer", &[]);
            let ctx = WorkerContext {
                provider,
                tools: &self.tools,
                delegation: &self.delegation,
                prompts: &self.prompts,
                trace: Some(&self.trace),
                config: &self.config,
            };
            Worker::new(ctx)
                .run(&Assignment {
                    goal: "Fix add",
                    step: &step,
                    call_signature: "sig-root",
                    attempt: 1,
                    retrieval_stage: 1,
                    previous_failure: None,
                    dependencies: &Map::new(),
                })
                .expect("worker run")
        }
    }

    #[test]
    fn tool_results_echo_call_id_and_count_metrics() {
        let fixture = Fixture::new();
        let provider = ScriptedProvider::new(vec![
            json!({"tool_calls": [{"tool": "file", "action": "write", "args": {"path": "a.txt", "content": "hi"}, "call_id": "c1"}]}),
            json!({"status": "SUCCESS", "summary": "wrote a.txt", "metrics": {"custom": 7}}),
        ]);
        let output = fixture.run(&provider);

        assert_eq!(output.status, WorkerStatus::Success);
        assert_eq!(output.metric_u64("model_calls"), Some(2));
        assert_eq!(output.metric_u64("tool_calls"), Some(1));
        assert_eq!(output.metric_u64("iteration_count"), Some(2));
        assert_eq!(output.metric_u64("custom"), Some(7));
        assert_eq!(output.metrics["tool_call_records"][0]["call_id"], "c1");
        assert!(fixture.temp.path().join("a.txt").is_file());

        let second_turn = &provider.seen_messages()[1];
        let tool_msg = second_turn.last().expect("tool message");
        assert_eq!(tool_msg.role, "tool");
        assert_eq!(tool_msg.name.as_deref(), Some("file"));
        let content: Value = serde_json::from_str(&tool_msg.content).expect("json content");
        assert_eq!(content["call_id"], "c1");
        assert_eq!(content["ok"], true);

        let events = read_trace(fixture.trace.path()).expect("trace");
        let tool_event = events
            .iter()
            .find(|e| e.event_type == "worker_tool_result")
            .expect("tool event");
        assert_eq!(tool_event.payload["call_id"], "sig-root");
        assert_eq!(tool_event.payload["tool_call_id"], "c1");
    }

    #[test]
    fn unknown_tool_is_reported_not_fatal() {
        let fixture = Fixture::new();
        let provider = ScriptedProvider::new(vec![
            json!({"tool_calls": [{"tool": "shell", "action": "run", "args": {}}]}),
            json!({"status": "FAILURE", "summary": "no shell", "failure_signature": "no-tool"}),
        ]);
        let output = fixture.run(&provider);
        assert_eq!(output.status, WorkerStatus::Failure);
        assert_eq!(output.metrics["tool_call_records"][0]["ok"], false);
        assert_eq!(output.metrics["tool_call_records"][0]["call_id"], "call-1-1");
    }

    #[test]
    fn exhausting_iterations_is_partial() {
        let fixture = Fixture::new();
        let provider = ScriptedProvider::new(
            (0..4)
                .map(|_| json!({"tool_calls": [{"tool": "file", "action": "list", "args": {}}]}))
                .collect(),
        );
        let output = fixture.run(&provider);
        assert_eq!(output.status, WorkerStatus::Partial);
        assert_eq!(output.failure_signature, SIG_MAX_ITERATIONS);
        assert_eq!(output.metric_u64("iteration_count"), Some(4));
    }

    #[test]
    fn delegation_runs_child_and_respects_depth() {
        let fixture = Fixture::new();
        let provider = ScriptedProvider::new(vec![
            json!({"tool_calls": [{"tool": "delegate", "action": "run", "args": {"goal": "write helper"}, "call_id": "d1"}]}),
            // child: tries to delegate again beyond max depth, then finishes
            json!({"tool_calls": [{"tool": "delegate", "action": "run", "args": {"goal": "deeper"}, "call_id": "d2"}]}),
            json!({"status": "SUCCESS", "summary": "helper written"}),
            json!({"status": "SUCCESS", "summary": "done"}),
        ]);
        let output = fixture.run(&provider);
        assert_eq!(output.status, WorkerStatus::Success);
        // parent 2 + child 2 model calls; parent 1 + child 1 tool calls
        assert_eq!(output.metric_u64("model_calls"), Some(4));
        assert_eq!(output.metric_u64("tool_calls"), Some(2));
        assert_eq!(output.metrics["tool_call_records"][0]["ok"], true);

        let graph = fixture.delegation.lock().expect("lock");
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.children("sig-root").count(), 1);
        drop(graph);

        let events = read_trace(fixture.trace.path()).expect("trace");
        let delegations: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == "worker_delegation")
            .collect();
        assert_eq!(delegations.len(), 2);
        assert_eq!(delegations[0].payload["accepted"], true);
        assert_eq!(delegations[1].payload["accepted"], false);
    }

    #[test]
    fn provider_errors_become_failures() {
        struct Broken;
        impl ReasoningProvider for Broken {
            fn send(&self, _request: &ProviderRequest<'_>) -> Result<Value> {
                Err(ProviderTimeout(Duration::from_secs(1)).into())
            }
        }
        let fixture = Fixture::new();
        let step = StepSpec::new("fix", "Implementer", &[]);
        let ctx = WorkerContext {
            provider: &Broken,
            tools: &fixture.tools,
            delegation: &fixture.delegation,
            prompts: &fixture.prompts,
            trace: None,
            config: &fixture.config,
        };
        let output = Worker::new(ctx)
            .run(&Assignment {
                goal: "g",
                step: &step,
                call_signature: "sig",
                attempt: 1,
                retrieval_stage: 1,
                previous_failure: None,
                dependencies: &Map::new(),
            })
            .expect("run");
        assert_eq!(output.status, WorkerStatus::Failure);
        assert_eq!(output.failure_signature, SIG_PROVIDER_TIMEOUT);
        assert_eq!(output.metric_u64("model_calls"), Some(1));
    }
}
