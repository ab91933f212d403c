//! Planner agent: asks the provider for a workflow, or for what it needs to know.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::core::workflow::{StepSpec, WorkflowSpec, workflow_from_value};
use crate::io::prompt::{PlannerPrompt, PromptBuilder};
use crate::io::provider::{Message, ProviderRequest, ReasoningProvider};
use crate::io::trace::TraceLogger;

/// Worker roles offered to the planner.
pub const WORKER_TYPES: [&str; 4] = ["Implementer", "Researcher", "Tester", "Reviewer"];

/// Step used when the provider answers without a workflow.
pub const FALLBACK_STEP_ID: &str = "implement";

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Workflow(WorkflowSpec),
    /// The provider declined to plan and asked for more information.
    Blocked {
        summary: String,
        clarifying_questions: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanRequest<'a> {
    pub goal: &'a str,
    pub charter: Option<&'a str>,
    pub input_context: Option<&'a str>,
}

pub struct Planner<'a> {
    provider: &'a dyn ReasoningProvider,
    prompts: &'a PromptBuilder,
    trace: Option<&'a TraceLogger>,
}

impl<'a> Planner<'a> {
    pub fn new(
        provider: &'a dyn ReasoningProvider,
        prompts: &'a PromptBuilder,
        trace: Option<&'a TraceLogger>,
    ) -> Self {
        Self {
            provider,
            prompts,
            trace,
        }
    }

    #[instrument(skip_all, fields(goal = %request.goal))]
    pub fn plan(&self, request: &PlanRequest<'_>) -> Result<PlanOutcome> {
        let prompt = self.prompts.build_planner(&PlannerPrompt {
            goal: request.goal,
            charter: request.charter,
            input_context: request.input_context,
            workers: &WORKER_TYPES,
        })?;
        let messages = [Message::system(prompt), Message::user(request.goal)];
        let response = self
            .provider
            .send(&ProviderRequest {
                messages: &messages,
                tools: &[],
            })
            .context("planner request failed")?;
        let outcome = interpret_plan(request.goal, &response)?;
        if let Some(trace) = self.trace {
            let payload = match &outcome {
                PlanOutcome::Workflow(spec) => json!({
                    "status": "PLANNED",
                    "workflow_id": spec.workflow_id,
                    "steps": spec.steps.iter().map(|s| s.step_id.as_str()).collect::<Vec<_>>(),
                }),
                PlanOutcome::Blocked {
                    clarifying_questions,
                    ..
                } => json!({"status": "BLOCKED", "clarifying_questions": clarifying_questions}),
            };
            trace.log("planner_response", payload)?;
        }
        Ok(outcome)
    }
}

/// Turn a planner response into a plan, a block, or the single-step fallback.
pub fn interpret_plan(goal: &str, response: &Value) -> Result<PlanOutcome> {
    if response.get("status").and_then(Value::as_str) == Some("BLOCKED") {
        let summary = response
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let clarifying_questions = response
            .get("clarifying_questions")
            .and_then(Value::as_array)
            .map(|qs| qs.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        return Ok(PlanOutcome::Blocked {
            summary,
            clarifying_questions,
        });
    }
    match response.get("workflow") {
        Some(workflow) => Ok(PlanOutcome::Workflow(
            workflow_from_value(goal, workflow).context("planner returned an invalid workflow")?,
        )),
        None => {
            debug!("planner response has no workflow; using single-step plan");
            Ok(PlanOutcome::Workflow(fallback_workflow(goal)?))
        }
    }
}

/// One Implementer step carrying the whole goal.
pub fn fallback_workflow(goal: &str) -> Result<WorkflowSpec> {
    let mut step = StepSpec::new(FALLBACK_STEP_ID, "Implementer", &[]);
    step.description = goal.to_string();
    workflow_from_value(goal, &json!({"steps": [step]}))
        .context("build single-step workflow")
}
