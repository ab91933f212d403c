//! Prompt rendering for the planner, step workers and self-improve sessions.
//!
//! Templates mark each section with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections are
//! removed in a fixed order and the last section is truncated if needed.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::types::EvaluationResult;
use crate::core::workflow::StepSpec;
use crate::io::provider::ToolDescriptor;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");
const ENTRYPOINT_TEMPLATE: &str = include_str!("prompts/entrypoint.md");

pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 48_000;

/// Drop order when over budget: least critical first.
const DROP_ORDER: [&str; 4] = ["dependencies", "input", "inputs", "failure"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should be valid")
});

static ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("planner", PLANNER_TEMPLATE)
        .expect("planner template should be valid");
    env.add_template("worker", WORKER_TEMPLATE)
        .expect("worker template should be valid");
    env.add_template("entrypoint", ENTRYPOINT_TEMPLATE)
        .expect("entrypoint template should be valid");
    env
});

/// Inputs for the planning request.
#[derive(Debug, Clone, Copy)]
pub struct PlannerPrompt<'a> {
    pub goal: &'a str,
    pub charter: Option<&'a str>,
    pub input_context: Option<&'a str>,
    pub workers: &'a [&'a str],
}

/// Inputs for one step attempt.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPrompt<'a> {
    pub goal: &'a str,
    pub step: &'a StepSpec,
    pub attempt: u32,
    pub retrieval_stage: u32,
    pub tools: &'a [ToolDescriptor],
    pub previous_failure: Option<&'a str>,
    pub inputs: &'a Map<String, Value>,
    pub dependencies: &'a Map<String, Value>,
}

/// Goal framing for one self-improve entrypoint attempt.
#[derive(Debug, Clone, Copy)]
pub struct EntrypointPrompt<'a> {
    pub goal: &'a str,
    pub charter: &'a str,
    pub summary_path: &'a str,
    pub required_fields: &'a [&'a str],
    pub attempt: u32,
    pub max_attempts: u32,
    pub baseline: &'a EvaluationResult,
    pub feedback: Option<&'a str>,
    pub input_context: Option<&'a str>,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

fn pretty_map(map: &Map<String, Value>) -> Result<Option<String>> {
    if map.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string_pretty(map).context("serialize prompt json")?))
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (idx, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    let mut cut = max.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| secs.iter().map(|s| s.content.len()).sum::<usize>();
    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }
    if total(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total(rest));
    if last.content.len() > allowed {
        if allowed > 12 {
            truncate_at_char_boundary(&mut last.content, allowed - 12);
            last.content.push_str("\n[truncated]");
        } else {
            truncate_at_char_boundary(&mut last.content, allowed);
        }
        debug!(section = %last.key, "truncated section for budget");
    }
}

fn join_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET_BYTES)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    fn finish(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        join_sections(&sections)
    }

    pub fn build_planner(&self, input: &PlannerPrompt<'_>) -> Result<String> {
        let rendered = ENV.get_template("planner")?.render(context! {
            goal => input.goal.trim(),
            charter => non_empty(input.charter),
            input_context => non_empty(input.input_context),
            workers => input.workers,
        })?;
        Ok(self.finish(&rendered))
    }

    pub fn build_worker(&self, input: &WorkerPrompt<'_>) -> Result<String> {
        let rendered = ENV.get_template("worker")?.render(context! {
            goal => input.goal.trim(),
            step => input.step,
            attempt => input.attempt,
            retrieval_stage => input.retrieval_stage,
            tools => input.tools,
            previous_failure => non_empty(input.previous_failure),
            inputs => pretty_map(input.inputs)?,
            dependencies => pretty_map(input.dependencies)?,
        })?;
        Ok(self.finish(&rendered))
    }

    pub fn build_entrypoint(&self, input: &EntrypointPrompt<'_>) -> Result<String> {
        let rendered = ENV.get_template("entrypoint")?.render(context! {
            goal => input.goal.trim(),
            charter => input.charter,
            summary_path => input.summary_path,
            required_fields => input.required_fields,
            attempt => input.attempt,
            max_attempts => input.max_attempts,
            baseline => input.baseline,
            feedback => non_empty(input.feedback),
            input_context => non_empty(input.input_context),
        })?;
        Ok(self.finish(&rendered))
    }
}
