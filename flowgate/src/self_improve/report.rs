//! Self-improve report model and its markdown rendering.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::charter::{DiversityCheck, PathCharter};
use crate::core::score::Score;
use crate::core::types::EvaluationResult;
use crate::core::verification::Verification;
use crate::core::workflow::WorkflowStatus;
use crate::io::config::SelfImproveConfig;
use crate::io::input::InputPayload;
use crate::io::workspace::FileChange;

pub const REPORT_JSON_FILE: &str = "report.json";
pub const REPORT_MARKDOWN_FILE: &str = "report.md";

/// One pass of the entrypoint loop: plan, execute, summarize, verify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrypointAttempt {
    pub attempt: u32,
    pub run_root: PathBuf,
    pub workflow_status: WorkflowStatus,
    pub verification: Verification,
    /// Parsed experiment summary, when the session wrote a readable one.
    pub experiment_summary: Option<Value>,
    pub evaluation: Option<EvaluationResult>,
    pub changed_files: Vec<String>,
    pub model_calls: u64,
    pub tool_calls: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: String,
    /// 1-based position in the batch; ties in score resolve to the lowest.
    pub index: usize,
    pub charter: PathCharter,
    pub workspace: Option<PathBuf>,
    pub run_root: Option<PathBuf>,
    pub workflow_status: WorkflowStatus,
    pub evaluation: Option<EvaluationResult>,
    pub score: Score,
    pub model_calls: u64,
    pub tool_calls: u64,
    pub changed_files: Vec<String>,
    pub changes: Vec<FileChange>,
    pub verification_ok: bool,
    pub verification_reason: String,
    pub entrypoint_attempts: u32,
    pub attempts: Vec<EntrypointAttempt>,
    #[serde(default)]
    pub clarifying_questions: Vec<String>,
    /// Infrastructure error that ended the session early.
    pub error: Option<String>,
}

impl SessionResult {
    /// Experiment summary of the last attempt that produced one.
    pub fn last_summary(&self) -> Option<&Value> {
        self.attempts
            .iter()
            .rev()
            .find_map(|attempt| attempt.experiment_summary.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_index: usize,
    pub baseline_evaluation: Option<EvaluationResult>,
    pub sessions: Vec<SessionResult>,
    pub diversity: DiversityCheck,
    pub winner_session_id: Option<String>,
    pub merged: bool,
    pub merge_reason: String,
    pub master_evaluation: Option<EvaluationResult>,
    /// Commit created on master for a kept merge.
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfImproveReport {
    pub run_id: String,
    pub goal: String,
    pub input: InputPayload,
    pub run_root: PathBuf,
    pub master: PathBuf,
    pub settings: SelfImproveConfig,
    pub declared_scoring_function: String,
    pub batches: Vec<BatchResult>,
}

impl SelfImproveReport {
    /// True when some batch kept a merge.
    pub fn any_merged(&self) -> bool {
        self.batches.iter().any(|batch| batch.merged)
    }

    /// True when every session of every batch was blocked on ambiguity.
    pub fn all_blocked(&self) -> bool {
        let mut sessions = self.batches.iter().flat_map(|batch| batch.sessions.iter());
        let mut any = false;
        let all = sessions.all(|session| {
            any = true;
            session.workflow_status == WorkflowStatus::Blocked
        });
        any && all
    }
}

fn eval_cell(evaluation: Option<&EvaluationResult>) -> String {
    match evaluation {
        Some(eval) => format!(
            "ok={} passed={} failed={}",
            eval.ok, eval.passed, eval.failed
        ),
        None => "n/a".to_string(),
    }
}

/// Flatten a summary field into a single table cell.
fn summary_cell(summary: Option<&Value>, key: &str) -> String {
    let text = match summary.and_then(|s| s.get(key)) {
        None | Some(Value::Null) => return "-".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        Some(other) => other.to_string(),
    };
    let cell = text.replace('|', "\\|").replace('\n', " ");
    if cell.trim().is_empty() {
        "-".to_string()
    } else {
        cell
    }
}

pub fn render_markdown(report: &SelfImproveReport) -> String {
    let mut out = String::new();
    let input_kind = serde_json::to_value(report.input.kind)
        .ok()
        .and_then(|kind| kind.as_str().map(str::to_string))
        .unwrap_or_default();
    let input_ref = report
        .input
        .reference
        .as_deref()
        .map(|reference| format!(" ({reference})"))
        .unwrap_or_default();
    out.push_str(&format!("# Self-Improve Report `{}`\n\n", report.run_id));
    out.push_str(&format!("- Goal: {}\n", report.goal.trim()));
    out.push_str(&format!("- Input: {input_kind}{input_ref}\n"));
    out.push_str(&format!("- Master: `{}`\n", report.master.display()));
    out.push_str(&format!(
        "- Settings: sessions_per_batch={} batches={} max_workers={} entrypoint_max_attempts={} merge_on_success={}\n",
        report.settings.sessions_per_batch,
        report.settings.batches,
        report.settings.max_workers,
        report.settings.entrypoint_max_attempts,
        report.settings.merge_on_success
    ));

    for batch in &report.batches {
        out.push_str(&format!("\n## Batch {}\n\n", batch.batch_index));
        out.push_str(&format!(
            "- Baseline: {}\n",
            eval_cell(batch.baseline_evaluation.as_ref())
        ));
        out.push_str(&format!(
            "- Winner: {}\n",
            batch.winner_session_id.as_deref().unwrap_or("none")
        ));
        out.push_str(&format!("- Merged: {} ({})\n", batch.merged, batch.merge_reason));
        if let Some(eval) = &batch.master_evaluation {
            out.push_str(&format!("- Post-merge: {}\n", eval_cell(Some(eval))));
        }
        if let Some(commit) = &batch.commit {
            out.push_str(&format!("- Commit: `{commit}`\n"));
        }

        out.push_str("\n## Parallel Exploration Protocol\n\n");
        out.push_str(&format!(
            "Declared scoring function: {}\n\n",
            report.declared_scoring_function
        ));
        let diversity = &batch.diversity;
        out.push_str(&format!(
            "Diversity check: {} (min distance {}, required {})\n",
            if diversity.ok { "passed" } else { "FAILED" },
            diversity
                .min_distance
                .map(|d| d.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            diversity.required
        ));
        for (a, b) in &diversity.violations {
            out.push_str(&format!("- too similar: {a} / {b}\n"));
        }

        out.push_str(
            "\n| Session | Charter | Status | Verified | Score | Attempts | Changed | Plan | Self-critique | Lessons |\n",
        );
        out.push_str("|---|---|---|---|---|---|---|---|---|---|\n");
        for session in &batch.sessions {
            let summary = session.last_summary();
            let winner = batch.winner_session_id.as_deref() == Some(session.session_id.as_str());
            out.push_str(&format!(
                "| {}{} | {} | {} | {} | {:?} | {} | {} | {} | {} | {} |\n",
                session.session_id,
                if winner { " (winner)" } else { "" },
                session.charter.describe(),
                session.workflow_status.as_str(),
                session.verification_ok,
                session.score.0,
                session.entrypoint_attempts,
                session.changed_files.len(),
                summary_cell(summary, "plan"),
                summary_cell(summary, "self_critique"),
                summary_cell(summary, "lessons"),
            ));
        }

        for session in &batch.sessions {
            out.push_str(&format!(
                "\n### Session {}\n\n- Verification: {}\n",
                session.session_id, session.verification_reason
            ));
            if let Some(error) = &session.error {
                out.push_str(&format!("- Error: {error}\n"));
            }
            for question in &session.clarifying_questions {
                out.push_str(&format!("- Question: {question}\n"));
            }
            for attempt in &session.attempts {
                out.push_str(&format!(
                    "- Attempt {}: {} / {} / {}\n",
                    attempt.attempt,
                    attempt.workflow_status.as_str(),
                    eval_cell(attempt.evaluation.as_ref()),
                    attempt.verification.reason
                ));
            }
        }
    }
    out
}
