//! Self-improvement orchestrator.
//!
//! Each batch evaluates master, runs diversified sessions in parallel (each
//! in its own cloned workspace), ranks the verified ones by the declared
//! score, and merges the winner back onto master. A merge that makes the
//! master evaluation regress is rolled back.

pub mod report;
pub mod session;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::{Map, json};
use tracing::{info, instrument, warn};

use crate::core::charter::{PathCharter, diversity_check};
use crate::core::score::{Candidate, DECLARED_SCORING_FUNCTION, select_winner};
use crate::core::types::EvaluationResult;
use crate::io::config::{SelfImproveConfig, WorkflowConfig};
use crate::io::evaluation::TestRunner;
use crate::io::fs_util::{write_atomic, write_json};
use crate::io::git::{Git, git_available};
use crate::io::input::read_optional_input;
use crate::io::provider::ReasoningProvider;
use crate::io::run_context::{RunContext, generate_run_id};
use crate::io::workspace::apply_changes;
use crate::pool::run_bounded;
use report::{
    BatchResult, REPORT_JSON_FILE, REPORT_MARKDOWN_FILE, SelfImproveReport, SessionResult,
    render_markdown,
};
use session::{SessionEnv, run_session};

pub const SELF_IMPROVE_DIR: &str = "self-improve";
pub const SESSIONS_DIR: &str = "sessions";

/// Builds the reasoning provider for a session, given its id and workspace.
pub type ProviderFactory =
    dyn Fn(&str, &Path) -> Result<Box<dyn ReasoningProvider>> + Send + Sync;

pub struct SelfImprove {
    pub master: PathBuf,
    pub runs_dir: PathBuf,
    pub settings: SelfImproveConfig,
    pub workflow: WorkflowConfig,
    pub test_runner: Arc<dyn TestRunner>,
    pub providers: Box<ProviderFactory>,
}

/// Whether a post-merge evaluation is worse than the batch baseline.
pub fn merge_regressed(baseline: Option<&EvaluationResult>, after: &EvaluationResult) -> bool {
    if after.ok {
        return false;
    }
    match baseline {
        Some(baseline) => baseline.ok || after.failed > baseline.failed,
        None => true,
    }
}

impl SelfImprove {
    /// Run every batch and write `report.json` and `report.md`.
    #[instrument(skip_all, fields(master = %self.master.display()))]
    pub fn run(&self, goal: &str, input_ref: Option<&str>) -> Result<SelfImproveReport> {
        if !git_available() {
            bail!("git is required for self-improve but is not available");
        }
        let input = read_optional_input(input_ref)?;
        let run_id = generate_run_id();
        let run_root = self.runs_dir.join(SELF_IMPROVE_DIR).join(&run_id);

        let mut metadata = Map::new();
        metadata.insert("command".into(), json!("self-improve"));
        metadata.insert("goal".into(), json!(goal));
        metadata.insert("master".into(), json!(self.master));
        metadata.insert("input".into(), serde_json::to_value(&input)?);
        let master_git = Git::new(&self.master);
        if master_git.is_repo() {
            metadata.insert("master_head".into(), json!(master_git.head_sha()?));
        }
        let run = RunContext::create_at(run_root.clone(), run_id.clone(), metadata)?;
        info!(run_id = %run_id, batches = self.settings.batches, "starting self-improve");

        let mut report = SelfImproveReport {
            run_id,
            goal: goal.to_string(),
            input,
            run_root,
            master: self.master.clone(),
            settings: self.settings.clone(),
            declared_scoring_function: DECLARED_SCORING_FUNCTION.to_string(),
            batches: Vec::new(),
        };
        for batch_index in 1..=self.settings.batches {
            let batch = self.run_batch(&run, &report, batch_index)?;
            run.trace().log(
                "batch_finished",
                json!({
                    "batch": batch_index,
                    "winner": batch.winner_session_id,
                    "merged": batch.merged,
                    "reason": batch.merge_reason,
                }),
            )?;
            report.batches.push(batch);
            write_report(&report)?;
        }
        write_report(&report)?;
        run.update_manifest("merged", json!(report.any_merged()))?;
        Ok(report)
    }

    #[instrument(skip_all, fields(batch = batch_index))]
    fn run_batch(
        &self,
        run: &RunContext,
        report: &SelfImproveReport,
        batch_index: usize,
    ) -> Result<BatchResult> {
        let baseline = self.evaluate_master("baseline");
        let sessions_dir = run.root().join(SESSIONS_DIR);
        let env = SessionEnv {
            goal: &report.goal,
            input: &report.input,
            master: &self.master,
            sessions_dir: &sessions_dir,
            parent_run_id: run.run_id(),
            settings: &self.settings,
            workflow: &self.workflow,
            test_runner: &self.test_runner,
            providers: self.providers.as_ref(),
            baseline: baseline.as_ref(),
        };
        let indices: Vec<usize> = (1..=self.settings.sessions_per_batch).collect();
        let sessions: Vec<SessionResult> =
            run_bounded(indices, self.settings.max_workers, |_, index| {
                run_session(&env, batch_index, index)
            })?;

        let charters: Vec<PathCharter> = sessions.iter().map(|s| s.charter.clone()).collect();
        let diversity = diversity_check(&charters);
        if !diversity.ok {
            warn!(violations = diversity.violations.len(), "session charters are not diverse");
        }
        let candidates: Vec<Candidate<'_>> = sessions
            .iter()
            .map(|session| Candidate {
                session_id: &session.session_id,
                index: session.index,
                verified: session.verification_ok,
                score: session.score,
            })
            .collect();
        let winner_session_id = select_winner(&candidates).map(str::to_string);

        let mut batch = BatchResult {
            batch_index,
            baseline_evaluation: baseline,
            diversity,
            winner_session_id,
            merged: false,
            merge_reason: String::new(),
            master_evaluation: None,
            commit: None,
            sessions,
        };
        self.merge_winner(&mut batch)?;
        info!(
            winner = ?batch.winner_session_id,
            merged = batch.merged,
            reason = %batch.merge_reason,
            "batch finished"
        );
        Ok(batch)
    }

    fn evaluate_master(&self, label: &str) -> Option<EvaluationResult> {
        match self
            .test_runner
            .evaluate(&self.master, &self.settings.test_targets)
        {
            Ok(evaluation) => Some(evaluation),
            Err(err) => {
                warn!(err = %format!("{err:#}"), label, "master evaluation failed");
                None
            }
        }
    }

    /// Apply the winner's changes to master, re-evaluate, keep or roll back.
    fn merge_winner(&self, batch: &mut BatchResult) -> Result<()> {
        let Some(winner_id) = batch.winner_session_id.clone() else {
            batch.merge_reason = "no session verified".to_string();
            return Ok(());
        };
        if !self.settings.merge_on_success {
            batch.merge_reason = "merge_on_success disabled".to_string();
            return Ok(());
        }
        let Some(winner) = batch
            .sessions
            .iter()
            .find(|session| session.session_id == winner_id)
        else {
            bail!("winner {winner_id} is not part of batch {}", batch.batch_index);
        };
        let Some(workspace) = winner.workspace.as_deref() else {
            bail!("winner {winner_id} has no workspace");
        };

        let backup = apply_changes(&self.master, workspace, &winner.changes)
            .with_context(|| format!("merge session {winner_id} into master"))?;
        let after = self
            .evaluate_master("post-merge")
            .unwrap_or_else(|| EvaluationResult::unavailable("post-merge evaluation failed"));
        if merge_regressed(batch.baseline_evaluation.as_ref(), &after) {
            backup.rollback()?;
            batch.merge_reason = format!(
                "post-merge evaluation regressed (failed={}); merge of {winner_id} rolled back",
                after.failed
            );
            batch.master_evaluation = Some(after);
            return Ok(());
        }

        let touched = backup.touched();
        batch.merged = true;
        batch.merge_reason = format!("merged {} change(s) from {winner_id}", touched.len());
        batch.master_evaluation = Some(after);
        if self.settings.commit_merges {
            batch.commit = self.commit_merge(&winner_id, batch.batch_index, &touched)?;
        }
        Ok(())
    }

    fn commit_merge(&self, winner_id: &str, batch_index: usize, paths: &[String]) -> Result<Option<String>> {
        let git = Git::new(&self.master);
        if !git.is_repo() {
            warn!("master is not a git repository, skipping commit");
            return Ok(None);
        }
        git.add_paths(paths)?;
        let message = format!("flowgate: merge session {winner_id} (batch {batch_index})");
        if !git.commit_staged(&message)? {
            return Ok(None);
        }
        git.head_sha()
    }
}

fn write_report(report: &SelfImproveReport) -> Result<()> {
    fs::create_dir_all(&report.run_root)
        .with_context(|| format!("create {}", report.run_root.display()))?;
    write_json(&report.run_root.join(REPORT_JSON_FILE), report)?;
    write_atomic(
        &report.run_root.join(REPORT_MARKDOWN_FILE),
        &render_markdown(report),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(ok: bool, failed: u64) -> EvaluationResult {
        EvaluationResult {
            ok,
            passed: 3,
            failed,
            failing_tests: Vec::new(),
            elapsed_s: 0.0,
        }
    }

    #[test]
    fn regression_means_worse_than_baseline() {
        assert!(!merge_regressed(Some(&eval(true, 0)), &eval(true, 0)));
        assert!(merge_regressed(Some(&eval(true, 0)), &eval(false, 1)));
        assert!(!merge_regressed(Some(&eval(false, 2)), &eval(false, 1)));
        assert!(merge_regressed(Some(&eval(false, 1)), &eval(false, 2)));
        assert!(merge_regressed(None, &eval(false, 0)));
    }
}
