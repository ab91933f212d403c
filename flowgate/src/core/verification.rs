//! Verdicts on whether an entrypoint attempt produced a real change.

use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::EvaluationResult;
use crate::core::workflow::WorkflowStatus;

const EXPERIMENT_SUMMARY_SCHEMA: &str =
    include_str!("../../schemas/experiment_summary.schema.json");

pub const REQUIRED_SUMMARY_FIELDS: [&str; 5] = [
    "causal_mechanism_hypothesis",
    "pass_condition",
    "baseline_evaluation",
    "post_change_evaluation",
    "delta",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub ok: bool,
    pub reason: String,
}

impl Verification {
    fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
        }
    }
}

/// Structural check of an experiment summary. Returns every problem found.
pub fn check_experiment_summary(summary: &Value) -> Result<(), Vec<String>> {
    let schema: Value = serde_json::from_str(EXPERIMENT_SUMMARY_SCHEMA)
        .map_err(|err| vec![format!("experiment summary schema is not JSON: {err}")])?;
    let validator =
        validator_for(&schema).map_err(|err| vec![format!("invalid summary schema: {err}")])?;
    let errors: Vec<String> = validator
        .iter_errors(summary)
        .map(|err| err.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Everything the verifier looks at for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptEvidence<'a> {
    pub workflow_status: WorkflowStatus,
    /// Parsed summary, or a description of why it could not be loaded.
    pub summary: Result<&'a Value, &'a str>,
    /// Files under the include paths that differ from master.
    pub changed_files: &'a [String],
    /// Evaluation of the workspace taken after the attempt.
    pub evaluation: &'a EvaluationResult,
}

/// Decide whether an attempt demonstrates a genuine, test-backed change.
///
/// Checks run in order and the first failure is reported: the workflow must
/// have succeeded, the summary must be structurally complete, at least one
/// tracked file must differ from master, and the workspace evaluation must pass.
pub fn verify_attempt(evidence: &AttemptEvidence<'_>) -> Verification {
    if evidence.workflow_status != WorkflowStatus::Succeeded {
        return Verification::fail(format!(
            "workflow finished {}",
            evidence.workflow_status.as_str()
        ));
    }
    let summary = match evidence.summary {
        Ok(summary) => summary,
        Err(reason) => return Verification::fail(format!("experiment summary unavailable: {reason}")),
    };
    if let Err(errors) = check_experiment_summary(summary) {
        return Verification::fail(format!(
            "experiment summary incomplete: {}",
            errors.join("; ")
        ));
    }
    if evidence.changed_files.is_empty() {
        return Verification::fail("no tracked file changed (no-op attempt)");
    }
    if !evidence.evaluation.ok {
        let failing = if evidence.evaluation.failing_tests.is_empty() {
            format!("{} failed", evidence.evaluation.failed)
        } else {
            evidence.evaluation.failing_tests.join(", ")
        };
        return Verification::fail(format!("post-change evaluation failing: {failing}"));
    }
    Verification {
        ok: true,
        reason: format!(
            "verified: {} changed file(s), evaluation ok ({} passed)",
            evidence.changed_files.len(),
            evidence.evaluation.passed
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complete_summary() -> Value {
        json!({
            "causal_mechanism_hypothesis": "add() returned the difference",
            "pass_condition": "test_add passes",
            "baseline_evaluation": {"ok": false, "passed": 0, "failed": 1, "failing_tests": ["t::test_add"]},
            "post_change_evaluation": {"ok": true, "passed": 1, "failed": 0, "failing_tests": []},
            "delta": {"passed": 1, "failed": -1}
        })
    }

    fn passing() -> EvaluationResult {
        EvaluationResult {
            ok: true,
            passed: 1,
            failed: 0,
            failing_tests: Vec::new(),
            elapsed_s: 0.1,
        }
    }

    #[test]
    fn summary_missing_a_field_is_rejected() {
        let errors = check_experiment_summary(&json!({"causal_mechanism_hypothesis": "x"}))
            .expect_err("incomplete");
        assert!(errors.iter().any(|e| e.contains("pass_condition")));
    }

    #[test]
    fn complete_summary_passes_structural_check() {
        check_experiment_summary(&complete_summary()).expect("complete");
    }

    #[test]
    fn no_op_attempt_fails_verification() {
        let summary = complete_summary();
        let eval = passing();
        let verdict = verify_attempt(&AttemptEvidence {
            workflow_status: WorkflowStatus::Succeeded,
            summary: Ok(&summary),
            changed_files: &[],
            evaluation: &eval,
        });
        assert!(!verdict.ok);
        assert!(verdict.reason.contains("no-op"));
    }

    #[test]
    fn real_change_with_passing_evaluation_is_verified() {
        let summary = complete_summary();
        let eval = passing();
        let changed = vec!["proj/app.py".to_string()];
        let verdict = verify_attempt(&AttemptEvidence {
            workflow_status: WorkflowStatus::Succeeded,
            summary: Ok(&summary),
            changed_files: &changed,
            evaluation: &eval,
        });
        assert!(verdict.ok, "{}", verdict.reason);
    }

    #[test]
    fn failing_workflow_missing_summary_and_red_tests_each_fail() {
        let summary = complete_summary();
        let eval = passing();
        let changed = vec!["proj/app.py".to_string()];

        let failed_workflow = verify_attempt(&AttemptEvidence {
            workflow_status: WorkflowStatus::Failed,
            summary: Ok(&summary),
            changed_files: &changed,
            evaluation: &eval,
        });
        assert_eq!(failed_workflow.reason, "workflow finished FAILED");

        let missing = verify_attempt(&AttemptEvidence {
            workflow_status: WorkflowStatus::Succeeded,
            summary: Err("not found"),
            changed_files: &changed,
            evaluation: &eval,
        });
        assert!(missing.reason.contains("not found"));

        let red = EvaluationResult {
            ok: false,
            passed: 0,
            failed: 1,
            failing_tests: vec!["t::test_add".to_string()],
            elapsed_s: 0.0,
        };
        let failing = verify_attempt(&AttemptEvidence {
            workflow_status: WorkflowStatus::Succeeded,
            summary: Ok(&summary),
            changed_files: &changed,
            evaluation: &red,
        });
        assert!(!failing.ok);
        assert!(failing.reason.contains("t::test_add"));
    }
}
