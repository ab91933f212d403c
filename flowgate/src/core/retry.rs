//! Retry admission control for repeated step attempts.
//!
//! The gate remembers every call signature and every failure fingerprint seen
//! in a session. [`RetryGate::can_retry`] is a pure read over those sets; the
//! caller records explicitly once it has acted on a decision.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::signature::sha256_hex;

pub const REASON_NO_PROGRESS: &str = "no measurable progress";
pub const REASON_SIGNATURE_REPEATED: &str = "signature repeated without progress";
pub const REASON_FAILURE_REPEATED: &str = "failure signature repeated without progress";
pub const REASON_ALLOWED: &str = "retry allowed";

/// Progress snapshot taken after an attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressMetrics {
    pub failing_tests: Option<u64>,
    pub passed_tests: Option<u64>,
    pub new_artifacts: Option<u64>,
    pub artifact_delta_hash: Option<String>,
    pub notes: Option<String>,
}

/// Outcome of a retry admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryDecision {
    pub allow: bool,
    pub reason: &'static str,
}

impl RetryDecision {
    fn allow() -> Self {
        Self {
            allow: true,
            reason: REASON_ALLOWED,
        }
    }

    fn deny(reason: &'static str) -> Self {
        Self {
            allow: false,
            reason,
        }
    }
}

/// Per-session record of attempted signatures and failure fingerprints.
///
/// Both sets only grow.
#[derive(Debug, Clone, Default)]
pub struct RetryGate {
    signatures: BTreeSet<String>,
    failures: BTreeSet<String>,
}

impl RetryGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_signature(&mut self, call_signature: &str) {
        self.signatures.insert(call_signature.to_string());
    }

    pub fn record_failure(&mut self, task_id: &str, call_signature: &str, failure_signature: &str) {
        self.failures
            .insert(failure_key(task_id, call_signature, failure_signature));
    }

    pub fn seen_signature(&self, call_signature: &str) -> bool {
        self.signatures.contains(call_signature)
    }

    pub fn seen_failure(&self, task_id: &str, call_signature: &str, failure_signature: &str) -> bool {
        self.failures
            .contains(&failure_key(task_id, call_signature, failure_signature))
    }

    /// Decide whether another attempt is admissible.
    ///
    /// Any attempt that shows progress is allowed. Without progress the attempt
    /// is denied when the signature was seen before, when the failure
    /// fingerprint was seen before, or when there is a previous snapshot it
    /// failed to improve on. The most specific reason wins.
    pub fn can_retry(
        &self,
        task_id: &str,
        call_signature: &str,
        failure_signature: &str,
        prev_metrics: Option<&ProgressMetrics>,
        new_metrics: Option<&ProgressMetrics>,
    ) -> RetryDecision {
        if has_progress(prev_metrics, new_metrics) {
            return RetryDecision::allow();
        }
        if self.seen_signature(call_signature) {
            return RetryDecision::deny(REASON_SIGNATURE_REPEATED);
        }
        if self.seen_failure(task_id, call_signature, failure_signature) {
            return RetryDecision::deny(REASON_FAILURE_REPEATED);
        }
        if prev_metrics.is_some() {
            return RetryDecision::deny(REASON_NO_PROGRESS);
        }
        RetryDecision::allow()
    }
}

/// Fingerprint for a (task, signature, failure) triple.
pub fn failure_key(task_id: &str, call_signature: &str, failure_signature: &str) -> String {
    sha256_hex(format!("{task_id}:{call_signature}:{failure_signature}"))
}

/// True when `new` shows measurable improvement over `prev`.
///
/// Without a `new` snapshot nothing can be claimed. Without a `prev`
/// snapshot the attempt is a first attempt and counts as progress.
pub fn has_progress(prev: Option<&ProgressMetrics>, new: Option<&ProgressMetrics>) -> bool {
    let Some(new) = new else {
        return false;
    };
    let Some(prev) = prev else {
        return true;
    };
    if let (Some(before), Some(after)) = (prev.failing_tests, new.failing_tests)
        && after < before
    {
        return true;
    }
    if let (Some(before), Some(after)) = (prev.passed_tests, new.passed_tests)
        && after > before
    {
        return true;
    }
    if new.new_artifacts.unwrap_or(0) > 0 {
        return true;
    }
    if let Some(hash) = new.artifact_delta_hash.as_deref()
        && !hash.is_empty()
        && prev.artifact_delta_hash.as_deref() != Some(hash)
    {
        return true;
    }
    if let Some(notes) = new.notes.as_deref()
        && !notes.is_empty()
        && prev.notes.as_deref() != Some(notes)
    {
        return true;
    }
    false
}
