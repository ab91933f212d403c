//! Path charters: deterministic approach fingerprints for parallel sessions.
//!
//! A charter picks one option along each of four axes. The option index on
//! each axis is the session's position in its batch modulo the axis length,
//! shifted by the batch number. Axis lengths are 5, 6, 7 and 2; two indices
//! closer than 30 apart can share at most two axes, so every pair of
//! sessions in a batch of up to [`MAX_DIVERSE_SESSIONS`] differs on at least
//! two axes.

use serde::{Deserialize, Serialize};

pub const MAX_DIVERSE_SESSIONS: usize = 30;
pub const MIN_CHARTER_DISTANCE: usize = 2;

const FOCUS: [&str; 5] = [
    "failing-tests-first",
    "minimal-diff",
    "root-cause-refactor",
    "instrument-and-observe",
    "contract-hardening",
];
const TACTIC: [&str; 6] = [
    "top-down",
    "bottom-up",
    "bisect-behaviour",
    "spike-then-trim",
    "test-driven",
    "read-callers-first",
];
const EVIDENCE: [&str; 7] = [
    "unit-tests",
    "targeted-repro",
    "regression-test",
    "property-checks",
    "log-trace",
    "diff-review",
    "edge-case-table",
];
const RISK: [&str; 2] = ["conservative", "bold"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCharter {
    pub session_id: String,
    pub focus: String,
    pub tactic: String,
    pub evidence: String,
    pub risk: String,
    /// Option index per axis, in axis order.
    pub vector: [usize; 4],
}

impl PathCharter {
    /// One-line description used in prompts and reports.
    pub fn describe(&self) -> String {
        format!(
            "focus={} tactic={} evidence={} risk={}",
            self.focus, self.tactic, self.evidence, self.risk
        )
    }
}

/// Parse `"{batch}-{index}"` into numbers; anything else maps to `(0, 0)`
/// salted by a stable hash of the id so the charter stays deterministic.
fn session_coordinates(session_id: &str) -> (usize, usize) {
    if let Some((batch, index)) = session_id.split_once('-')
        && let (Ok(batch), Ok(index)) = (batch.parse::<usize>(), index.parse::<usize>())
    {
        return (batch, index.saturating_sub(1));
    }
    let salt = session_id
        .bytes()
        .fold(0usize, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte as usize));
    (0, salt)
}

/// Charter for a session id of the form `"{batch}-{index}"` (1-based index).
pub fn path_charter(session_id: &str) -> PathCharter {
    let (batch, position) = session_coordinates(session_id);
    let pick = |len: usize, stride: usize| (position + batch * stride) % len;
    let vector = [
        pick(FOCUS.len(), 1),
        pick(TACTIC.len(), 2),
        pick(EVIDENCE.len(), 3),
        pick(RISK.len(), 1),
    ];
    PathCharter {
        session_id: session_id.to_string(),
        focus: FOCUS[vector[0]].to_string(),
        tactic: TACTIC[vector[1]].to_string(),
        evidence: EVIDENCE[vector[2]].to_string(),
        risk: RISK[vector[3]].to_string(),
        vector,
    }
}

/// Number of axes on which two charters choose different options.
pub fn charter_distance(a: &PathCharter, b: &PathCharter) -> usize {
    a.vector
        .iter()
        .zip(b.vector.iter())
        .filter(|(left, right)| left != right)
        .count()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiversityCheck {
    pub ok: bool,
    /// Smallest pairwise distance, or `None` for fewer than two charters.
    pub min_distance: Option<usize>,
    pub required: usize,
    /// Session id pairs closer than `required`.
    pub violations: Vec<(String, String)>,
}

pub fn diversity_check(charters: &[PathCharter]) -> DiversityCheck {
    let mut min_distance = None;
    let mut violations = Vec::new();
    for (i, left) in charters.iter().enumerate() {
        for right in &charters[i + 1..] {
            let distance = charter_distance(left, right);
            min_distance = Some(min_distance.map_or(distance, |min: usize| min.min(distance)));
            if distance < MIN_CHARTER_DISTANCE {
                violations.push((left.session_id.clone(), right.session_id.clone()));
            }
        }
    }
    DiversityCheck {
        ok: violations.is_empty(),
        min_distance,
        required: MIN_CHARTER_DISTANCE,
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charter_is_deterministic() {
        assert_eq!(path_charter("1-1"), path_charter("1-1"));
        assert_eq!(path_charter("custom"), path_charter("custom"));
    }

    #[test]
    fn five_sessions_are_pairwise_diverse() {
        let charters: Vec<PathCharter> = (1..=5).map(|idx| path_charter(&format!("1-{idx}"))).collect();
        for (i, left) in charters.iter().enumerate() {
            for right in &charters[i + 1..] {
                assert!(charter_distance(left, right) >= MIN_CHARTER_DISTANCE);
            }
        }
        assert!(diversity_check(&charters).ok);
    }

    #[test]
    fn maximum_batch_is_diverse_for_several_batches() {
        for batch in 1..=4 {
            let charters: Vec<PathCharter> = (1..=MAX_DIVERSE_SESSIONS)
                .map(|idx| path_charter(&format!("{batch}-{idx}")))
                .collect();
            let check = diversity_check(&charters);
            assert!(check.ok, "batch {batch}: {:?}", check.violations);
            assert!(check.min_distance.is_some_and(|d| d >= 2));
        }
    }

    #[test]
    fn batches_rotate_the_first_session_charter() {
        assert_ne!(path_charter("1-1").vector, path_charter("2-1").vector);
    }

    #[test]
    fn single_charter_has_no_distance() {
        let check = diversity_check(&[path_charter("1-1")]);
        assert!(check.ok);
        assert_eq!(check.min_distance, None);
    }
}
