//! Session scoring and winner selection.

use serde::{Deserialize, Serialize};

use crate::core::types::EvaluationResult;

pub const DECLARED_SCORING_FUNCTION: &str = "score = (verification_ok, evaluation_ok, passed_tests, -failed_tests, -(model_calls + tool_calls)), compared lexicographically with higher first; ties go to the lowest session index";

/// Totally ordered score tuple. Higher is better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Score(pub [i64; 5]);

impl Score {
    pub fn verification_ok(&self) -> bool {
        self.0[0] == 1
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub fn score_session(
    verification_ok: bool,
    evaluation: Option<&EvaluationResult>,
    model_calls: u64,
    tool_calls: u64,
) -> Score {
    let (eval_ok, passed, failed) = evaluation
        .map(|eval| (eval.ok, eval.passed, eval.failed))
        .unwrap_or((false, 0, 0));
    Score([
        i64::from(verification_ok),
        i64::from(eval_ok),
        clamp(passed),
        -clamp(failed),
        -clamp(model_calls.saturating_add(tool_calls)),
    ])
}

/// A ranked entry: the session's position in its batch plus its verdict.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub session_id: &'a str,
    pub index: usize,
    pub verified: bool,
    pub score: Score,
}

/// Best verified candidate; equal scores resolve to the lowest index.
pub fn select_winner<'a>(candidates: &[Candidate<'a>]) -> Option<&'a str> {
    let mut best: Option<&Candidate<'a>> = None;
    for candidate in candidates.iter().filter(|c| c.verified) {
        best = match best {
            Some(current)
                if current.score > candidate.score
                    || (current.score == candidate.score && current.index <= candidate.index) =>
            {
                Some(current)
            }
            _ => Some(candidate),
        };
    }
    best.map(|candidate| candidate.session_id)
}
