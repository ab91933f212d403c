//! Detection of goals too vague to plan against.

/// Words that carry no information about what to change.
const FILLER: &[&str] = &[
    "a", "an", "the", "it", "this", "that", "these", "those", "thing", "things", "stuff", "fix",
    "fixes", "make", "do", "work", "works", "working", "better", "improve", "please", "just",
    "again", "now", "up", "all", "everything", "something", "issue", "issues", "problem",
    "problems", "bug", "bugs", "broken", "code", "help", "me", "us", "my", "our", "some",
];

/// Clarifying questions for a goal that names nothing concrete.
///
/// A goal is ambiguous when, after dropping filler words, nothing is left and
/// no input payload supplies context. Returns `None` for plannable goals.
pub fn clarifying_questions(goal: &str, has_input_context: bool) -> Option<Vec<String>> {
    if has_input_context {
        return None;
    }
    let concrete = goal
        .split(|ch: char| ch.is_whitespace() || matches!(ch, ',' | ';' | '!' | '?'))
        .map(|word| word.trim_matches(|ch: char| !ch.is_alphanumeric()).to_lowercase())
        .filter(|word| !word.is_empty())
        .any(|word| !FILLER.contains(&word.as_str()));
    if concrete {
        return None;
    }
    Some(vec![
        "Which file, module or behaviour should change?".to_string(),
        "What is observed today, and what should happen instead?".to_string(),
        "Which test or command demonstrates success?".to_string(),
    ])
}
