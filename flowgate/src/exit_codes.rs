//! Stable exit codes for flowgate CLI commands.

/// Command succeeded (task passed, run inspected, or a winner was found).
pub const OK: i32 = 0;
/// Invalid input or an infrastructure failure: unknown task, missing run
/// state, bad config, git unavailable.
pub const INVALID: i32 = 1;
/// The command ran to completion but did not succeed (workflow failed or
/// blocked, evaluation failing, no session verified).
pub const UNSUCCESSFUL: i32 = 2;
