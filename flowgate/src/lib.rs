//! Progress-gated workflow orchestration for coding agents.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (workflow state machine, retry
//!   gate, delegation graph, scoring, verification). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, processes,
//!   reasoning providers, test runners, run directories).
//! - **[`agents`]**: Provider-backed planner and worker.
//!
//! Orchestration modules ([`execute`], [`task`], [`suite`], [`self_improve`])
//! coordinate core logic with I/O to implement the CLI commands in [`cli`].

pub mod agents;
pub mod cli;
pub mod core;
pub mod execute;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pool;
pub mod self_improve;
pub mod suite;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
