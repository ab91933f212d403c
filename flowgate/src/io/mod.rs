//! Filesystem, process, git and provider plumbing.

pub mod artifacts;
pub mod config;
pub mod evaluation;
pub mod fs_util;
pub mod git;
pub mod input;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod run_context;
pub mod tools;
pub mod trace;
pub mod workflow_store;
pub mod workspace;
