//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod charter;
pub mod clarify;
pub mod delegation;
pub mod retry;
pub mod score;
pub mod signature;
pub mod types;
pub mod verification;
pub mod workflow;
