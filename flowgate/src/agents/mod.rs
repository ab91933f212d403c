//! Provider-backed agents: the planner that proposes workflows and the
//! worker that carries out one step with tools.

pub mod planner;
pub mod worker;
