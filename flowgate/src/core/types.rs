//! Shared contracts exchanged with external collaborators.
//!
//! These shapes mirror what a reasoning provider, a tool and a test runner
//! send back. Parsing is lenient about optional fields and strict about the
//! status discriminant.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Terminal status a worker reports for a step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    Success,
    Partial,
    Failure,
    Blocked,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Failure => "FAILURE",
            Self::Blocked => "BLOCKED",
        }
    }
}

/// Terminal response of a worker (or provider) for one step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub status: WorkerStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<Value>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub next_actions: Vec<String>,
    #[serde(default)]
    pub failure_signature: String,
}

impl WorkerOutput {
    /// Parse a terminal status object. Returns `None` when `status` is absent
    /// or not one of the known values.
    pub fn from_response(value: &Value) -> Option<Self> {
        value.get("status")?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn failure(summary: impl Into<String>, failure_signature: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Failure,
            summary: summary.into(),
            artifacts: Vec::new(),
            metrics: Map::new(),
            next_actions: Vec::new(),
            failure_signature: failure_signature.into(),
        }
    }

    pub fn metric_u64(&self, key: &str) -> Option<u64> {
        self.metrics.get(key).and_then(Value::as_u64)
    }
}

/// Result of a project test evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub ok: bool,
    pub passed: u64,
    pub failed: u64,
    #[serde(default)]
    pub failing_tests: Vec<String>,
    #[serde(default)]
    pub elapsed_s: f64,
}

impl EvaluationResult {
    /// Evaluation that could not be produced at all.
    pub fn unavailable(reason: &str) -> Self {
        Self {
            ok: false,
            passed: 0,
            failed: 0,
            failing_tests: vec![reason.to_string()],
            elapsed_s: 0.0,
        }
    }
}

/// Result of a single tool action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub summary: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub elapsed_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(summary: impl Into<String>, data: Value) -> Self {
        Self {
            ok: true,
            summary: summary.into(),
            data,
            elapsed_ms: 0.0,
            error: None,
        }
    }

    pub fn error(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            summary: summary.into(),
            data: Value::Object(Map::new()),
            elapsed_ms: 0.0,
            error: Some(error.into()),
        }
    }
}

/// A tool invocation requested by the reasoning provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub call_id: Option<String>,
}

/// Extract `tool_calls` from a provider response, if it is a tool-call request.
///
/// Malformed entries are skipped.
pub fn tool_calls_from_response(value: &Value) -> Option<Vec<ToolCall>> {
    let calls = value.get("tool_calls")?.as_array()?;
    Some(
        calls
            .iter()
            .filter_map(|call| serde_json::from_value(call.clone()).ok())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_terminal_status_with_defaults() {
        let output = WorkerOutput::from_response(&json!({"status": "PARTIAL"})).expect("parse");
        assert_eq!(output.status, WorkerStatus::Partial);
        assert!(output.summary.is_empty());
        assert!(output.failure_signature.is_empty());
    }

    #[test]
    fn rejects_unknown_status_and_plain_objects() {
        assert!(WorkerOutput::from_response(&json!({"status": "DONE"})).is_none());
        assert!(WorkerOutput::from_response(&json!({"tool_calls": []})).is_none());
    }

    #[test]
    fn tool_calls_skip_malformed_entries() {
        let calls = tool_calls_from_response(&json!({
            "tool_calls": [
                {"tool": "file", "action": "read", "args": {"path": "a"}, "call_id": "c1"},
                {"action": "missing-tool"}
            ]
        }))
        .expect("tool calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id.as_deref(), Some("c1"));
    }
}
