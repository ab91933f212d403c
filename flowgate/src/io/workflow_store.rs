//! Workflow snapshot persistence and step output validation.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::core::workflow::{WorkflowEngine, WorkflowSnapshot};
use crate::io::fs_util::{read_json, write_json};

impl WorkflowEngine {
    /// Persist `{spec, state}` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, &self.snapshot())
            .with_context(|| format!("save workflow state {}", path.display()))?;
        debug!(path = %path.display(), "saved workflow state");
        Ok(())
    }

    /// Reload an engine saved with [`WorkflowEngine::save`].
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("missing workflow state {}", path.display()));
        }
        let snapshot: WorkflowSnapshot = read_json(path)?;
        WorkflowEngine::from_snapshot(snapshot)
            .with_context(|| format!("restore workflow state {}", path.display()))
    }
}

/// Validate `value` against a step's JSON schema. An empty schema accepts anything.
pub fn validate_outputs(schema: &Value, value: &Value) -> Result<()> {
    if schema.as_object().is_none_or(|obj| obj.is_empty()) {
        return Ok(());
    }
    let compiled = validator_for(schema).map_err(|err| anyhow!("invalid outputs schema: {}", err))?;
    let messages: Vec<String> = compiled.iter_errors(value).map(|err| err.to_string()).collect();
    if messages.is_empty() {
        return Ok(());
    }
    Err(anyhow!("outputs schema validation failed: {}", messages.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workflow::{StepSpec, StepStatus, WorkflowSpec};
    use serde_json::{Map, json};

    fn engine() -> WorkflowEngine {
        let spec = WorkflowSpec::new(
            "wf",
            "goal",
            vec![
                StepSpec::new("a", "Implementer", &[]),
                StepSpec::new("b", "Reviewer", &["a"]),
            ],
            Map::new(),
        )
        .expect("spec");
        WorkflowEngine::new(spec).expect("engine")
    }

    #[test]
    fn save_then_load_restores_statuses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("workflow_state.json");
        let mut engine = engine();
        engine.mark_status("a", StepStatus::Succeeded).expect("mark");
        engine.mark_status("b", StepStatus::Running).expect("mark");
        engine.save(&path).expect("save");

        let loaded = WorkflowEngine::load(&path).expect("load");
        assert_eq!(loaded.status("a"), Some(StepStatus::Succeeded));
        assert_eq!(loaded.status("b"), Some(StepStatus::Running));
        assert_eq!(loaded.spec(), engine.spec());
    }

    #[test]
    fn load_missing_file_is_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = WorkflowEngine::load(&temp.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("missing workflow state"));
    }

    #[test]
    fn outputs_schema_enforced_only_when_present() {
        validate_outputs(&json!({}), &json!({"anything": 1})).expect("empty schema");
        let schema = json!({"type": "object", "required": ["summary"]});
        validate_outputs(&schema, &json!({"summary": "done"})).expect("valid");
        let err = validate_outputs(&schema, &json!({"other": 1})).unwrap_err();
        assert!(err.to_string().contains("outputs schema validation failed"));
    }
}
