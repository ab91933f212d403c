//! Per-step outputs and artifacts under `artifacts/steps/<step_id>/`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::signature::{canonical_json, sha256_hex};
use crate::io::fs_util::write_json;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn step_dir(&self, step_id: &str) -> PathBuf {
        self.root.join(step_id)
    }

    /// Write `outputs.json` and `artifacts.json` for a step and return the
    /// content digest of both.
    pub fn write_step(&self, step_id: &str, outputs: &Value, artifacts: &[Value]) -> Result<String> {
        let dir = self.step_dir(step_id);
        write_json(&dir.join("outputs.json"), outputs)?;
        write_json(&dir.join("artifacts.json"), &artifacts)?;
        Ok(content_hash(outputs, artifacts))
    }
}

/// Digest of the canonical encoding of `{outputs, artifacts}`.
pub fn content_hash(outputs: &Value, artifacts: &[Value]) -> String {
    sha256_hex(canonical_json(&json!({"outputs": outputs, "artifacts": artifacts})))
}
