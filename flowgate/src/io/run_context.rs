//! Run directories and the `run.json` manifest.
//!
//! Layout of a run root:
//!
//! ```text
//! run-<YYYYmmdd-HHMMSS>-<suffix>/
//!   run.json
//!   trace.jsonl
//!   workflow_state.json
//!   logs/
//!   artifacts/steps/<step_id>/
//!   reports/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::io::fs_util::{read_json, write_json};
use crate::io::trace::TraceLogger;

pub const MANIFEST_FILE: &str = "run.json";
pub const TRACE_FILE: &str = "trace.jsonl";
pub const WORKFLOW_STATE_FILE: &str = "workflow_state.json";

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Lowercase alphanumeric id of the given length.
pub fn short_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(len)
        .collect::<String>()
        .to_lowercase()
}

/// `YYYYmmdd-HHMMSS-<8 chars>`; sortable by creation time.
pub fn generate_run_id() -> String {
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), short_id(8))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub created_at: String,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Handle on one run directory.
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    root: PathBuf,
    trace: TraceLogger,
}

impl RunContext {
    /// Create a fresh run directory under `base_dir` and write its manifest.
    pub fn create(base_dir: &Path, metadata: Map<String, Value>) -> Result<Self> {
        let run_id = generate_run_id();
        let root = base_dir.join(format!("run-{run_id}"));
        Self::create_at(root, run_id, metadata)
    }

    /// Create a run directory at an explicit path.
    pub fn create_at(root: PathBuf, run_id: String, metadata: Map<String, Value>) -> Result<Self> {
        for dir in [root.join("logs"), root.join("artifacts/steps"), root.join("reports")] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("create run directory {}", dir.display()))?;
        }
        let manifest = RunManifest {
            run_id: run_id.clone(),
            created_at: timestamp_now(),
            metadata,
        };
        write_json(&root.join(MANIFEST_FILE), &manifest)?;
        debug!(run_id = %run_id, root = %root.display(), "created run directory");
        let trace = TraceLogger::new(root.join(TRACE_FILE));
        Ok(Self {
            run_id,
            root,
            trace,
        })
    }

    /// Reopen an existing run directory (resume, inspect).
    pub fn open(root: &Path) -> Result<Self> {
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(anyhow!("missing run manifest {}", manifest_path.display()));
        }
        let manifest: RunManifest = read_json(&manifest_path)?;
        Ok(Self {
            run_id: manifest.run_id,
            root: root.to_path_buf(),
            trace: TraceLogger::new(root.join(TRACE_FILE)),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trace(&self) -> &TraceLogger {
        &self.trace
    }

    pub fn step_artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts/steps")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn workflow_state_path(&self) -> PathBuf {
        self.root.join(WORKFLOW_STATE_FILE)
    }

    pub fn manifest(&self) -> Result<RunManifest> {
        read_json(&self.manifest_path())
    }

    /// Set one metadata key in `run.json`.
    pub fn update_manifest(&self, key: &str, value: Value) -> Result<()> {
        let mut manifest = self.manifest()?;
        manifest.metadata.insert(key.to_string(), value);
        write_json(&self.manifest_path(), &manifest)
    }
}
