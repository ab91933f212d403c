//! Append-only JSONL trace of orchestration events.
//!
//! Product output, unlike `tracing` diagnostics: every record is written
//! regardless of `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::io::run_context::timestamp_now;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub timestamp: String,
    pub event_type: String,
    pub payload: Value,
}

/// Writes one JSON record per line. Safe to share between threads.
#[derive(Debug)]
pub struct TraceLogger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TraceLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, event_type: &str, payload: Value) -> Result<()> {
        let record = TraceRecord {
            timestamp: timestamp_now(),
            event_type: event_type.to_string(),
            payload,
        };
        let mut line = serde_json::to_string(&record).context("serialize trace record")?;
        line.push('\n');
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("trace lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create trace dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open trace {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append trace {}", self.path.display()))
    }
}

/// Read every record of a trace file, skipping blank lines.
pub fn read_trace(path: &Path) -> Result<Vec<TraceRecord>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read trace {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse trace {} record {}", path.display(), idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appends_one_record_per_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let trace = TraceLogger::new(temp.path().join("logs/trace.jsonl"));
        trace.log("step_started", json!({"step_id": "a"})).expect("log");
        trace.log("step_finished", json!({"step_id": "a", "status": "SUCCEEDED"})).expect("log");

        let records = read_trace(trace.path()).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, "step_started");
        assert_eq!(records[1].payload["status"], "SUCCEEDED");
        assert!(!records[0].timestamp.is_empty());
    }
}
