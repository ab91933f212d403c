//! Orchestrator configuration stored in `flowgate.toml`.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::charter::MAX_DIVERSE_SESSIONS;

pub const DEFAULT_CONFIG_FILE: &str = "flowgate.toml";

/// Orchestrator configuration (TOML).
///
/// Every table is optional; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FlowConfig {
    /// Directory that receives run directories.
    pub runs_dir: PathBuf,
    /// Directory holding benchmark tasks (`<id>/task.json`).
    pub tasks_dir: PathBuf,
    pub provider: ProviderConfig,
    pub evaluation: EvaluationConfig,
    pub workflow: WorkflowConfig,
    pub self_improve: SelfImproveConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// External CLI that reads a prompt on stdin and prints JSON.
    Command,
    /// Scripted responses; an empty script answers PARTIAL.
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Command,
            command: ["codex", "exec", "--skip-git-repo-check", "-"]
                .iter()
                .map(|arg| arg.to_string())
                .collect(),
            timeout_secs: 600,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Test command; targets are appended as extra arguments.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            command: ["python", "-m", "pytest", "-q"]
                .iter()
                .map(|arg| arg.to_string())
                .collect(),
            timeout_secs: 600,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Attempts per step, including the first.
    pub max_step_attempts: u32,
    /// Ready steps dispatched at once.
    pub step_concurrency: usize,
    /// Provider round trips a worker may take for one attempt.
    pub worker_max_iterations: u32,
    /// Wall-clock budget for one worker attempt.
    pub worker_timeout_secs: u64,
    pub strategy_id: String,
    /// Nested delegation levels below a step's worker.
    pub max_delegation_depth: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 3,
            step_concurrency: 1,
            worker_max_iterations: 12,
            worker_timeout_secs: 30 * 60,
            strategy_id: "default".to_string(),
            max_delegation_depth: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SelfImproveConfig {
    pub sessions_per_batch: usize,
    pub batches: usize,
    pub max_workers: usize,
    /// Paths (relative to master) cloned into each session workspace.
    pub include_paths: Vec<String>,
    /// Extra arguments handed to the evaluation command.
    pub test_targets: Vec<String>,
    pub entrypoint_max_attempts: u32,
    pub merge_on_success: bool,
    /// Commit kept merges on master with git.
    pub commit_merges: bool,
}

impl Default for SelfImproveConfig {
    fn default() -> Self {
        Self {
            sessions_per_batch: 5,
            batches: 1,
            max_workers: 4,
            include_paths: vec!["src".to_string(), "tests".to_string()],
            test_targets: Vec::new(),
            entrypoint_max_attempts: 3,
            merge_on_success: true,
            commit_merges: false,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("runs"),
            tasks_dir: PathBuf::from("benchmarks/tasks"),
            provider: ProviderConfig::default(),
            evaluation: EvaluationConfig::default(),
            workflow: WorkflowConfig::default(),
            self_improve: SelfImproveConfig::default(),
        }
    }
}

fn ensure_command(label: &str, command: &[String]) -> Result<()> {
    if command.is_empty() || command[0].trim().is_empty() {
        return Err(anyhow!("{label} must be a non-empty array"));
    }
    Ok(())
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.provider.kind == ProviderKind::Command {
            ensure_command("provider.command", &self.provider.command)?;
        }
        if self.provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        if self.provider.output_limit_bytes == 0 {
            return Err(anyhow!("provider.output_limit_bytes must be > 0"));
        }
        ensure_command("evaluation.command", &self.evaluation.command)?;
        if self.evaluation.timeout_secs == 0 {
            return Err(anyhow!("evaluation.timeout_secs must be > 0"));
        }
        if self.evaluation.output_limit_bytes == 0 {
            return Err(anyhow!("evaluation.output_limit_bytes must be > 0"));
        }
        self.workflow.validate()?;
        self.self_improve.validate()
    }
}

impl WorkflowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_step_attempts == 0 {
            return Err(anyhow!("workflow.max_step_attempts must be >= 1"));
        }
        if self.step_concurrency == 0 {
            return Err(anyhow!("workflow.step_concurrency must be >= 1"));
        }
        if self.worker_max_iterations == 0 {
            return Err(anyhow!("workflow.worker_max_iterations must be >= 1"));
        }
        if self.worker_timeout_secs == 0 {
            return Err(anyhow!("workflow.worker_timeout_secs must be > 0"));
        }
        if self.strategy_id.trim().is_empty() {
            return Err(anyhow!("workflow.strategy_id must not be empty"));
        }
        Ok(())
    }
}

impl SelfImproveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sessions_per_batch == 0 || self.sessions_per_batch > MAX_DIVERSE_SESSIONS {
            return Err(anyhow!(
                "self_improve.sessions_per_batch must be between 1 and {MAX_DIVERSE_SESSIONS}"
            ));
        }
        if self.batches == 0 {
            return Err(anyhow!("self_improve.batches must be >= 1"));
        }
        if self.max_workers == 0 {
            return Err(anyhow!("self_improve.max_workers must be >= 1"));
        }
        if self.entrypoint_max_attempts == 0 {
            return Err(anyhow!("self_improve.entrypoint_max_attempts must be >= 1"));
        }
        if self.include_paths.is_empty() {
            return Err(anyhow!("self_improve.include_paths must not be empty"));
        }
        for path in &self.include_paths {
            let parsed = Path::new(path);
            let relative_and_contained = !path.trim().is_empty()
                && parsed
                    .components()
                    .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
            if !relative_and_contained {
                return Err(anyhow!(
                    "self_improve.include_paths entry '{path}' must be a relative path without '..'"
                ));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FlowConfig::default()`.
pub fn load_config(path: &Path) -> Result<FlowConfig> {
    if !path.exists() {
        let cfg = FlowConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FlowConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FlowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::fs_util::write_atomic(path, &buf)
}
