//! Tools a worker may call, and the registry that dispatches to them.
//!
//! Every tool declares its actions up front through [`Tool::descriptor`] and
//! answers each invocation with a [`ToolResult`]; failures are results with
//! `ok = false`, never panics or errors.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value, json};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::types::{ToolCall, ToolResult};
use crate::io::evaluation::TestRunner;
use crate::io::provider::ToolDescriptor;

pub const TRAVERSAL_ERROR: &str = "Path traversal detected";

pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    fn invoke(&self, action: &str, args: &Map<String, Value>) -> ToolResult;
}

/// Named tools available to workers of one session.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.descriptor().name, tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|tool| tool.descriptor()).collect()
    }

    /// Dispatch a call, timing it. Unknown tools produce an error result.
    pub fn invoke(&self, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        let mut result = match self.tools.get(&call.tool) {
            Some(tool) => tool.invoke(&call.action, &call.args),
            None => ToolResult::error("unknown tool", format!("no tool named '{}'", call.tool)),
        };
        result.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(tool = %call.tool, action = %call.action, ok = result.ok, "tool invoked");
        result
    }
}

fn string_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing string argument '{key}'"))
}

/// Sandboxed read/write access below a root directory.
#[derive(Debug, Clone)]
pub struct FileTool {
    root: PathBuf,
}

impl FileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `path` below the root, rejecting anything that escapes it
    /// lexically or through a symlinked ancestor.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut relative = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(anyhow!(TRAVERSAL_ERROR));
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(anyhow!(TRAVERSAL_ERROR)),
            }
        }
        let candidate = self.root.join(&relative);
        let root = fs::canonicalize(&self.root)
            .with_context(|| format!("resolve tool root {}", self.root.display()))?;
        let mut existing = candidate.as_path();
        while !existing.exists() {
            existing = match existing.parent() {
                Some(parent) => parent,
                None => break,
            };
        }
        if existing.exists() {
            let resolved = fs::canonicalize(existing)
                .with_context(|| format!("resolve {}", existing.display()))?;
            if !resolved.starts_with(&root) {
                return Err(anyhow!(TRAVERSAL_ERROR));
            }
        }
        Ok(candidate)
    }

    fn read(&self, args: &Map<String, Value>) -> Result<Value> {
        let path = self.resolve(string_arg(args, "path")?)?;
        let content =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(json!({"path": path.display().to_string(), "content": content}))
    }

    fn write(&self, args: &Map<String, Value>) -> Result<Value> {
        let path = self.resolve(string_arg(args, "path")?)?;
        let content = string_arg(args, "content")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        Ok(json!({"path": path.display().to_string(), "bytes": content.len()}))
    }

    fn list(&self, args: &Map<String, Value>) -> Result<Value> {
        let base = self.resolve(args.get("path").and_then(Value::as_str).unwrap_or("."))?;
        let mut files = Vec::new();
        for entry in WalkDir::new(&base).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walk {}", base.display()))?;
            if entry.file_type().is_file()
                && let Ok(rel) = entry.path().strip_prefix(&self.root)
            {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(json!({"files": files}))
    }
}

impl Tool for FileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "file".to_string(),
            actions: vec!["read".to_string(), "write".to_string(), "list".to_string()],
            description: "Read, write or list files relative to the workspace root. args: {path, content?}"
                .to_string(),
        }
    }

    fn invoke(&self, action: &str, args: &Map<String, Value>) -> ToolResult {
        let outcome = match action {
            "read" => self.read(args),
            "write" => self.write(args),
            "list" => self.list(args),
            other => Err(anyhow!("unknown action '{other}'")),
        };
        match outcome {
            Ok(data) => ToolResult::ok(format!("{action} ok"), data),
            Err(err) => {
                let mut result = ToolResult::error(format!("{action} failed"), err.to_string());
                if let Some(path) = args.get("path") {
                    result.data = json!({"path": path});
                }
                result
            }
        }
    }
}

/// Exposes the project's test evaluation to workers.
pub struct TestTool {
    runner: Arc<dyn TestRunner>,
    workdir: PathBuf,
    default_targets: Vec<String>,
}

impl TestTool {
    pub fn new(runner: Arc<dyn TestRunner>, workdir: impl Into<PathBuf>, default_targets: Vec<String>) -> Self {
        Self {
            runner,
            workdir: workdir.into(),
            default_targets,
        }
    }
}

impl Tool for TestTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "tests".to_string(),
            actions: vec!["run".to_string()],
            description: "Run the project test suite. args: {targets?: [string]}".to_string(),
        }
    }

    fn invoke(&self, action: &str, args: &Map<String, Value>) -> ToolResult {
        if action != "run" {
            return ToolResult::error("run failed", format!("unknown action '{action}'"));
        }
        let targets = args
            .get("targets")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| self.default_targets.clone());
        match self.runner.evaluate(&self.workdir, &targets) {
            Ok(evaluation) => {
                let summary = format!("{} passed, {} failed", evaluation.passed, evaluation.failed);
                match serde_json::to_value(&evaluation) {
                    Ok(data) => ToolResult {
                        ok: evaluation.ok,
                        ..ToolResult::ok(summary, data)
                    },
                    Err(err) => ToolResult::error("run failed", err.to_string()),
                }
            }
            Err(err) => ToolResult::error("run failed", format!("{err:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn write_then_read_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tool = FileTool::new(temp.path());
        let written = tool.invoke("write", &args(json!({"path": "notes/todo.txt", "content": "hello"})));
        assert!(written.ok, "{:?}", written.error);

        let read = tool.invoke("read", &args(json!({"path": "notes/todo.txt"})));
        assert!(read.ok);
        assert_eq!(read.data["content"], "hello");
        assert_eq!(
            PathBuf::from(read.data["path"].as_str().expect("path")),
            temp.path().join("notes").join("todo.txt")
        );
    }

    #[test]
    fn blocks_path_traversal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tool = FileTool::new(temp.path());
        let result = tool.invoke("read", &args(json!({"path": "../secrets.txt"})));
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some(TRAVERSAL_ERROR));

        let absolute = tool.invoke("write", &args(json!({"path": "/tmp/x", "content": ""})));
        assert_eq!(absolute.error.as_deref(), Some(TRAVERSAL_ERROR));
    }

    #[test]
    fn inner_parent_segments_stay_inside_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tool = FileTool::new(temp.path());
        let resolved = tool.resolve("a/../b.txt").expect("resolve");
        assert_eq!(resolved, temp.path().join("b.txt"));
    }

    #[test]
    fn missing_file_is_an_error_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tool = FileTool::new(temp.path());
        let result = tool.invoke("read", &args(json!({"path": "does-not-exist.txt"})));
        assert!(!result.ok);
        assert_eq!(result.summary, "read failed");
        assert!(result.error.is_some());
    }

    #[test]
    fn list_returns_sorted_relative_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tool = FileTool::new(temp.path());
        for path in ["b.txt", "a/c.txt"] {
            let result = tool.invoke("write", &args(json!({"path": path, "content": "x"})));
            assert!(result.ok);
        }
        let listed = tool.invoke("list", &Map::new());
        assert_eq!(listed.data["files"], json!(["a/c.txt", "b.txt"]));
    }

    #[test]
    fn registry_reports_unknown_tools() {
        let registry = ToolRegistry::new();
        let result = registry.invoke(&ToolCall {
            tool: "nope".to_string(),
            action: "x".to_string(),
            args: Map::new(),
            call_id: None,
        });
        assert!(!result.ok);
        assert_eq!(result.summary, "unknown tool");
    }
}
