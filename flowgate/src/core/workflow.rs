//! Workflow specification and the per-session step state machine.
//!
//! A [`WorkflowSpec`] is immutable once built. The [`WorkflowEngine`] owns the
//! mutable [`WorkflowState`] and exposes readiness over the dependency graph.
//! It never propagates failures on its own: the driving loop calls
//! [`WorkflowEngine::block_unreachable`] after every status change.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::retry::ProgressMetrics;
use crate::core::signature::{canonical_json, sha256_hex};
use crate::core::types::WorkerOutput;

pub const DEFAULT_WORKER: &str = "Implementer";

/// Structural problems with a workflow or a status update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("workflow has no steps")]
    Empty,
    #[error("duplicate step id `{0}`")]
    DuplicateStep(String),
    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: String, dependency: String },
    #[error("step `{0}` depends on itself")]
    SelfDependency(String),
    #[error("dependency cycle among steps: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
    #[error("unknown step `{0}`")]
    UnknownStep(String),
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

fn default_worker() -> String {
    DEFAULT_WORKER.to_string()
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// One unit of planned work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_worker")]
    pub worker: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "empty_object")]
    pub inputs_schema: Value,
    #[serde(default = "empty_object")]
    pub outputs_schema: Value,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

impl StepSpec {
    pub fn new(step_id: &str, worker: &str, depends_on: &[&str]) -> Self {
        Self {
            step_id: step_id.to_string(),
            name: step_id.to_string(),
            description: String::new(),
            worker: worker.to_string(),
            depends_on: depends_on.iter().map(|dep| dep.to_string()).collect(),
            inputs_schema: empty_object(),
            outputs_schema: empty_object(),
            inputs: Map::new(),
        }
    }
}

/// Immutable plan for one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub workflow_id: String,
    pub goal: String,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl WorkflowSpec {
    /// Build a spec, rejecting structural problems up front.
    pub fn new(
        workflow_id: impl Into<String>,
        goal: impl Into<String>,
        steps: Vec<StepSpec>,
        metadata: Map<String, Value>,
    ) -> Result<Self, WorkflowError> {
        let spec = Self {
            workflow_id: workflow_id.into(),
            goal: goal.into(),
            steps,
            metadata,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::Empty);
        }
        let mut ids = BTreeSet::new();
        for step in &self.steps {
            if !ids.insert(step.step_id.as_str()) {
                return Err(WorkflowError::DuplicateStep(step.step_id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.step_id {
                    return Err(WorkflowError::SelfDependency(step.step_id.clone()));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(WorkflowError::UnknownDependency {
                        step: step.step_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        let stuck = unresolvable_steps(&self.steps);
        if !stuck.is_empty() {
            return Err(WorkflowError::DependencyCycle(stuck));
        }
        Ok(())
    }
}

/// Steps that can never be ordered because they sit on (or behind) a cycle.
fn unresolvable_steps(steps: &[StepSpec]) -> Vec<String> {
    let mut resolved: BTreeSet<&str> = BTreeSet::new();
    loop {
        let before = resolved.len();
        for step in steps {
            if !resolved.contains(step.step_id.as_str())
                && step
                    .depends_on
                    .iter()
                    .all(|dep| resolved.contains(dep.as_str()))
            {
                resolved.insert(step.step_id.as_str());
            }
        }
        if resolved.len() == before {
            break;
        }
    }
    steps
        .iter()
        .filter(|step| !resolved.contains(step.step_id.as_str()))
        .map(|step| step.step_id.clone())
        .collect()
}

/// Build a validated spec from a provider's `workflow` object.
///
/// Steps accept `id` or `step_id`; `worker` defaults to `Implementer`, `name`
/// to the step id.
pub fn workflow_from_value(goal: &str, value: &Value) -> Result<WorkflowSpec, WorkflowError> {
    let raw_steps = value
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| WorkflowError::InvalidPlan("missing `steps` array".to_string()))?;

    let mut steps = Vec::with_capacity(raw_steps.len());
    for (idx, raw) in raw_steps.iter().enumerate() {
        let obj = raw
            .as_object()
            .ok_or_else(|| WorkflowError::InvalidPlan(format!("step {idx} is not an object")))?;
        let step_id = obj
            .get("id")
            .or_else(|| obj.get("step_id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| WorkflowError::InvalidPlan(format!("step {idx} has no id")))?;
        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        let depends_on = match obj.get("depends_on") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(deps)) => deps
                .iter()
                .map(|dep| {
                    dep.as_str().map(str::to_string).ok_or_else(|| {
                        WorkflowError::InvalidPlan(format!(
                            "step `{step_id}` has a non-string dependency"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(WorkflowError::InvalidPlan(format!(
                    "step `{step_id}` depends_on must be an array"
                )));
            }
        };
        steps.push(StepSpec {
            step_id: step_id.to_string(),
            name: text("name").unwrap_or_else(|| step_id.to_string()),
            description: text("description").unwrap_or_default(),
            worker: text("worker").unwrap_or_else(default_worker),
            depends_on,
            inputs_schema: obj.get("inputs_schema").cloned().unwrap_or_else(empty_object),
            outputs_schema: obj
                .get("outputs_schema")
                .cloned()
                .unwrap_or_else(empty_object),
            inputs: obj
                .get("inputs")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        });
    }

    let workflow_id = value
        .get("workflow_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            let digest = sha256_hex(format!("{goal}\n{}", canonical_json(value)));
            format!("wf-{}", &digest[..12])
        });
    let metadata = value
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    WorkflowSpec::new(workflow_id, goal, steps, metadata)
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    New,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Blocked,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Blocked
        )
    }

    /// Terminal states other than success; dependents can never run.
    pub fn is_dead_end(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped | Self::Blocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Blocked => "BLOCKED",
        }
    }
}

/// Aggregate outcome of a workflow run (or of a session that never ran one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    Succeeded,
    Failed,
    Blocked,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
        }
    }
}

/// One attempt at a step, appended in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub call_signature: String,
    pub worker_type: String,
    pub output: WorkerOutput,
    #[serde(default)]
    pub metrics: ProgressMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StepState {
    fn new() -> Self {
        Self {
            status: StepStatus::New,
            attempts: Vec::new(),
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub steps: BTreeMap<String, StepState>,
}

/// Persisted form of an engine: `{spec, state}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub spec: WorkflowSpec,
    pub state: WorkflowState,
}

/// DAG scheduler over one workflow.
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    spec: WorkflowSpec,
    state: WorkflowState,
}

impl WorkflowEngine {
    /// Start a fresh engine with every step NEW.
    pub fn new(spec: WorkflowSpec) -> Result<Self, WorkflowError> {
        spec.validate()?;
        let steps = spec
            .steps
            .iter()
            .map(|step| (step.step_id.clone(), StepState::new()))
            .collect();
        Ok(Self {
            spec,
            state: WorkflowState { steps },
        })
    }

    /// Rebuild an engine from persisted parts.
    ///
    /// Known steps keep their persisted state verbatim. Steps without state
    /// start NEW and are promoted to READY when their dependencies already
    /// succeeded. State for steps the spec no longer names is dropped.
    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Result<Self, WorkflowError> {
        let WorkflowSnapshot { spec, mut state } = snapshot;
        spec.validate()?;
        state
            .steps
            .retain(|step_id, _| spec.step(step_id).is_some());
        let mut fresh = Vec::new();
        for step in &spec.steps {
            if !state.steps.contains_key(&step.step_id) {
                state.steps.insert(step.step_id.clone(), StepState::new());
                fresh.push(step.step_id.clone());
            }
        }
        let mut engine = Self { spec, state };
        for step_id in fresh {
            if engine.dependencies_succeeded(&step_id) {
                engine.set(&step_id, StepStatus::Ready);
            }
        }
        Ok(engine)
    }

    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            spec: self.spec.clone(),
            state: self.state.clone(),
        }
    }

    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.state.steps.get(step_id).map(|state| state.status)
    }

    pub fn step_state(&self, step_id: &str) -> Option<&StepState> {
        self.state.steps.get(step_id)
    }

    /// Overwrite a step's status. The transition itself is trusted.
    pub fn mark_status(&mut self, step_id: &str, status: StepStatus) -> Result<(), WorkflowError> {
        let state = self
            .state
            .steps
            .get_mut(step_id)
            .ok_or_else(|| WorkflowError::UnknownStep(step_id.to_string()))?;
        state.status = status;
        Ok(())
    }

    /// Overwrite a step's status and note why.
    pub fn mark_status_with_reason(
        &mut self,
        step_id: &str,
        status: StepStatus,
        reason: impl Into<String>,
    ) -> Result<(), WorkflowError> {
        self.mark_status(step_id, status)?;
        if let Some(state) = self.state.steps.get_mut(step_id) {
            state.reason = Some(reason.into());
        }
        Ok(())
    }

    pub fn record_attempt(
        &mut self,
        step_id: &str,
        record: AttemptRecord,
    ) -> Result<(), WorkflowError> {
        let state = self
            .state
            .steps
            .get_mut(step_id)
            .ok_or_else(|| WorkflowError::UnknownStep(step_id.to_string()))?;
        state.attempts.push(record);
        Ok(())
    }

    /// Steps that may run now, in spec order.
    ///
    /// NEW steps whose dependencies all succeeded are promoted to READY first.
    pub fn compute_ready(&mut self) -> Vec<StepSpec> {
        let promotable: Vec<String> = self
            .spec
            .steps
            .iter()
            .filter(|step| self.status(&step.step_id) == Some(StepStatus::New))
            .filter(|step| self.dependencies_succeeded(&step.step_id))
            .map(|step| step.step_id.clone())
            .collect();
        for step_id in &promotable {
            self.set(step_id, StepStatus::Ready);
        }
        self.spec
            .steps
            .iter()
            .filter(|step| self.status(&step.step_id) == Some(StepStatus::Ready))
            .cloned()
            .collect()
    }

    /// Block every pending step that depends (transitively) on a dead end.
    ///
    /// Returns the newly blocked step ids in spec order.
    pub fn block_unreachable(&mut self) -> Vec<String> {
        let mut blocked = Vec::new();
        loop {
            let next: Vec<(String, String)> = self
                .spec
                .steps
                .iter()
                .filter(|step| {
                    matches!(
                        self.status(&step.step_id),
                        Some(StepStatus::New | StepStatus::Ready)
                    )
                })
                .filter_map(|step| {
                    step.depends_on
                        .iter()
                        .find(|dep| self.status(dep).is_some_and(StepStatus::is_dead_end))
                        .map(|dep| (step.step_id.clone(), dep.clone()))
                })
                .collect();
            if next.is_empty() {
                break;
            }
            for (step_id, dep) in next {
                if let Some(state) = self.state.steps.get_mut(&step_id) {
                    state.status = StepStatus::Blocked;
                    state.reason = Some(format!("dependency `{dep}` did not succeed"));
                }
                blocked.push(step_id);
            }
        }
        blocked
    }

    /// Move steps left RUNNING by an interrupted process back to NEW.
    pub fn reset_interrupted(&mut self) -> Vec<String> {
        let mut reset = Vec::new();
        for (step_id, state) in &mut self.state.steps {
            if state.status == StepStatus::Running {
                state.status = StepStatus::New;
                reset.push(step_id.clone());
            }
        }
        reset
    }

    pub fn is_finished(&self) -> bool {
        self.state.steps.values().all(|state| state.status.is_terminal())
    }

    /// SUCCEEDED when every step succeeded or was skipped.
    pub fn overall_status(&self) -> WorkflowStatus {
        let all_ok = self.state.steps.values().all(|state| {
            matches!(state.status, StepStatus::Succeeded | StepStatus::Skipped)
        });
        if all_ok {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Failed
        }
    }

    /// Latest successful output per completed dependency of `step_id`.
    pub fn dependency_outputs(&self, step_id: &str) -> Map<String, Value> {
        let mut outputs = Map::new();
        let Some(step) = self.spec.step(step_id) else {
            return outputs;
        };
        for dep in &step.depends_on {
            if let Some(attempt) = self
                .state
                .steps
                .get(dep)
                .and_then(|state| state.attempts.last())
            {
                outputs.insert(
                    dep.clone(),
                    serde_json::json!({
                        "summary": attempt.output.summary,
                        "artifacts": attempt.output.artifacts,
                    }),
                );
            }
        }
        outputs
    }

    fn dependencies_succeeded(&self, step_id: &str) -> bool {
        self.spec.step(step_id).is_some_and(|step| {
            step.depends_on
                .iter()
                .all(|dep| self.status(dep) == Some(StepStatus::Succeeded))
        })
    }

    fn set(&mut self, step_id: &str, status: StepStatus) {
        if let Some(state) = self.state.steps.get_mut(step_id) {
            state.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(steps: Vec<StepSpec>) -> WorkflowSpec {
        WorkflowSpec::new("wf", "goal", steps, Map::new()).expect("valid spec")
    }

    fn chain() -> WorkflowSpec {
        spec(vec![
            StepSpec::new("a", "Implementer", &[]),
            StepSpec::new("b", "Implementer", &["a"]),
            StepSpec::new("c", "Reviewer", &["b"]),
        ])
    }

    #[test]
    fn rejects_structural_errors() {
        let dup = WorkflowSpec::new(
            "wf",
            "g",
            vec![StepSpec::new("a", "W", &[]), StepSpec::new("a", "W", &[])],
            Map::new(),
        );
        assert_eq!(dup.unwrap_err(), WorkflowError::DuplicateStep("a".into()));

        let unknown = WorkflowSpec::new("wf", "g", vec![StepSpec::new("a", "W", &["zz"])], Map::new());
        assert!(matches!(
            unknown.unwrap_err(),
            WorkflowError::UnknownDependency { .. }
        ));

        let self_dep = WorkflowSpec::new("wf", "g", vec![StepSpec::new("a", "W", &["a"])], Map::new());
        assert_eq!(self_dep.unwrap_err(), WorkflowError::SelfDependency("a".into()));

        let cycle = WorkflowSpec::new(
            "wf",
            "g",
            vec![StepSpec::new("a", "W", &["b"]), StepSpec::new("b", "W", &["a"])],
            Map::new(),
        );
        assert_eq!(
            cycle.unwrap_err(),
            WorkflowError::DependencyCycle(vec!["a".into(), "b".into()])
        );

        let empty = WorkflowSpec::new("wf", "g", Vec::new(), Map::new());
        assert_eq!(empty.unwrap_err(), WorkflowError::Empty);
    }

    #[test]
    fn ready_steps_follow_dependencies_in_spec_order() {
        let mut engine = WorkflowEngine::new(spec(vec![
            StepSpec::new("b", "W", &[]),
            StepSpec::new("a", "W", &[]),
            StepSpec::new("c", "W", &["a", "b"]),
        ]))
        .expect("engine");

        let ready: Vec<String> = engine.compute_ready().into_iter().map(|s| s.step_id).collect();
        assert_eq!(ready, vec!["b", "a"]);
        assert_eq!(engine.status("c"), Some(StepStatus::New));

        engine.mark_status("a", StepStatus::Succeeded).expect("mark a");
        engine.mark_status("b", StepStatus::Succeeded).expect("mark b");
        let ready: Vec<String> = engine.compute_ready().into_iter().map(|s| s.step_id).collect();
        assert_eq!(ready, vec!["c"]);
    }

    #[test]
    fn mark_status_rejects_unknown_step() {
        let mut engine = WorkflowEngine::new(chain()).expect("engine");
        assert_eq!(
            engine.mark_status("nope", StepStatus::Running),
            Err(WorkflowError::UnknownStep("nope".into()))
        );
    }

    #[test]
    fn failure_blocks_transitive_dependents() {
        let mut engine = WorkflowEngine::new(chain()).expect("engine");
        engine.compute_ready();
        engine.mark_status("a", StepStatus::Failed).expect("mark");

        assert!(engine.compute_ready().is_empty());
        let blocked = engine.block_unreachable();
        assert_eq!(blocked, vec!["b", "c"]);
        assert!(engine.is_finished());
        assert_eq!(engine.overall_status(), WorkflowStatus::Failed);
        assert!(
            engine
                .step_state("c")
                .and_then(|s| s.reason.as_deref())
                .is_some_and(|r| r.contains("`b`"))
        );
    }

    #[test]
    fn restoring_snapshot_defaults_new_steps_by_dependency_state() {
        let mut engine = WorkflowEngine::new(chain()).expect("engine");
        engine.mark_status("a", StepStatus::Succeeded).expect("mark");
        let mut snapshot = engine.snapshot();
        snapshot.state.steps.remove("b");
        snapshot.state.steps.remove("c");

        let restored = WorkflowEngine::from_snapshot(snapshot).expect("restore");
        assert_eq!(restored.status("a"), Some(StepStatus::Succeeded));
        assert_eq!(restored.status("b"), Some(StepStatus::Ready));
        assert_eq!(restored.status("c"), Some(StepStatus::New));
    }

    #[test]
    fn reset_interrupted_returns_running_steps_to_new() {
        let mut engine = WorkflowEngine::new(chain()).expect("engine");
        engine.mark_status("a", StepStatus::Running).expect("mark");
        assert_eq!(engine.reset_interrupted(), vec!["a"]);
        assert_eq!(engine.status("a"), Some(StepStatus::New));
    }

    #[test]
    fn parses_provider_workflow_with_defaults() {
        let spec = workflow_from_value(
            "goal",
            &json!({"steps": [
                {"id": "s1"},
                {"step_id": "s2", "worker": "Reviewer", "depends_on": ["s1"], "inputs": {"k": 1}}
            ]}),
        )
        .expect("parse");
        assert_eq!(spec.steps[0].worker, DEFAULT_WORKER);
        assert_eq!(spec.steps[0].name, "s1");
        assert_eq!(spec.steps[1].depends_on, vec!["s1"]);
        assert_eq!(spec.steps[1].inputs.get("k"), Some(&json!(1)));
        assert!(spec.workflow_id.starts_with("wf-"));
    }

    #[test]
    fn rejects_malformed_provider_workflow() {
        assert!(matches!(
            workflow_from_value("g", &json!({"steps": "nope"})),
            Err(WorkflowError::InvalidPlan(_))
        ));
        assert!(matches!(
            workflow_from_value("g", &json!({"steps": [{"worker": "W"}]})),
            Err(WorkflowError::InvalidPlan(_))
        ));
        assert!(matches!(
            workflow_from_value("g", &json!({"steps": [{"id": "a", "depends_on": ["b"]}]})),
            Err(WorkflowError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn snapshot_serializes_upper_case_statuses() {
        let engine = WorkflowEngine::new(chain()).expect("engine");
        let value = serde_json::to_value(engine.snapshot()).expect("serialize");
        assert_eq!(value["state"]["steps"]["a"]["status"], json!("NEW"));
        assert_eq!(value["state"]["steps"]["a"]["attempts"], json!([]));
        assert_eq!(value["spec"]["steps"][2]["worker"], json!("Reviewer"));
    }
}
