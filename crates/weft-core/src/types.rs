use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::{ApprovalOutcome, ApprovalRequest};
use crate::error::WeftError;
use crate::traits::{ModelBackend, ToolBackend, WorkflowRunner};

/// Name of the handle that carries a node's whole output value.
pub const DEFAULT_OUTPUT: &str = "output";

/// Name of the default input handle.
pub const DEFAULT_INPUT: &str = "input";

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    /// Id for a nested run (one iteration item, one loop pass).
    pub fn child(&self, node_id: &str, index: usize) -> Self {
        Self(format!("{}/{}#{}", self.0, node_id, index))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authoring-time data kind carried on edges. Never used for runtime coercion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Text,
    Json,
    Bool,
    Float,
    Number,
    Rows,
    Binary,
    #[default]
    Any,
    Exec,
}

/// Lifecycle status of one node within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
    Waiting,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Waiting => "waiting",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a node was skipped instead of dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A producer failed, or was itself skipped because of a failure.
    UpstreamFailed,
    /// A router chose another branch, or a producer yielded nothing.
    BranchNotTaken,
    /// The run was cancelled before this node could finish.
    Cancelled,
}

/// Token and cost usage reported by an executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn new(tokens: u64, cost_usd: f64) -> Self {
        Self { tokens, cost_usd }
    }

    pub fn add(&mut self, other: Usage) {
        self.tokens += other.tokens;
        self.cost_usd += other.cost_usd.max(0.0);
    }
}

/// Authoritative per-node state. Only the scheduler writes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

/// Inputs resolved for one dispatch, keyed by target handle in wiring order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInput {
    handles: Vec<(String, Value)>,
}

impl NodeInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input carrying a single value on the default handle.
    pub fn from_value(value: Value) -> Self {
        Self {
            handles: vec![(DEFAULT_INPUT.to_string(), value)],
        }
    }

    pub fn insert(&mut self, handle: impl Into<String>, value: Value) {
        let handle = handle.into();
        match self.handles.iter_mut().find(|(h, _)| *h == handle) {
            Some(slot) => slot.1 = value,
            None => self.handles.push((handle, value)),
        }
    }

    pub fn get(&self, handle: &str) -> Option<&Value> {
        self.handles
            .iter()
            .find(|(h, _)| h == handle)
            .map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn handles(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.handles.iter().map(|(h, v)| (h.as_str(), v))
    }

    /// The combined input value.
    ///
    /// A lone edge into the default handle yields its value unchanged;
    /// anything else becomes an object keyed by target handle.
    pub fn value(&self) -> Option<Value> {
        match self.handles.as_slice() {
            [] => None,
            [(handle, value)] if handle == DEFAULT_INPUT => Some(value.clone()),
            many => Some(Value::Object(
                many.iter().map(|(h, v)| (h.clone(), v.clone())).collect(),
            )),
        }
    }

    /// Look up `key` as a handle, then as a field of the combined value.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.get(key) {
            return Some(v.clone());
        }
        match self.value()? {
            Value::Object(map) => map.get(key).cloned(),
            _ => None,
        }
    }
}

/// Suspension request returned by an approval-gated executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalGate {
    pub message: String,
    pub preview: String,
    pub timeout: Option<Duration>,
    /// Value released as the node's output once approved.
    pub pending: Value,
}

/// What an executor hands back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub value: Value,
    pub usage: Usage,
    /// Output handles actually produced. `None` means every handle.
    pub handles: Option<Vec<String>>,
    pub gate: Option<ApprovalGate>,
}

impl NodeOutput {
    pub fn value(value: Value) -> Self {
        Self {
            value,
            usage: Usage::default(),
            handles: None,
            gate: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Restrict the produced handles to `handle` alone.
    pub fn only_handle(mut self, handle: impl Into<String>) -> Self {
        self.handles = Some(vec![handle.into()]);
        self
    }

    pub fn gated(gate: ApprovalGate) -> Self {
        Self {
            value: Value::Null,
            usage: Usage::default(),
            handles: None,
            gate: Some(gate),
        }
    }
}

/// Request sent to a model-serving backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: Option<String>,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Completion returned by a model-serving backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl ModelResponse {
    pub fn usage(&self) -> Usage {
        Usage::new(self.input_tokens + self.output_tokens, self.cost_usd)
    }
}

/// External collaborators reachable from executors.
#[derive(Clone)]
pub struct Services {
    pub model: Option<Arc<dyn ModelBackend>>,
    pub tools: Option<Arc<dyn ToolBackend>>,
    pub workflows: Option<Arc<dyn WorkflowRunner>>,
    pub working_dir: PathBuf,
    pub approval_timeout: Duration,
    pub preview_chars: usize,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            model: None,
            tools: None,
            workflows: None,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            approval_timeout: Duration::from_secs(300),
            preview_chars: 500,
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("model", &self.model.is_some())
            .field("tools", &self.tools.is_some())
            .field("workflows", &self.workflows.is_some())
            .field("working_dir", &self.working_dir)
            .field("approval_timeout", &self.approval_timeout)
            .field("preview_chars", &self.preview_chars)
            .finish()
    }
}

/// Read-only view of the run handed to an executor for one dispatch.
#[derive(Clone, Debug)]
pub struct NodeContext {
    pub run_id: RunId,
    pub node_id: String,
    pub config: Value,
    /// Run variables (declared inputs plus engine-injected values).
    pub variables: Arc<HashMap<String, Value>>,
    /// Snapshot of outputs completed before this dispatch.
    pub outputs: Arc<HashMap<String, Value>>,
    /// Workflow ids from the outermost run down to this one.
    pub call_chain: Arc<Vec<String>>,
    pub services: Services,
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| v.as_bool())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(|v| v.as_f64())
    }

    /// Build an execution error attributed to this node.
    pub fn fail(&self, message: impl Into<String>) -> WeftError {
        WeftError::node(self.node_id.clone(), message)
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one iteration item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    pub index: usize,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub node_states: BTreeMap<String, NodeState>,
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub node_states: BTreeMap<String, NodeState>,
    /// Values of output nodes, keyed by node id.
    pub outputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub iterations: BTreeMap<String, Vec<ItemReport>>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_states.get(node_id).map(|s| s.status)
    }

    pub fn output_of(&self, node_id: &str) -> Option<&Value> {
        self.node_states.get(node_id).and_then(|s| s.output.as_ref())
    }

    /// Nodes that ended in `error`, in id order.
    pub fn failed_nodes(&self) -> Vec<&str> {
        self.node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Error)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// True when at least one node completed and at least one failed.
    pub fn is_partial(&self) -> bool {
        let any_done = self
            .node_states
            .values()
            .any(|s| s.status == NodeStatus::Completed);
        any_done && !self.failed_nodes().is_empty()
    }
}

/// Why a live run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStopReason {
    UserStopped,
    MaxPasses,
    ErrorPolicy,
    ConsecutiveErrors,
    TriggerClosed,
}

impl std::fmt::Display for LiveStopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UserStopped => "user_stopped",
            Self::MaxPasses => "max_passes",
            Self::ErrorPolicy => "error_policy",
            Self::ConsecutiveErrors => "consecutive_errors",
            Self::TriggerClosed => "trigger_closed",
        };
        f.write_str(s)
    }
}

/// Events published on the engine's bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    NodeStatusChanged {
        run_id: RunId,
        node_id: String,
        status: NodeStatus,
        timestamp: DateTime<Utc>,
    },
    ApprovalRequested {
        request: ApprovalRequest,
    },
    ApprovalResolved {
        request_id: String,
        outcome: ApprovalOutcome,
    },
    IterationProgress {
        run_id: RunId,
        node_id: String,
        completed: usize,
        total: usize,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
        total_tokens: u64,
        total_cost_usd: f64,
    },
    LivePassCompleted {
        live_id: String,
        pass: u64,
        status: RunStatus,
        tokens: u64,
        cost_usd: f64,
        duration_ms: u64,
        output_summary: String,
    },
    LiveStopped {
        live_id: String,
        passes: u64,
        reason: LiveStopReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_default_input_flattens() {
        let input = NodeInput::from_value(json!("hello"));
        assert_eq!(input.value(), Some(json!("hello")));
    }

    #[test]
    fn named_handles_build_object() {
        let mut input = NodeInput::new();
        input.insert("prompt", json!("p"));
        input.insert("context", json!("c"));
        assert_eq!(input.value(), Some(json!({"prompt": "p", "context": "c"})));
        assert_eq!(input.lookup("context"), Some(json!("c")));
    }

    #[test]
    fn lookup_falls_back_to_field() {
        let input = NodeInput::from_value(json!({"path": "/tmp/x"}));
        assert_eq!(input.lookup("path"), Some(json!("/tmp/x")));
        assert_eq!(input.lookup("missing"), None);
    }

    #[test]
    fn empty_input_has_no_value() {
        assert_eq!(NodeInput::new().value(), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(NodeStatus::Completed.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(NodeStatus::Error.is_terminal());
        assert!(!NodeStatus::Waiting.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
    }

    #[test]
    fn child_run_ids_nest() {
        let parent = RunId::from_str("r1");
        assert_eq!(parent.child("iter", 2).0, "r1/iter#2");
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(Usage::new(10, 0.5));
        total.add(Usage::new(5, 0.25));
        assert_eq!(total.tokens, 15);
        assert!((total.cost_usd - 0.75).abs() < 1e-9);
    }
}
