use serde::Serialize;
use thiserror::Error;

/// A single problem found while validating a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationIssue {
    #[error("workflow has no nodes")]
    EmptyGraph,

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("edge {edge} references unknown node {node}")]
    UnknownNode { edge: String, node: String },

    #[error("no executor registered for node type '{node_type}' (node {node_id})")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("handle {node_id}.{handle} has {count} incoming edges (at most one allowed)")]
    HandleConflict {
        node_id: String,
        handle: String,
        count: usize,
    },

    #[error("required input {node_id}.{handle} is not wired")]
    UnwiredInput { node_id: String, handle: String },

    #[error("node {0} has no incoming edges and is not a start node")]
    MissingProducer(String),

    #[error("node {0} is not reachable from any start node")]
    Unreachable(String),

    #[error("node {0} must have at least one outgoing edge")]
    MissingOutgoing(String),

    #[error("workflow has no sink node")]
    NoSink,

    #[error("cycle detected through nodes: {}", .nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error("loop {node_id} has invalid maxIterations ({value}); expected 1..={max}")]
    LoopBound {
        node_id: String,
        value: String,
        max: u64,
    },

    #[error("{start} must reach exactly one matching {end_kind} node, found {found}")]
    UnmatchedConstruct {
        start: String,
        end_kind: String,
        found: usize,
    },

    #[error("{end} is claimed by more than one construct: {}", .starts.join(", "))]
    AmbiguousNesting { end: String, starts: Vec<String> },

    #[error("construct {outer} contains {inner} without its matching boundary")]
    CrossedBoundary { outer: String, inner: String },

    #[error("edge {source_node} -> {target_node} crosses the region of {construct}")]
    RegionEdge {
        construct: String,
        source_node: String,
        target_node: String,
    },

    #[error("missing required input variable: {0}")]
    MissingVariable(String),
}

#[derive(Debug, Error)]
pub enum WeftError {
    // Validation errors
    #[error("workflow validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    // Execution errors
    #[error("node {node_id} failed: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("approval denied for node {node_id}: {reason}")]
    ApprovalDenied { node_id: String, reason: String },

    #[error("approval timed out for node {node_id}")]
    ApprovalTimedOut { node_id: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("no executor registered for node type: {0}")]
    UnknownNodeType(String),

    // Collaborator errors
    #[error("backend error: {0}")]
    Backend(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("live run already active for workflow: {0}")]
    LiveRunActive(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Shorthand used by executors to report a failed call.
    pub fn node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Issues carried by a validation failure, empty for every other variant.
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            Self::Validation(issues) => issues,
            _ => &[],
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_issue() {
        let err = WeftError::Validation(vec![
            ValidationIssue::EmptyGraph,
            ValidationIssue::CycleDetected {
                nodes: vec!["a".into(), "b".into()],
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("no nodes"));
        assert!(msg.contains("a, b"));
        assert_eq!(err.issues().len(), 2);
    }

    #[test]
    fn non_validation_errors_have_no_issues() {
        assert!(WeftError::Cancelled.issues().is_empty());
    }
}
