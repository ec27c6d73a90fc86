use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node type. Built-in kinds are closed; anything else resolves through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Input,
    Output,
    Llm,
    Tool,
    Router,
    Approval,
    Transform,
    Iterator,
    Aggregator,
    Subworkflow,
    HttpRequest,
    FileRead,
    FileWrite,
    ShellExec,
    Validator,
    Webhook,
    Cron,
    Loop,
    Exit,
    Custom(String),
}

impl NodeKind {
    /// Registry type id.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Llm => "llm",
            Self::Tool => "tool",
            Self::Router => "router",
            Self::Approval => "approval",
            Self::Transform => "transform",
            Self::Iterator => "iterator",
            Self::Aggregator => "aggregator",
            Self::Subworkflow => "subworkflow",
            Self::HttpRequest => "http_request",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::ShellExec => "shell_exec",
            Self::Validator => "validator",
            Self::Webhook => "webhook",
            Self::Cron => "cron",
            Self::Loop => "loop",
            Self::Exit => "exit",
            Self::Custom(id) => id,
        }
    }

    /// Kinds that may run without any incoming edge.
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Input | Self::Webhook | Self::Cron)
    }

    /// Kinds whose output must be consumed by at least one edge.
    pub fn needs_outgoing(&self) -> bool {
        matches!(self, Self::Router | Self::Iterator | Self::Loop)
    }
}

impl From<String> for NodeKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "input" => Self::Input,
            "output" => Self::Output,
            "llm" => Self::Llm,
            "tool" => Self::Tool,
            "router" => Self::Router,
            "approval" => Self::Approval,
            "transform" => Self::Transform,
            "iterator" => Self::Iterator,
            "aggregator" => Self::Aggregator,
            "subworkflow" => Self::Subworkflow,
            "http_request" => Self::HttpRequest,
            "file_read" => Self::FileRead,
            "file_write" => Self::FileWrite,
            "shell_exec" => Self::ShellExec,
            "validator" => Self::Validator,
            "webhook" => Self::Webhook,
            "cron" => Self::Cron,
            "loop" => Self::Loop,
            "exit" => Self::Exit,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for NodeKind {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique within the graph.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Executor-specific settings.
    #[serde(default, alias = "data")]
    pub config: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<NodeKind>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            config: Value::Object(Default::default()),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}
