use serde::{Deserialize, Serialize};

use weft_core::types::{DataKind, DEFAULT_INPUT, DEFAULT_OUTPUT};

/// Data-flow connection from one node's output handle to another's input handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    #[serde(default = "default_source_handle")]
    pub source_handle: String,
    #[serde(default = "default_target_handle")]
    pub target_handle: String,
    /// Authoring hint only; values pass through untyped.
    #[serde(default)]
    pub kind: DataKind,
}

fn default_source_handle() -> String {
    DEFAULT_OUTPUT.to_string()
}

fn default_target_handle() -> String {
    DEFAULT_INPUT.to_string()
}

impl Edge {
    /// Edge between the default handles.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            source_handle: default_source_handle(),
            target_handle: default_target_handle(),
            kind: DataKind::Any,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn from_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = handle.into();
        self
    }

    pub fn to_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = handle.into();
        self
    }

    pub fn with_kind(mut self, kind: DataKind) -> Self {
        self.kind = kind;
        self
    }

    /// Id for diagnostics: the declared id or `source->target`.
    pub fn label(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", self.source, self.target))
    }
}
