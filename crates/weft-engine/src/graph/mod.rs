//! Workflow graph model.
//!
//! A workflow is a set of typed `Node`s wired by `Edge`s between named
//! handles, plus the `Variable`s a caller supplies at run start. Graphs are
//! plain data; `crate::plan` turns one into an executable plan.

pub mod edge;
pub mod node;

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_core::error::{Result, ValidationIssue, WeftError};
use weft_core::types::DataKind;

pub use edge::Edge;
pub use node::{Node, NodeKind};

/// Named input supplied when a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub kind: DataKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Variable {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DataKind::Any,
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            kind: DataKind::Any,
            required: false,
            default: Some(default),
            description: None,
        }
    }
}

/// A workflow definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ..Default::default()
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    /// Shorthand for a default-handle edge.
    pub fn connect(self, source: &str, target: &str) -> Self {
        self.with_edge(Edge::new(source, target))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a graph file. An empty `id` falls back to the file stem.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WeftError::WorkflowNotFound(format!("{}: {}", path.display(), e))
        })?;
        let mut graph = Self::from_json(&content)?;
        if graph.id.is_empty() {
            graph.id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(graph)
    }

    /// Merge run inputs with declared defaults.
    ///
    /// Undeclared inputs are passed through. A required variable with neither
    /// a supplied value nor a default is reported as `MissingVariable`.
    pub fn resolve_variables(
        &self,
        inputs: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let mut resolved = inputs.clone();
        let mut missing = Vec::new();
        for var in &self.variables {
            if resolved.contains_key(&var.name) {
                continue;
            }
            match &var.default {
                Some(default) => {
                    resolved.insert(var.name.clone(), default.clone());
                }
                None if var.required => {
                    missing.push(ValidationIssue::MissingVariable(var.name.clone()))
                }
                None => {}
            }
        }
        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(WeftError::Validation(missing))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_editor_json() {
        let graph = Graph::from_json(
            r#"{
                "id": "wf", "name": "Demo",
                "nodes": [
                    {"id": "in", "type": "input"},
                    {"id": "out", "type": "output", "data": {}}
                ],
                "edges": [{"source": "in", "target": "out", "kind": "text"}],
                "variables": [{"name": "topic", "required": true}]
            }"#,
        )
        .unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges[0].kind, DataKind::Text);
        assert!(graph.variables[0].required);
    }

    #[test]
    fn defaults_fill_missing_variables() {
        let graph = Graph::new("wf")
            .with_variable(Variable::optional("tone", json!("calm")))
            .with_variable(Variable::required("topic"));

        let mut inputs = HashMap::new();
        inputs.insert("topic".to_string(), json!("rust"));
        let vars = graph.resolve_variables(&inputs).unwrap();
        assert_eq!(vars["tone"], json!("calm"));
        assert_eq!(vars["topic"], json!("rust"));

        let err = graph.resolve_variables(&HashMap::new()).unwrap_err();
        assert_eq!(err.issues(), &[ValidationIssue::MissingVariable("topic".into())]);
    }

    #[test]
    fn file_stem_names_anonymous_graphs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.json");
        std::fs::write(&path, r#"{"nodes": []}"#).unwrap();
        assert_eq!(Graph::from_file(&path).unwrap().id, "triage");
        assert!(Graph::from_file(&dir.path().join("nope.json")).is_err());
    }
}
