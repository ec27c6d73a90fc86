//! Edge data resolution: what value a producer makes available on a handle.

use serde_json::Value;

use weft_core::types::{NodeInput, DEFAULT_OUTPUT};

use crate::plan::PlanEdge;

/// Prefix of router branch handles. Objects without the named field fall
/// back to their `value` field for these handles only.
const BRANCH_PREFIX: &str = "branch-";
const BRANCH_FALLBACK_FIELD: &str = "value";

/// A completed node's output as seen by its consumers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Produced {
    pub value: Value,
    /// Handles the executor produced; `None` means all of them.
    pub handles: Option<Vec<String>>,
}

impl Produced {
    pub fn all(value: Value) -> Self {
        Self {
            value,
            handles: None,
        }
    }
}

/// Resolve `handle` against a producer's output. `None` means not produced.
pub(crate) fn resolve_handle(produced: &Produced, handle: &str) -> Option<Value> {
    if produced.value.is_null() {
        return None;
    }
    if handle == DEFAULT_OUTPUT {
        return Some(produced.value.clone());
    }
    if let Some(handles) = &produced.handles {
        if !handles.iter().any(|h| h == handle) {
            return None;
        }
    }
    match &produced.value {
        Value::Object(map) => map.get(handle).cloned().or_else(|| {
            handle
                .starts_with(BRANCH_PREFIX)
                .then(|| map.get(BRANCH_FALLBACK_FIELD).cloned())
                .flatten()
        }),
        other => Some(other.clone()),
    }
}

/// Resolve `edges` against per-node outputs indexed like the edges' sources.
pub(crate) fn resolve_edges(edges: &[PlanEdge], outputs: &[Option<Produced>]) -> NodeInput {
    let mut input = NodeInput::new();
    for edge in edges {
        let value = outputs
            .get(edge.source)
            .and_then(Option::as_ref)
            .and_then(|p| resolve_handle(p, &edge.source_handle));
        if let Some(value) = value {
            input.insert(edge.target_handle.clone(), value);
        }
    }
    input
}
