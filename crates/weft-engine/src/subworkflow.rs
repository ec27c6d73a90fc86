//! Loading and running nested workflows for `subworkflow` nodes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::WorkflowRunner;
use weft_core::types::RunStatus;

use crate::engine::EngineInner;
use crate::graph::Graph;

/// Where subworkflow graphs come from.
pub trait GraphSource: Send + Sync + 'static {
    fn load(&self, workflow_id: &str) -> BoxFuture<'_, Result<Graph>>;
}

/// Graphs stored as `<dir>/<id>.json`.
pub struct DirGraphSource {
    dir: PathBuf,
}

impl DirGraphSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl GraphSource for DirGraphSource {
    fn load(&self, workflow_id: &str) -> BoxFuture<'_, Result<Graph>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            if workflow_id.is_empty()
                || workflow_id.contains(['/', '\\'])
                || workflow_id.contains("..")
            {
                return Err(WeftError::WorkflowNotFound(workflow_id));
            }
            let path = self.dir.join(format!("{workflow_id}.json"));
            debug!(workflow_id = %workflow_id, path = %path.display(), "Loading workflow");
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|_| WeftError::WorkflowNotFound(workflow_id.clone()))?;
            let mut graph = Graph::from_json(&raw)?;
            if graph.id.is_empty() {
                graph.id = workflow_id;
            }
            Ok(graph)
        })
    }
}

/// Graphs registered in memory, keyed by id.
#[derive(Default)]
pub struct MemoryGraphSource {
    graphs: RwLock<HashMap<String, Graph>>,
}

impl MemoryGraphSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, graph: Graph) {
        if let Ok(mut graphs) = self.graphs.write() {
            graphs.insert(graph.id.clone(), graph);
        }
    }

    pub fn with_graph(self, graph: Graph) -> Self {
        self.insert(graph);
        self
    }
}

impl GraphSource for MemoryGraphSource {
    fn load(&self, workflow_id: &str) -> BoxFuture<'_, Result<Graph>> {
        let found = self
            .graphs
            .read()
            .ok()
            .and_then(|graphs| graphs.get(workflow_id).cloned());
        let workflow_id = workflow_id.to_string();
        Box::pin(async move { found.ok_or(WeftError::WorkflowNotFound(workflow_id)) })
    }
}

/// Runs subworkflows on the engine that owns it.
pub(crate) struct EngineWorkflowRunner {
    pub engine: Weak<EngineInner>,
    pub source: Arc<dyn GraphSource>,
}

impl WorkflowRunner for EngineWorkflowRunner {
    fn run_workflow(
        &self,
        workflow_id: String,
        input: Value,
        call_chain: Vec<String>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let inner = self
                .engine
                .upgrade()
                .ok_or_else(|| WeftError::Backend("engine has shut down".into()))?;
            let graph = self.source.load(&workflow_id).await?;
            let result = inner
                .run_nested(&graph, input, call_chain, &cancel)
                .await?;
            match result.status {
                RunStatus::Completed => Ok(collapse_outputs(result.outputs.into_iter().collect())),
                RunStatus::Cancelled => Err(WeftError::Cancelled),
                RunStatus::Failed => {
                    let failed = result.failed_nodes().join(", ");
                    Err(WeftError::Backend(format!(
                        "workflow {workflow_id} failed at: {failed}"
                    )))
                }
            }
        })
    }
}

/// A lone output is returned as-is; several become an object keyed by node id.
fn collapse_outputs(mut outputs: Vec<(String, Value)>) -> Value {
    if outputs.len() == 1 {
        return outputs.pop().map(|(_, v)| v).unwrap_or(Value::Null);
    }
    Value::Object(outputs.into_iter().collect::<Map<String, Value>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use serde_json::json;

    #[tokio::test]
    async fn dir_source_reads_json_by_id() {
        let dir = weft_test_utils::temp_dir_with(&[(
            "child.json",
            r#"{"nodes": [{"id": "in", "type": "input"}], "edges": []}"#,
        )]);
        let source = DirGraphSource::new(dir.path());
        let graph = source.load("child").await.unwrap();
        assert_eq!(graph.id, "child");
        assert_eq!(graph.nodes.len(), 1);
    }

    #[tokio::test]
    async fn dir_source_rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirGraphSource::new(dir.path());
        for id in ["../etc", "a/b", "missing"] {
            let err = source.load(id).await.unwrap_err();
            assert!(matches!(err, WeftError::WorkflowNotFound(_)), "{id}");
        }
    }

    #[tokio::test]
    async fn memory_source_returns_registered_graphs() {
        let source =
            MemoryGraphSource::new().with_graph(Graph::new("g").with_node(Node::new("in", "input")));
        assert_eq!(source.load("g").await.unwrap().nodes.len(), 1);
        assert!(source.load("h").await.is_err());
    }

    #[test]
    fn outputs_collapse() {
        assert_eq!(collapse_outputs(vec![("o".into(), json!(1))]), json!(1));
        assert_eq!(
            collapse_outputs(vec![("a".into(), json!(1)), ("b".into(), json!(2))]),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(collapse_outputs(vec![]), json!({}));
    }
}
