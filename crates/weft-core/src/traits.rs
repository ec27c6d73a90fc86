use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{ModelRequest, ModelResponse, NodeContext, NodeInput, NodeOutput};

/// Node executor, one implementation per node type.
pub trait NodeExecutor: Send + Sync + 'static {
    /// Type id this executor is registered under (e.g. "llm").
    fn node_type(&self) -> &str;

    /// Input handles that must be wired and resolved before dispatch.
    fn required_inputs(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run the node against its resolved inputs.
    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>>;
}

/// Model-serving backend reached by `llm` and classifying `router` nodes.
pub trait ModelBackend: Send + Sync + 'static {
    fn complete(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>>;
}

/// Tool-serving backend reached by `tool` nodes.
pub trait ToolBackend: Send + Sync + 'static {
    fn call(&self, tool: String, input: Value) -> BoxFuture<'_, Result<Value>>;
}

/// Trait for running nested workflows without circular crate dependencies.
/// The nested run must stop when `cancel` fires.
pub trait WorkflowRunner: Send + Sync + 'static {
    fn run_workflow(
        &self,
        workflow_id: String,
        input: Value,
        call_chain: Vec<String>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Value>>;
}
