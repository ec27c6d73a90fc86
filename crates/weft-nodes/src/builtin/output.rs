use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

/// Sink node: its value becomes one of the run's outputs.
pub struct OutputExecutor;

impl NodeExecutor for OutputExecutor {
    fn node_type(&self) -> &str {
        "output"
    }

    fn execute(&self, input: NodeInput, _ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move { Ok(NodeOutput::value(input.value().unwrap_or(Value::Null))) })
    }
}
