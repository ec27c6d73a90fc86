use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

/// Loop entry. Emits the initial body input; the engine repeats the body.
pub struct LoopExecutor;

/// Loop exit. Passes the body's result through.
pub struct ExitExecutor;

impl NodeExecutor for LoopExecutor {
    fn node_type(&self) -> &str {
        "loop"
    }

    fn execute(&self, input: NodeInput, _ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move { Ok(NodeOutput::value(input.value().unwrap_or(Value::Null))) })
    }
}

impl NodeExecutor for ExitExecutor {
    fn node_type(&self) -> &str {
        "exit"
    }

    fn execute(&self, input: NodeInput, _ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move { Ok(NodeOutput::value(input.value().unwrap_or(Value::Null))) })
    }
}
