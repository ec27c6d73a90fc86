use futures::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

/// Runs another workflow, by id, as a single node.
pub struct SubworkflowExecutor;

impl NodeExecutor for SubworkflowExecutor {
    fn node_type(&self) -> &str {
        "subworkflow"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let workflow_id = ctx
                .config_str("workflowId")
                .filter(|id| !id.is_empty())
                .ok_or_else(|| ctx.fail("no workflowId configured"))?
                .to_string();

            if ctx.call_chain.iter().any(|id| *id == workflow_id) {
                let mut chain: Vec<&str> = ctx.call_chain.iter().map(|s| s.as_str()).collect();
                chain.push(&workflow_id);
                return Err(ctx.fail(format!(
                    "circular subworkflow reference: {}",
                    chain.join(" -> ")
                )));
            }

            let runner = ctx
                .services
                .workflows
                .clone()
                .ok_or_else(|| ctx.fail("no workflow runner available"))?;

            info!(node_id = %ctx.node_id, workflow_id = %workflow_id, "Running subworkflow");
            let chain = ctx.call_chain.as_ref().clone();
            let output = runner
                .run_workflow(
                    workflow_id,
                    input.value().unwrap_or(Value::Null),
                    chain,
                    ctx.cancel.clone(),
                )
                .await
                .map_err(|e| ctx.fail(e.to_string()))?;
            Ok(NodeOutput::value(output))
        })
    }
}
