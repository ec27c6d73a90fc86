use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{ApprovalGate, NodeContext, NodeInput, NodeOutput};

use crate::template::{self, primary_text, truncate};

/// Human approval gate. Hands the scheduler a gate instead of a value; the
/// pending data becomes the output once someone approves.
pub struct ApprovalExecutor;

/// The value awaiting release: `input`, then `data`, then the first wired value.
fn pending_value(input: &NodeInput) -> Value {
    input
        .get("input")
        .or_else(|| input.get("data"))
        .cloned()
        .or_else(|| input.handles().next().map(|(_, v)| v.clone()))
        .unwrap_or(Value::Null)
}

impl NodeExecutor for ApprovalExecutor {
    fn node_type(&self) -> &str {
        "approval"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let pending = pending_value(&input);
            let message = ctx
                .config_str("message")
                .map(|m| template::render_in(m, &ctx, Some(&pending)))
                .unwrap_or_else(|| "Approval required to continue".to_string());
            let preview = truncate(&primary_text(&pending), ctx.services.preview_chars);
            let timeout = ctx.config_u64("timeoutSecs").map(Duration::from_secs);

            Ok(NodeOutput::gated(ApprovalGate {
                message,
                preview,
                timeout,
                pending,
            }))
        })
    }
}
