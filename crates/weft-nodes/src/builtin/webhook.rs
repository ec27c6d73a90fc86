use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

/// Exposes the request that fired the run. The HTTP listener lives in the
/// host, which passes the request in as `__webhook_*` run variables.
pub struct WebhookExecutor;

impl NodeExecutor for WebhookExecutor {
    fn node_type(&self) -> &str {
        "webhook"
    }

    fn execute(&self, _input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let var = |key: &str, fallback: Value| ctx.variables.get(key).cloned().unwrap_or(fallback);
            let body = var("__webhook_body", Value::Null);
            let method = var("__webhook_method", json!("POST"));
            debug!(node_id = %ctx.node_id, method = %method, "Webhook trigger");

            Ok(NodeOutput::value(json!({
                "body": body,
                "headers": var("__webhook_headers", json!({})),
                "query": var("__webhook_query", json!({})),
                "method": method,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::ctx;

    #[tokio::test]
    async fn reads_request_variables_with_defaults() {
        let c = ctx(json!({}), &[("__webhook_body", json!({"msg": "hi"}))]);
        let out = WebhookExecutor.execute(NodeInput::new(), c).await.unwrap();
        assert_eq!(out.value["body"], json!({"msg": "hi"}));
        assert_eq!(out.value["method"], json!("POST"));
        assert_eq!(out.value["headers"], json!({}));
    }
}
