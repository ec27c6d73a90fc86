use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

use super::parse_config;

/// Tool call through the host's tool backend.
pub struct ToolExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    tool_name: String,
    #[serde(default)]
    tool_input: Option<Value>,
    /// `auto` or `deny`.
    #[serde(default = "default_approval")]
    approval: String,
}

fn default_approval() -> String {
    "auto".to_string()
}

/// Config `toolInput` overlaid with the incoming object.
fn build_tool_input(config: &ToolConfig, incoming: Option<Value>, ctx: &NodeContext) -> Result<Value> {
    let mut merged = match &config.tool_input {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => return Ok(incoming.unwrap_or_else(|| other.clone())),
        None => Map::new(),
    };
    match incoming {
        Some(Value::Object(map)) => merged.extend(map),
        Some(Value::Null) | None => {}
        Some(other) if merged.is_empty() => {
            merged.insert("input".to_string(), other);
        }
        Some(_) => {
            return Err(ctx.fail("tool input must be an object when toolInput is configured"));
        }
    }
    Ok(Value::Object(merged))
}

impl NodeExecutor for ToolExecutor {
    fn node_type(&self) -> &str {
        "tool"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let config: ToolConfig = parse_config(&ctx)?;
            if config.approval == "deny" {
                return Err(ctx.fail(format!("tool '{}' is denied by node policy", config.tool_name)));
            }
            let backend = ctx
                .services
                .tools
                .clone()
                .ok_or_else(|| ctx.fail("no tool backend configured"))?;

            let tool_input = build_tool_input(&config, input.value(), &ctx)?;
            debug!(node_id = %ctx.node_id, tool = %config.tool_name, "Calling tool backend");

            let result = backend
                .call(config.tool_name.clone(), tool_input)
                .await
                .map_err(|e| ctx.fail(e.to_string()))?;
            Ok(NodeOutput::value(result))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::builtin::testing::ctx;
    use serde_json::json;
    use weft_test_utils::MockTools;

    #[tokio::test]
    async fn merges_config_and_incoming_input() {
        let tools = Arc::new(MockTools::new().with_result("search", json!({"hits": 3})));
        let mut c = ctx(json!({"toolName": "search", "toolInput": {"limit": 5}}), &[]);
        c.services.tools = Some(tools.clone());

        let out = ToolExecutor
            .execute(NodeInput::from_value(json!({"query": "rust"})), c)
            .await
            .unwrap();
        assert_eq!(out.value, json!({"hits": 3}));
        assert_eq!(
            tools.calls(),
            vec![("search".to_string(), json!({"limit": 5, "query": "rust"}))]
        );
    }

    #[tokio::test]
    async fn deny_policy_refuses_call() {
        let tools = Arc::new(MockTools::new());
        let mut c = ctx(json!({"toolName": "rm", "approval": "deny"}), &[]);
        c.services.tools = Some(tools.clone());
        assert!(ToolExecutor.execute(NodeInput::new(), c).await.is_err());
        assert!(tools.calls().is_empty());
    }

    #[tokio::test]
    async fn scalar_input_is_wrapped() {
        let tools = Arc::new(MockTools::new());
        let mut c = ctx(json!({"toolName": "echo"}), &[]);
        c.services.tools = Some(tools.clone());
        ToolExecutor
            .execute(NodeInput::from_value(json!("hi")), c)
            .await
            .unwrap();
        assert_eq!(tools.calls()[0].1, json!({"input": "hi"}));
    }
}
