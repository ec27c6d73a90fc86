use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

/// Entry node: picks its value out of the run variables.
pub struct InputExecutor;

fn find_value(input: &NodeInput, ctx: &NodeContext) -> Option<Value> {
    let vars = &ctx.variables;

    if let Some(v) = vars.get(&ctx.node_id) {
        return Some(v.clone());
    }
    for key in ["inputName", "name", "label"] {
        if let Some(v) = ctx.config_str(key).and_then(|name| vars.get(name)) {
            return Some(v.clone());
        }
    }
    if let Some(v) = vars.get("input") {
        return Some(v.clone());
    }
    if let Some(v) = input.value() {
        return Some(v);
    }

    // A single user-supplied variable feeds any input node
    let mut user_vars = vars.iter().filter(|(k, _)| !k.starts_with("__"));
    if let (Some((_, v)), None) = (user_vars.next(), user_vars.next()) {
        return Some(v.clone());
    }

    ctx.config.get("defaultValue").cloned()
}

impl NodeExecutor for InputExecutor {
    fn node_type(&self) -> &str {
        "input"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            find_value(&input, &ctx)
                .map(NodeOutput::value)
                .ok_or_else(|| ctx.fail("no value supplied for this input"))
        })
    }
}
