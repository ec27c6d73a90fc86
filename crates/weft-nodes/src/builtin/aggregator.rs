use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

use crate::aggregate;

/// Combines its wired inputs by strategy.
///
/// When paired with an iterator the engine aggregates per-item results itself;
/// this executor covers a free-standing aggregator joining parallel branches.
pub struct AggregatorExecutor;

impl NodeExecutor for AggregatorExecutor {
    fn node_type(&self) -> &str {
        "aggregator"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let values: Vec<Value> = match input.len() {
                1 => match input.handles().next().map(|(_, v)| v.clone()) {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => Vec::new(),
                },
                _ => input.handles().map(|(_, v)| v.clone()).collect(),
            };
            Ok(NodeOutput::value(aggregate::combine_with_config(&ctx.config, &values)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::ctx;
    use serde_json::json;

    #[tokio::test]
    async fn joins_branches_in_wiring_order() {
        let mut input = NodeInput::new();
        input.insert("a", json!("left"));
        input.insert("b", json!("right"));
        let out = AggregatorExecutor
            .execute(input, ctx(json!({"strategy": "concat", "separator": " | "}), &[]))
            .await
            .unwrap();
        assert_eq!(out.value, json!("left | right"));
    }

    #[tokio::test]
    async fn single_array_input_is_spread() {
        let out = AggregatorExecutor
            .execute(
                NodeInput::from_value(json!([{"a": 1}, {"b": 2}])),
                ctx(json!({"strategy": "merge"}), &[]),
            )
            .await
            .unwrap();
        assert_eq!(out.value, json!({"a": 1, "b": 2}));
    }
}
