use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

use super::parse_config;

/// Checks data against a JSON Schema.
pub struct ValidatorExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidatorConfig {
    schema: Value,
    #[serde(default = "default_true")]
    fail_on_error: bool,
}

fn default_true() -> bool {
    true
}

fn parse_schema(ctx: &NodeContext, raw: Value) -> Result<Value> {
    match raw {
        Value::String(s) => {
            serde_json::from_str(&s).map_err(|e| ctx.fail(format!("schema is not valid JSON: {e}")))
        }
        Value::Object(_) | Value::Bool(_) => Ok(raw),
        _ => Err(ctx.fail("schema must be an object or a JSON string")),
    }
}

impl NodeExecutor for ValidatorExecutor {
    fn node_type(&self) -> &str {
        "validator"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let config: ValidatorConfig = parse_config(&ctx)?;
            let schema = parse_schema(&ctx, config.schema)?;
            let validator = jsonschema::validator_for(&schema)
                .map_err(|e| ctx.fail(format!("invalid schema: {e}")))?;

            let data = input
                .get("data")
                .cloned()
                .or_else(|| input.value())
                .unwrap_or(Value::Null);

            let errors: Vec<Value> = validator
                .iter_errors(&data)
                .map(|e| {
                    json!({
                        "path": e.instance_path.to_string(),
                        "message": e.to_string(),
                    })
                })
                .collect();

            debug!(node_id = %ctx.node_id, errors = errors.len(), "Validated data");

            if !errors.is_empty() && config.fail_on_error {
                let summary: Vec<String> = errors
                    .iter()
                    .filter_map(|e| e["message"].as_str().map(str::to_string))
                    .collect();
                return Err(ctx.fail(format!("validation failed: {}", summary.join("; "))));
            }

            Ok(NodeOutput::value(json!({
                "valid": errors.is_empty(),
                "data": data,
                "errors": errors,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::ctx;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["name"],
            "properties": {"name": {"type": "string"}, "age": {"type": "integer"}}
        })
    }

    #[tokio::test]
    async fn valid_data_passes_through() {
        let out = ValidatorExecutor
            .execute(
                NodeInput::from_value(json!({"name": "ann", "age": 3})),
                ctx(json!({"schema": schema()}), &[]),
            )
            .await
            .unwrap();
        assert_eq!(out.value["valid"], json!(true));
        assert_eq!(out.value["data"]["name"], json!("ann"));
    }

    #[tokio::test]
    async fn invalid_data_fails_by_default() {
        let err = ValidatorExecutor
            .execute(
                NodeInput::from_value(json!({"age": "x"})),
                ctx(json!({"schema": schema()}), &[]),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("validation failed"));
    }

    #[tokio::test]
    async fn errors_reported_when_not_failing() {
        let out = ValidatorExecutor
            .execute(
                NodeInput::from_value(json!({"age": "x"})),
                ctx(json!({"schema": schema().to_string(), "failOnError": false}), &[]),
            )
            .await
            .unwrap();
        assert_eq!(out.value["valid"], json!(false));
        assert_eq!(out.value["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn data_handle_preferred() {
        let mut input = NodeInput::new();
        input.insert("data", json!({"name": "x"}));
        input.insert("meta", json!(1));
        let out = ValidatorExecutor
            .execute(input, ctx(json!({"schema": schema()}), &[]))
            .await
            .unwrap();
        assert_eq!(out.value["data"], json!({"name": "x"}));
    }
}
