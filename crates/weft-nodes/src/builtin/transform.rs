use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

use super::parse_config;
use crate::{expr, path, template};

/// Pure value transformation: template, path extraction, or expression.
pub struct TransformExecutor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Mode {
    #[default]
    Template,
    Path,
    Expression,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransformConfig {
    #[serde(default)]
    mode: Mode,
    #[serde(default = "default_template")]
    template: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    expression: Option<String>,
    #[serde(default)]
    default: Option<Value>,
}

fn default_template() -> String {
    "{{input}}".to_string()
}

impl NodeExecutor for TransformExecutor {
    fn node_type(&self) -> &str {
        "transform"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let config: TransformConfig = parse_config(&ctx)?;
            let incoming = input.value().unwrap_or(Value::Null);

            let value = match config.mode {
                Mode::Template => {
                    // Literal templates pass the input through untouched
                    if template::has_placeholders(&config.template) {
                        Value::String(template::render_in(&config.template, &ctx, Some(&incoming)))
                    } else {
                        incoming
                    }
                }
                Mode::Path => {
                    let p = config
                        .path
                        .as_deref()
                        .ok_or_else(|| ctx.fail("path mode needs a 'path'"))?;
                    match path::extract(&incoming, p) {
                        Some(v) => v.clone(),
                        None => config
                            .default
                            .clone()
                            .ok_or_else(|| ctx.fail(format!("path '{p}' not found in input")))?,
                    }
                }
                Mode::Expression => {
                    let e = config
                        .expression
                        .as_deref()
                        .ok_or_else(|| ctx.fail("expression mode needs an 'expression'"))?;
                    expr::evaluate(e, incoming).map_err(|msg| ctx.fail(msg))?
                }
            };
            Ok(NodeOutput::value(value))
        })
    }
}
