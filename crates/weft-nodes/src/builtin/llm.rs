use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{ModelRequest, NodeContext, NodeInput, NodeOutput};

use super::parse_config;
use crate::template::{self, value_to_text};

/// Model call through the host's model backend.
pub struct LlmExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmConfig {
    #[serde(default = "default_prompt")]
    prompt: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

fn default_prompt() -> String {
    "{{input}}".to_string()
}

/// Prompt precedence: a wired `prompt` handle, a bare string input, the template.
fn build_prompt(input: &NodeInput, ctx: &NodeContext, config: &LlmConfig) -> String {
    let incoming = input.value();
    let prompt = if let Some(p) = input.get("prompt") {
        value_to_text(p)
    } else if let Some(Value::String(s)) = &incoming {
        if config.prompt == default_prompt() {
            s.clone()
        } else {
            template::render_in(&config.prompt, ctx, incoming.as_ref())
        }
    } else {
        template::render_in(&config.prompt, ctx, incoming.as_ref())
    };

    match input.get("context") {
        Some(context) => format!("Context:\n{}\n\n{}", value_to_text(context), prompt),
        None => prompt,
    }
}

impl NodeExecutor for LlmExecutor {
    fn node_type(&self) -> &str {
        "llm"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let config: LlmConfig = parse_config(&ctx)?;
            let backend = ctx
                .services
                .model
                .clone()
                .ok_or_else(|| ctx.fail("no model backend configured"))?;

            let prompt = build_prompt(&input, &ctx, &config);
            if prompt.trim().is_empty() {
                return Err(ctx.fail("prompt is empty"));
            }
            let system = input
                .get("system")
                .map(value_to_text)
                .or_else(|| {
                    config
                        .system_prompt
                        .as_deref()
                        .map(|s| template::render_in(s, &ctx, input.value().as_ref()))
                });

            debug!(node_id = %ctx.node_id, prompt_len = prompt.len(), "Calling model backend");

            let response = backend
                .complete(ModelRequest {
                    model: config.model.clone(),
                    system,
                    prompt,
                    temperature: config.temperature,
                    max_tokens: config.max_tokens,
                })
                .await
                .map_err(|e| ctx.fail(e.to_string()))?;

            let usage = response.usage();
            Ok(NodeOutput::value(json!({
                "response": response.content,
                "model": response.model,
                "usage": {
                    "input_tokens": response.input_tokens,
                    "output_tokens": response.output_tokens,
                    "cost_usd": response.cost_usd,
                },
            }))
            .with_usage(usage))
        })
    }
}
