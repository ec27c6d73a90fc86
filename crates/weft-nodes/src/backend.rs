//! HTTP-backed collaborators for hosts that have no model or tool backend of
//! their own (the CLI uses these).

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use weft_core::config::{ModelConfig, ToolServiceConfig};
use weft_core::error::{Result, WeftError};
use weft_core::traits::{ModelBackend, ToolBackend};
use weft_core::types::{ModelRequest, ModelResponse};

/// OpenAI-compatible chat completion client. Works with OpenAI, Ollama, vLLM, Groq, etc.
pub struct OpenAiModel {
    http: Client,
    config: ModelConfig,
}

impl OpenAiModel {
    pub fn new(config: ModelConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.config.input_cost_per_mtok
            + output_tokens as f64 * self.config.output_cost_per_mtok)
            / 1_000_000.0
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl ModelBackend for OpenAiModel {
    fn complete(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        Box::pin(async move {
            let model = request.model.as_deref().unwrap_or(&self.config.model_id);
            let mut messages = Vec::new();
            if let Some(system) = request.system.as_deref() {
                messages.push(ChatMessage {
                    role: "system",
                    content: system,
                });
            }
            messages.push(ChatMessage {
                role: "user",
                content: &request.prompt,
            });

            let body = ChatRequest {
                model,
                messages,
                temperature: request.temperature.or(self.config.temperature),
                max_tokens: request.max_tokens.or(self.config.max_tokens),
            };

            let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
            debug!(model = %model, url = %url, "Sending completion request");

            let mut req = self.http.post(&url).json(&body);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| WeftError::Backend(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(WeftError::Backend(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| WeftError::Backend(format!("bad completion response: {e}")))?;

            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default();
            let usage = parsed.usage.unwrap_or_default();

            Ok(ModelResponse {
                content,
                model: parsed.model.unwrap_or_else(|| model.to_string()),
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                cost_usd: self.cost(usage.prompt_tokens, usage.completion_tokens),
            })
        })
    }
}

/// Tool sidecar reached with `POST {endpoint}` and a `{tool_name, tool_input}` body.
pub struct HttpToolBackend {
    http: Client,
    endpoint: String,
}

impl HttpToolBackend {
    pub fn new(config: &ToolServiceConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: config.endpoint.clone(),
        }
    }
}

impl ToolBackend for HttpToolBackend {
    fn call(&self, tool: String, input: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            debug!(tool = %tool, endpoint = %self.endpoint, "Calling tool backend");
            let response = self
                .http
                .post(&self.endpoint)
                .json(&serde_json::json!({
                    "tool_name": tool,
                    "tool_input": input,
                }))
                .send()
                .await
                .map_err(|e| WeftError::Backend(e.to_string()))?;

            let status = response.status();
            let body: Value = response
                .json()
                .await
                .map_err(|e| WeftError::Backend(format!("bad tool response: {e}")))?;

            if !status.is_success() {
                let message = body
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| body.to_string());
                return Err(WeftError::Backend(format!("tool {tool}: HTTP {status}: {message}")));
            }
            Ok(body.get("result").cloned().unwrap_or(body))
        })
    }
}
