use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

use super::parse_config;
use crate::template::{self, value_to_text};

/// Outbound HTTP call.
pub struct HttpRequestExecutor {
    http: Client,
}

impl HttpRequestExecutor {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for HttpRequestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpConfig {
    #[serde(default)]
    url: Option<String>,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
    #[serde(default)]
    allow_private: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Loopback, private, link-local and unspecified targets are refused by default.
pub fn is_private_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") || host.ends_with(".localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
        }
        Ok(IpAddr::V6(ip)) => {
            let seg = ip.segments()[0];
            ip.is_loopback()
                || ip.is_unspecified()
                || (seg & 0xfe00) == 0xfc00
                || (seg & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

impl NodeExecutor for HttpRequestExecutor {
    fn node_type(&self) -> &str {
        "http_request"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let config: HttpConfig = parse_config(&ctx)?;
            let incoming = input.value();

            let raw_url = input
                .lookup("url")
                .and_then(|v| v.as_str().map(str::to_string))
                .or_else(|| config.url.clone())
                .ok_or_else(|| ctx.fail("no url configured"))?;
            let url_text = template::render_in(&raw_url, &ctx, incoming.as_ref());
            let url = Url::parse(&url_text).map_err(|e| ctx.fail(format!("invalid url '{url_text}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ctx.fail(format!("unsupported url scheme '{}'", url.scheme())));
            }
            if !config.allow_private && is_private_host(&url) {
                return Err(ctx.fail(format!("requests to private host '{}' are blocked", url)));
            }

            let method = Method::from_bytes(config.method.to_uppercase().as_bytes())
                .map_err(|_| ctx.fail(format!("invalid method '{}'", config.method)))?;

            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .timeout(Duration::from_secs(config.timeout_secs));
            for (k, v) in &config.headers {
                req = req.header(k.as_str(), template::render_in(v, &ctx, incoming.as_ref()));
            }

            let body = match (&config.body, input.lookup("body")) {
                (_, Some(b)) => Some(b),
                (Some(Value::String(s)), None) => {
                    Some(Value::String(template::render_in(s, &ctx, incoming.as_ref())))
                }
                (Some(other), None) => Some(other.clone()),
                (None, None) if matches!(method, Method::POST | Method::PUT | Method::PATCH) => {
                    incoming.clone()
                }
                (None, None) => None,
            };
            req = match body {
                Some(Value::String(s)) => req.body(s),
                Some(Value::Null) | None => req,
                Some(other) => req.json(&other),
            };

            debug!(node_id = %ctx.node_id, method = %method, url = %url, "HTTP request");
            let response = req
                .send()
                .await
                .map_err(|e| ctx.fail(format!("request failed: {e}")))?;

            let status = response.status().as_u16();
            let headers: Map<String, Value> = response
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str()
                        .ok()
                        .map(|v| (k.as_str().to_string(), Value::String(v.to_string())))
                })
                .collect();
            let text = response
                .text()
                .await
                .map_err(|e| ctx.fail(format!("failed to read response body: {e}")))?;
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

            Ok(NodeOutput::value(json!({
                "status": status,
                "ok": (200..300).contains(&status),
                "headers": headers,
                "body": body,
                "text": value_to_text(&body),
            })))
        })
    }
}
