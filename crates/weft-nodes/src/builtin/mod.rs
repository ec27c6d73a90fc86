pub mod aggregator;
pub mod approval;
pub mod cron;
pub mod file_io;
pub mod http_request;
pub mod input;
pub mod iterator;
pub mod llm;
pub mod loop_node;
pub mod output;
pub mod router;
pub mod shell_exec;
pub mod subworkflow;
pub mod tool;
pub mod transform;
pub mod validator;
pub mod webhook;

use serde::de::DeserializeOwned;

use weft_core::error::Result;
use weft_core::types::NodeContext;

/// Deserialize a node's config into a typed struct.
pub(crate) fn parse_config<T: DeserializeOwned>(ctx: &NodeContext) -> Result<T> {
    let config = if ctx.config.is_null() {
        serde_json::json!({})
    } else {
        ctx.config.clone()
    };
    serde_json::from_value(config).map_err(|e| ctx.fail(format!("invalid config: {e}")))
}
