use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

use super::parse_config;
use crate::template::{self, value_to_text};

/// Runs a shell command. Stdin receives the incoming value as text.
pub struct ShellExecExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShellConfig {
    command: String,
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    env_vars: HashMap<String, String>,
    #[serde(default = "default_true")]
    fail_on_non_zero: bool,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl ShellExecExecutor {
    fn working_dir(ctx: &NodeContext, configured: Option<&str>) -> PathBuf {
        match configured {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                if dir.is_absolute() {
                    dir
                } else {
                    ctx.services.working_dir.join(dir)
                }
            }
            None => ctx.services.working_dir.clone(),
        }
    }
}

impl NodeExecutor for ShellExecExecutor {
    fn node_type(&self) -> &str {
        "shell_exec"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let config: ShellConfig = parse_config(&ctx)?;
            let incoming = input.value();
            let command = template::render_in(&config.command, &ctx, incoming.as_ref());
            if command.trim().is_empty() {
                return Err(ctx.fail("command is empty"));
            }
            let cwd = Self::working_dir(&ctx, config.working_dir.as_deref());

            debug!(node_id = %ctx.node_id, command = %command, cwd = %cwd.display(), "Running shell command");

            let mut child = tokio::process::Command::new(&config.shell)
                .arg("-c")
                .arg(&command)
                .current_dir(&cwd)
                .envs(&config.env_vars)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| ctx.fail(format!("failed to spawn {}: {e}", config.shell)))?;

            if let Some(mut stdin) = child.stdin.take() {
                let text = incoming.as_ref().map(value_to_text).unwrap_or_default();
                // A command that never reads stdin closes the pipe early
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    debug!(node_id = %ctx.node_id, error = %e, "stdin not consumed");
                }
            }

            let timeout = Duration::from_secs(config.timeout_secs);
            let output = tokio::select! {
                result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => return Err(ctx.fail(format!("command failed: {e}"))),
                    Err(_) => {
                        warn!(node_id = %ctx.node_id, timeout_secs = config.timeout_secs, "Shell command timed out");
                        return Err(ctx.fail(format!("command timed out after {}s", config.timeout_secs)));
                    }
                },
                _ = ctx.cancel.cancelled() => return Err(ctx.fail("command cancelled")),
            };

            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let exit_code = output.status.code().unwrap_or(-1);

            if config.fail_on_non_zero && !output.status.success() {
                let detail = if stderr.trim().is_empty() {
                    stdout.trim()
                } else {
                    stderr.trim()
                };
                return Err(ctx.fail(format!("exit code {exit_code}: {}", template::truncate(detail, 500))));
            }

            Ok(NodeOutput::value(json!({
                "stdout": stdout,
                "stderr": stderr,
                "exitCode": exit_code,
            })))
        })
    }
}
