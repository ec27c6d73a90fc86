use std::path::{Component, Path, PathBuf};

use base64::Engine as _;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

use super::parse_config;
use crate::template::{self, value_to_text};

const DENIED_DIRS: &[&str] = &[".ssh", ".gnupg", ".aws"];
const DENIED_FILES: &[&str] = &["/etc/shadow", "/etc/passwd", "/etc/sudoers"];

/// Whether `path` points into a credential store or system secret.
pub fn is_path_denied(path: &Path) -> bool {
    if DENIED_FILES.iter().any(|f| path == Path::new(f)) {
        return true;
    }
    path.components().any(|c| match c {
        Component::Normal(name) => DENIED_DIRS.iter().any(|d| name == *d),
        _ => false,
    })
}

/// Path from the incoming `path` (handle or field) or config, relative to the working dir.
fn resolve_path(input: &NodeInput, ctx: &NodeContext, configured: Option<&str>) -> Result<PathBuf> {
    let raw = input
        .lookup("path")
        .and_then(|v| v.as_str().map(str::to_string))
        .or_else(|| configured.map(|p| template::render_in(p, ctx, input.value().as_ref())))
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ctx.fail("path is empty"))?;

    let path = PathBuf::from(raw.trim());
    let path = if path.is_absolute() {
        path
    } else {
        ctx.services.working_dir.join(path)
    };
    if is_path_denied(&path) {
        return Err(ctx.fail(format!("access denied to sensitive path '{}'", path.display())));
    }
    Ok(path)
}

/// Reads a file as text, JSON, lines, or base64.
pub struct FileReadExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadConfig {
    #[serde(default)]
    path: Option<String>,
    #[serde(default = "default_read_mode")]
    mode: String,
    #[serde(default = "default_max_bytes")]
    max_bytes: u64,
}

fn default_read_mode() -> String {
    "text".to_string()
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024
}

impl NodeExecutor for FileReadExecutor {
    fn node_type(&self) -> &str {
        "file_read"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let config: ReadConfig = parse_config(&ctx)?;
            let path = resolve_path(&input, &ctx, config.path.as_deref())?;

            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| ctx.fail(format!("cannot access {}: {e}", path.display())))?;
            if meta.len() > config.max_bytes {
                return Err(ctx.fail(format!(
                    "file too large: {} bytes > {} byte limit",
                    meta.len(),
                    config.max_bytes
                )));
            }
            debug!(node_id = %ctx.node_id, path = %path.display(), mode = %config.mode, "Reading file");

            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| ctx.fail(format!("failed to read {}: {e}", path.display())))?;
            let size = bytes.len();
            let content = match config.mode.as_str() {
                "binary" => Value::String(base64::engine::general_purpose::STANDARD.encode(&bytes)),
                "json" => serde_json::from_slice(&bytes)
                    .map_err(|e| ctx.fail(format!("invalid JSON in {}: {e}", path.display())))?,
                "lines" => Value::Array(
                    String::from_utf8_lossy(&bytes)
                        .lines()
                        .map(|l| Value::String(l.to_string()))
                        .collect(),
                ),
                _ => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            };

            Ok(NodeOutput::value(json!({
                "content": content,
                "path": path.display().to_string(),
                "size": size,
            })))
        })
    }
}

/// Writes text or JSON to a file.
pub struct FileWriteExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteConfig {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default = "default_write_mode")]
    mode: String,
    #[serde(default = "default_overwrite")]
    write_mode: String,
    #[serde(default = "default_true")]
    create_dirs: bool,
    #[serde(default = "default_true")]
    json_pretty: bool,
}

fn default_write_mode() -> String {
    "text".to_string()
}

fn default_overwrite() -> String {
    "overwrite".to_string()
}

fn default_true() -> bool {
    true
}

impl NodeExecutor for FileWriteExecutor {
    fn node_type(&self) -> &str {
        "file_write"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let config: WriteConfig = parse_config(&ctx)?;
            let path = resolve_path(&input, &ctx, config.path.as_deref())?;

            let content = match (input.get("content").cloned(), &config.content) {
                (Some(v), _) => v,
                (None, Some(t)) => Value::String(template::render_in(t, &ctx, input.value().as_ref())),
                (None, None) => match input.value() {
                    Some(Value::Object(map)) if map.contains_key("content") => map["content"].clone(),
                    Some(v) => v,
                    None => return Err(ctx.fail("no content provided")),
                },
            };

            let text = match config.mode.as_str() {
                "json" if config.json_pretty => serde_json::to_string_pretty(&content)?,
                "json" => serde_json::to_string(&content)?,
                _ => value_to_text(&content),
            };

            if config.create_dirs {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| ctx.fail(format!("failed to create directories: {e}")))?;
                }
            }

            debug!(node_id = %ctx.node_id, path = %path.display(), bytes = text.len(), "Writing file");
            if config.write_mode == "append" {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .map_err(|e| ctx.fail(format!("failed to open for append: {e}")))?;
                file.write_all(text.as_bytes())
                    .await
                    .map_err(|e| ctx.fail(format!("failed to write file: {e}")))?;
                file.flush()
                    .await
                    .map_err(|e| ctx.fail(format!("failed to write file: {e}")))?;
            } else {
                tokio::fs::write(&path, text.as_bytes())
                    .await
                    .map_err(|e| ctx.fail(format!("failed to write file: {e}")))?;
            }

            Ok(NodeOutput::value(json!({
                "path": path.display().to_string(),
                "bytes": text.len(),
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::ctx;

    fn ctx_in(dir: &Path, config: Value) -> NodeContext {
        let mut c = ctx(config, &[]);
        c.services.working_dir = dir.to_path_buf();
        c
    }

    #[test]
    fn sensitive_paths_denied() {
        assert!(is_path_denied(Path::new("/home/u/.ssh/id_rsa")));
        assert!(is_path_denied(Path::new("/etc/shadow")));
        assert!(!is_path_denied(Path::new("/home/u/notes.txt")));
    }

    #[tokio::test]
    async fn write_then_read_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let out = FileWriteExecutor
            .execute(
                NodeInput::from_value(json!({"a": 1})),
                ctx_in(dir.path(), json!({"path": "out/data.json", "mode": "json", "jsonPretty": false})),
            )
            .await
            .unwrap();
        assert_eq!(out.value["bytes"], json!(7));

        let read = FileReadExecutor
            .execute(
                NodeInput::new(),
                ctx_in(dir.path(), json!({"path": "out/data.json", "mode": "json"})),
            )
            .await
            .unwrap();
        assert_eq!(read.value["content"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn append_mode_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        for line in ["one\n", "two\n"] {
            FileWriteExecutor
                .execute(
                    NodeInput::from_value(json!(line)),
                    ctx_in(dir.path(), json!({"path": "log.txt", "writeMode": "append"})),
                )
                .await
                .unwrap();
        }
        let read = FileReadExecutor
            .execute(
                NodeInput::new(),
                ctx_in(dir.path(), json!({"path": "log.txt", "mode": "lines"})),
            )
            .await
            .unwrap();
        assert_eq!(read.value["content"], json!(["one", "two"]));
    }

    #[tokio::test]
    async fn size_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "0123456789").unwrap();
        let err = FileReadExecutor
            .execute(
                NodeInput::new(),
                ctx_in(dir.path(), json!({"path": "big.txt", "maxBytes": 4})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn denied_path_refused() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileReadExecutor
            .execute(NodeInput::new(), ctx_in(dir.path(), json!({"path": ".ssh/config"})))
            .await
            .is_err());
    }
}
