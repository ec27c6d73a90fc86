use futures::future::BoxFuture;
use regex::RegexBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{ModelRequest, NodeContext, NodeInput, NodeOutput};

use super::parse_config;
use crate::template::primary_text;

/// Picks exactly one `branch-N` handle for its input.
pub struct RouterExecutor;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BranchSpec {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        default: bool,
    },
}

#[derive(Debug, Clone)]
struct Branch {
    name: String,
    pattern: Option<String>,
    default: bool,
}

impl From<BranchSpec> for Branch {
    fn from(spec: BranchSpec) -> Self {
        match spec {
            BranchSpec::Name(name) => Self {
                name,
                pattern: None,
                default: false,
            },
            BranchSpec::Full {
                name,
                pattern,
                default,
            } => Self {
                name,
                pattern,
                default,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouterConfig {
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    branches: Vec<BranchSpec>,
    #[serde(default)]
    model: Option<String>,
}

fn default_mode() -> String {
    "pattern".to_string()
}

/// Handle name for the branch at `index`.
pub fn branch_handle(index: usize) -> String {
    format!("branch-{index}")
}

fn branch_matches(branch: &Branch, text: &str) -> std::result::Result<bool, regex::Error> {
    match &branch.pattern {
        Some(pattern) => Ok(RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()?
            .is_match(text)),
        None => Ok(text.to_lowercase().contains(&branch.name.to_lowercase())),
    }
}

/// First matching branch; otherwise the `default` branch, otherwise the last.
fn select_by_pattern(branches: &[Branch], text: &str) -> std::result::Result<usize, regex::Error> {
    for (i, branch) in branches.iter().enumerate() {
        if branch.default {
            continue;
        }
        if branch_matches(branch, text)? {
            return Ok(i);
        }
    }
    Ok(branches
        .iter()
        .position(|b| b.default)
        .unwrap_or(branches.len() - 1))
}

async fn select_by_model(
    branches: &[Branch],
    text: &str,
    ctx: &NodeContext,
    model: Option<String>,
) -> Result<usize> {
    let backend = ctx
        .services
        .model
        .clone()
        .ok_or_else(|| ctx.fail("router mode 'llm' needs a model backend"))?;
    let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
    let prompt = format!(
        "Classify the following input into exactly one of these categories: {}.\n\
         Respond with only the category name.\n\nInput: {}",
        names.join(", "),
        text
    );
    let response = backend
        .complete(ModelRequest {
            model,
            prompt,
            temperature: Some(0.0),
            ..Default::default()
        })
        .await
        .map_err(|e| ctx.fail(e.to_string()))?;

    let answer = response.content.trim().to_lowercase();
    let chosen = branches
        .iter()
        .position(|b| b.name.to_lowercase() == answer)
        .or_else(|| {
            branches
                .iter()
                .position(|b| answer.contains(&b.name.to_lowercase()))
        });
    Ok(chosen.unwrap_or_else(|| {
        warn!(node_id = %ctx.node_id, answer = %answer, "Classifier answer matched no branch, using first");
        0
    }))
}

impl NodeExecutor for RouterExecutor {
    fn node_type(&self) -> &str {
        "router"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let config: RouterConfig = parse_config(&ctx)?;
            let branches: Vec<Branch> = config.branches.into_iter().map(Branch::from).collect();
            if branches.is_empty() {
                return Err(ctx.fail("router has no branches"));
            }

            let incoming = input.value().unwrap_or(Value::Null);
            let text = primary_text(&incoming);

            let index = match config.mode.as_str() {
                "llm" => select_by_model(&branches, &text, &ctx, config.model).await?,
                _ => select_by_pattern(&branches, &text)
                    .map_err(|e| ctx.fail(format!("invalid branch pattern: {e}")))?,
            };
            let selected = &branches[index];
            debug!(node_id = %ctx.node_id, branch = %selected.name, index, "Router selected branch");

            Ok(NodeOutput::value(json!({
                "selectedBranch": selected.name,
                "branchIndex": index,
                "value": incoming,
            }))
            .only_handle(branch_handle(index)))
        })
    }
}
