use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub tools: Option<ToolServiceConfig>,
    #[serde(default)]
    pub workflows: Option<WorkflowLibraryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent node executions per run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    /// Iteration items executed at once unless the iterator overrides it.
    #[serde(default = "default_item_concurrency")]
    pub item_concurrency: usize,
    /// Upper bound accepted for a loop's `maxIterations`.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Characters kept in approval previews.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn default_max_concurrency() -> usize {
    4
}
fn default_approval_timeout_secs() -> u64 {
    300
}
fn default_item_concurrency() -> usize {
    1
}
fn default_max_loop_iterations() -> u64 {
    50
}
fn default_event_capacity() -> usize {
    256
}
fn default_preview_chars() -> usize {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            approval_timeout_secs: default_approval_timeout_secs(),
            item_concurrency: default_item_concurrency(),
            max_loop_iterations: default_max_loop_iterations(),
            event_capacity: default_event_capacity(),
            preview_chars: default_preview_chars(),
            working_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    /// Resolve the working directory for file and shell nodes (expand ~).
    pub fn working_dir(&self) -> PathBuf {
        match self.working_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// What a live run does when a pass fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Keep going; stop only after too many consecutive failures.
    #[default]
    Skip,
    /// Stop on the first failed pass.
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_passes")]
    pub max_passes: u64,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_interval_ms() -> u64 {
    5000
}
fn default_max_passes() -> u64 {
    1000
}
fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_passes: default_max_passes(),
            error_policy: ErrorPolicy::default(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl LiveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// USD per million prompt tokens.
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    /// USD per million completion tokens.
    #[serde(default)]
    pub output_cost_per_mtok: f64,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_backend_timeout_secs() -> u64 {
    120
}

/// Tool-serving sidecar reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServiceConfig {
    pub endpoint: String,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
}

/// Directory holding `<workflow id>.json` graphs for subworkflow nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLibraryConfig {
    pub dir: String,
}

impl WorkflowLibraryConfig {
    pub fn dir(&self) -> PathBuf {
        expand_home(&self.dir)
    }
}

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Reject values that parse but cannot run.
    pub fn check(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(WeftError::Config(
                "engine.max_concurrency must be at least 1".into(),
            ));
        }
        if self.engine.item_concurrency == 0 {
            return Err(WeftError::Config(
                "engine.item_concurrency must be at least 1".into(),
            ));
        }
        if self.engine.max_loop_iterations == 0 {
            return Err(WeftError::Config(
                "engine.max_loop_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
