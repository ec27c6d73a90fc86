//! Mocks and executors shared by the weft crates' tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{ModelBackend, NodeExecutor, ToolBackend};
use weft_core::types::{ModelRequest, ModelResponse, NodeContext, NodeInput, NodeOutput};

// ── Backends ────────────────────────────────────────────────────

/// Model backend that replays canned responses in a cycle.
pub struct MockModel {
    responses: Vec<String>,
    next: AtomicUsize,
    tokens: u64,
    cost_usd: f64,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockModel {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: responses.into_iter().map(str::to_string).collect(),
            next: AtomicUsize::new(0),
            tokens: 0,
            cost_usd: 0.0,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Report `tokens` (all as input tokens) and `cost_usd` on every call.
    pub fn with_usage(mut self, tokens: u64, cost_usd: f64) -> Self {
        self.tokens = tokens;
        self.cost_usd = cost_usd;
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ModelBackend for MockModel {
    fn complete(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        Box::pin(async move {
            let content = if self.responses.is_empty() {
                request.prompt.clone()
            } else {
                let i = self.next.fetch_add(1, Ordering::SeqCst) % self.responses.len();
                self.responses[i].clone()
            };
            let model = request.model.clone().unwrap_or_else(|| "mock".to_string());
            if let Ok(mut seen) = self.requests.lock() {
                seen.push(request);
            }
            Ok(ModelResponse {
                content,
                model,
                input_tokens: self.tokens,
                output_tokens: 0,
                cost_usd: self.cost_usd,
            })
        })
    }
}

/// Tool backend with fixed per-tool results. Unknown tools echo their input.
pub struct MockTools {
    results: HashMap<String, Value>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockTools {
    pub fn new() -> Self {
        Self {
            results: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_result(mut self, tool: &str, result: Value) -> Self {
        self.results.insert(tool.to_string(), result);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Default for MockTools {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolBackend for MockTools {
    fn call(&self, tool: String, input: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let result = self.results.get(&tool).cloned().unwrap_or_else(|| input.clone());
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((tool, input));
            }
            Ok(result)
        })
    }
}

// ── Executors ───────────────────────────────────────────────────

type Handler = dyn Fn(&NodeInput, &NodeContext) -> Result<NodeOutput> + Send + Sync;

/// Executor built from a synchronous closure, with an optional delay.
pub struct FnExecutor {
    node_type: String,
    required: Vec<String>,
    delay: Option<Duration>,
    handler: Arc<Handler>,
}

impl FnExecutor {
    pub fn new<F>(node_type: &str, handler: F) -> Self
    where
        F: Fn(&NodeInput, &NodeContext) -> Result<NodeOutput> + Send + Sync + 'static,
    {
        Self {
            node_type: node_type.to_string(),
            required: Vec::new(),
            delay: None,
            handler: Arc::new(handler),
        }
    }

    /// Executor that returns its combined input unchanged.
    pub fn passthrough(node_type: &str) -> Self {
        Self::new(node_type, |input, _| {
            Ok(NodeOutput::value(input.value().unwrap_or(Value::Null)))
        })
    }

    /// Executor that always fails with `message`.
    pub fn failing(node_type: &str, message: &str) -> Self {
        let message = message.to_string();
        Self::new(node_type, move |_, ctx| Err(ctx.fail(message.clone())))
    }

    pub fn with_required(mut self, handles: &[&str]) -> Self {
        self.required = handles.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl NodeExecutor for FnExecutor {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn required_inputs(&self) -> Vec<String> {
        self.required.clone()
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.handler)(&input, &ctx)
        })
    }
}

/// Counts calls and records the peak number running at once.
///
/// Each call sleeps for `delay` (or until the run is cancelled) and then
/// returns its input, or the node id when it has none.
pub struct ProbeExecutor {
    node_type: String,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<String>>>,
}

impl ProbeExecutor {
    pub fn new(node_type: &str, delay: Duration) -> Self {
        Self {
            node_type: node_type.to_string(),
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared counters, readable after the executor moved into a registry.
    pub fn stats(&self) -> ProbeStats {
        ProbeStats {
            calls: self.calls.clone(),
            peak: self.peak.clone(),
            started: self.started.clone(),
        }
    }
}

/// Handle onto a [`ProbeExecutor`]'s counters.
#[derive(Clone)]
pub struct ProbeStats {
    calls: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<String>>>,
}

impl ProbeStats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Node ids in the order their executions started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl NodeExecutor for ProbeExecutor {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut started) = self.started.lock() {
                started.push(ctx.node_id.clone());
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let cancelled = tokio::select! {
                _ = tokio::time::sleep(self.delay) => false,
                _ = ctx.cancel.cancelled() => true,
            };
            self.running.fetch_sub(1, Ordering::SeqCst);

            if cancelled {
                return Err(WeftError::Cancelled);
            }
            Ok(NodeOutput::value(
                input.value().unwrap_or_else(|| Value::String(ctx.node_id.clone())),
            ))
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// Temporary directory pre-populated with `(relative path, contents)` files.
pub fn temp_dir_with(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("create temp dir");
    for (name, contents) in files {
        write_file(dir.path(), name, contents);
    }
    dir
}

fn write_file(root: &Path, name: &str, contents: &str) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create fixture dirs");
    }
    std::fs::write(path, contents).expect("write fixture file");
}
