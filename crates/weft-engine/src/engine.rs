use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::approval::{ApprovalDecision, ApprovalRequest};
use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::{ModelBackend, ToolBackend, WorkflowRunner};
use weft_core::types::{RunEvent, RunId, RunResult, Services};
use weft_nodes::ExecutorRegistry;

use crate::approval::ApprovalBroker;
use crate::context::RunContext;
use crate::graph::Graph;
use crate::plan::ExecutionPlan;
use crate::scheduler::{drive, Runtime};
use crate::subworkflow::{EngineWorkflowRunner, GraphSource};
use crate::validate::{self, ValidationReport};

/// Entry point for validating, running, and cancelling workflows.
///
/// Cheap to clone; clones share the registry, event bus, and approval broker.
/// Every run gets its own execution context, so concurrent runs never share
/// mutable state.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub runtime: Arc<Runtime>,
    pub registry: ExecutorRegistry,
    pub runs: Mutex<HashMap<RunId, CancellationToken>>,
    /// Workflow ids with an active live run.
    pub live: Mutex<std::collections::HashSet<String>>,
}

/// Configures and builds an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<ExecutorRegistry>,
    model: Option<Arc<dyn ModelBackend>>,
    tools: Option<Arc<dyn ToolBackend>>,
    graph_source: Option<Arc<dyn GraphSource>>,
    workflow_runner: Option<Arc<dyn WorkflowRunner>>,
    working_dir: Option<PathBuf>,
}

impl EngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the built-in registry.
    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_model(mut self, model: Arc<dyn ModelBackend>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolBackend>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Where `subworkflow` nodes load graphs from.
    pub fn with_graph_source(mut self, source: Arc<dyn GraphSource>) -> Self {
        self.graph_source = Some(source);
        self
    }

    /// Hand `subworkflow` nodes to a host runner instead of this engine.
    pub fn with_workflow_runner(mut self, runner: Arc<dyn WorkflowRunner>) -> Self {
        self.workflow_runner = Some(runner);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Engine {
        let Self {
            config,
            registry,
            model,
            tools,
            graph_source,
            workflow_runner,
            working_dir,
        } = self;

        let inner = Arc::new_cyclic(|weak| {
            let workflows = workflow_runner.or_else(|| {
                graph_source.map(|source| {
                    Arc::new(EngineWorkflowRunner {
                        engine: weak.clone(),
                        source,
                    }) as Arc<dyn WorkflowRunner>
                })
            });
            let services = Services {
                model,
                tools,
                workflows,
                working_dir: working_dir.unwrap_or_else(|| config.working_dir()),
                approval_timeout: config.approval_timeout(),
                preview_chars: config.preview_chars,
            };
            let bus = Arc::new(EventBus::new(config.event_capacity));
            let approvals = Arc::new(ApprovalBroker::new(bus.clone()));
            EngineInner {
                runtime: Arc::new(Runtime {
                    config,
                    services,
                    bus,
                    approvals,
                }),
                registry: registry.unwrap_or_else(ExecutorRegistry::with_builtins),
                runs: Mutex::new(HashMap::new()),
                live: Mutex::new(Default::default()),
            }
        });
        Engine { inner }
    }
}

/// A run started in the background.
pub struct RunHandle {
    run_id: RunId,
    cancel: CancellationToken,
    join: JoinHandle<RunResult>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Request graceful cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish.
    pub async fn join(self) -> Result<RunResult> {
        self.join
            .await
            .map_err(|e| WeftError::Backend(format!("run task failed: {e}")))
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            registry: None,
            model: None,
            tools: None,
            graph_source: None,
            workflow_runner: None,
            working_dir: None,
        }
    }

    /// Engine with built-in executors, default config, and no backends.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.runtime.config
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.inner.registry
    }

    /// Every validation finding, without building a plan.
    pub fn check(&self, graph: &Graph) -> ValidationReport {
        validate::check(graph, &self.inner.registry, self.config().max_loop_iterations)
    }

    /// Validate `graph` and build its execution plan.
    pub fn validate(&self, graph: &Graph) -> Result<ExecutionPlan> {
        ExecutionPlan::build(graph, &self.inner.registry, self.config().max_loop_iterations)
    }

    /// Run `graph` to completion.
    pub async fn run(&self, graph: &Graph, inputs: HashMap<String, Value>) -> Result<RunResult> {
        self.start(graph, inputs)?.join().await
    }

    /// Validate and start `graph` in the background.
    pub fn start(&self, graph: &Graph, inputs: HashMap<String, Value>) -> Result<RunHandle> {
        let plan = Arc::new(self.validate(graph)?);
        let variables = graph.resolve_variables(&inputs)?;
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let chain = Arc::new(vec![graph.id.clone()]);
        // Registered before spawning so `cancel(run_id)` works as soon as the id is returned
        let registration = RunRegistration::new(&self.inner, run_id.clone(), cancel.clone());

        let join = tokio::spawn({
            let run_id = run_id.clone();
            let cancel = cancel.clone();
            async move {
                let _registration = registration;
                inner.execute(plan, variables, run_id, cancel, chain).await
            }
        });
        Ok(RunHandle {
            run_id,
            cancel,
            join,
        })
    }

    /// Cancel a run started by this engine. Returns false for unknown ids.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        let token = self
            .inner
            .runs
            .lock()
            .ok()
            .and_then(|runs| runs.get(run_id).cloned());
        match token {
            Some(token) => {
                info!(run_id = %run_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of runs currently in flight.
    pub fn active_runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self
            .inner
            .runs
            .lock()
            .map(|runs| runs.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Deliver a decision for a pending approval. Returns false when the
    /// request is unknown or already resolved.
    pub async fn resolve_approval(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        self.inner.runtime.approvals.respond(request_id, decision).await
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.inner.runtime.approvals.pending_requests().await
    }

    /// Resolve a request id from a unique prefix.
    pub async fn find_approval(&self, prefix: &str) -> Option<String> {
        self.inner.runtime.approvals.find_by_prefix(prefix).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.runtime.bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.runtime.bus
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineInner {
    /// Run a validated plan under `run_id`. Callers that want the run
    /// cancellable by id hold a [`RunRegistration`] for its duration.
    pub(crate) async fn execute(
        &self,
        plan: Arc<ExecutionPlan>,
        variables: HashMap<String, Value>,
        run_id: RunId,
        cancel: CancellationToken,
        call_chain: Arc<Vec<String>>,
    ) -> RunResult {
        let rt = &self.runtime;

        info!(run_id = %run_id, workflow_id = %plan.graph_id(), nodes = plan.nodes.len(), "Run started");
        rt.bus.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            workflow_id: plan.graph_id().to_string(),
            timestamp: Utc::now(),
        });

        let ctx = RunContext::new(&plan, run_id, variables, cancel, rt.bus.clone())
            .with_call_chain(call_chain);
        let ctx = drive(rt.clone(), plan.clone(), ctx).await;
        let result = ctx.into_result(&plan);

        info!(
            run_id = %result.run_id,
            status = %result.status,
            elapsed_ms = result.duration_ms,
            total_tokens = result.total_tokens,
            "Run finished"
        );
        rt.bus.publish(RunEvent::RunFinished {
            run_id: result.run_id.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
            total_tokens: result.total_tokens,
            total_cost_usd: result.total_cost_usd,
        });
        result
    }

    /// Run `graph` as a subworkflow with `{ input }` as its variables.
    /// The nested run is cancelled along with `parent`.
    pub(crate) async fn run_nested(
        self: &Arc<Self>,
        graph: &Graph,
        input: Value,
        call_chain: Vec<String>,
        parent: &CancellationToken,
    ) -> Result<RunResult> {
        let plan = Arc::new(ExecutionPlan::build(
            graph,
            &self.registry,
            self.runtime.config.max_loop_iterations,
        )?);
        let mut inputs = HashMap::new();
        inputs.insert("input".to_string(), input);
        let variables = graph.resolve_variables(&inputs)?;

        let mut chain = call_chain;
        chain.push(graph.id.clone());
        let run_id = RunId::new();
        let cancel = parent.child_token();
        let _registration = RunRegistration::new(self, run_id.clone(), cancel.clone());
        Ok(self
            .execute(plan, variables, run_id, cancel, Arc::new(chain))
            .await)
    }
}

/// Keeps a run's cancel token reachable from `Engine::cancel` until dropped.
pub(crate) struct RunRegistration {
    inner: Arc<EngineInner>,
    run_id: RunId,
}

impl RunRegistration {
    pub(crate) fn new(
        inner: &Arc<EngineInner>,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Self {
        match inner.runs.lock() {
            Ok(mut runs) => {
                runs.insert(run_id.clone(), cancel);
            }
            Err(_) => warn!(run_id = %run_id, "Run registry poisoned; run cannot be cancelled by id"),
        }
        Self {
            inner: inner.clone(),
            run_id,
        }
    }
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        if let Ok(mut runs) = self.inner.runs.lock() {
            runs.remove(&self.run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use serde_json::json;
    use weft_core::types::RunStatus;

    #[tokio::test]
    async fn run_input_to_output() {
        let engine = Engine::new();
        let graph = Graph::new("wf")
            .with_node(Node::new("in", "input"))
            .with_node(Node::new("out", "output"))
            .connect("in", "out");
        let mut inputs = HashMap::new();
        inputs.insert("in".to_string(), json!("hello"));
        let result = engine.run(&graph, inputs).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.outputs["out"], json!("hello"));
        assert!(engine.active_runs().is_empty());
    }

    #[tokio::test]
    async fn invalid_graph_never_starts() {
        let engine = Engine::new();
        let err = engine.run(&Graph::new("empty"), HashMap::new()).await.unwrap_err();
        assert!(matches!(err, WeftError::Validation(_)));
    }

    #[tokio::test]
    async fn run_is_cancellable_by_id_as_soon_as_it_starts() {
        let engine = Engine::new();
        let graph = Graph::new("gated")
            .with_node(Node::new("in", "input"))
            .with_node(Node::new("review", "approval"))
            .connect("in", "review");
        let mut inputs = HashMap::new();
        inputs.insert("in".to_string(), json!("x"));

        let handle = engine.start(&graph, inputs).unwrap();
        assert_eq!(engine.active_runs(), vec![handle.run_id().clone()]);
        assert!(engine.cancel(handle.run_id()));

        let result = handle.join().await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(engine.active_runs().is_empty());
    }

    #[test]
    fn cancel_unknown_run_is_false() {
        assert!(!Engine::new().cancel(&RunId::from_str("nope")));
    }
}
