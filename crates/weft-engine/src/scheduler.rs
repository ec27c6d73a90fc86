//! Ready-queue scheduler for one plan.
//!
//! The scheduler owns the run's `RunContext` exclusively. Executors run as
//! tasks on a `JoinSet` and hand their result back through the join; nothing
//! else writes node state. Approval gates park as watcher futures that hold
//! no concurrency slot.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use weft_core::approval::{ApprovalOutcome, ApprovalRequest};
use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::types::{
    ApprovalGate, NodeContext, NodeInput, NodeOutput, NodeStatus, Services, SkipReason,
};

use crate::approval::ApprovalBroker;
use crate::construct::{self, ConstructOutcome};
use crate::context::RunContext;
use crate::plan::ExecutionPlan;
use crate::resolve::{resolve_edges, Produced};

/// Engine-wide collaborators shared by every scheduler.
pub(crate) struct Runtime {
    pub config: EngineConfig,
    pub services: Services,
    pub bus: Arc<EventBus>,
    pub approvals: Arc<ApprovalBroker>,
}

/// Run `plan` to completion against `ctx` and hand the context back.
pub(crate) fn drive(
    rt: Arc<Runtime>,
    plan: Arc<ExecutionPlan>,
    ctx: RunContext,
) -> BoxFuture<'static, RunContext> {
    Box::pin(async move { Scheduler::new(rt, plan, ctx).run().await })
}

enum Outcome {
    Node(Result<NodeOutput>),
    Construct(Result<ConstructOutcome>),
}

struct Finished {
    idx: usize,
    outcome: Outcome,
}

struct Resolved {
    idx: usize,
    outcome: ApprovalOutcome,
}

struct Parked {
    request_id: String,
    pending: Value,
}

struct Scheduler {
    rt: Arc<Runtime>,
    plan: Arc<ExecutionPlan>,
    ctx: RunContext,
    ready: VecDeque<(usize, NodeInput)>,
    queued: Vec<bool>,
    tasks: JoinSet<Finished>,
    watchers: FuturesUnordered<BoxFuture<'static, Resolved>>,
    parked: HashMap<usize, Parked>,
    dispatched: HashMap<usize, Instant>,
    cancelled: bool,
}

impl Scheduler {
    fn new(rt: Arc<Runtime>, plan: Arc<ExecutionPlan>, ctx: RunContext) -> Self {
        let n = plan.nodes.len();
        let mut scheduler = Self {
            rt,
            plan,
            ctx,
            ready: VecDeque::new(),
            queued: vec![false; n],
            tasks: JoinSet::new(),
            watchers: FuturesUnordered::new(),
            parked: HashMap::new(),
            dispatched: HashMap::new(),
            cancelled: false,
        };
        scheduler.seed_ready();
        scheduler
    }

    /// Roots in declaration order, then whatever the seeds unlock.
    fn seed_ready(&mut self) {
        let plan = self.plan.clone();
        for (idx, node) in plan.nodes.iter().enumerate() {
            let root = node.producers.is_empty() && node.owner.is_none();
            if root && !plan.seeds.contains(&idx) && !self.ctx.is_terminal(idx) {
                self.enqueue(idx, NodeInput::new());
            }
        }
        for &seed in &plan.seeds {
            self.release(seed);
        }
    }

    async fn run(mut self) -> RunContext {
        let cancel = self.ctx.cancel.clone();
        loop {
            if !self.cancelled && cancel.is_cancelled() {
                self.on_cancel().await;
            }
            self.fill();
            if self.tasks.is_empty() && self.watchers.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match joined {
                        Ok(finished) => self.on_finished(finished).await,
                        Err(e) => error!(run_id = %self.ctx.run_id, error = %e, "Node task aborted"),
                    }
                }
                Some(resolved) = self.watchers.next(), if !self.watchers.is_empty() => {
                    self.on_resolved(resolved).await;
                }
                _ = cancel.cancelled(), if !self.cancelled => {
                    self.on_cancel().await;
                }
            }
        }
        self.settle_leftovers();
        self.ctx
    }

    /// Dispatch queued nodes while slots remain.
    fn fill(&mut self) {
        let limit = self.rt.config.max_concurrency.max(1);
        while self.tasks.len() < limit {
            let Some((idx, input)) = self.ready.pop_front() else {
                break;
            };
            self.queued[idx] = false;
            self.dispatch(idx, input);
        }
    }

    fn enqueue(&mut self, idx: usize, input: NodeInput) {
        if !self.queued[idx] {
            self.queued[idx] = true;
            self.ready.push_back((idx, input));
        }
    }

    fn node_context(&self, idx: usize) -> NodeContext {
        let node = &self.plan.nodes[idx];
        NodeContext {
            run_id: self.ctx.run_id.clone(),
            node_id: node.id.clone(),
            config: node.config.clone(),
            variables: self.ctx.variables.clone(),
            outputs: self.ctx.snapshot(),
            call_chain: self.ctx.call_chain.clone(),
            services: self.rt.services.clone(),
            cancel: self.ctx.cancel.clone(),
        }
    }

    fn dispatch(&mut self, idx: usize, input: NodeInput) {
        let node_ctx = self.node_context(idx);
        let node = &self.plan.nodes[idx];
        debug!(
            run_id = %self.ctx.run_id,
            node_id = %node.id,
            node_type = %node.kind,
            running = self.tasks.len() + 1,
            "Dispatching node"
        );
        self.dispatched.insert(idx, Instant::now());
        self.ctx.mark(idx, NodeStatus::Running);

        let node_id = node.id.clone();
        if self.plan.constructs.contains_key(&idx) {
            let work = construct::run(self.rt.clone(), self.plan.clone(), idx, input, node_ctx);
            self.tasks.spawn(async move {
                let outcome = AssertUnwindSafe(work)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_error(&node_id, panic)));
                Finished {
                    idx,
                    outcome: Outcome::Construct(outcome),
                }
            });
        } else {
            let executor = node.executor.clone();
            self.tasks.spawn(async move {
                let outcome = AssertUnwindSafe(async { executor.execute(input, node_ctx).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_error(&node_id, panic)));
                Finished {
                    idx,
                    outcome: Outcome::Node(outcome),
                }
            });
        }
    }

    fn elapsed_ms(&self, idx: usize) -> u64 {
        self.dispatched
            .get(&idx)
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    async fn on_finished(&mut self, finished: Finished) {
        let idx = finished.idx;
        let elapsed = self.elapsed_ms(idx);

        if self.cancelled {
            debug!(
                run_id = %self.ctx.run_id,
                node_id = %self.ctx.node_id(idx),
                "Discarding result of cancelled run"
            );
            self.ctx.states[idx].duration_ms = elapsed;
            self.skip_node(idx, SkipReason::Cancelled);
            return;
        }

        match finished.outcome {
            Outcome::Node(Ok(output)) => self.on_output(idx, output, elapsed).await,
            Outcome::Node(Err(e)) => {
                warn!(
                    run_id = %self.ctx.run_id,
                    node_id = %self.ctx.node_id(idx),
                    elapsed_ms = elapsed,
                    error = %e,
                    "Node failed"
                );
                self.ctx.fail(idx, e.to_string(), elapsed);
                self.release(idx);
            }
            Outcome::Construct(result) => self.apply_construct(idx, result, elapsed),
        }
    }

    async fn on_output(&mut self, idx: usize, output: NodeOutput, elapsed: u64) {
        self.ctx.charge(idx, output.usage);
        if let Some(gate) = output.gate {
            self.park(idx, gate, elapsed).await;
            return;
        }
        info!(
            run_id = %self.ctx.run_id,
            node_id = %self.ctx.node_id(idx),
            node_type = %self.plan.nodes[idx].kind,
            elapsed_ms = elapsed,
            tokens = output.usage.tokens,
            "Node completed"
        );
        let produced = Produced {
            value: output.value,
            handles: output.handles,
        };
        self.ctx.complete(idx, produced, elapsed);
        self.release(idx);
    }

    /// Suspend a node behind an approval request.
    async fn park(&mut self, idx: usize, gate: ApprovalGate, elapsed: u64) {
        let wait = gate.timeout.unwrap_or(self.rt.services.approval_timeout);
        let now = Utc::now();
        let deadline = chrono::Duration::from_std(wait)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            run_id: self.ctx.run_id.clone(),
            node_id: self.ctx.node_id(idx).to_string(),
            message: gate.message,
            preview: gate.preview,
            deadline,
            created_at: now,
        };
        info!(
            run_id = %self.ctx.run_id,
            node_id = %request.node_id,
            request_id = %request.id,
            timeout_secs = wait.as_secs(),
            "Awaiting approval"
        );

        self.ctx.states[idx].duration_ms = elapsed;
        self.ctx.mark(idx, NodeStatus::Waiting);
        self.parked.insert(
            idx,
            Parked {
                request_id: request.id.clone(),
                pending: gate.pending,
            },
        );

        let approvals = self.rt.approvals.clone();
        let request_id = request.id.clone();
        let rx = approvals.request(request).await;
        self.watchers.push(Box::pin(async move {
            let outcome = approvals.await_decision(&request_id, rx, wait).await;
            Resolved { idx, outcome }
        }));
    }

    async fn on_resolved(&mut self, resolved: Resolved) {
        let idx = resolved.idx;
        let Some(parked) = self.parked.remove(&idx) else {
            return;
        };
        let node_id = self.ctx.node_id(idx).to_string();
        let elapsed = self.elapsed_ms(idx);
        info!(
            run_id = %self.ctx.run_id,
            node_id = %node_id,
            request_id = %parked.request_id,
            outcome = ?resolved.outcome,
            "Approval resolved"
        );

        match resolved.outcome {
            ApprovalOutcome::Approved => {
                self.ctx.complete(idx, Produced::all(parked.pending), elapsed);
            }
            ApprovalOutcome::Denied { reason } => {
                let err = WeftError::ApprovalDenied { node_id, reason };
                self.ctx.fail(idx, err.to_string(), elapsed);
            }
            ApprovalOutcome::TimedOut => {
                let err = WeftError::ApprovalTimedOut { node_id };
                self.ctx.fail(idx, err.to_string(), elapsed);
            }
            ApprovalOutcome::Withdrawn => {
                self.ctx.skip(idx, SkipReason::Cancelled);
            }
        }
        self.release(idx);
    }

    /// Stop dispatching: withdraw approvals and skip everything queued.
    async fn on_cancel(&mut self) {
        self.cancelled = true;
        info!(
            run_id = %self.ctx.run_id,
            in_flight = self.tasks.len(),
            "Run cancelled, draining in-flight nodes"
        );
        self.watchers.clear();

        let mut parked: Vec<(usize, Parked)> = self.parked.drain().collect();
        parked.sort_by_key(|(idx, _)| *idx);
        for (idx, p) in parked {
            self.rt
                .approvals
                .close(&p.request_id, ApprovalOutcome::Withdrawn)
                .await;
            self.skip_node(idx, SkipReason::Cancelled);
        }

        let queued: Vec<usize> = self.ready.drain(..).map(|(idx, _)| idx).collect();
        for idx in queued {
            self.queued[idx] = false;
            self.skip_node(idx, SkipReason::Cancelled);
        }
    }

    fn apply_construct(&mut self, idx: usize, result: Result<ConstructOutcome>, elapsed: u64) {
        let plan = self.plan.clone();
        let Some(construct) = plan.constructs.get(&idx) else {
            return;
        };
        let end = construct.end;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(run_id = %self.ctx.run_id, node_id = %self.ctx.node_id(idx), error = %e, "Construct failed");
                self.ctx.fail(idx, e.to_string(), elapsed);
                self.skip_owned(idx, SkipReason::UpstreamFailed);
                self.release(end);
                return;
            }
        };

        for (region_idx, state) in outcome.region {
            self.ctx.replace_state(region_idx, state);
        }
        self.ctx.usage.add(outcome.body_usage);
        self.ctx.iterations.extend(outcome.reports);
        self.ctx.charge(idx, outcome.start_usage);

        let started = match outcome.start {
            Ok(value) => {
                info!(
                    run_id = %self.ctx.run_id,
                    node_id = %self.ctx.node_id(idx),
                    elapsed_ms = elapsed,
                    "Construct completed"
                );
                self.ctx.complete(idx, Produced::all(value), elapsed);
                true
            }
            Err(e) => {
                warn!(run_id = %self.ctx.run_id, node_id = %self.ctx.node_id(idx), error = %e, "Construct failed");
                self.ctx.fail(idx, e.to_string(), elapsed);
                false
            }
        };

        match outcome.end {
            Some(value) if started => self.ctx.complete(end, Produced::all(value), elapsed),
            _ if started => self.ctx.skip(end, SkipReason::BranchNotTaken),
            _ => self.ctx.skip(end, SkipReason::UpstreamFailed),
        }
        self.release(end);
    }

    /// Skip a node (and, for a construct start, everything it owns) and
    /// propagate to its dependents.
    fn skip_node(&mut self, idx: usize, reason: SkipReason) {
        if !self.ctx.is_terminal(idx) {
            self.ctx.skip(idx, reason);
        }
        if let Some(end) = self.plan.constructs.get(&idx).map(|c| c.end) {
            self.skip_owned(idx, reason);
            self.release(end);
        }
        self.release(idx);
    }

    fn skip_owned(&mut self, start: usize, reason: SkipReason) {
        let owned: Vec<usize> = (0..self.plan.nodes.len())
            .filter(|&i| self.plan.nodes[i].owner == Some(start) && !self.ctx.is_terminal(i))
            .collect();
        for i in owned {
            self.ctx.skip(i, reason);
        }
    }

    /// Re-evaluate everything downstream of a node that just became terminal.
    fn release(&mut self, from: usize) {
        let plan = self.plan.clone();
        let mut work = VecDeque::from([from]);
        while let Some(done) = work.pop_front() {
            for &dep in &plan.nodes[done].dependents {
                let idle = self.ctx.states[dep].status == NodeStatus::Idle;
                let blocked = plan.nodes[dep]
                    .producers
                    .iter()
                    .any(|&p| !self.ctx.is_terminal(p));
                if !idle || self.queued[dep] || blocked {
                    continue;
                }
                match self.evaluate(dep) {
                    Ok(input) => self.enqueue(dep, input),
                    Err(reason) => {
                        debug!(
                            run_id = %self.ctx.run_id,
                            node_id = %plan.nodes[dep].id,
                            reason = ?reason,
                            "Skipping node"
                        );
                        self.ctx.skip(dep, reason);
                        if let Some(end) = plan.constructs.get(&dep).map(|c| c.end) {
                            self.skip_owned(dep, reason);
                            work.push_back(end);
                        }
                        work.push_back(dep);
                    }
                }
            }
        }
    }

    /// Resolve a ready node's inputs, or say why it cannot run.
    fn evaluate(&self, idx: usize) -> std::result::Result<NodeInput, SkipReason> {
        if self.cancelled || self.ctx.cancel.is_cancelled() {
            return Err(SkipReason::Cancelled);
        }
        let node = &self.plan.nodes[idx];
        let input = resolve_edges(&node.incoming, &self.ctx.produced);
        let missing_required = node
            .executor
            .required_inputs()
            .iter()
            .any(|h| input.get(h).is_none());
        if node.incoming.is_empty() || (!input.is_empty() && !missing_required) {
            return Ok(input);
        }
        let upstream_failed = node.producers.iter().any(|&p| {
            let state = &self.ctx.states[p];
            state.status == NodeStatus::Error
                || state.skip_reason == Some(SkipReason::UpstreamFailed)
        });
        Err(if upstream_failed {
            SkipReason::UpstreamFailed
        } else {
            SkipReason::BranchNotTaken
        })
    }

    /// Give every non-terminal node a terminal status.
    fn settle_leftovers(&mut self) {
        let reason = if self.cancelled {
            SkipReason::Cancelled
        } else {
            SkipReason::BranchNotTaken
        };
        for idx in 0..self.plan.nodes.len() {
            match self.ctx.states[idx].status {
                NodeStatus::Running => {
                    let elapsed = self.elapsed_ms(idx);
                    self.ctx.fail(idx, "node result was lost".to_string(), elapsed);
                }
                NodeStatus::Idle | NodeStatus::Waiting => {
                    if !self.cancelled {
                        warn!(
                            run_id = %self.ctx.run_id,
                            node_id = %self.ctx.node_id(idx),
                            "Node never became ready"
                        );
                    }
                    self.ctx.skip(idx, reason);
                }
                _ => {}
            }
        }
    }
}

fn panic_error(node_id: &str, panic: Box<dyn std::any::Any + Send>) -> WeftError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    WeftError::node(node_id, format!("executor panicked: {message}"))
}
