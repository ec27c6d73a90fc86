//! Per-run execution state, owned by exactly one scheduler.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use weft_core::event::EventBus;
use weft_core::types::{
    ItemReport, NodeState, NodeStatus, RunEvent, RunId, RunResult, RunStatus, SkipReason, Usage,
};

use crate::graph::NodeKind;
use crate::plan::ExecutionPlan;
use crate::resolve::Produced;

/// Output map, state table and accumulators of one run.
///
/// Only the scheduler mutates it; executors see snapshots through
/// `NodeContext`.
pub(crate) struct RunContext {
    pub run_id: RunId,
    pub states: Vec<NodeState>,
    pub produced: Vec<Option<Produced>>,
    pub usage: Usage,
    pub variables: Arc<HashMap<String, Value>>,
    /// Outputs visible from an enclosing run (construct bodies only).
    pub inherited: Arc<HashMap<String, Value>>,
    pub call_chain: Arc<Vec<String>>,
    pub cancel: CancellationToken,
    pub iterations: BTreeMap<String, Vec<ItemReport>>,
    pub started: Instant,
    ids: Vec<String>,
    bus: Arc<EventBus>,
}

impl RunContext {
    pub fn new(
        plan: &ExecutionPlan,
        run_id: RunId,
        variables: HashMap<String, Value>,
        cancel: CancellationToken,
        bus: Arc<EventBus>,
    ) -> Self {
        let n = plan.nodes.len();
        Self {
            run_id,
            states: vec![NodeState::default(); n],
            produced: vec![None; n],
            usage: Usage::default(),
            variables: Arc::new(variables),
            inherited: Arc::new(HashMap::new()),
            call_chain: Arc::new(vec![plan.graph_id.clone()]),
            cancel,
            iterations: BTreeMap::new(),
            started: Instant::now(),
            ids: plan.nodes.iter().map(|n| n.id.clone()).collect(),
            bus,
        }
    }

    pub fn with_inherited(mut self, outputs: Arc<HashMap<String, Value>>) -> Self {
        self.inherited = outputs;
        self
    }

    pub fn with_call_chain(mut self, chain: Arc<Vec<String>>) -> Self {
        self.call_chain = chain;
        self
    }

    pub fn node_id(&self, idx: usize) -> &str {
        &self.ids[idx]
    }

    pub fn is_terminal(&self, idx: usize) -> bool {
        self.states[idx].status.is_terminal()
    }

    /// Pre-complete a node without running it.
    pub fn seed(&mut self, idx: usize, value: Value) {
        self.produced[idx] = Some(Produced::all(value.clone()));
        self.states[idx].output = Some(value);
        self.mark(idx, NodeStatus::Completed);
    }

    /// Set a status and publish the transition.
    pub fn mark(&mut self, idx: usize, status: NodeStatus) {
        self.states[idx].status = status;
        self.bus.publish(RunEvent::NodeStatusChanged {
            run_id: self.run_id.clone(),
            node_id: self.ids[idx].clone(),
            status,
            timestamp: Utc::now(),
        });
    }

    /// Record usage on a node and on the run totals.
    pub fn charge(&mut self, idx: usize, usage: Usage) {
        let state = &mut self.states[idx];
        state.tokens += usage.tokens;
        state.cost_usd += usage.cost_usd.max(0.0);
        self.usage.add(usage);
    }

    pub fn complete(&mut self, idx: usize, produced: Produced, duration_ms: u64) {
        self.states[idx].output = Some(produced.value.clone());
        self.states[idx].duration_ms = duration_ms;
        self.produced[idx] = Some(produced);
        self.mark(idx, NodeStatus::Completed);
    }

    pub fn fail(&mut self, idx: usize, message: String, duration_ms: u64) {
        self.states[idx].error = Some(message);
        self.states[idx].duration_ms = duration_ms;
        self.mark(idx, NodeStatus::Error);
    }

    pub fn skip(&mut self, idx: usize, reason: SkipReason) {
        self.states[idx].skip_reason = Some(reason);
        self.mark(idx, NodeStatus::Skipped);
    }

    /// Overwrite a state computed elsewhere (construct region summaries).
    pub fn replace_state(&mut self, idx: usize, state: NodeState) {
        let status = state.status;
        if status == NodeStatus::Completed {
            self.produced[idx] = state.output.clone().map(Produced::all);
        }
        self.states[idx] = state;
        self.mark(idx, status);
    }

    /// Outputs completed so far, including inherited ones.
    pub fn snapshot(&self) -> Arc<HashMap<String, Value>> {
        let mut outputs = self.inherited.as_ref().clone();
        for (idx, produced) in self.produced.iter().enumerate() {
            if let Some(p) = produced {
                outputs.insert(self.ids[idx].clone(), p.value.clone());
            }
        }
        Arc::new(outputs)
    }

    pub fn status(&self, plan: &ExecutionPlan) -> RunStatus {
        let cancelled = self
            .states
            .iter()
            .any(|s| s.skip_reason == Some(SkipReason::Cancelled));
        if cancelled {
            return RunStatus::Cancelled;
        }
        let sink_failed = plan.sinks.iter().any(|&i| {
            let state = &self.states[i];
            state.status == NodeStatus::Error
                || state.skip_reason == Some(SkipReason::UpstreamFailed)
        });
        if sink_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn states_by_id(&self) -> BTreeMap<String, NodeState> {
        self.ids
            .iter()
            .cloned()
            .zip(self.states.iter().cloned())
            .collect()
    }

    pub fn into_result(self, plan: &ExecutionPlan) -> RunResult {
        let status = self.status(plan);
        let outputs = plan
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == NodeKind::Output)
            .filter_map(|(i, n)| Some((n.id.clone(), self.states[i].output.clone()?)))
            .collect();
        RunResult {
            run_id: self.run_id.clone(),
            status,
            duration_ms: self.elapsed_ms(),
            node_states: self.states_by_id(),
            outputs,
            iterations: self.iterations,
            total_tokens: self.usage.tokens,
            total_cost_usd: self.usage.cost_usd,
        }
    }
}
