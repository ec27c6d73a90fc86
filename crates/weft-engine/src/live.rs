//! Live runs: one workflow executed pass after pass until stopped.
//!
//! Passes never overlap. Each gets a fresh, unpersisted context and reports
//! a compact `LivePassCompleted` event instead of its full payload history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use weft_core::config::{ErrorPolicy, LiveConfig};
use weft_core::error::{Result, WeftError};
use weft_core::types::{LiveStopReason, RunEvent, RunId, RunResult, RunStatus};
use weft_nodes::template::{primary_text, truncate};

use crate::engine::{Engine, EngineInner, RunRegistration};
use crate::graph::Graph;
use crate::plan::ExecutionPlan;

/// Longest `output_summary` carried by a pass event.
const SUMMARY_CHARS: usize = 300;
const TRIGGER_BUFFER: usize = 16;

/// How passes are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMode {
    /// Start the next pass `interval` after the previous one finished.
    Continuous { interval: Duration },
    /// Start a pass for each `fire` call.
    Triggered,
}

#[derive(Debug, Clone)]
pub struct LiveOptions {
    pub mode: LiveMode,
    /// Zero means unbounded.
    pub max_passes: u64,
    pub error_policy: ErrorPolicy,
    pub max_consecutive_errors: u32,
}

impl LiveOptions {
    pub fn from_config(config: &LiveConfig, triggered: bool) -> Self {
        let mode = if triggered {
            LiveMode::Triggered
        } else {
            LiveMode::Continuous {
                interval: config.interval(),
            }
        };
        Self {
            mode,
            max_passes: config.max_passes,
            error_policy: config.error_policy,
            max_consecutive_errors: config.max_consecutive_errors,
        }
    }
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self::from_config(&LiveConfig::default(), false)
    }
}

/// Totals of a finished live run.
#[derive(Debug, Clone, Serialize)]
pub struct LiveSummary {
    pub live_id: String,
    pub workflow_id: String,
    pub passes: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub reason: LiveStopReason,
}

/// Control surface of a running live run.
pub struct LiveHandle {
    live_id: String,
    stop: CancellationToken,
    trigger: Option<mpsc::Sender<HashMap<String, Value>>>,
    join: JoinHandle<LiveSummary>,
}

impl LiveHandle {
    pub fn live_id(&self) -> &str {
        &self.live_id
    }

    /// Stop after cancelling the in-flight pass, if any.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Token that stops the run when cancelled, for use after `join` takes the handle.
    pub fn cancel_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Start one pass with `inputs` layered over the base inputs.
    /// Only valid in triggered mode.
    pub async fn fire(&self, inputs: HashMap<String, Value>) -> Result<()> {
        let trigger = self
            .trigger
            .as_ref()
            .ok_or_else(|| WeftError::Config("live run is not in triggered mode".into()))?;
        trigger
            .send(inputs)
            .await
            .map_err(|_| WeftError::Backend(format!("live run {} has stopped", self.live_id)))
    }

    /// Close the trigger channel; the run stops once queued passes finish.
    pub fn close_trigger(&mut self) {
        self.trigger = None;
    }

    pub async fn join(self) -> Result<LiveSummary> {
        self.join
            .await
            .map_err(|e| WeftError::Backend(format!("live task failed: {e}")))
    }
}

/// Releases the per-workflow live slot when the driver ends.
struct LiveSlot {
    inner: Arc<EngineInner>,
    workflow_id: String,
}

impl LiveSlot {
    fn claim(inner: &Arc<EngineInner>, workflow_id: &str) -> Result<Self> {
        let mut active = inner
            .live
            .lock()
            .map_err(|_| WeftError::LiveRunActive(workflow_id.to_string()))?;
        if !active.insert(workflow_id.to_string()) {
            return Err(WeftError::LiveRunActive(workflow_id.to_string()));
        }
        Ok(Self {
            inner: inner.clone(),
            workflow_id: workflow_id.to_string(),
        })
    }
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        if let Ok(mut active) = self.inner.live.lock() {
            active.remove(&self.workflow_id);
        }
    }
}

impl Engine {
    /// Validate `graph` and start repeating it in the background.
    ///
    /// Validation failures and a second live run for the same workflow are
    /// returned here, before any pass runs.
    pub fn start_live(
        &self,
        graph: &Graph,
        inputs: HashMap<String, Value>,
        options: LiveOptions,
    ) -> Result<LiveHandle> {
        let plan = Arc::new(self.validate(graph)?);
        let base = graph.resolve_variables(&inputs)?;
        let slot = LiveSlot::claim(&self.inner, &graph.id)?;

        let live_id = format!("live-{}", Uuid::new_v4());
        let stop = CancellationToken::new();
        let (trigger, rx) = match options.mode {
            LiveMode::Triggered => {
                let (tx, rx) = mpsc::channel(TRIGGER_BUFFER);
                (Some(tx), Some(rx))
            }
            LiveMode::Continuous { .. } => (None, None),
        };

        info!(live_id = %live_id, workflow_id = %graph.id, mode = ?options.mode, "Live run started");
        let driver = LiveDriver {
            inner: self.inner.clone(),
            plan,
            base,
            options,
            live_id: live_id.clone(),
            stop: stop.clone(),
            triggers: rx,
        };
        let join = tokio::spawn(async move {
            let summary = driver.run().await;
            drop(slot);
            summary
        });

        Ok(LiveHandle {
            live_id,
            stop,
            trigger,
            join,
        })
    }

    /// Whether a live run is active for `workflow_id`.
    pub fn is_live(&self, workflow_id: &str) -> bool {
        self.inner
            .live
            .lock()
            .map(|active| active.contains(workflow_id))
            .unwrap_or(false)
    }
}

struct LiveDriver {
    inner: Arc<EngineInner>,
    plan: Arc<ExecutionPlan>,
    base: HashMap<String, Value>,
    options: LiveOptions,
    live_id: String,
    stop: CancellationToken,
    triggers: Option<mpsc::Receiver<HashMap<String, Value>>>,
}

impl LiveDriver {
    async fn run(mut self) -> LiveSummary {
        let mut summary = LiveSummary {
            live_id: self.live_id.clone(),
            workflow_id: self.plan.graph_id().to_string(),
            passes: 0,
            completed: 0,
            failed: 0,
            total_tokens: 0,
            total_cost_usd: 0.0,
            reason: LiveStopReason::UserStopped,
        };
        let mut consecutive_errors = 0u32;

        summary.reason = loop {
            if self.options.max_passes > 0 && summary.passes >= self.options.max_passes {
                break LiveStopReason::MaxPasses;
            }
            let inputs = match self.next_inputs(summary.passes == 0).await {
                Ok(inputs) => inputs,
                Err(reason) => break reason,
            };

            summary.passes += 1;
            let result = self.pass(summary.passes, inputs).await;
            summary.total_tokens += result.total_tokens;
            summary.total_cost_usd += result.total_cost_usd;

            match result.status {
                RunStatus::Completed => {
                    summary.completed += 1;
                    consecutive_errors = 0;
                }
                RunStatus::Failed => {
                    summary.failed += 1;
                    consecutive_errors += 1;
                    warn!(
                        live_id = %self.live_id,
                        pass = summary.passes,
                        consecutive_errors,
                        failed_nodes = ?result.failed_nodes(),
                        "Live pass failed"
                    );
                    if self.options.error_policy == ErrorPolicy::Stop {
                        break LiveStopReason::ErrorPolicy;
                    }
                    if consecutive_errors >= self.options.max_consecutive_errors.max(1) {
                        break LiveStopReason::ConsecutiveErrors;
                    }
                }
                RunStatus::Cancelled => break LiveStopReason::UserStopped,
            }
            if self.stop.is_cancelled() {
                break LiveStopReason::UserStopped;
            }
        };

        info!(
            live_id = %self.live_id,
            passes = summary.passes,
            reason = %summary.reason,
            "Live run stopped"
        );
        self.inner.runtime.bus.publish(RunEvent::LiveStopped {
            live_id: self.live_id.clone(),
            passes: summary.passes,
            reason: summary.reason,
        });
        summary
    }

    /// Wait for the next pass to be due and return its inputs.
    async fn next_inputs(
        &mut self,
        first: bool,
    ) -> std::result::Result<HashMap<String, Value>, LiveStopReason> {
        match (&self.options.mode, self.triggers.as_mut()) {
            (LiveMode::Triggered, Some(rx)) => tokio::select! {
                _ = self.stop.cancelled() => Err(LiveStopReason::UserStopped),
                fired = rx.recv() => match fired {
                    Some(extra) => {
                        let mut inputs = self.base.clone();
                        inputs.extend(extra);
                        Ok(inputs)
                    }
                    None => Err(LiveStopReason::TriggerClosed),
                },
            },
            (LiveMode::Triggered, None) => Err(LiveStopReason::TriggerClosed),
            (LiveMode::Continuous { interval }, _) => {
                if self.stop.is_cancelled() {
                    return Err(LiveStopReason::UserStopped);
                }
                // The first pass starts immediately
                if !first {
                    let interval = *interval;
                    tokio::select! {
                        _ = self.stop.cancelled() => return Err(LiveStopReason::UserStopped),
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                Ok(self.base.clone())
            }
        }
    }

    async fn pass(&self, pass: u64, inputs: HashMap<String, Value>) -> RunResult {
        let run_id = RunId::from_str(&format!("{}#{}", self.live_id, pass));
        let cancel = self.stop.child_token();
        let _registration = RunRegistration::new(&self.inner, run_id.clone(), cancel.clone());
        let result = self
            .inner
            .execute(
                self.plan.clone(),
                inputs,
                run_id,
                cancel,
                Arc::new(vec![self.plan.graph_id().to_string()]),
            )
            .await;

        info!(
            live_id = %self.live_id,
            pass,
            status = %result.status,
            elapsed_ms = result.duration_ms,
            "Live pass finished"
        );
        self.inner.runtime.bus.publish(RunEvent::LivePassCompleted {
            live_id: self.live_id.clone(),
            pass,
            status: result.status,
            tokens: result.total_tokens,
            cost_usd: result.total_cost_usd,
            duration_ms: result.duration_ms,
            output_summary: output_summary(&result),
        });
        result
    }
}

/// Short text of a pass's outputs for the live stream.
fn output_summary(result: &RunResult) -> String {
    let text = result
        .outputs
        .values()
        .map(primary_text)
        .collect::<Vec<_>>()
        .join(" | ");
    // Leave room for the truncation marker
    truncate(&text, SUMMARY_CHARS - 3)
}
