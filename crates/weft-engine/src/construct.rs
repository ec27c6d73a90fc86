//! Iteration and loop constructs.
//!
//! A construct start is dispatched like any node, but instead of a single
//! executor call its task re-runs the construct's body plan: once per item
//! for an iterator, once per pass for a loop. Every body run gets its own
//! `RunContext`, so item and pass state never collide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use weft_core::error::{Result, WeftError};
use weft_core::types::{
    ItemReport, NodeContext, NodeInput, NodeState, NodeStatus, RunEvent, RunStatus, SkipReason,
    Usage,
};
use weft_nodes::aggregate::{combine, separator, Strategy};
use weft_nodes::builtin::iterator::extract_items;
use weft_nodes::template::value_to_text;

use crate::context::RunContext;
use crate::plan::{Construct, ExecutionPlan};
use crate::resolve::resolve_edges;
use crate::scheduler::{drive, Runtime};
use crate::validate::{loop_bound, ConstructKind};

const DEFAULT_STABILITY_THRESHOLD: f64 = 0.95;
/// Characters compared by the stability check.
const SIMILARITY_MAX_CHARS: usize = 10_000;

/// What a construct run hands back to the owning scheduler.
pub(crate) struct ConstructOutcome {
    /// Output of the start node, or why the construct failed.
    pub start: Result<Value>,
    pub start_usage: Usage,
    /// Output of the end node; `None` skips it.
    pub end: Option<Value>,
    /// Summary states for region nodes, keyed by owning-plan index.
    pub region: Vec<(usize, NodeState)>,
    pub body_usage: Usage,
    pub reports: Vec<(String, Vec<ItemReport>)>,
}

impl ConstructOutcome {
    fn start_failed(construct: &Construct, err: WeftError, start_usage: Usage) -> Self {
        let skipped = NodeState {
            status: NodeStatus::Skipped,
            skip_reason: Some(SkipReason::UpstreamFailed),
            ..NodeState::default()
        };
        Self {
            start: Err(err),
            start_usage,
            end: None,
            region: construct
                .region
                .iter()
                .map(|&(idx, _)| (idx, skipped.clone()))
                .collect(),
            body_usage: Usage::default(),
            reports: Vec::new(),
        }
    }
}

/// Run the construct started by `start` in `plan`.
pub(crate) fn run(
    rt: Arc<Runtime>,
    plan: Arc<ExecutionPlan>,
    start: usize,
    input: NodeInput,
    node_ctx: NodeContext,
) -> BoxFuture<'static, Result<ConstructOutcome>> {
    Box::pin(async move {
        let construct = plan
            .constructs
            .get(&start)
            .ok_or_else(|| node_ctx.fail("node is not a construct start"))?;
        match construct.kind {
            ConstructKind::Iteration => iterate(&rt, &plan, construct, input, node_ctx).await,
            ConstructKind::Loop => repeat(&rt, &plan, construct, input, node_ctx).await,
        }
    })
}

/// A fresh sub-run of `construct`'s body, seeded with `seed`.
fn body_context(
    rt: &Runtime,
    construct: &Construct,
    parent: &NodeContext,
    index: usize,
    seed: Value,
    extra: &[(&str, Value)],
) -> RunContext {
    let mut variables: HashMap<String, Value> = parent.variables.as_ref().clone();
    for (name, value) in extra {
        variables.insert(name.to_string(), value.clone());
    }
    let mut ctx = RunContext::new(
        &construct.body,
        parent.run_id.child(&parent.node_id, index),
        variables,
        parent.cancel.child_token(),
        rt.bus.clone(),
    )
    .with_inherited(parent.outputs.clone())
    .with_call_chain(parent.call_chain.clone());
    for &seed_idx in &construct.body.seeds {
        ctx.seed(seed_idx, seed.clone());
    }
    ctx
}

fn first_error(ctx: &RunContext) -> Option<String> {
    ctx.states.iter().find_map(|s| s.error.clone())
}

/// Nested reports of a body run, re-keyed under the owning item or pass.
fn nested_reports(start_id: &str, index: usize, ctx: &mut RunContext) -> Vec<(String, Vec<ItemReport>)> {
    std::mem::take(&mut ctx.iterations)
        .into_iter()
        .map(|(nested, reports)| (format!("{start_id}#{index}/{nested}"), reports))
        .collect()
}

// ── Iteration ──

struct ItemRun {
    report: ItemReport,
    ctx: RunContext,
}

async fn iterate(
    rt: &Arc<Runtime>,
    plan: &ExecutionPlan,
    construct: &Construct,
    input: NodeInput,
    node_ctx: NodeContext,
) -> Result<ConstructOutcome> {
    let start = &plan.nodes[construct.start];
    let end = &plan.nodes[construct.end];

    let output = match start.executor.execute(input, node_ctx.clone()).await {
        Ok(output) => output,
        Err(e) => return Ok(ConstructOutcome::start_failed(construct, e, Usage::default())),
    };
    let items = match output.value {
        Value::Array(items) => items,
        other => match extract_items(&other, None) {
            Ok(items) => items,
            Err(msg) => {
                return Ok(ConstructOutcome::start_failed(
                    construct,
                    node_ctx.fail(msg),
                    output.usage,
                ))
            }
        },
    };

    let total = items.len();
    let limit = node_ctx
        .config_u64("concurrency")
        .map(|n| n as usize)
        .unwrap_or(rt.config.item_concurrency)
        .max(1);
    info!(
        run_id = %node_ctx.run_id,
        node_id = %start.id,
        items = total,
        concurrency = limit,
        "Starting iteration"
    );

    let done = AtomicUsize::new(0);
    let runs: Vec<ItemRun> = stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| run_item(rt, construct, &node_ctx, index, item, total, &done))
        .buffered(limit)
        .collect()
        .await;

    let mut body_usage = Usage::default();
    let mut reports = Vec::with_capacity(runs.len());
    let mut nested = Vec::new();
    let mut values = Vec::new();
    let mut completed = 0usize;
    let mut contexts = Vec::with_capacity(runs.len());
    for mut run in runs {
        body_usage.add(run.ctx.usage);
        if run.report.status == RunStatus::Completed {
            completed += 1;
            if let Some(value) = &run.report.output {
                values.push(value.clone());
            }
        }
        nested.extend(nested_reports(&start.id, run.report.index, &mut run.ctx));
        reports.push(run.report);
        contexts.push(run.ctx);
    }

    let strategy = Strategy::from_config(&end.config);
    let combined = combine(strategy, &separator(&end.config), &values);
    let region = construct
        .region
        .iter()
        .map(|&(plan_idx, body_idx)| (plan_idx, summarize(&contexts, body_idx)))
        .collect();

    let mut all_reports = vec![(start.id.clone(), reports)];
    all_reports.extend(nested);

    Ok(ConstructOutcome {
        start: Ok(json!({
            "count": total,
            "completed": completed,
            "failed": total - completed,
        })),
        start_usage: output.usage,
        end: Some(combined),
        region,
        body_usage,
        reports: all_reports,
    })
}

async fn run_item(
    rt: &Arc<Runtime>,
    construct: &Construct,
    parent: &NodeContext,
    index: usize,
    item: Value,
    total: usize,
    done: &AtomicUsize,
) -> ItemRun {
    let ctx = body_context(
        rt,
        construct,
        parent,
        index,
        item.clone(),
        &[("item", item), ("index", json!(index)), ("total", json!(total))],
    );
    let ctx = drive(rt.clone(), construct.body.clone(), ctx).await;

    let status = ctx.status(&construct.body);
    let output = resolve_edges(&construct.end_edges, &ctx.produced).value();
    let completed = done.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(
        run_id = %parent.run_id,
        node_id = %parent.node_id,
        index,
        status = %status,
        "Iteration item finished"
    );
    rt.bus.publish(RunEvent::IterationProgress {
        run_id: parent.run_id.clone(),
        node_id: parent.node_id.clone(),
        completed,
        total,
    });

    ItemRun {
        report: ItemReport {
            index,
            status,
            output,
            error: first_error(&ctx),
            node_states: ctx.states_by_id(),
        },
        ctx,
    }
}

/// Parent-level state of a region node across every item.
fn summarize(contexts: &[RunContext], body_idx: usize) -> NodeState {
    let states: Vec<&NodeState> = contexts.iter().map(|c| &c.states[body_idx]).collect();
    let mut summary = NodeState {
        tokens: states.iter().map(|s| s.tokens).sum(),
        cost_usd: states.iter().map(|s| s.cost_usd).sum(),
        duration_ms: states.iter().map(|s| s.duration_ms).sum(),
        ..NodeState::default()
    };
    if states.iter().any(|s| s.status == NodeStatus::Completed) {
        summary.status = NodeStatus::Completed;
    } else if let Some(failed) = states.iter().find(|s| s.status == NodeStatus::Error) {
        summary.status = NodeStatus::Error;
        summary.error = failed.error.clone();
    } else {
        summary.status = NodeStatus::Skipped;
        summary.skip_reason = Some(
            states
                .iter()
                .find_map(|s| s.skip_reason)
                .unwrap_or(SkipReason::BranchNotTaken),
        );
    }
    summary
}

// ── Loop ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCondition {
    MaxIterations,
    StableOutput,
    Evaluator,
}

impl ExitCondition {
    fn from_config(config: &Value) -> Self {
        match config.get("exitCondition").and_then(Value::as_str) {
            Some("stable_output") => Self::StableOutput,
            Some("evaluator") => Self::Evaluator,
            _ => Self::MaxIterations,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::MaxIterations => "max_iterations",
            Self::StableOutput => "stable_output",
            Self::Evaluator => "evaluator",
        }
    }
}

async fn repeat(
    rt: &Arc<Runtime>,
    plan: &ExecutionPlan,
    construct: &Construct,
    input: NodeInput,
    node_ctx: NodeContext,
) -> Result<ConstructOutcome> {
    let start = &plan.nodes[construct.start];
    let output = match start.executor.execute(input, node_ctx.clone()).await {
        Ok(output) => output,
        Err(e) => return Ok(ConstructOutcome::start_failed(construct, e, Usage::default())),
    };

    let config = &start.config;
    let max = loop_bound(config).max(1) as usize;
    let condition = ExitCondition::from_config(config);
    let threshold = config
        .get("stabilityThreshold")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_STABILITY_THRESHOLD);
    let append = config.get("feedbackMode").and_then(Value::as_str) == Some("append");
    info!(
        run_id = %node_ctx.run_id,
        node_id = %start.id,
        max_iterations = max,
        exit_condition = condition.as_str(),
        "Starting loop"
    );

    let mut feed = output.value;
    let mut outputs: Vec<Value> = Vec::new();
    let mut passes: Vec<ItemReport> = Vec::new();
    let mut nested = Vec::new();
    let mut body_usage = Usage::default();
    let mut exit_reason = ExitCondition::MaxIterations;
    let mut last: Option<RunContext> = None;

    for pass in 0..max {
        if node_ctx.cancel.is_cancelled() {
            return Err(WeftError::Cancelled);
        }
        let ctx = body_context(
            rt,
            construct,
            &node_ctx,
            pass,
            feed.clone(),
            &[("iteration", json!(pass + 1))],
        );
        let mut ctx = drive(rt.clone(), construct.body.clone(), ctx).await;
        body_usage.add(ctx.usage);
        nested.extend(nested_reports(&start.id, pass, &mut ctx));

        let status = ctx.status(&construct.body);
        let exit_value = resolve_edges(&construct.end_edges, &ctx.produced).value();
        let value = exit_value
            .clone()
            .or_else(|| resolve_edges(&construct.back_edges, &ctx.produced).value())
            .or_else(|| last_sink_output(&construct.body, &ctx));
        passes.push(ItemReport {
            index: pass,
            status,
            output: value.clone(),
            error: first_error(&ctx),
            node_states: ctx.states_by_id(),
        });

        if status != RunStatus::Completed {
            let reason = first_error(&ctx).unwrap_or_else(|| status.to_string());
            let region = region_states(construct, &ctx);
            let mut reports = vec![(start.id.clone(), passes)];
            reports.extend(nested);
            return Ok(ConstructOutcome {
                start: Err(node_ctx.fail(format!("iteration {} failed: {reason}", pass + 1))),
                start_usage: output.usage,
                end: None,
                region,
                body_usage,
                reports,
            });
        }

        let value = value.unwrap_or_else(|| feed.clone());
        let stop = match condition {
            ExitCondition::Evaluator => exit_value.is_some(),
            ExitCondition::StableOutput => outputs.last().is_some_and(|prev| {
                let similarity = levenshtein_similarity(&value_to_text(prev), &value_to_text(&value));
                debug!(node_id = %start.id, pass = pass + 1, similarity, "Loop stability check");
                similarity >= threshold
            }),
            ExitCondition::MaxIterations => false,
        };
        outputs.push(value.clone());
        feed = if append {
            Value::String(format!("{}\n\n{}", value_to_text(&feed), value_to_text(&value)))
        } else {
            value
        };
        last = Some(ctx);
        if stop {
            exit_reason = condition;
            break;
        }
    }

    let final_value = outputs.last().cloned().unwrap_or(Value::Null);
    let region = last
        .as_ref()
        .map(|ctx| region_states(construct, ctx))
        .unwrap_or_default();
    info!(
        run_id = %node_ctx.run_id,
        node_id = %start.id,
        iterations = outputs.len(),
        exit_reason = exit_reason.as_str(),
        "Loop finished"
    );

    let mut reports = vec![(start.id.clone(), passes)];
    reports.extend(nested);
    Ok(ConstructOutcome {
        start: Ok(json!({
            "output": final_value,
            "count": outputs.len(),
            "iterations": outputs,
            "exitReason": exit_reason.as_str(),
        })),
        start_usage: output.usage,
        end: Some(final_value),
        region,
        body_usage,
        reports,
    })
}

fn region_states(construct: &Construct, ctx: &RunContext) -> Vec<(usize, NodeState)> {
    construct
        .region
        .iter()
        .map(|&(plan_idx, body_idx)| (plan_idx, ctx.states[body_idx].clone()))
        .collect()
}

/// Output of the last completed body sink, in declaration order.
fn last_sink_output(body: &ExecutionPlan, ctx: &RunContext) -> Option<Value> {
    body.sinks
        .iter()
        .rev()
        .find_map(|&i| ctx.produced[i].as_ref().map(|p| p.value.clone()))
}

/// `1 - distance / longer length`, over at most the first ten thousand chars.
fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().take(SIMILARITY_MAX_CHARS).collect();
    let b: Vec<char> = b.chars().take(SIMILARITY_MAX_CHARS).collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    1.0 - prev[b.len()] as f64 / a.len().max(b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_bounds() {
        assert_eq!(levenshtein_similarity("", ""), 1.0);
        assert_eq!(levenshtein_similarity("abc", ""), 0.0);
        assert_eq!(levenshtein_similarity("same", "same"), 1.0);
    }

    #[test]
    fn similarity_counts_edits() {
        // kitten -> sitting is three edits over seven chars
        let s = levenshtein_similarity("kitten", "sitting");
        assert!((s - (1.0 - 3.0 / 7.0)).abs() < 1e-9);
    }

    #[test]
    fn exit_condition_defaults_to_max_iterations() {
        assert_eq!(ExitCondition::from_config(&json!({})), ExitCondition::MaxIterations);
        assert_eq!(
            ExitCondition::from_config(&json!({"exitCondition": "evaluator"})),
            ExitCondition::Evaluator
        );
        assert_eq!(ExitCondition::StableOutput.as_str(), "stable_output");
    }
}
