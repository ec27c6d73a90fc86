//! Executable plans built from validated graphs.
//!
//! A plan resolves every node's executor once, precomputes producers and
//! dependents, and carves each top-level iterator/loop construct into a
//! nested body plan that the scheduler re-runs per item or per pass.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use weft_core::error::{Result, WeftError};
use weft_core::traits::NodeExecutor;
use weft_nodes::ExecutorRegistry;

use crate::graph::{Graph, NodeKind, Variable};
use crate::validate::{self, Analysis, ConstructKind};

/// A wired input, with the producer given as a plan-local index.
#[derive(Debug, Clone)]
pub(crate) struct PlanEdge {
    pub source: usize,
    pub source_handle: String,
    pub target_handle: String,
}

pub(crate) struct PlannedNode {
    pub id: String,
    pub kind: NodeKind,
    pub config: Value,
    pub executor: Arc<dyn NodeExecutor>,
    /// Inputs in wiring order.
    pub incoming: Vec<PlanEdge>,
    pub producers: Vec<usize>,
    pub dependents: Vec<usize>,
    /// Start node of the construct that drives this node, if any.
    pub owner: Option<usize>,
}

/// A top-level construct of a plan and the body re-run for it.
pub(crate) struct Construct {
    pub kind: ConstructKind,
    pub start: usize,
    pub end: usize,
    /// Region nodes as `(plan index, body index)` pairs.
    pub region: Vec<(usize, usize)>,
    /// Edges into the end node, with sources as body indices.
    pub end_edges: Vec<PlanEdge>,
    /// Loop back-edges, with sources as body indices.
    pub back_edges: Vec<PlanEdge>,
    pub body: Arc<ExecutionPlan>,
}

/// A validated, ready-to-run workflow.
pub struct ExecutionPlan {
    pub(crate) graph_id: String,
    pub(crate) nodes: Vec<PlannedNode>,
    pub(crate) index: HashMap<String, usize>,
    /// Nodes whose output is supplied before scheduling starts.
    pub(crate) seeds: Vec<usize>,
    pub(crate) constructs: HashMap<usize, Construct>,
    pub(crate) sinks: Vec<usize>,
    pub(crate) variables: Vec<Variable>,
    warnings: Vec<String>,
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("graph_id", &self.graph_id)
            .field("nodes", &self.node_ids())
            .field("sinks", &self.sink_ids())
            .field("constructs", &self.constructs.len())
            .finish()
    }
}

/// Printable overview of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub graph_id: String,
    pub nodes: usize,
    pub sinks: Vec<String>,
    pub constructs: Vec<ConstructSummary>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConstructSummary {
    pub kind: ConstructKind,
    pub start: String,
    pub end: String,
    pub region: Vec<String>,
}

impl ExecutionPlan {
    /// Validate `graph` and assemble its plan.
    pub fn build(graph: &Graph, registry: &ExecutorRegistry, max_loop_iterations: u64) -> Result<Self> {
        let (analysis, report) = validate::analyze(graph, registry, max_loop_iterations);
        if !report.is_ok() {
            return Err(WeftError::Validation(report.errors));
        }
        let members: Vec<usize> = (0..graph.nodes.len()).collect();
        let mut plan = assemble(&analysis, &members, None)?;
        plan.warnings = report.warnings;
        Ok(plan)
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    pub fn sink_ids(&self) -> Vec<&str> {
        self.sinks.iter().map(|&i| self.nodes[i].id.as_str()).collect()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut constructs: Vec<&Construct> = self.constructs.values().collect();
        constructs.sort_by_key(|c| c.start);
        PlanSummary {
            graph_id: self.graph_id.clone(),
            nodes: self.nodes.len(),
            sinks: self.sink_ids().into_iter().map(str::to_string).collect(),
            constructs: constructs
                .into_iter()
                .map(|c| ConstructSummary {
                    kind: c.kind,
                    start: self.nodes[c.start].id.clone(),
                    end: self.nodes[c.end].id.clone(),
                    region: c.region.iter().map(|(i, _)| self.nodes[*i].id.clone()).collect(),
                })
                .collect(),
            warnings: self.warnings.clone(),
        }
    }

    pub(crate) fn idx(&self, node_id: &str) -> Option<usize> {
        self.index.get(node_id).copied()
    }
}

/// Build the plan over `members` (graph indices, ascending). `seed` is the
/// construct start pre-completed in a body plan.
fn assemble(a: &Analysis<'_>, members: &[usize], seed: Option<usize>) -> Result<ExecutionPlan> {
    let graph = a.graph;
    let local: HashMap<usize, usize> = members.iter().enumerate().map(|(l, &g)| (g, l)).collect();
    let is_member = |g: usize| local.contains_key(&g);

    // Constructs fully inside this plan, excluding the one this body belongs to
    let inside: Vec<_> = a
        .constructs
        .iter()
        .filter(|c| Some(c.start) != seed && is_member(c.start) && is_member(c.end))
        .collect();
    let top_level: Vec<_> = inside
        .iter()
        .filter(|c| !inside.iter().any(|o| o.region.contains(&c.start)))
        .copied()
        .collect();

    let mut owner: HashMap<usize, usize> = HashMap::new();
    for c in &top_level {
        for &g in c.region.iter().chain(std::iter::once(&c.end)) {
            owner.insert(g, c.start);
        }
    }

    let mut nodes = Vec::with_capacity(members.len());
    for &g in members {
        let node = &graph.nodes[g];
        let executor = a.executors[g]
            .clone()
            .ok_or_else(|| WeftError::UnknownNodeType(node.kind.to_string()))?;
        nodes.push(PlannedNode {
            id: node.id.clone(),
            kind: node.kind.clone(),
            config: node.config.clone(),
            executor,
            incoming: Vec::new(),
            producers: Vec::new(),
            dependents: Vec::new(),
            owner: owner.get(&g).map(|s| local[s]),
        });
    }

    for edge in a.edges.iter().filter(|e| !e.back) {
        let (Some(&s), Some(&t)) = (local.get(&edge.source), local.get(&edge.target)) else {
            continue;
        };
        // Owned nodes are fed by their construct, not by this plan
        if nodes[t].owner.is_some() || Some(edge.target) == seed {
            continue;
        }
        nodes[t].incoming.push(PlanEdge {
            source: s,
            source_handle: edge.source_handle.clone(),
            target_handle: edge.target_handle.clone(),
        });
        if !nodes[t].producers.contains(&s) {
            nodes[t].producers.push(s);
            nodes[s].dependents.push(t);
        }
    }

    for node in &mut nodes {
        node.dependents.sort_unstable();
    }

    let mut constructs = HashMap::new();
    for c in top_level {
        let body_members: Vec<usize> = std::iter::once(c.start)
            .chain(c.region.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let body = assemble(a, &body_members, Some(c.start))?;
        let in_body = |g: usize| body.idx(&graph.nodes[g].id);

        let mut end_edges = Vec::new();
        let mut back_edges = Vec::new();
        for edge in &a.edges {
            let Some(source) = in_body(edge.source) else {
                continue;
            };
            let plan_edge = PlanEdge {
                source,
                source_handle: edge.source_handle.clone(),
                target_handle: edge.target_handle.clone(),
            };
            if edge.target == c.end && !edge.back {
                end_edges.push(plan_edge);
            } else if edge.back && edge.target == c.start {
                back_edges.push(plan_edge);
            }
        }

        let region = c
            .region
            .iter()
            .filter_map(|&g| Some((local[&g], in_body(g)?)))
            .collect();
        let start = local[&c.start];
        constructs.insert(
            start,
            Construct {
                kind: c.kind,
                start,
                end: local[&c.end],
                region,
                end_edges,
                back_edges,
                body: Arc::new(body),
            },
        );
    }

    // Sinks: nothing downstream here; region nodes report through their construct
    let sinks = (0..nodes.len())
        .filter(|&i| {
            let region_member = nodes[i].owner.is_some() && !constructs.values().any(|c| c.end == i);
            let feeds_construct = constructs.contains_key(&i);
            nodes[i].dependents.is_empty() && !region_member && !feeds_construct
        })
        .collect();

    Ok(ExecutionPlan {
        graph_id: graph.id.clone(),
        index: nodes.iter().enumerate().map(|(i, n)| (n.id.clone(), i)).collect(),
        nodes,
        seeds: seed.map(|g| vec![local[&g]]).unwrap_or_default(),
        constructs,
        sinks,
        variables: graph.variables.clone(),
        warnings: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use weft_test_utils::FnExecutor;

    fn registry() -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::with_builtins();
        registry.register(FnExecutor::passthrough("work"));
        registry
    }

    fn chain(ids: &[(&str, &str)]) -> Graph {
        let mut graph = Graph::new("wf");
        for (id, kind) in ids {
            graph = graph.with_node(Node::new(*id, *kind));
        }
        for pair in ids.windows(2) {
            graph = graph.connect(pair[0].0, pair[1].0);
        }
        graph
    }

    #[test]
    fn fan_out_plan_has_two_sinks() {
        let graph = Graph::new("wf")
            .with_node(Node::new("in", "input"))
            .with_node(Node::new("a", "output"))
            .with_node(Node::new("b", "output"))
            .connect("in", "a")
            .connect("in", "b");
        let plan = ExecutionPlan::build(&graph, &registry(), 50).unwrap();
        assert_eq!(plan.sink_ids(), vec!["a", "b"]);
        assert_eq!(plan.nodes[0].dependents, vec![1, 2]);
        assert!(plan.seeds.is_empty());
    }

    #[test]
    fn validation_errors_block_the_plan() {
        let graph = chain(&[("in", "input"), ("x", "nope")]);
        let err = ExecutionPlan::build(&graph, &registry(), 50).unwrap_err();
        assert!(matches!(err, WeftError::Validation(_)));
    }

    #[test]
    fn iteration_body_is_carved_out() {
        let graph = chain(&[
            ("in", "input"),
            ("it", "iterator"),
            ("a", "work"),
            ("b", "work"),
            ("agg", "aggregator"),
            ("out", "output"),
        ]);
        let plan = ExecutionPlan::build(&graph, &registry(), 50).unwrap();
        let construct = &plan.constructs[&1];
        assert_eq!(construct.end, 4);
        assert_eq!(plan.nodes[2].owner, Some(1));
        assert_eq!(plan.nodes[4].owner, Some(1));
        assert!(plan.nodes[4].incoming.is_empty());
        assert_eq!(plan.nodes[5].producers, vec![4]);
        assert_eq!(plan.sink_ids(), vec!["out"]);

        let body = &construct.body;
        assert_eq!(body.node_ids(), vec!["it", "a", "b"]);
        assert_eq!(body.seeds, vec![0]);
        assert_eq!(body.sink_ids(), vec!["b"]);
        assert_eq!(construct.end_edges.len(), 1);
        assert_eq!(construct.end_edges[0].source, 2);
    }

    #[test]
    fn nested_construct_lives_in_outer_body() {
        let graph = chain(&[
            ("in", "input"),
            ("lp", "loop"),
            ("it", "iterator"),
            ("w", "work"),
            ("agg", "aggregator"),
            ("ex", "exit"),
            ("out", "output"),
        ]);
        let plan = ExecutionPlan::build(&graph, &registry(), 50).unwrap();
        assert_eq!(plan.constructs.len(), 1);
        let body = &plan.constructs[&1].body;
        assert_eq!(body.node_ids(), vec!["lp", "it", "w", "agg"]);
        assert_eq!(body.constructs.len(), 1);
        assert!(body.constructs.contains_key(&1));
        assert_eq!(body.sink_ids(), vec!["agg"]);
    }

    #[test]
    fn summary_lists_constructs() {
        let graph = chain(&[
            ("in", "input"),
            ("it", "iterator"),
            ("a", "work"),
            ("agg", "aggregator"),
        ]);
        let summary = ExecutionPlan::build(&graph, &registry(), 50).unwrap().summary();
        assert_eq!(summary.constructs[0].start, "it");
        assert_eq!(summary.constructs[0].region, vec!["a"]);
        assert_eq!(summary.sinks, vec!["agg"]);
    }
}
