//! Structural checks run before any node executes.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use weft_core::error::ValidationIssue;
use weft_core::traits::NodeExecutor;
use weft_nodes::ExecutorRegistry;

use crate::graph::{Graph, NodeKind};

/// Default `maxIterations` for a loop that does not set one.
pub const DEFAULT_LOOP_ITERATIONS: u64 = 5;

/// Everything validation found. Warnings never block a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Which construct a start/end pair delimits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstructKind {
    Iteration,
    Loop,
}

impl ConstructKind {
    fn of(kind: &NodeKind) -> Option<Self> {
        match kind {
            NodeKind::Iterator => Some(Self::Iteration),
            NodeKind::Loop => Some(Self::Loop),
            _ => None,
        }
    }

    fn end_kind(self) -> NodeKind {
        match self {
            Self::Iteration => NodeKind::Aggregator,
            Self::Loop => NodeKind::Exit,
        }
    }
}

/// A resolved edge between graph node indices.
#[derive(Debug, Clone)]
pub(crate) struct GraphEdge {
    pub source: usize,
    pub target: usize,
    pub source_handle: String,
    pub target_handle: String,
    /// Declared loop back-edge; ignored by ordering and scheduling.
    pub back: bool,
}

/// A matched construct and the nodes strictly between its boundaries.
#[derive(Debug, Clone)]
pub(crate) struct ConstructSpan {
    pub kind: ConstructKind,
    pub start: usize,
    pub end: usize,
    pub region: BTreeSet<usize>,
}

/// Validated view of a graph, consumed by plan assembly.
pub(crate) struct Analysis<'g> {
    pub graph: &'g Graph,
    pub executors: Vec<Option<Arc<dyn NodeExecutor>>>,
    pub edges: Vec<GraphEdge>,
    pub constructs: Vec<ConstructSpan>,
}

/// Validate `graph` against the executors in `registry`.
pub fn check(graph: &Graph, registry: &ExecutorRegistry, max_loop_iterations: u64) -> ValidationReport {
    analyze(graph, registry, max_loop_iterations).1
}

pub(crate) fn analyze<'g>(
    graph: &'g Graph,
    registry: &ExecutorRegistry,
    max_loop_iterations: u64,
) -> (Analysis<'g>, ValidationReport) {
    let mut report = ValidationReport::default();
    let mut analysis = Analysis {
        graph,
        executors: Vec::new(),
        edges: Vec::new(),
        constructs: Vec::new(),
    };

    if graph.nodes.is_empty() {
        report.errors.push(ValidationIssue::EmptyGraph);
        return (analysis, report);
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, node) in graph.nodes.iter().enumerate() {
        if index.insert(node.id.as_str(), i).is_some() {
            report.errors.push(ValidationIssue::DuplicateNode(node.id.clone()));
        }
    }
    if !report.errors.is_empty() {
        return (analysis, report);
    }

    // ── Edges and handles ───────────────────────────────────────
    for edge in &graph.edges {
        let source = index.get(edge.source.as_str()).copied();
        let target = index.get(edge.target.as_str()).copied();
        for (endpoint, found) in [(&edge.source, source), (&edge.target, target)] {
            if found.is_none() {
                report.errors.push(ValidationIssue::UnknownNode {
                    edge: edge.label(),
                    node: endpoint.clone(),
                });
            }
        }
        if let (Some(source), Some(target)) = (source, target) {
            analysis.edges.push(GraphEdge {
                source,
                target,
                source_handle: edge.source_handle.clone(),
                target_handle: edge.target_handle.clone(),
                back: false,
            });
        }
    }

    // ── Executors ───────────────────────────────────────────────
    for (i, node) in graph.nodes.iter().enumerate() {
        let executor = registry.get(node.kind.as_str());
        match &executor {
            None => report.errors.push(ValidationIssue::UnknownNodeType {
                node_id: node.id.clone(),
                node_type: node.kind.to_string(),
            }),
            Some(executor) => {
                for handle in executor.required_inputs() {
                    let wired = analysis
                        .edges
                        .iter()
                        .any(|e| e.target == i && e.target_handle == handle);
                    if !wired {
                        report.errors.push(ValidationIssue::UnwiredInput {
                            node_id: node.id.clone(),
                            handle,
                        });
                    }
                }
            }
        }
        analysis.executors.push(executor);
    }

    for (i, node) in graph.nodes.iter().enumerate() {
        if node.kind.needs_outgoing() && !analysis.edges.iter().any(|e| e.source == i) {
            report.errors.push(ValidationIssue::MissingOutgoing(node.id.clone()));
        }
    }

    // ── Constructs ──────────────────────────────────────────────
    analysis.constructs = find_constructs(graph, &analysis.edges, &mut report, max_loop_iterations);
    for span in analysis.constructs.iter().filter(|c| c.kind == ConstructKind::Loop) {
        for edge in analysis.edges.iter_mut() {
            if edge.target == span.start
                && (edge.source == span.end || span.region.contains(&edge.source))
            {
                edge.back = true;
            }
        }
    }

    // Back-edges share the loop's input handle with its entry edge
    let mut handle_counts: Vec<((usize, &str), usize)> = Vec::new();
    for edge in analysis.edges.iter().filter(|e| !e.back) {
        let key = (edge.target, edge.target_handle.as_str());
        match handle_counts.iter_mut().find(|(k, _)| *k == key) {
            Some((_, count)) => *count += 1,
            None => handle_counts.push((key, 1)),
        }
    }
    for ((target, handle), count) in handle_counts {
        if count > 1 {
            report.errors.push(ValidationIssue::HandleConflict {
                node_id: graph.nodes[target].id.clone(),
                handle: handle.to_string(),
                count,
            });
        }
    }

    check_reachability(graph, &analysis.edges, &mut report);
    check_cycles(graph, &analysis.edges, &mut report);

    let has_sink = (0..graph.nodes.len())
        .any(|i| !analysis.edges.iter().any(|e| e.source == i && !e.back));
    if !has_sink {
        report.errors.push(ValidationIssue::NoSink);
    }

    (analysis, report)
}

fn adjacency(n: usize, edges: &[GraphEdge]) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
    let mut out = vec![Vec::new(); n];
    let mut inc = vec![Vec::new(); n];
    for edge in edges.iter().filter(|e| !e.back) {
        out[edge.source].push(edge.target);
        inc[edge.target].push(edge.source);
    }
    (out, inc)
}

fn find_constructs(
    graph: &Graph,
    edges: &[GraphEdge],
    report: &mut ValidationReport,
    max_loop_iterations: u64,
) -> Vec<ConstructSpan> {
    let (out, inc) = adjacency(graph.nodes.len(), edges);
    let mut candidates: Vec<(ConstructKind, usize, usize, BTreeSet<usize>)> = Vec::new();

    for (start, node) in graph.nodes.iter().enumerate() {
        let Some(kind) = ConstructKind::of(&node.kind) else {
            continue;
        };
        let end_kind = kind.end_kind();

        // Forward from the start, never expanding past a matching end node
        let mut forward = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(n) = queue.pop_front() {
            for &m in &out[n] {
                if m != start && forward.insert(m) && graph.nodes[m].kind != end_kind {
                    queue.push_back(m);
                }
            }
        }

        let ends: Vec<usize> = forward
            .iter()
            .copied()
            .filter(|&m| graph.nodes[m].kind == end_kind)
            .collect();
        if ends.len() != 1 {
            report.errors.push(ValidationIssue::UnmatchedConstruct {
                start: node.id.clone(),
                end_kind: end_kind.to_string(),
                found: ends.len(),
            });
            continue;
        }

        if kind == ConstructKind::Loop {
            if let Some(raw) = node.config.get("maxIterations").filter(|v| !v.is_null()) {
                let in_range = raw
                    .as_u64()
                    .is_some_and(|n| (1..=max_loop_iterations).contains(&n));
                if !in_range {
                    report.errors.push(ValidationIssue::LoopBound {
                        node_id: node.id.clone(),
                        value: raw.to_string(),
                        max: max_loop_iterations,
                    });
                }
            }
        }

        candidates.push((kind, start, ends[0], forward));
    }

    let mut claims: Vec<(usize, Vec<usize>)> = Vec::new();
    for (_, start, end, _) in &candidates {
        match claims.iter_mut().find(|(e, _)| e == end) {
            Some((_, starts)) => starts.push(*start),
            None => claims.push((*end, vec![*start])),
        }
    }
    for (end, starts) in &claims {
        if starts.len() > 1 {
            report.errors.push(ValidationIssue::AmbiguousNesting {
                end: graph.nodes[*end].id.clone(),
                starts: starts.iter().map(|s| graph.nodes[*s].id.clone()).collect(),
            });
        }
    }

    let mut spans = Vec::new();
    for (kind, start, end, forward) in candidates {
        let contested = claims
            .iter()
            .any(|(e, starts)| *e == end && starts.len() > 1);
        if contested {
            continue;
        }

        // Backward from the end (and, for loops, from back-edge sources)
        let mut seeds = vec![end];
        if kind == ConstructKind::Loop {
            seeds.extend(inc[start].iter().copied().filter(|s| forward.contains(s)));
        }
        let mut backward: BTreeSet<usize> = seeds.iter().copied().collect();
        let mut queue: VecDeque<usize> = seeds.into_iter().collect();
        while let Some(n) = queue.pop_front() {
            for &p in &inc[n] {
                if p != start && backward.insert(p) {
                    queue.push_back(p);
                }
            }
        }

        let mut region: BTreeSet<usize> = forward.intersection(&backward).copied().collect();
        region.remove(&end);
        spans.push(ConstructSpan {
            kind,
            start,
            end,
            region,
        });
    }

    for span in &spans {
        check_region_edges(graph, edges, span, report);
    }
    for outer in &spans {
        for inner in &spans {
            if outer.start == inner.start {
                continue;
            }
            let start_in = outer.region.contains(&inner.start);
            let end_in = outer.region.contains(&inner.end);
            if start_in != end_in {
                report.errors.push(ValidationIssue::CrossedBoundary {
                    outer: graph.nodes[outer.start].id.clone(),
                    inner: graph.nodes[inner.start].id.clone(),
                });
            } else if start_in && outer.kind == inner.kind {
                report.errors.push(ValidationIssue::AmbiguousNesting {
                    end: graph.nodes[inner.end].id.clone(),
                    starts: vec![
                        graph.nodes[outer.start].id.clone(),
                        graph.nodes[inner.start].id.clone(),
                    ],
                });
            }
        }
    }

    spans
}

fn check_region_edges(
    graph: &Graph,
    edges: &[GraphEdge],
    span: &ConstructSpan,
    report: &mut ValidationReport,
) {
    let inside = |n: usize| span.region.contains(&n);
    for edge in edges {
        let (s, t) = (edge.source, edge.target);
        let is_back = span.kind == ConstructKind::Loop
            && t == span.start
            && (inside(s) || s == span.end);
        if is_back {
            continue;
        }
        let entering = inside(t) && !inside(s) && s != span.start;
        let leaving = inside(s) && !inside(t) && t != span.end;
        let start_escapes = s == span.start && !inside(t) && t != span.end;
        let foreign_end_input = t == span.end && !inside(s) && s != span.start;
        if entering || leaving || start_escapes || foreign_end_input {
            report.errors.push(ValidationIssue::RegionEdge {
                construct: graph.nodes[span.start].id.clone(),
                source_node: graph.nodes[s].id.clone(),
                target_node: graph.nodes[t].id.clone(),
            });
        }
    }
}

fn check_reachability(graph: &Graph, edges: &[GraphEdge], report: &mut ValidationReport) {
    let n = graph.nodes.len();
    let (out, inc) = adjacency(n, edges);
    let isolated = |i: usize| !edges.iter().any(|e| e.source == i || e.target == i);

    let mut flagged = vec![false; n];
    for (i, node) in graph.nodes.iter().enumerate() {
        if isolated(i) {
            report
                .warnings
                .push(format!("node {} is not connected to anything", node.id));
            flagged[i] = true;
        } else if !node.kind.is_start() && inc[i].is_empty() {
            report.errors.push(ValidationIssue::MissingProducer(node.id.clone()));
            flagged[i] = true;
        }
    }

    let mut seen = vec![false; n];
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| graph.nodes[i].kind.is_start()).collect();
    for &i in &queue {
        seen[i] = true;
    }
    while let Some(i) = queue.pop_front() {
        for &m in &out[i] {
            if !seen[m] {
                seen[m] = true;
                queue.push_back(m);
            }
        }
    }
    for (i, node) in graph.nodes.iter().enumerate() {
        if !seen[i] && !flagged[i] {
            report.errors.push(ValidationIssue::Unreachable(node.id.clone()));
        }
    }
}

/// Kahn's algorithm over forward edges; leftovers sit on a cycle or behind one.
fn check_cycles(graph: &Graph, edges: &[GraphEdge], report: &mut ValidationReport) {
    let n = graph.nodes.len();
    let (out, inc) = adjacency(n, edges);
    let mut in_degree: Vec<usize> = inc.iter().map(Vec::len).collect();
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &m in &out[i] {
            in_degree[m] -= 1;
            if in_degree[m] == 0 {
                queue.push_back(m);
            }
        }
    }
    if visited < n {
        let mut nodes: Vec<String> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| graph.nodes[i].id.clone())
            .collect();
        nodes.sort();
        report.errors.push(ValidationIssue::CycleDetected { nodes });
    }
}

/// Effective `maxIterations` of a loop node.
pub(crate) fn loop_bound(config: &Value) -> u64 {
    config
        .get("maxIterations")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_LOOP_ITERATIONS)
}
