use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use weft_core::config::EngineConfig;
use weft_core::error::{ValidationIssue, WeftError};
use weft_core::types::{NodeOutput, NodeStatus, RunEvent, RunStatus, SkipReason};
use weft_engine::{Edge, Engine, Graph, Node};
use weft_nodes::ExecutorRegistry;
use weft_test_utils::{FnExecutor, MockModel, ProbeExecutor};

fn inputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn engine_with(registry: ExecutorRegistry, max_concurrency: usize) -> Engine {
    Engine::builder()
        .with_registry(registry)
        .with_config(EngineConfig {
            max_concurrency,
            ..EngineConfig::default()
        })
        .build()
}

fn registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(FnExecutor::passthrough("work"));
    registry.register(FnExecutor::failing("boom", "exploded"));
    registry
}

#[tokio::test]
async fn every_node_ends_terminal_and_partial_failure_is_reported() {
    let graph = Graph::new("wf")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("bad", "boom"))
        .with_node(Node::new("good", "work"))
        .with_node(Node::new("out_bad", "output"))
        .with_node(Node::new("out_good", "output"))
        .connect("in", "bad")
        .connect("in", "good")
        .connect("bad", "out_bad")
        .connect("good", "out_good");

    let engine = engine_with(registry(), 4);
    let result = engine
        .run(&graph, inputs(&[("in", json!("x"))]))
        .await
        .unwrap();

    for (id, state) in &result.node_states {
        assert!(state.status.is_terminal(), "{id} ended {:?}", state.status);
    }
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.is_partial());
    assert_eq!(result.status_of("bad"), Some(NodeStatus::Error));
    assert!(result.node_states["bad"].error.as_deref().unwrap().contains("exploded"));
    assert_eq!(
        result.node_states["out_bad"].skip_reason,
        Some(SkipReason::UpstreamFailed)
    );
    assert_eq!(result.outputs.get("out_good"), Some(&json!("x")));
    assert_eq!(result.failed_nodes(), vec!["bad"]);
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_holds_and_dispatch_follows_declaration_order() {
    let probe = ProbeExecutor::new("probe", Duration::from_millis(50));
    let stats = probe.stats();
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(probe);

    let mut graph = Graph::new("fan").with_node(Node::new("in", "input"));
    for i in 0..6 {
        let id = format!("p{i}");
        graph = graph.with_node(Node::new(&id, "probe")).connect("in", &id);
    }

    let engine = engine_with(registry, 2);
    let result = engine
        .run(&graph, inputs(&[("in", json!(1))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(stats.calls(), 6);
    assert_eq!(stats.peak(), 2);
    assert_eq!(stats.started(), vec!["p0", "p1", "p2", "p3", "p4", "p5"]);
}

#[tokio::test(start_paused = true)]
async fn no_node_runs_before_its_producers_finish() {
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(ProbeExecutor::new("probe", Duration::from_millis(20)));

    // in -> a -> c, in -> b -> c, c -> d
    let graph = Graph::new("dag")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("a", "probe"))
        .with_node(Node::new("b", "probe"))
        .with_node(Node::new("c", "probe"))
        .with_node(Node::new("d", "probe"))
        .connect("in", "a")
        .connect("in", "b")
        .with_edge(Edge::new("a", "c").to_handle("left"))
        .with_edge(Edge::new("b", "c").to_handle("right"))
        .connect("c", "d");
    let producers: HashMap<&str, Vec<&str>> = HashMap::from([
        ("a", vec!["in"]),
        ("b", vec!["in"]),
        ("c", vec!["a", "b"]),
        ("d", vec!["c"]),
    ]);

    let engine = engine_with(registry, 4);
    let mut events = engine.subscribe();
    let result = engine
        .run(&graph, inputs(&[("in", json!(1))]))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let mut terminal: Vec<String> = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RunEvent::NodeStatusChanged { node_id, status, .. } = event {
            if status == NodeStatus::Running {
                for p in producers.get(node_id.as_str()).into_iter().flatten() {
                    assert!(terminal.iter().any(|t| t == p), "{node_id} ran before {p}");
                }
            } else if status.is_terminal() {
                terminal.push(node_id);
            }
        }
    }
    assert_eq!(terminal.len(), 5);
}

#[tokio::test]
async fn undeclared_cycle_is_rejected_before_execution() {
    let probe = ProbeExecutor::new("probe", Duration::from_millis(1));
    let stats = probe.stats();
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(probe);

    let graph = Graph::new("cyclic")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("a", "probe"))
        .with_node(Node::new("b", "probe"))
        .with_node(Node::new("out", "output"))
        .with_edge(Edge::new("in", "a").to_handle("seed"))
        .with_edge(Edge::new("b", "a").to_handle("again"))
        .connect("a", "b")
        .connect("b", "out");

    let err = engine_with(registry, 4)
        .run(&graph, inputs(&[("in", json!(1))]))
        .await
        .unwrap_err();
    match err {
        WeftError::Validation(issues) => assert!(issues
            .iter()
            .any(|i| matches!(
                i,
                ValidationIssue::CycleDetected { nodes }
                    if nodes.contains(&"a".to_string()) && nodes.contains(&"b".to_string())
            ))),
        other => panic!("expected validation error, got {other}"),
    }
    assert_eq!(stats.calls(), 0);
}

#[tokio::test]
async fn router_skips_the_branch_not_taken() {
    let graph = Graph::new("triage")
        .with_node(Node::new("Input", "input"))
        .with_node(Node::new("Router", "router").with_config(json!({
            "mode": "pattern",
            "branches": [
                {"name": "branch_a", "pattern": "fail"},
                {"name": "branch_b", "default": true}
            ]
        })))
        .with_node(Node::new("Output_fail", "output"))
        .with_node(Node::new("Output_ok", "output"))
        .connect("Input", "Router")
        .with_edge(Edge::new("Router", "Output_fail").from_handle("branch-0"))
        .with_edge(Edge::new("Router", "Output_ok").from_handle("branch-1"));

    let result = Engine::new()
        .run(&graph, inputs(&[("Input", json!("build FAILED"))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.status_of("Router"), Some(NodeStatus::Completed));
    assert_eq!(result.status_of("Output_fail"), Some(NodeStatus::Completed));
    assert_eq!(result.outputs["Output_fail"], json!("build FAILED"));
    assert_eq!(result.status_of("Output_ok"), Some(NodeStatus::Skipped));
    assert_eq!(
        result.node_states["Output_ok"].skip_reason,
        Some(SkipReason::BranchNotTaken)
    );
}

#[tokio::test]
async fn another_completed_producer_keeps_a_node_alive() {
    let graph = Graph::new("alt")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("bad", "boom"))
        .with_node(Node::new("join", "work"))
        .with_node(Node::new("out", "output"))
        .connect("in", "bad")
        .with_edge(Edge::new("bad", "join").to_handle("primary"))
        .with_edge(Edge::new("in", "join").to_handle("fallback"))
        .connect("join", "out");

    let result = engine_with(registry(), 4)
        .run(&graph, inputs(&[("in", json!("v"))]))
        .await
        .unwrap();

    assert_eq!(result.status_of("bad"), Some(NodeStatus::Error));
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.outputs["out"], json!({"fallback": "v"}));
}

#[tokio::test]
async fn missing_required_input_skips_instead_of_dispatching() {
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let seen = calls.clone();
    let mut registry = registry();
    registry.register(
        FnExecutor::new("merge", move |input, _| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(NodeOutput::value(input.value().unwrap_or(Value::Null)))
        })
        .with_required(&["left", "right"]),
    );

    let graph = Graph::new("req")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("bad", "boom"))
        .with_node(Node::new("m", "merge"))
        .connect("in", "bad")
        .with_edge(Edge::new("in", "m").to_handle("left"))
        .with_edge(Edge::new("bad", "m").to_handle("right"));

    let result = engine_with(registry, 4)
        .run(&graph, inputs(&[("in", json!(1))]))
        .await
        .unwrap();

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(
        result.node_states["m"].skip_reason,
        Some(SkipReason::UpstreamFailed)
    );
    assert_eq!(result.status, RunStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn cancelling_discards_in_flight_results_and_stops_dispatch() {
    let slow = ProbeExecutor::new("slow", Duration::from_secs(5));
    let after = ProbeExecutor::new("after", Duration::from_millis(1));
    let after_stats = after.stats();
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(slow);
    registry.register(after);

    let graph = Graph::new("cancel")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("A", "slow"))
        .with_node(Node::new("B", "after"))
        .connect("in", "A")
        .connect("A", "B");

    let engine = engine_with(registry, 4);
    let mut events = engine.subscribe();
    let handle = engine.start(&graph, inputs(&[("in", json!(1))])).unwrap();
    let run_id = handle.run_id().clone();

    // Wait for A to be dispatched
    loop {
        if let RunEvent::NodeStatusChanged { node_id, status, .. } = events.recv().await.unwrap() {
            if node_id == "A" && status == NodeStatus::Running {
                break;
            }
        }
    }
    assert!(engine.cancel(&run_id));
    let result = handle.join().await.unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.status_of("in"), Some(NodeStatus::Completed));
    assert_eq!(result.node_states["A"].skip_reason, Some(SkipReason::Cancelled));
    assert_eq!(result.output_of("A"), None);
    assert_eq!(result.node_states["B"].skip_reason, Some(SkipReason::Cancelled));
    assert_eq!(after_stats.calls(), 0);
    assert!(!engine.cancel(&run_id));
}

#[tokio::test]
async fn usage_rolls_up_into_run_totals() {
    let engine = Engine::builder()
        .with_model(Arc::new(MockModel::new(vec!["one", "two"]).with_usage(10, 0.25)))
        .build();
    let graph = Graph::new("llm")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("first", "llm"))
        .with_node(Node::new("second", "llm"))
        .with_node(Node::new("out", "output"))
        .connect("in", "first")
        .connect("first", "second")
        .connect("second", "out");

    let result = engine
        .run(&graph, inputs(&[("in", json!("hi"))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.node_states["first"].tokens, 10);
    assert_eq!(result.total_tokens, 20);
    assert!((result.total_cost_usd - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn panicking_executor_becomes_a_node_error() {
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(FnExecutor::new("explode", |_, _| panic!("kaboom")));
    let graph = Graph::new("panic")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("x", "explode"))
        .connect("in", "x");

    let result = engine_with(registry, 1)
        .run(&graph, inputs(&[("in", json!(1))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.node_states["x"]
        .error
        .as_deref()
        .unwrap()
        .contains("kaboom"));
}

#[tokio::test]
async fn declared_variables_take_defaults_or_fail_validation() {
    use weft_engine::Variable;

    let graph = Graph::new("vars")
        .with_node(Node::new("topic", "input"))
        .with_node(Node::new("out", "output"))
        .connect("topic", "out")
        .with_variable(Variable::optional("topic", json!("rust")));
    let result = Engine::new().run(&graph, HashMap::new()).await.unwrap();
    assert_eq!(result.outputs["out"], json!("rust"));

    let strict = graph.clone().with_variable(Variable::required("audience"));
    let err = Engine::new().run(&strict, HashMap::new()).await.unwrap_err();
    assert!(err
        .issues()
        .contains(&ValidationIssue::MissingVariable("audience".into())));
}

#[tokio::test]
async fn run_events_bracket_the_run() {
    let engine = Engine::new();
    let mut events = engine.subscribe();
    let graph = Graph::new("ev")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("out", "output"))
        .connect("in", "out");
    let result = engine
        .run(&graph, inputs(&[("in", json!(1))]))
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            RunEvent::RunStarted { .. } => "started",
            RunEvent::RunFinished { run_id, .. } => {
                assert_eq!(run_id, result.run_id);
                "finished"
            }
            RunEvent::NodeStatusChanged { .. } => "node",
            _ => "other",
        });
    }
    assert_eq!(kinds.first(), Some(&"started"));
    assert_eq!(kinds.last(), Some(&"finished"));
    // in and out each go running -> completed
    assert_eq!(kinds.iter().filter(|k| **k == "node").count(), 4);
}
