use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use weft_core::config::ErrorPolicy;
use weft_core::error::{ValidationIssue, WeftError};
use weft_core::types::{LiveStopReason, NodeOutput, RunEvent, RunStatus};
use weft_engine::{Engine, Graph, LiveMode, LiveOptions, Node, Variable};
use weft_nodes::ExecutorRegistry;
use weft_test_utils::{FnExecutor, MockModel};

fn inputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn echo() -> Graph {
    Graph::new("echo")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("out", "output"))
        .connect("in", "out")
}

fn continuous(max_passes: u64) -> LiveOptions {
    LiveOptions {
        mode: LiveMode::Continuous {
            interval: Duration::from_secs(1),
        },
        max_passes,
        ..LiveOptions::default()
    }
}

fn triggered() -> LiveOptions {
    LiveOptions {
        mode: LiveMode::Triggered,
        max_passes: 0,
        ..LiveOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn continuous_run_stops_at_max_passes() {
    let engine = Engine::builder()
        .with_model(Arc::new(MockModel::new(vec!["a", "b", "c"]).with_usage(5, 0.1)))
        .build();
    let graph = Graph::new("poll")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("ask", "llm"))
        .with_node(Node::new("out", "output"))
        .connect("in", "ask")
        .connect("ask", "out");
    let mut events = engine.subscribe();

    let handle = engine
        .start_live(&graph, inputs(&[("in", json!("status?"))]), continuous(3))
        .unwrap();
    let live_id = handle.live_id().to_string();
    let summary = handle.join().await.unwrap();

    assert_eq!(summary.live_id, live_id);
    assert_eq!(summary.passes, 3);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.total_tokens, 15);
    assert_eq!(summary.reason, LiveStopReason::MaxPasses);
    assert!(!engine.is_live("poll"));

    let mut passes = Vec::new();
    let mut stopped = None;
    while let Ok(event) = events.try_recv() {
        match event {
            RunEvent::LivePassCompleted {
                live_id: id,
                pass,
                status,
                tokens,
                ..
            } => {
                assert_eq!(id, live_id);
                assert_eq!(status, RunStatus::Completed);
                assert_eq!(tokens, 5);
                passes.push(pass);
            }
            RunEvent::LiveStopped { passes, reason, .. } => stopped = Some((passes, reason)),
            _ => {}
        }
    }
    assert_eq!(passes, vec![1, 2, 3]);
    assert_eq!(stopped, Some((3, LiveStopReason::MaxPasses)));
}

#[tokio::test(start_paused = true)]
async fn one_live_run_per_workflow() {
    let engine = Engine::new();
    let first = engine
        .start_live(&echo(), inputs(&[("in", json!(1))]), continuous(0))
        .unwrap();
    assert!(engine.is_live("echo"));

    let err = engine
        .start_live(&echo(), inputs(&[("in", json!(1))]), continuous(0))
        .err()
        .unwrap();
    assert!(matches!(err, WeftError::LiveRunActive(id) if id == "echo"));

    first.stop();
    let summary = first.join().await.unwrap();
    assert_eq!(summary.reason, LiveStopReason::UserStopped);
    assert!(!engine.is_live("echo"));

    // The slot is free again
    let again = engine
        .start_live(&echo(), inputs(&[("in", json!(2))]), continuous(1))
        .unwrap();
    assert_eq!(again.join().await.unwrap().passes, 1);
}

#[tokio::test]
async fn triggered_passes_layer_fired_inputs_over_the_base() {
    let engine = Engine::new();
    let mut events = engine.subscribe();
    let mut handle = engine
        .start_live(&echo(), inputs(&[("in", json!("base"))]), triggered())
        .unwrap();

    handle.fire(HashMap::new()).await.unwrap();
    handle.fire(inputs(&[("in", json!("fired"))])).await.unwrap();
    handle.close_trigger();
    let summary = handle.join().await.unwrap();

    assert_eq!(summary.passes, 2);
    assert_eq!(summary.reason, LiveStopReason::TriggerClosed);

    let mut outputs = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RunEvent::LivePassCompleted { output_summary, .. } = event {
            outputs.push(output_summary);
        }
    }
    assert_eq!(outputs, vec!["base", "fired"]);
}

#[tokio::test]
async fn fire_is_refused_in_continuous_mode() {
    let engine = Engine::new();
    let handle = engine
        .start_live(&echo(), inputs(&[("in", json!(1))]), continuous(1))
        .unwrap();
    let err = handle.fire(HashMap::new()).await.unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
    handle.join().await.unwrap();
}

fn always_failing() -> (Engine, Graph) {
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(FnExecutor::failing("broken", "upstream down"));
    let graph = Graph::new("broken")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("step", "broken"))
        .with_node(Node::new("out", "output"))
        .connect("in", "step")
        .connect("step", "out");
    (Engine::builder().with_registry(registry).build(), graph)
}

#[tokio::test(start_paused = true)]
async fn stop_policy_ends_on_first_failure() {
    let (engine, graph) = always_failing();
    let options = LiveOptions {
        error_policy: ErrorPolicy::Stop,
        ..continuous(10)
    };
    let summary = engine
        .start_live(&graph, inputs(&[("in", json!(1))]), options)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(summary.passes, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.reason, LiveStopReason::ErrorPolicy);
}

#[tokio::test(start_paused = true)]
async fn skip_policy_stops_after_consecutive_failures() {
    let (engine, graph) = always_failing();
    let options = LiveOptions {
        error_policy: ErrorPolicy::Skip,
        max_consecutive_errors: 3,
        ..continuous(10)
    };
    let summary = engine
        .start_live(&graph, inputs(&[("in", json!(1))]), options)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(summary.passes, 3);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.reason, LiveStopReason::ConsecutiveErrors);
}

#[tokio::test(start_paused = true)]
async fn a_success_resets_the_error_streak() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let mut registry = ExecutorRegistry::with_builtins();
    // Only the second pass succeeds
    registry.register(FnExecutor::new("flaky", move |input, ctx| {
        if seen.fetch_add(1, Ordering::SeqCst) == 1 {
            Ok(NodeOutput::value(input.value().unwrap_or(Value::Null)))
        } else {
            Err(ctx.fail("flaked"))
        }
    }));
    let graph = Graph::new("flaky")
        .with_node(Node::new("in", "input"))
        .with_node(Node::new("step", "flaky"))
        .connect("in", "step");
    let options = LiveOptions {
        max_consecutive_errors: 2,
        ..continuous(10)
    };

    let summary = Engine::builder()
        .with_registry(registry)
        .build()
        .start_live(&graph, inputs(&[("in", json!(1))]), options)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(summary.passes, 4);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.reason, LiveStopReason::ConsecutiveErrors);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn invalid_workflow_is_rejected_before_any_pass() {
    let engine = Engine::new();
    let err = engine
        .start_live(&Graph::new("empty"), HashMap::new(), continuous(1))
        .err()
        .unwrap();
    assert!(err.issues().contains(&ValidationIssue::EmptyGraph));

    let needs_topic = echo().with_variable(Variable::required("topic"));
    let err = engine
        .start_live(&needs_topic, HashMap::new(), continuous(1))
        .err()
        .unwrap();
    assert!(err
        .issues()
        .contains(&ValidationIssue::MissingVariable("topic".into())));
    assert!(!engine.is_live("echo"));
}

#[tokio::test]
async fn stopping_a_triggered_run_while_idle() {
    let engine = Engine::new();
    let handle = engine
        .start_live(&echo(), inputs(&[("in", json!(1))]), triggered())
        .unwrap();
    handle.stop();
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.passes, 0);
    assert_eq!(summary.reason, LiveStopReason::UserStopped);
}
