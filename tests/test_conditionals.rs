mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use workflow_interpreter::domain::graph::graph::WorkflowGraph;
use workflow_interpreter::domain::graph::node::{NodeKind, NodeState};
use workflow_interpreter::domain::interpreter::scheduler::WorkflowInterpreter;
use workflow_interpreter::domain::services::event_bus::TaskOutput;
use workflow_interpreter::domain::utils::id::NodeId;

use common::{ScriptedEvaluator, fast_config, gate, harness, service, wire};

/// value -> If($0 > 3) -> {big | small} -> EndIf -> Output "label"
fn branching(threshold_value: i64) -> WorkflowGraph {
    let mut graph = WorkflowGraph::new("branching");
    let value = graph.add_node("value", NodeKind::Constant { value: json!(threshold_value) }).unwrap();
    let check = graph.add_node("check", NodeKind::If { expression: "$0 > 3".to_string() }).unwrap();
    graph.add_control_out(check, "true").unwrap();
    graph.add_control_out(check, "false").unwrap();
    let big_label = graph.add_node("big_label", NodeKind::Constant { value: json!("big") }).unwrap();
    let small_label = graph.add_node("small_label", NodeKind::Constant { value: json!("small") }).unwrap();
    let big = graph.add_node("big", service("echo")).unwrap();
    let small = graph.add_node("small", service("echo")).unwrap();
    let merge = graph.add_node("merge", NodeKind::EndIf).unwrap();
    let label = graph.add_node("label", NodeKind::Output).unwrap();

    wire(&mut graph, value, "value", check, "value");
    gate(&mut graph, check, "true", big);
    gate(&mut graph, check, "false", small);
    wire(&mut graph, big_label, "value", big, "text");
    wire(&mut graph, small_label, "value", small, "text");
    wire(&mut graph, big, "text", merge, "from_big");
    wire(&mut graph, small, "text", merge, "from_small");
    graph.add_data_out(merge, "text").unwrap();
    wire(&mut graph, merge, "text", label, "value");
    graph
}

#[tokio::test]
async fn test_if_runs_only_the_taken_branch() {
    let harness = harness();
    let interpreter = WorkflowInterpreter::new(branching(5), harness.services.clone(), fast_config());

    let outcome = interpreter.run(HashMap::new()).await.unwrap();

    assert!(outcome.is_completed(), "errors: {:?}", outcome.errors);
    assert_eq!(outcome.output("label"), Some(&json!("big")));
    assert_eq!(outcome.node_states["big"], NodeState::Finished);
    assert_eq!(outcome.node_states["small"], NodeState::Waiting);
    assert_eq!(outcome.node_states["merge"], NodeState::Finished);
    assert_eq!(harness.simulator.submissions().len(), 1);
}

#[tokio::test]
async fn test_if_false_takes_the_other_branch() {
    let harness = harness();
    let interpreter = WorkflowInterpreter::new(branching(2), harness.services.clone(), fast_config());

    let outcome = interpreter.run(HashMap::new()).await.unwrap();

    assert_eq!(outcome.output("label"), Some(&json!("small")));
    assert_eq!(outcome.node_states["big"], NodeState::Waiting);
}

#[tokio::test]
async fn test_end_if_with_both_branches_fired_fails_the_workflow() {
    // Both branches run unconditionally, so the merge sees two fired slots.
    let mut graph = WorkflowGraph::new("double");
    let left = graph.add_node("left", NodeKind::Constant { value: json!(1) }).unwrap();
    let right = graph.add_node("right", NodeKind::Constant { value: json!(2) }).unwrap();
    let merge = graph.add_node("merge", NodeKind::EndIf).unwrap();
    wire(&mut graph, left, "value", merge, "a");
    wire(&mut graph, right, "value", merge, "b");
    graph.add_data_out(merge, "value").unwrap();

    let harness = harness();
    let outcome = WorkflowInterpreter::new(graph, harness.services.clone(), fast_config()).run(HashMap::new()).await.unwrap();

    assert!(!outcome.is_completed());
    assert_eq!(outcome.node_states["merge"], NodeState::Failed);
    assert!(outcome.errors.iter().any(|error| error.is_structural()));
}

/// start -> DoWhile -> count -> EndDoWhile -> Output "total"
fn counting_loop(expression: &str) -> WorkflowGraph {
    let mut graph = WorkflowGraph::new("loop");
    let start = graph.add_node("start", NodeKind::Constant { value: json!(0) }).unwrap();
    let repeat = graph.add_node("repeat", NodeKind::DoWhile { expression: expression.to_string() }).unwrap();
    let count = graph.add_node("count", service("counter")).unwrap();
    let done = graph.add_node("done", NodeKind::EndDoWhile).unwrap();
    let total = graph.add_node("total", NodeKind::Output).unwrap();

    wire(&mut graph, start, "value", repeat, "seed");
    graph.add_data_out(repeat, "seed").unwrap();
    wire(&mut graph, repeat, "seed", count, "seed");
    wire(&mut graph, count, "n", done, "n");
    graph.add_data_out(done, "n").unwrap();
    wire(&mut graph, done, "n", total, "value");
    graph
}

fn register_counter(harness: &common::Harness) -> Arc<AtomicUsize> {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    harness.simulator.register("counter", move |payload| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(payload.output_names.iter().map(|name| TaskOutput { name: name.clone(), value: json!(n) }).collect())
    });
    runs
}

#[tokio::test]
async fn test_do_while_runs_body_until_condition_is_false() {
    let evaluator = Arc::new(ScriptedEvaluator::new(&[true, true, false]));
    let harness = harness();
    let runs = register_counter(&harness);
    let services = harness.services.clone().with_evaluator(evaluator.clone());

    let outcome = WorkflowInterpreter::new(counting_loop("$0 < 3"), services, fast_config()).run(HashMap::new()).await.unwrap();

    assert!(outcome.is_completed(), "errors: {:?}", outcome.errors);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.output("total"), Some(&json!(3)));
    assert_eq!(evaluator.calls(), vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]]);
    assert_eq!(outcome.node_states["repeat"], NodeState::Finished);
    assert_eq!(outcome.node_states["done"], NodeState::Finished);

    // Every iteration of the body is its own catalog instance.
    assert_eq!(harness.catalog.instances_of(&NodeId::new("count")).len(), 3);
}

#[tokio::test]
async fn test_do_while_with_expression_evaluator() {
    let harness = harness();
    let runs = register_counter(&harness);

    let outcome = WorkflowInterpreter::new(counting_loop("$0 < 5"), harness.services.clone(), fast_config()).run(HashMap::new()).await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 5);
    assert_eq!(outcome.output("total"), Some(&json!(5)));
}

#[tokio::test]
async fn test_do_while_iteration_cap() {
    let harness = harness();
    let runs = register_counter(&harness);
    let mut config = fast_config();
    config.max_loop_iterations = Some(4);

    let outcome = WorkflowInterpreter::new(counting_loop("true"), harness.services.clone(), config).run(HashMap::new()).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.output("total"), Some(&json!(4)));
}

#[tokio::test]
async fn test_do_while_body_failure_fails_the_loop() {
    let harness = harness();
    harness.simulator.register("counter", |_| Err("disk full".to_string()));

    let outcome = WorkflowInterpreter::new(counting_loop("true"), harness.services.clone(), fast_config()).run(HashMap::new()).await.unwrap();

    assert!(!outcome.is_completed());
    assert_eq!(outcome.node_states["repeat"], NodeState::Failed);
    assert_eq!(outcome.node_states["count"], NodeState::Failed);
    assert_eq!(outcome.node_states["total"], NodeState::Waiting);
}
