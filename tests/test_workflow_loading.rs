mod common;

use std::collections::HashMap;

use serde_json::json;
use workflow_interpreter::api::graph_dto::GraphDto;
use workflow_interpreter::domain::graph::graph::WorkflowGraph;
use workflow_interpreter::domain::graph::node::{NodeKind, NodeState};
use workflow_interpreter::domain::graph::port::PortDirection;
use workflow_interpreter::domain::interpreter::config::ForEachPolicy;
use workflow_interpreter::domain::interpreter::scheduler::WorkflowInterpreter;
use workflow_interpreter::error::{Error, InterpreterError};
use workflow_interpreter::loader::parser::parse_json_str;
use workflow_interpreter::{load_config, load_workflow};

use common::harness;

const COVERAGE_WORKFLOW: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/data/workflows/coverage.json");
const INTERPRETER_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/data/config/interpreter.json");

fn build(json: &str) -> workflow_interpreter::error::Result<WorkflowGraph> {
    let dto: GraphDto = parse_json_str(json)?;
    WorkflowGraph::from_dto(dto)
}

#[test]
fn test_load_workflow_from_file() {
    let graph = load_workflow(COVERAGE_WORKFLOW).unwrap();

    assert_eq!(graph.name, "coverage");
    assert_eq!(graph.len(), 8);

    let fan = graph.node_key_by_str("fan").unwrap();
    assert!(matches!(graph.node(fan).unwrap().kind, NodeKind::ForEach));
    assert!(graph.port_by_name(fan, PortDirection::DataIn, "lanes").is_some());
    assert!(graph.port_by_name(fan, PortDirection::DataOut, "depth").is_some());

    let score = graph.node_key_by_str("score").unwrap();
    assert!(matches!(&graph.node(score).unwrap().kind, NodeKind::ServiceInvocation { service } if service == "sum"));
    assert_eq!(graph.successors(score), vec![graph.node_key_by_str("join").unwrap()]);

    for (_, node) in graph.nodes() {
        assert_eq!(node.state, NodeState::Waiting, "{}", node.id);
    }
}

#[test]
fn test_load_config_from_file() {
    let config = load_config(INTERPRETER_CONFIG).unwrap();

    assert_eq!(config.poll_interval.as_millis(), 1);
    assert_eq!(config.for_each_policy, ForEachPolicy::Zipped);
    assert_eq!(config.max_parallel_runs, 4);
    assert_eq!(config.handler_grace_period.as_millis(), 500);
}

#[test]
fn test_missing_file_is_an_io_error() {
    assert!(matches!(load_workflow("does/not/exist.json"), Err(Error::IoError(_))));
}

#[test]
fn test_unknown_node_kind_is_rejected() {
    let result = build(r#"{ "name": "bad", "nodes": [{ "id": "x", "kind": "teleport" }] }"#);

    assert!(matches!(result, Err(Error::Interpreter(InterpreterError::UnknownNodeKind(kind))) if kind == "teleport"));
}

#[test]
fn test_service_node_without_service_is_rejected() {
    let result = build(r#"{ "name": "bad", "nodes": [{ "id": "x", "kind": "service" }] }"#);

    assert!(matches!(result, Err(Error::GraphConstructionError(_))));
}

#[test]
fn test_edge_to_unknown_port_is_rejected() {
    let result = build(
        r#"{
            "name": "bad",
            "nodes": [
                { "id": "a", "kind": "constant", "value": 1, "dataOut": [{ "name": "value" }] },
                { "id": "b", "kind": "output", "dataIn": [{ "name": "value" }] }
            ],
            "edges": [{ "from": { "node": "a", "port": "value" }, "to": { "node": "b", "port": "missing" } }]
        }"#,
    );

    assert!(matches!(result, Err(Error::GraphConstructionError(message)) if message.contains("missing")));
}

#[test]
fn test_if_gets_true_and_false_control_outs() {
    let graph = build(
        r#"{
            "name": "gate",
            "nodes": [
                { "id": "check", "kind": "if", "expression": "$0 > 1", "dataIn": [{ "name": "value" }] },
                { "id": "then", "kind": "service", "service": "echo", "controlIn": true }
            ],
            "edges": [{ "from": { "node": "check", "port": "true" }, "to": { "node": "then", "port": "control" } }]
        }"#,
    )
    .unwrap();

    let check = graph.node_key_by_str("check").unwrap();
    assert!(graph.port_by_name(check, PortDirection::ControlOut, "true").is_some());
    assert!(graph.port_by_name(check, PortDirection::ControlOut, "false").is_some());
    assert_eq!(graph.successors(check), vec![graph.node_key_by_str("then").unwrap()]);
}

#[test]
fn test_nested_sub_workflow_is_built() {
    let graph = build(
        r#"{
            "name": "outer",
            "nodes": [{
                "id": "child",
                "kind": "subWorkflow",
                "dataIn": [{ "name": "x" }],
                "dataOut": [{ "name": "y" }],
                "subWorkflow": {
                    "name": "inner",
                    "nodes": [
                        { "id": "x", "kind": "input", "dataOut": [{ "name": "value" }] },
                        { "id": "y", "kind": "output", "dataIn": [{ "name": "value" }] }
                    ],
                    "edges": [{ "from": { "node": "x", "port": "value" }, "to": { "node": "y", "port": "value" } }]
                }
            }]
        }"#,
    )
    .unwrap();

    let child = graph.node_key_by_str("child").unwrap();
    match &graph.node(child).unwrap().kind {
        NodeKind::SubWorkflow { graph: inner } => assert_eq!(inner.len(), 2),
        other => panic!("expected a sub-workflow, got {:?}", other),
    }
}

#[tokio::test]
async fn test_loaded_workflow_runs_to_completion() {
    let graph = load_workflow(COVERAGE_WORKFLOW).unwrap();
    let config = load_config(INTERPRETER_CONFIG).unwrap();
    let harness = harness();

    let outcome = WorkflowInterpreter::new(graph, harness.services.clone(), config).run(HashMap::from([("depth".to_string(), json!(100))])).await.unwrap();

    assert!(outcome.is_completed(), "errors: {:?}", outcome.errors);
    assert_eq!(outcome.output("result"), Some(&json!(306)));
    assert_eq!(outcome.node_states["note"], NodeState::Waiting);
    assert_eq!(harness.simulator.submissions().len(), 4);
}
