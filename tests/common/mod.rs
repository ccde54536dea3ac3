#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use workflow_interpreter::domain::graph::graph::{NodeKey, WorkflowGraph};
use workflow_interpreter::domain::graph::node::NodeKind;
use workflow_interpreter::domain::graph::port::PortDirection;
use workflow_interpreter::domain::interpreter::config::InterpreterConfig;
use workflow_interpreter::domain::services::InterpreterServices;
use workflow_interpreter::domain::services::catalog::InMemoryCatalog;
use workflow_interpreter::domain::services::evaluator::{ExpressionError, PredicateEvaluator};
use workflow_interpreter::domain::services::event_bus::InMemoryEventBus;
use workflow_interpreter::domain::services::status_publisher::{PublishError, StatusEvent, StatusPublisher};
use workflow_interpreter::domain::simulator::task_simulator::SimulatedTaskService;

/// Answers conditions from a fixed script, then `false` once it runs out.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    script: Mutex<VecDeque<bool>>,
    calls: Mutex<Vec<Vec<Value>>>,
}

impl ScriptedEvaluator {
    pub fn new(script: &[bool]) -> Self {
        ScriptedEvaluator { script: Mutex::new(script.iter().copied().collect()), calls: Mutex::new(Vec::new()) }
    }

    /// The inputs of every evaluation, in order.
    pub fn calls(&self) -> Vec<Vec<Value>> {
        self.calls.lock().unwrap().clone()
    }
}

impl PredicateEvaluator for ScriptedEvaluator {
    fn evaluate(&self, _expression: &str, inputs: &[Value]) -> Result<bool, ExpressionError> {
        self.calls.lock().unwrap().push(inputs.to_vec());
        Ok(self.script.lock().unwrap().pop_front().unwrap_or(false))
    }
}

#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl StatusPublisher for RecordingPublisher {
    fn publish(&self, event: StatusEvent) -> Result<(), PublishError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Simulated execution service with all in-memory collaborators, kept
/// accessible for assertions.
pub struct Harness {
    pub simulator: SimulatedTaskService,
    pub catalog: Arc<InMemoryCatalog>,
    pub publisher: Arc<RecordingPublisher>,
    pub event_bus: Arc<InMemoryEventBus>,
    pub services: InterpreterServices,
}

pub fn harness() -> Harness {
    harness_with_latency(Duration::from_millis(2))
}

pub fn harness_with_latency(latency: Duration) -> Harness {
    let event_bus = Arc::new(InMemoryEventBus::new());
    let simulator = SimulatedTaskService::new(event_bus.clone()).with_latency(latency);
    let catalog = Arc::new(InMemoryCatalog::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let services = InterpreterServices::new(Arc::new(simulator.clone()), event_bus.clone()).with_catalog(catalog.clone()).with_publisher(publisher.clone());
    Harness { simulator, catalog, publisher, event_bus, services }
}

pub fn fast_config() -> InterpreterConfig {
    InterpreterConfig {
        poll_interval: Duration::from_millis(1),
        pause_backoff_initial: Duration::from_millis(1),
        pause_backoff_max: Duration::from_millis(20),
        handler_grace_period: Duration::from_millis(500),
        ..InterpreterConfig::default()
    }
}

pub fn service(service: &str) -> NodeKind {
    NodeKind::ServiceInvocation { service: service.to_string() }
}

/// Connects `from.from_port` to `to.to_port`, creating both data ports.
pub fn wire(graph: &mut WorkflowGraph, from: NodeKey, from_port: &str, to: NodeKey, to_port: &str) {
    let out = match graph.port_by_name(from, PortDirection::DataOut, from_port) {
        Some(port) => port,
        None => graph.add_data_out(from, from_port).unwrap(),
    };
    let input = graph.add_data_in(to, to_port).unwrap();
    graph.connect(out, input).unwrap();
}

/// Connects a control-out of `from` to the control-in of `to`, creating the ports as needed.
pub fn gate(graph: &mut WorkflowGraph, from: NodeKey, control_out: &str, to: NodeKey) {
    let out = match graph.port_by_name(from, PortDirection::ControlOut, control_out) {
        Some(port) => port,
        None => graph.add_control_out(from, control_out).unwrap(),
    };
    let input = match graph.node(to).and_then(|node| node.control_in) {
        Some(port) => port,
        None => graph.add_control_in(to).unwrap(),
    };
    graph.connect(out, input).unwrap();
}
