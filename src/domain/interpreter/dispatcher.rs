use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::domain::graph::graph::{NodeKey, WorkflowGraph};
use crate::domain::graph::node::{NodeKind, NodeState};
use crate::domain::interpreter::awaiting_tasks::{AwaitKey, AwaitingTaskTable, TaskOutcome};
use crate::domain::interpreter::output_store::OutputStore;
use crate::domain::services::InterpreterServices;
use crate::domain::services::status_publisher::{NodeStatus, StatusEvent, WorkflowStatus};
use crate::domain::services::task_service::{TaskInput, TaskPayload};
use crate::domain::utils::id::{NodeId, NodeInstanceId, TaskId, WorkflowId};
use crate::error::InterpreterError;
use crate::logger::ANALYTICS_TARGET;

pub type SharedGraph = Arc<RwLock<WorkflowGraph>>;

/// Submits nodes to the execution service and owns every node state change.
///
/// Each transition is mirrored to the catalog and published to observers.
/// Both are best effort: failures are logged and never propagate.
///
/// Lock order is awaiting table -> graph -> output store. No lock is held
/// across an `.await`.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    workflow_id: WorkflowId,
    graph: SharedGraph,
    store: OutputStore,
    awaiting: AwaitingTaskTable,
    services: InterpreterServices,
    credential_token: String,
}

impl TaskDispatcher {
    pub fn new(
        workflow_id: WorkflowId,
        graph: SharedGraph,
        store: OutputStore,
        awaiting: AwaitingTaskTable,
        services: InterpreterServices,
        credential_token: String,
    ) -> Self {
        TaskDispatcher { workflow_id, graph, store, awaiting, services, credential_token }
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    pub fn awaiting(&self) -> &AwaitingTaskTable {
        &self.awaiting
    }

    pub fn services(&self) -> &InterpreterServices {
        &self.services
    }

    pub fn node_name(&self, key: NodeKey) -> String {
        self.graph.read().expect("RwLock poisoned").node_name(key)
    }

    /// Fire-and-forget submission of a task node. The node is Executing on
    /// return, completion arrives later through the completion listener.
    pub fn dispatch(&self, key: NodeKey) -> Result<TaskId, InterpreterError> {
        self.begin(key)?;
        self.submit(AwaitKey::node(key), None, None, None).inspect_err(|_| self.fail_node(key))
    }

    /// Dispatches `key` and waits for the outcome of that single invocation.
    pub async fn invoke(&self, key: NodeKey) -> Result<HashMap<String, Value>, InterpreterError> {
        let (sender, receiver) = oneshot::channel();
        self.begin(key)?;
        if let Err(e) = self.submit(AwaitKey::node(key), None, None, Some(sender)) {
            self.fail_node(key);
            return Err(e);
        }
        self.await_outcome(key, receiver).await
    }

    /// Submits one fan-out run of a ForEach body with explicit inputs and waits
    /// for its outcome. The body's node state is left to the ForEach handler.
    pub async fn invoke_run(&self, key: NodeKey, iteration: usize, iteration_key: String, inputs: Vec<Value>) -> Result<HashMap<String, Value>, InterpreterError> {
        let (sender, receiver) = oneshot::channel();
        self.submit(AwaitKey::run(key, iteration), Some(iteration_key), Some(inputs), Some(sender))?;
        self.await_outcome(key, receiver).await
    }

    async fn await_outcome(&self, key: NodeKey, receiver: oneshot::Receiver<TaskOutcome>) -> Result<HashMap<String, Value>, InterpreterError> {
        match receiver.await {
            Ok(TaskOutcome::Finished(outputs)) => Ok(outputs),
            Ok(TaskOutcome::Failed(reason)) => Err(InterpreterError::TaskFailed { node: self.node_name(key), reason }),
            Err(_) => Err(InterpreterError::TaskFailed { node: self.node_name(key), reason: "Task was abandoned before it completed".to_string() }),
        }
    }

    fn submit(
        &self,
        slot: AwaitKey,
        iteration_key: Option<String>,
        inputs: Option<Vec<Value>>,
        waiter: Option<oneshot::Sender<TaskOutcome>>,
    ) -> Result<TaskId, InterpreterError> {
        let payload = self.build_payload(slot, iteration_key, inputs)?;
        let task_id = TaskId::generate();

        if !self.awaiting.insert(task_id.clone(), slot, waiter) {
            return Err(InterpreterError::AlreadyInFlight { node: payload.node_id.to_string() });
        }

        log::debug!("Submitting task {} for node {} (service '{}', run {:?}).", task_id, payload.node_id, payload.service, slot.iteration);

        let dispatcher = self.clone();
        let submitted = task_id.clone();
        tokio::spawn(async move {
            let task_service = dispatcher.services.task_service.clone();
            if let Err(e) = task_service.submit_task(&submitted, &dispatcher.credential_token, payload).await {
                // A completion may have raced the rejection; only settle if still awaited.
                if let Some((slot, waiter)) = dispatcher.awaiting.remove(&submitted) {
                    dispatcher.settle_failure(slot, waiter, e.to_string());
                }
            }
        });

        Ok(task_id)
    }

    fn build_payload(&self, slot: AwaitKey, iteration_key: Option<String>, inputs: Option<Vec<Value>>) -> Result<TaskPayload, InterpreterError> {
        let graph = self.graph.read().expect("RwLock poisoned");
        let node = graph.node(slot.node).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", slot.node)))?;

        let values = inputs.unwrap_or_else(|| self.store.resolve_inputs(&graph, slot.node));
        let inputs = node
            .data_in
            .iter()
            .enumerate()
            .filter_map(|(index, key)| {
                let port = graph.port(*key)?;
                Some(TaskInput { name: port.name.clone(), value_type: port.value_type, value: values.get(index).cloned().unwrap_or(Value::Null) })
            })
            .collect();
        let output_names = node.data_out.iter().filter_map(|key| graph.port_name(*key).map(str::to_string)).collect();
        let resource_action = match &node.kind {
            NodeKind::ResourceLifecycle { action, .. } => Some(*action),
            _ => None,
        };

        Ok(TaskPayload {
            workflow_id: self.workflow_id.clone(),
            node_id: node.id.clone(),
            service: node.kind.service().unwrap_or(&node.name).to_string(),
            inputs,
            output_names,
            resource_action,
            iteration: slot.iteration,
            iteration_key,
        })
    }

    /// Failure of a submitted task: fails the node of a plain slot and wakes the waiter.
    pub(crate) fn settle_failure(&self, slot: AwaitKey, waiter: Option<oneshot::Sender<TaskOutcome>>, reason: String) {
        tracing::warn!("Task for node {} (run {:?}) failed: {}", self.node_name(slot.node), slot.iteration, reason);
        if slot.iteration.is_none() {
            self.fail_node(slot.node);
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(TaskOutcome::Failed(reason));
        }
    }

    /// `Waiting -> Executing`, creating the catalog instance on the first dispatch.
    pub fn begin(&self, key: NodeKey) -> Result<(), InterpreterError> {
        self.ensure_instance(key);
        self.mark_state(key, NodeState::Executing).map(|_| ())
    }

    /// Marks a node Failed. A node that already left Executing is only logged.
    pub fn fail_node(&self, key: NodeKey) {
        if let Err(e) = self.mark_state(key, NodeState::Failed) {
            tracing::warn!("Could not mark node as failed: {}", e);
        }
    }

    /// Applies a validated node transition and mirrors it.
    ///
    /// # Returns
    /// The previous state.
    pub fn mark_state(&self, key: NodeKey, next: NodeState) -> Result<NodeState, InterpreterError> {
        let (node_id, kind, instance_id, previous) = {
            let mut graph = self.graph.write().expect("RwLock poisoned");
            let previous = graph.transition(key, next)?;
            let node = graph.node(key).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", key)))?;
            (node.id.clone(), node.kind.label(), node.instance_id.clone(), previous)
        };

        tracing::info!(
            target: ANALYTICS_TARGET,
            Workflow = %self.workflow_id,
            Node = %node_id,
            Kind = kind,
            From = ?previous,
            To = ?next,
            "Node transition"
        );

        if let Some(instance_id) = &instance_id {
            if let Err(e) = self.services.catalog.update_node_status(instance_id, next) {
                tracing::warn!("Failed to record state {:?} of node {} in the catalog: {}", next, node_id, e);
            }
        }
        if let Some(status) = NodeStatus::from_state(next) {
            self.publish_node_status(&node_id, instance_id, status);
        }

        Ok(previous)
    }

    /// Stores produced values and mirrors them to the node's catalog instance.
    pub fn record_outputs(&self, key: NodeKey, outputs: &HashMap<String, Value>) {
        let instance_id = self.graph.read().expect("RwLock poisoned").node(key).and_then(|node| node.instance_id.clone());

        for (port, value) in outputs {
            self.store.put(key, port, value.clone());
        }

        if let Some(instance_id) = instance_id {
            for (port, value) in outputs {
                if let Err(e) = self.services.catalog.add_node_output(&instance_id, port, value) {
                    tracing::warn!("Failed to record output '{}' in the catalog: {}", port, e);
                }
            }
        }
    }

    pub fn publish_node_status(&self, node_id: &NodeId, instance_id: Option<NodeInstanceId>, status: NodeStatus) {
        let event = StatusEvent::Node { workflow_id: self.workflow_id.clone(), node_id: node_id.clone(), instance_id, status };
        if let Err(e) = self.services.publisher.publish(event) {
            tracing::warn!("Failed to publish status {:?} of node {}: {}", status, node_id, e);
        }
    }

    pub fn publish_workflow_status(&self, status: WorkflowStatus) {
        let event = StatusEvent::Workflow { workflow_id: self.workflow_id.clone(), status };
        if let Err(e) = self.services.publisher.publish(event) {
            tracing::warn!("Failed to publish workflow status {:?}: {}", status, e);
        }
    }

    fn ensure_instance(&self, key: NodeKey) {
        let node_id = {
            let graph = self.graph.read().expect("RwLock poisoned");
            match graph.node(key) {
                Some(node) if node.instance_id.is_none() => node.id.clone(),
                _ => return,
            }
        };

        match self.services.catalog.create_node_instance(&self.workflow_id, &node_id) {
            Ok(instance_id) => self.graph.write().expect("RwLock poisoned").set_instance_id(key, instance_id),
            Err(e) => tracing::warn!("Failed to create catalog instance for node {}: {}", node_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::domain::services::status_publisher::LogStatusPublisher;
    use crate::domain::interpreter::testing::{FailingPublisher, RecordingTaskService, dispatcher_for};

    fn single_service() -> (WorkflowGraph, NodeKey) {
        let mut graph = WorkflowGraph::new("single");
        let key = graph.add_node("align", NodeKind::ServiceInvocation { service: "bwa".to_string() }).unwrap();
        graph.add_data_out(key, "bam").unwrap();
        (graph, key)
    }

    #[test]
    #[traced_test]
    fn test_publish_failure_is_logged_and_swallowed() {
        let (graph, key) = single_service();
        let dispatcher = dispatcher_for(graph, RecordingTaskService::accepting(), Arc::new(FailingPublisher));

        dispatcher.begin(key).unwrap();

        assert_eq!(dispatcher.graph().read().unwrap().state(key), Some(NodeState::Executing));
        assert!(logs_contain("Failed to publish status Executing"));
    }

    #[tokio::test]
    async fn test_dispatch_resolves_inputs_in_port_order() {
        let mut graph = WorkflowGraph::new("ordered");
        let first = graph.add_node("first", NodeKind::Constant { value: json!("a") }).unwrap();
        let second = graph.add_node("second", NodeKind::Constant { value: json!("b") }).unwrap();
        let join = graph.add_node("join", NodeKind::ServiceInvocation { service: "concat".to_string() }).unwrap();
        let first_out = graph.add_data_out(first, "value").unwrap();
        let second_out = graph.add_data_out(second, "value").unwrap();
        let x = graph.add_data_in(join, "x").unwrap();
        let y = graph.add_data_in(join, "y").unwrap();
        graph.add_data_out(join, "joined").unwrap();
        graph.connect(second_out, x).unwrap();
        graph.connect(first_out, y).unwrap();

        let service = RecordingTaskService::accepting();
        let dispatcher = dispatcher_for(graph, service.clone(), Arc::new(LogStatusPublisher));
        dispatcher.store().put(first, "value", json!("a"));
        dispatcher.store().put(second, "value", json!("b"));

        dispatcher.dispatch(join).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let payloads = service.payloads();
        assert_eq!(payloads.len(), 1);
        let values: Vec<&Value> = payloads[0].inputs.iter().map(|input| &input.value).collect();
        assert_eq!(values, vec![&json!("b"), &json!("a")]);
        assert_eq!(payloads[0].output_names, vec!["joined".to_string()]);
        assert_eq!(payloads[0].service, "concat");
        assert_eq!(dispatcher.awaiting().len(), 1);
        assert_eq!(dispatcher.graph().read().unwrap().state(join), Some(NodeState::Executing));
    }

    #[tokio::test]
    async fn test_rejected_submission_fails_node() {
        let (graph, key) = single_service();
        let dispatcher = dispatcher_for(graph, RecordingTaskService::rejecting(), Arc::new(LogStatusPublisher));

        dispatcher.dispatch(key).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(dispatcher.graph().read().unwrap().state(key), Some(NodeState::Failed));
        assert!(dispatcher.awaiting().is_empty());
    }

    #[tokio::test]
    async fn test_redispatch_of_executing_node_is_refused() {
        let (graph, key) = single_service();
        let dispatcher = dispatcher_for(graph, RecordingTaskService::accepting(), Arc::new(LogStatusPublisher));

        dispatcher.dispatch(key).unwrap();
        let second = dispatcher.dispatch(key);

        assert!(matches!(second, Err(InterpreterError::InvalidNodeTransition { from: NodeState::Executing, .. })));
        assert_eq!(dispatcher.awaiting().len(), 1);
    }
}
