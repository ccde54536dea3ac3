use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};

use crate::domain::services::event_bus::{EventBus, TaskEvent, TaskOutput, TaskOutputChanged, TaskPhase, TaskStatusChanged};
use crate::domain::services::task_service::{ServiceError, TaskPayload, TaskService};
use crate::domain::utils::id::TaskId;

/// Computes the outputs of one simulated task, or the reason it failed.
pub type Workload = Arc<dyn Fn(&TaskPayload) -> Result<Vec<TaskOutput>, String> + Send + Sync>;

/// Which completion event the simulator publishes first for a successful task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryOrder {
    #[default]
    StatusFirst,
    OutputFirst,
}

/// In-process execution service.
///
/// Each submitted task is resolved by name against a registry of workloads
/// and completed from its own tokio task after the configured latency, by
/// publishing `TaskStatusChanged` and `TaskOutputChanged` on the event bus.
///
/// Built-in workloads:
/// - `echo`: output `i` is input `i`, or the first input if there is no input `i`.
/// - `concat`: all inputs joined into one string.
/// - `sum`: numeric sum of all inputs, arrays are summed element-wise into the total.
/// - `increment`: first input plus one.
/// - `fail`: always fails.
/// - `resource`: a fake instance handle for resource lifecycle nodes.
#[derive(Clone)]
pub struct SimulatedTaskService {
    event_bus: Arc<dyn EventBus>,
    workloads: Arc<RwLock<HashMap<String, Workload>>>,
    latency: Duration,
    jitter: Duration,
    delivery_order: DeliveryOrder,
    submissions: Arc<Mutex<Vec<TaskPayload>>>,
}

impl fmt::Debug for SimulatedTaskService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.workloads.read().expect("RwLock poisoned").keys().cloned().collect();
        names.sort();
        f.debug_struct("SimulatedTaskService")
            .field("workloads", &names)
            .field("latency", &self.latency)
            .field("jitter", &self.jitter)
            .field("delivery_order", &self.delivery_order)
            .finish()
    }
}

impl SimulatedTaskService {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        let service = SimulatedTaskService {
            event_bus,
            workloads: Arc::new(RwLock::new(HashMap::new())),
            latency: Duration::from_millis(5),
            jitter: Duration::ZERO,
            delivery_order: DeliveryOrder::default(),
            submissions: Arc::new(Mutex::new(Vec::new())),
        };
        service.register_builtins();
        service
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Adds a random delay of up to `jitter` to every task, which shuffles completion order.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_delivery_order(mut self, delivery_order: DeliveryOrder) -> Self {
        self.delivery_order = delivery_order;
        self
    }

    /// Registers `workload` under `name`, replacing any workload of that name.
    pub fn register<F>(&self, name: &str, workload: F)
    where
        F: Fn(&TaskPayload) -> Result<Vec<TaskOutput>, String> + Send + Sync + 'static,
    {
        self.workloads.write().expect("RwLock poisoned").insert(name.to_string(), Arc::new(workload));
    }

    /// Every payload submitted so far, in submission order.
    pub fn submissions(&self) -> Vec<TaskPayload> {
        self.submissions.lock().expect("Mutex poisoned").clone()
    }

    fn register_builtins(&self) {
        self.register("echo", |payload| {
            Ok(payload
                .output_names
                .iter()
                .enumerate()
                .map(|(index, name)| {
                    let value = payload.input(index).or_else(|| payload.input(0)).cloned().unwrap_or(Value::Null);
                    TaskOutput { name: name.clone(), value }
                })
                .collect())
        });

        self.register("concat", |payload| {
            let joined: String = payload.inputs.iter().map(|input| plain_text(&input.value)).collect();
            Ok(broadcast(payload, json!(joined)))
        });

        self.register("sum", |payload| {
            let mut numbers = Vec::new();
            for input in &payload.inputs {
                collect_numbers(&input.value, &mut numbers)?;
            }
            Ok(broadcast(payload, add_up(&numbers)))
        });

        self.register("increment", |payload| {
            let first = payload.input(0).ok_or_else(|| "increment needs one input".to_string())?;
            let mut numbers = Vec::new();
            collect_numbers(first, &mut numbers)?;
            numbers.push(json!(1));
            Ok(broadcast(payload, add_up(&numbers)))
        });

        self.register("fail", |payload| Err(format!("Workload 'fail' rejected node {}", payload.node_id)));

        self.register("resource", |payload| {
            let action = payload.resource_action.map(|action| format!("{:?}", action).to_lowercase()).unwrap_or_else(|| "none".to_string());
            Ok(broadcast(payload, json!(format!("{}-{}", action, payload.node_id))))
        });
    }

    fn delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.latency;
        }
        self.latency + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

#[async_trait]
impl TaskService for SimulatedTaskService {
    async fn submit_task(&self, task_id: &TaskId, _credential_token: &str, payload: TaskPayload) -> Result<(), ServiceError> {
        self.submissions.lock().expect("Mutex poisoned").push(payload.clone());

        let workload = self.workloads.read().expect("RwLock poisoned").get(&payload.service).cloned();
        let Some(workload) = workload else {
            return Err(ServiceError::UnknownService(payload.service));
        };

        let bus = self.event_bus.clone();
        let delay = self.delay();
        let order = self.delivery_order;
        let task_id = task_id.clone();

        tokio::spawn(async move {
            bus.publish(status(&task_id, TaskPhase::Launched, None));
            tokio::time::sleep(delay).await;

            match workload(&payload) {
                Ok(outputs) => {
                    let completed = status(&task_id, TaskPhase::Completed, None);
                    let produced = TaskEvent::OutputChanged(TaskOutputChanged { task_id: task_id.clone(), outputs });
                    let events = match order {
                        DeliveryOrder::StatusFirst => [completed, produced],
                        DeliveryOrder::OutputFirst => [produced, completed],
                    };
                    for event in events {
                        bus.publish(event);
                    }
                }
                Err(reason) => {
                    log::debug!("Simulated task {} of node {} failed: {}", task_id, payload.node_id, reason);
                    bus.publish(status(&task_id, TaskPhase::Failed, Some(reason)));
                }
            }
        });

        Ok(())
    }
}

fn status(task_id: &TaskId, phase: TaskPhase, reason: Option<String>) -> TaskEvent {
    TaskEvent::StatusChanged(TaskStatusChanged { task_id: task_id.clone(), phase, reason })
}

/// The same value on every declared output.
fn broadcast(payload: &TaskPayload, value: Value) -> Vec<TaskOutput> {
    payload.output_names.iter().map(|name| TaskOutput { name: name.clone(), value: value.clone() }).collect()
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn collect_numbers(value: &Value, numbers: &mut Vec<Value>) -> Result<(), String> {
    match value {
        Value::Number(_) => numbers.push(value.clone()),
        Value::Array(items) => {
            for item in items {
                collect_numbers(item, numbers)?;
            }
        }
        Value::String(text) => {
            let parsed: serde_json::Number = text.trim().parse().map_err(|_| format!("'{}' is not a number", text))?;
            numbers.push(Value::Number(parsed));
        }
        other => return Err(format!("{} is not a number", other)),
    }
    Ok(())
}

/// Integer sum if every operand is an integer, floating point sum otherwise.
fn add_up(numbers: &[Value]) -> Value {
    let integers: Option<Vec<i64>> = numbers.iter().map(Value::as_i64).collect();
    match integers {
        Some(integers) => json!(integers.iter().sum::<i64>()),
        None => json!(numbers.iter().filter_map(Value::as_f64).sum::<f64>()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::port::ValueType;
    use crate::domain::services::event_bus::InMemoryEventBus;
    use crate::domain::services::task_service::TaskInput;
    use crate::domain::utils::id::{NodeId, WorkflowId};

    fn payload(service: &str, inputs: Vec<Value>, outputs: &[&str]) -> TaskPayload {
        TaskPayload {
            workflow_id: WorkflowId::new("wf"),
            node_id: NodeId::new("node"),
            service: service.to_string(),
            inputs: inputs.into_iter().enumerate().map(|(index, value)| TaskInput { name: format!("in{}", index), value_type: ValueType::Any, value }).collect(),
            output_names: outputs.iter().map(|name| name.to_string()).collect(),
            resource_action: None,
            iteration: None,
            iteration_key: None,
        }
    }

    fn recorded_bus() -> (InMemoryEventBus, Arc<Mutex<Vec<TaskEvent>>>) {
        let bus = InMemoryEventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(Arc::new(move |event: &TaskEvent| sink.lock().unwrap().push(event.clone())));
        (bus, events)
    }

    #[tokio::test]
    async fn test_sum_keeps_integers() {
        let (bus, events) = recorded_bus();
        let service = SimulatedTaskService::new(Arc::new(bus)).with_latency(Duration::ZERO);

        service.submit_task(&TaskId::new("t1"), "token", payload("sum", vec![json!(10), json!([1, 2]), json!("3")], &["total"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], TaskEvent::StatusChanged(status) if status.phase == TaskPhase::Completed));
        let TaskEvent::OutputChanged(outputs) = &events[2] else { panic!("expected outputs last") };
        assert_eq!(outputs.outputs, vec![TaskOutput { name: "total".to_string(), value: json!(16) }]);
    }

    #[tokio::test]
    async fn test_output_first_delivery() {
        let (bus, events) = recorded_bus();
        let service = SimulatedTaskService::new(Arc::new(bus)).with_latency(Duration::ZERO).with_delivery_order(DeliveryOrder::OutputFirst);

        service.submit_task(&TaskId::new("t1"), "token", payload("echo", vec![json!("a")], &["x", "y"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = events.lock().unwrap();
        let TaskEvent::OutputChanged(outputs) = &events[1] else { panic!("expected outputs before status") };
        assert_eq!(outputs.outputs[1].value, json!("a"));
        assert!(matches!(&events[2], TaskEvent::StatusChanged(status) if status.phase == TaskPhase::Completed));
    }

    #[tokio::test]
    async fn test_failing_and_unknown_workloads() {
        let (bus, events) = recorded_bus();
        let service = SimulatedTaskService::new(Arc::new(bus)).with_latency(Duration::ZERO);

        let unknown = service.submit_task(&TaskId::new("t0"), "token", payload("blast", vec![], &[])).await;
        assert_eq!(unknown, Err(ServiceError::UnknownService("blast".to_string())));

        service.submit_task(&TaskId::new("t1"), "token", payload("fail", vec![], &[])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = events.lock().unwrap();
        assert!(matches!(events.last(), Some(TaskEvent::StatusChanged(status)) if status.phase == TaskPhase::Failed && status.reason.is_some()));
        assert_eq!(service.submissions().len(), 2);
    }
}
