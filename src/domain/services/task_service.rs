use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::graph::node::ResourceAction;
use crate::domain::graph::port::ValueType;
use crate::domain::utils::id::{NodeId, TaskId, WorkflowId};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    #[error("Task '{task}' was rejected: {reason}")]
    Rejected { task: String, reason: String },

    #[error("Execution service unavailable: {0}")]
    Unavailable(String),
}

/// One resolved argument of a task, in the order of the node's data-in ports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInput {
    pub name: String,
    pub value_type: ValueType,
    pub value: Value,
}

/// Everything the execution service needs to run one node execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPayload {
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub service: String,
    pub inputs: Vec<TaskInput>,

    /// Declared data-out port names. Outputs under other names are dropped on completion.
    pub output_names: Vec<String>,
    pub resource_action: Option<ResourceAction>,

    /// Index of the fan-out run when the task belongs to a ForEach body.
    pub iteration: Option<usize>,

    /// The run's input combination joined with the configured delimiter.
    pub iteration_key: Option<String>,
}

impl TaskPayload {
    pub fn input(&self, index: usize) -> Option<&Value> {
        self.inputs.get(index).map(|input| &input.value)
    }
}

/// External task-execution service. Submission is fire-and-forget: completion
/// arrives later on the event bus as `TaskStatusChanged` / `TaskOutputChanged`.
#[async_trait]
pub trait TaskService: Send + Sync + std::fmt::Debug {
    async fn submit_task(&self, task_id: &TaskId, credential_token: &str, payload: TaskPayload) -> Result<(), ServiceError>;
}
