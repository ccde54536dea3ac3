use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::domain::graph::graph::WorkflowGraph;
use crate::domain::interpreter::awaiting_tasks::AwaitingTaskTable;
use crate::domain::interpreter::dispatcher::TaskDispatcher;
use crate::domain::interpreter::output_store::OutputStore;
use crate::domain::services::InterpreterServices;
use crate::domain::services::event_bus::InMemoryEventBus;
use crate::domain::services::status_publisher::{PublishError, StatusEvent, StatusPublisher};
use crate::domain::services::task_service::{ServiceError, TaskPayload, TaskService};
use crate::domain::utils::id::{TaskId, WorkflowId};

/// Task service that records payloads and never completes anything.
#[derive(Debug, Clone)]
pub struct RecordingTaskService {
    reject: bool,
    payloads: Arc<Mutex<Vec<TaskPayload>>>,
}

impl RecordingTaskService {
    pub fn accepting() -> Self {
        RecordingTaskService { reject: false, payloads: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn rejecting() -> Self {
        RecordingTaskService { reject: true, payloads: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn payloads(&self) -> Vec<TaskPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskService for RecordingTaskService {
    async fn submit_task(&self, task_id: &TaskId, _credential_token: &str, payload: TaskPayload) -> Result<(), ServiceError> {
        self.payloads.lock().unwrap().push(payload);
        if self.reject {
            return Err(ServiceError::Rejected { task: task_id.to_string(), reason: "quota exceeded".to_string() });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FailingPublisher;

impl StatusPublisher for FailingPublisher {
    fn publish(&self, _event: StatusEvent) -> Result<(), PublishError> {
        Err(PublishError::Unavailable("observer endpoint down".to_string()))
    }
}

pub fn dispatcher_for(graph: WorkflowGraph, task_service: RecordingTaskService, publisher: Arc<dyn StatusPublisher>) -> TaskDispatcher {
    let services = InterpreterServices::new(Arc::new(task_service), Arc::new(InMemoryEventBus::new())).with_publisher(publisher);
    TaskDispatcher::new(
        WorkflowId::new("wf-test"),
        Arc::new(RwLock::new(graph)),
        OutputStore::new(),
        AwaitingTaskTable::new(),
        services,
        "token".to_string(),
    )
}
