use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::graph::node::NodeState;
use crate::domain::utils::id::{NodeId, NodeInstanceId, WorkflowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeStatus {
    Executing,
    Completed,
    Failed,
    Canceling,
}

impl NodeStatus {
    /// `Waiting` is never published.
    pub fn from_state(state: NodeState) -> Option<NodeStatus> {
        match state {
            NodeState::Waiting => None,
            NodeState::Executing => Some(NodeStatus::Executing),
            NodeState::Finished => Some(NodeStatus::Completed),
            NodeState::Failed => Some(NodeStatus::Failed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StatusEvent {
    Node { workflow_id: WorkflowId, node_id: NodeId, instance_id: Option<NodeInstanceId>, status: NodeStatus },
    Workflow { workflow_id: WorkflowId, status: WorkflowStatus },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PublishError {
    #[error("No observer is listening")]
    NoObservers,

    #[error("Status channel unavailable: {0}")]
    Unavailable(String),
}

/// Best-effort sink for status/progress notifications.
pub trait StatusPublisher: Send + Sync + std::fmt::Debug {
    fn publish(&self, event: StatusEvent) -> Result<(), PublishError>;
}

/// Writes status events to the log.
#[derive(Debug, Clone, Default)]
pub struct LogStatusPublisher;

impl StatusPublisher for LogStatusPublisher {
    fn publish(&self, event: StatusEvent) -> Result<(), PublishError> {
        match &event {
            StatusEvent::Node { node_id, status, .. } => log::debug!("Node {} is now {:?}.", node_id, status),
            StatusEvent::Workflow { workflow_id, status } => log::info!("Workflow {} is now {:?}.", workflow_id, status),
        }
        Ok(())
    }
}

/// Fans status events out to any number of receivers over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastStatusPublisher {
    sender: broadcast::Sender<StatusEvent>,
}

impl BroadcastStatusPublisher {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<StatusEvent>) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }
}

impl StatusPublisher for BroadcastStatusPublisher {
    fn publish(&self, event: StatusEvent) -> Result<(), PublishError> {
        self.sender.send(event).map(|_| ()).map_err(|_| PublishError::NoObservers)
    }
}
