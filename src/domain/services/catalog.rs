use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;

use crate::domain::graph::node::NodeState;
use crate::domain::services::status_publisher::WorkflowStatus;
use crate::domain::utils::id::{NodeId, NodeInstanceId, WorkflowId};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CatalogError {
    #[error("Unknown node instance '{0}'")]
    UnknownInstance(String),

    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

/// Persistent record of node executions and workflow results.
///
/// The interpreter writes through to the catalog on every transition and
/// output. All errors are logged by the caller and never abort scheduling.
pub trait Catalog: Send + Sync + std::fmt::Debug {
    fn create_node_instance(&self, workflow_id: &WorkflowId, node_id: &NodeId) -> Result<NodeInstanceId, CatalogError>;

    fn update_node_status(&self, instance_id: &NodeInstanceId, state: NodeState) -> Result<(), CatalogError>;

    fn add_node_output(&self, instance_id: &NodeInstanceId, port: &str, value: &Value) -> Result<(), CatalogError>;

    fn record_workflow_output(&self, workflow_id: &WorkflowId, name: &str, value: &Value) -> Result<(), CatalogError>;

    fn update_workflow_status(&self, workflow_id: &WorkflowId, status: WorkflowStatus) -> Result<(), CatalogError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeInstanceRecord {
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,

    /// Every state the instance was moved to, in order.
    pub states: Vec<NodeState>,
    pub outputs: Vec<(String, Value)>,
}

#[derive(Debug, Default)]
struct CatalogInner {
    instances: HashMap<NodeInstanceId, NodeInstanceRecord>,
    workflow_outputs: HashMap<WorkflowId, Vec<(String, Value)>>,
    workflow_status: HashMap<WorkflowId, WorkflowStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    inner: Arc<RwLock<CatalogInner>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All instances created for a node, across runs and re-runs.
    pub fn instances_of(&self, node_id: &NodeId) -> Vec<NodeInstanceRecord> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.instances.values().filter(|record| &record.node_id == node_id).cloned().collect()
    }

    pub fn workflow_outputs(&self, workflow_id: &WorkflowId) -> Vec<(String, Value)> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.workflow_outputs.get(workflow_id).cloned().unwrap_or_default()
    }

    pub fn workflow_status(&self, workflow_id: &WorkflowId) -> Option<WorkflowStatus> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.workflow_status.get(workflow_id).copied()
    }
}

impl Catalog for InMemoryCatalog {
    fn create_node_instance(&self, workflow_id: &WorkflowId, node_id: &NodeId) -> Result<NodeInstanceId, CatalogError> {
        let instance_id = NodeInstanceId::generate();
        let record = NodeInstanceRecord { workflow_id: workflow_id.clone(), node_id: node_id.clone(), states: Vec::new(), outputs: Vec::new() };

        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.instances.insert(instance_id.clone(), record);
        Ok(instance_id)
    }

    fn update_node_status(&self, instance_id: &NodeInstanceId, state: NodeState) -> Result<(), CatalogError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let record = guard.instances.get_mut(instance_id).ok_or_else(|| CatalogError::UnknownInstance(instance_id.to_string()))?;
        record.states.push(state);
        Ok(())
    }

    fn add_node_output(&self, instance_id: &NodeInstanceId, port: &str, value: &Value) -> Result<(), CatalogError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let record = guard.instances.get_mut(instance_id).ok_or_else(|| CatalogError::UnknownInstance(instance_id.to_string()))?;
        record.outputs.push((port.to_string(), value.clone()));
        Ok(())
    }

    fn record_workflow_output(&self, workflow_id: &WorkflowId, name: &str, value: &Value) -> Result<(), CatalogError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.workflow_outputs.entry(workflow_id.clone()).or_default().push((name.to_string(), value.clone()));
        Ok(())
    }

    fn update_workflow_status(&self, workflow_id: &WorkflowId, status: WorkflowStatus) -> Result<(), CatalogError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.workflow_status.insert(workflow_id.clone(), status);
        Ok(())
    }
}
