use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::domain::graph::node::NodeState;
use crate::domain::services::status_publisher::WorkflowStatus;
use crate::domain::utils::id::WorkflowId;
use crate::error::InterpreterError;

/// What a finished run reports back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,

    /// Values drained from Output nodes, keyed by Output node name.
    pub outputs: BTreeMap<String, Value>,

    /// Everything that reached the workflow error channel, in the order it was raised.
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Vec<InterpreterError>,

    /// Final state of every node, keyed by node id.
    pub node_states: BTreeMap<String, NodeState>,
}

impl WorkflowOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    pub fn nodes_in(&self, state: NodeState) -> Vec<&str> {
        self.node_states.iter().filter(|(_, s)| **s == state).map(|(id, _)| id.as_str()).collect()
    }
}

fn serialize_errors<S: serde::Serializer>(errors: &[InterpreterError], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}
