use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::graph::graph::{PortKey, WorkflowGraph};
use crate::domain::utils::id::{NodeId, NodeInstanceId};

/// Runtime state of a node.
///
/// Transitions are monotonic: `Waiting -> Executing -> {Finished, Failed}`.
/// Only an explicit reset (re-run, or the DoWhile handler between iterations)
/// moves a node back to `Waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Waiting,
    Executing,
    Finished,
    Failed,
}

impl NodeState {
    pub fn can_transition_to(self, next: NodeState) -> bool {
        matches!(
            (self, next),
            (NodeState::Waiting, NodeState::Executing) | (NodeState::Executing, NodeState::Finished) | (NodeState::Executing, NodeState::Failed)
        )
    }
}

/// Lifecycle step of an external resource (e.g. a compute instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAction {
    Start,
    Terminate,
}

/// The fixed set of node kinds the interpreter understands.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Workflow input, bound by name when the run starts.
    Input { default: Option<Value> },
    /// Workflow output, drained once its single input is finished.
    Output,
    Constant { value: Value },
    ServiceInvocation { service: String },
    /// Service invocation whose concrete service is resolved by the execution service.
    Dynamic { service: String },
    If { expression: String },
    EndIf,
    DoWhile { expression: String },
    EndDoWhile,
    ForEach,
    EndForEach,
    SubWorkflow { graph: Box<WorkflowGraph> },
    ResourceLifecycle { action: ResourceAction, service: String },
    /// Annotation node without runtime behavior.
    Memo { text: String },
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Input { .. } => "Input",
            NodeKind::Output => "Output",
            NodeKind::Constant { .. } => "Constant",
            NodeKind::ServiceInvocation { .. } => "ServiceInvocation",
            NodeKind::Dynamic { .. } => "Dynamic",
            NodeKind::If { .. } => "If",
            NodeKind::EndIf => "EndIf",
            NodeKind::DoWhile { .. } => "DoWhile",
            NodeKind::EndDoWhile => "EndDoWhile",
            NodeKind::ForEach => "ForEach",
            NodeKind::EndForEach => "EndForEach",
            NodeKind::SubWorkflow { .. } => "SubWorkflow",
            NodeKind::ResourceLifecycle { action: ResourceAction::Start, .. } => "ResourceStart",
            NodeKind::ResourceLifecycle { action: ResourceAction::Terminate, .. } => "ResourceTerminate",
            NodeKind::Memo { .. } => "Memo",
        }
    }

    /// Kinds that are executed by submitting a task to the execution service.
    pub fn is_task(&self) -> bool {
        matches!(self, NodeKind::ServiceInvocation { .. } | NodeKind::Dynamic { .. } | NodeKind::ResourceLifecycle { .. })
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            NodeKind::ServiceInvocation { service } | NodeKind::Dynamic { service } | NodeKind::ResourceLifecycle { service, .. } => Some(service),
            _ => None,
        }
    }

    pub fn expression(&self) -> Option<&str> {
        match self {
            NodeKind::If { expression } | NodeKind::DoWhile { expression } => Some(expression),
            _ => None,
        }
    }
}

/// A node in the workflow graph.
///
/// Ports are owned by the graph arena, the node only keeps their keys.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,

    /// Name used for binding workflow inputs/outputs and sub-workflow ports.
    pub name: String,
    pub kind: NodeKind,
    pub state: NodeState,

    /// Author-set breakpoint: the scheduler pauses the workflow instead of dispatching this node.
    pub break_flag: bool,

    pub data_in: Vec<PortKey>,
    pub data_out: Vec<PortKey>,
    pub control_in: Option<PortKey>,
    pub control_out: Vec<PortKey>,

    /// Catalog key, created when the node is first dispatched.
    pub instance_id: Option<NodeInstanceId>,
}

impl Node {
    pub fn new(id: NodeId, name: String, kind: NodeKind) -> Self {
        Node {
            id,
            name,
            kind,
            state: NodeState::Waiting,
            break_flag: false,
            data_in: Vec::new(),
            data_out: Vec::new(),
            control_in: None,
            control_out: Vec::new(),
            instance_id: None,
        }
    }
}
