use thiserror::Error;

use crate::domain::graph::node::NodeState;
use crate::domain::interpreter::control::WorkflowExecutionState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse workflow JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Failed to build workflow graph: {0}")]
    GraphConstructionError(String),

    #[error("Invalid interpreter configuration: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while a workflow is being interpreted.
///
/// Structural and expression errors are fatal to the node or construct that
/// raised them and are reported on the workflow error channel. Task failures
/// stay local to the failing node.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InterpreterError {
    #[error("EndIf '{node}': output {output} has {fired} fired branches, expected exactly one")]
    EndIfBranchMismatch { node: String, output: usize, fired: usize },

    #[error("EndIf '{node}': {inputs} inputs cannot be paired onto {outputs} outputs")]
    EndIfArity { node: String, inputs: usize, outputs: usize },

    #[error("{construct} '{node}' has {count} body nodes, only a single body node is supported")]
    BodyNotSupported { construct: &'static str, node: String, count: usize },

    #[error("{construct} '{node}' has no body node")]
    MissingBody { construct: &'static str, node: String },

    #[error("{construct} '{node}' cannot run a {kind} node as its body")]
    UnsupportedBody { construct: &'static str, node: String, kind: &'static str },

    #[error("{construct} '{node}' is not closed by a matching end node")]
    MissingEndNode { construct: &'static str, node: String },

    #[error("Input '{input}' of '{node}' was not set")]
    InputNotSet { node: String, input: String },

    #[error("Wrong number of inputs to ForEach '{node}': list lengths {lengths:?}")]
    ForEachLengthMismatch { node: String, lengths: Vec<usize> },

    #[error("Cross product on ForEach '{node}' needs at most two input lists, got {lists}")]
    CrossProductArity { node: String, lists: usize },

    #[error("Expression '{expression}' of '{node}' could not be evaluated: {reason}")]
    Expression { node: String, expression: String, reason: String },

    #[error("Node '{node}' has no expression")]
    MissingExpression { node: String },

    #[error("Task for node '{node}' failed: {reason}")]
    TaskFailed { node: String, reason: String },

    #[error("Submitting task for node '{node}' failed: {reason}")]
    TaskSubmission { node: String, reason: String },

    #[error("Node '{node}' already has an execution in flight")]
    AlreadyInFlight { node: String },

    #[error("Node '{node}' cannot move from {from:?} to {to:?}")]
    InvalidNodeTransition { node: String, from: NodeState, to: NodeState },

    #[error("Workflow cannot move from {from:?} to {to:?}")]
    InvalidWorkflowTransition { from: WorkflowExecutionState, to: WorkflowExecutionState },

    #[error("Node '{node}' cannot be re-run while '{executing}' is executing")]
    RerunWhileExecuting { node: String, executing: String },

    #[error("Sub-workflow '{node}' finished with status {status}")]
    SubWorkflowFailed { node: String, status: String },

    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    #[error("Unknown node kind '{0}'")]
    UnknownNodeKind(String),
}

impl InterpreterError {
    /// Structural errors describe a malformed graph rather than a runtime failure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            InterpreterError::EndIfBranchMismatch { .. }
                | InterpreterError::EndIfArity { .. }
                | InterpreterError::BodyNotSupported { .. }
                | InterpreterError::MissingBody { .. }
                | InterpreterError::UnsupportedBody { .. }
                | InterpreterError::MissingEndNode { .. }
                | InterpreterError::InputNotSet { .. }
                | InterpreterError::ForEachLengthMismatch { .. }
                | InterpreterError::CrossProductArity { .. }
        )
    }
}
