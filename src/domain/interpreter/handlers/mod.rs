use tokio_util::sync::CancellationToken;

use crate::domain::graph::graph::{NodeKey, WorkflowGraph};
use crate::domain::graph::node::NodeKind;
use crate::domain::interpreter::config::InterpreterConfig;
use crate::domain::interpreter::dispatcher::TaskDispatcher;
use crate::domain::services::InterpreterServices;
use crate::error::InterpreterError;

pub mod combination;
pub mod do_while;
pub mod for_each;
pub mod if_handler;
pub mod sub_workflow;

/// Everything a spawned construct handler needs, cloned into each unit.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub dispatcher: TaskDispatcher,
    pub config: InterpreterConfig,
    pub cancel: CancellationToken,
}

impl HandlerContext {
    pub fn services(&self) -> &InterpreterServices {
        self.dispatcher.services()
    }
}

/// Resolves the single body node of a loop or fan-out construct and the end
/// node that closes it.
///
/// The body is the one node fed by the construct's data-out ports, not
/// counting a directly connected end node.
pub(crate) fn locate_body(
    graph: &WorkflowGraph,
    construct: &'static str,
    key: NodeKey,
    is_end: fn(&NodeKind) -> bool,
    allow_sub_workflow: bool,
) -> Result<(NodeKey, NodeKey), InterpreterError> {
    let name = graph.node_name(key);
    let kind_of = |node: NodeKey| graph.node(node).map(|node| &node.kind);

    let bodies: Vec<NodeKey> = graph.data_consumers(key).into_iter().filter(|consumer| !kind_of(*consumer).is_some_and(is_end)).collect();
    let body = match bodies.as_slice() {
        [] => return Err(InterpreterError::MissingBody { construct, node: name }),
        [body] => *body,
        _ => return Err(InterpreterError::BodyNotSupported { construct, node: name, count: bodies.len() }),
    };

    match kind_of(body) {
        Some(kind) if kind.is_task() => {}
        Some(NodeKind::SubWorkflow { .. }) if allow_sub_workflow => {}
        Some(kind) => return Err(InterpreterError::UnsupportedBody { construct, node: name, kind: kind.label() }),
        None => return Err(InterpreterError::MissingBody { construct, node: name }),
    }

    let end = graph
        .successors(body)
        .into_iter()
        .chain(graph.successors(key))
        .find(|candidate| kind_of(*candidate).is_some_and(is_end))
        .ok_or(InterpreterError::MissingEndNode { construct, node: name })?;

    Ok((body, end))
}
