use std::collections::HashMap;

use serde_json::Value;

use crate::domain::graph::graph::NodeKey;
use crate::domain::graph::node::NodeState;
use crate::domain::interpreter::dispatcher::TaskDispatcher;
use crate::error::InterpreterError;

/// Evaluates the If expression over the resolved inputs and flags exactly one
/// branch: control-out 0 when true, control-out 1 when false.
///
/// Runs synchronously inside the scheduler tick. A malformed expression fails
/// the node and is not retried.
pub fn handle_if(dispatcher: &TaskDispatcher, key: NodeKey) -> Result<bool, InterpreterError> {
    dispatcher.begin(key)?;

    let (name, expression, inputs, branches) = {
        let graph = dispatcher.graph().read().expect("RwLock poisoned");
        let node = graph.node(key).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", key)))?;
        let inputs = dispatcher.store().resolve_inputs(&graph, key);
        (node.id.to_string(), node.kind.expression().map(str::to_string), inputs, node.control_out.clone())
    };

    let Some(expression) = expression else {
        dispatcher.fail_node(key);
        return Err(InterpreterError::MissingExpression { node: name });
    };

    let verdict = match dispatcher.services().evaluator.evaluate(&expression, &inputs) {
        Ok(verdict) => verdict,
        Err(e) => {
            dispatcher.fail_node(key);
            return Err(InterpreterError::Expression { node: name, expression, reason: e.to_string() });
        }
    };

    {
        let mut graph = dispatcher.graph().write().expect("RwLock poisoned");
        if let Some(taken) = branches.first() {
            graph.set_condition(*taken, verdict);
        }
        if let Some(other) = branches.get(1) {
            graph.set_condition(*other, !verdict);
        }
    }

    log::debug!("If {} evaluated '{}' to {}.", name, expression, verdict);
    dispatcher.mark_state(key, NodeState::Finished)?;
    Ok(verdict)
}

/// Merges the two branches of a conditional: output `i` takes the one value
/// resolvable from input slots `2i` and `2i+1`.
pub fn handle_end_if(dispatcher: &TaskDispatcher, key: NodeKey) -> Result<(), InterpreterError> {
    dispatcher.begin(key)?;

    let merged = merge_branches(dispatcher, key);
    match merged {
        Ok(outputs) => {
            dispatcher.record_outputs(key, &outputs);
            dispatcher.mark_state(key, NodeState::Finished)?;
            Ok(())
        }
        Err(e) => {
            dispatcher.fail_node(key);
            Err(e)
        }
    }
}

fn merge_branches(dispatcher: &TaskDispatcher, key: NodeKey) -> Result<HashMap<String, Value>, InterpreterError> {
    let graph = dispatcher.graph().read().expect("RwLock poisoned");
    let node = graph.node(key).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", key)))?;
    let name = node.id.to_string();

    if node.data_in.len() != 2 * node.data_out.len() {
        return Err(InterpreterError::EndIfArity { node: name, inputs: node.data_in.len(), outputs: node.data_out.len() });
    }

    // A slot resolves only if its branch ran; the untaken branch yields nothing.
    let slot = |index: usize| {
        let port = *node.data_in.get(index)?;
        let source = graph.source_node(port)?;
        if !graph.is_finished(source) {
            return None;
        }
        dispatcher.store().resolve(&graph, port)
    };

    let mut outputs = HashMap::new();
    for (index, out_port) in node.data_out.iter().enumerate() {
        let value = match (slot(2 * index), slot(2 * index + 1)) {
            (Some(value), None) | (None, Some(value)) => value,
            (Some(_), Some(_)) => return Err(InterpreterError::EndIfBranchMismatch { node: name, output: index, fired: 2 }),
            (None, None) => return Err(InterpreterError::EndIfBranchMismatch { node: name, output: index, fired: 0 }),
        };
        if let Some(port_name) = graph.port_name(*out_port) {
            outputs.insert(port_name.to_string(), value);
        }
    }

    Ok(outputs)
}
