use std::collections::HashMap;

use serde_json::Value;

use crate::domain::graph::graph::NodeKey;
use crate::domain::graph::node::{NodeKind, NodeState};
use crate::domain::interpreter::handlers::{HandlerContext, locate_body};
use crate::error::InterpreterError;

/// Runs a DoWhile loop to convergence on its own task.
///
/// The scheduler has already moved the DoWhile node to Executing.
/// - **Phase 1**: Seed the loop outputs with the node's inputs so the body can resolve them.
/// - **Phase 2**: Invoke the single body node and evaluate the condition over its outputs.
///   While true, reset the body and invoke it again.
/// - **Phase 3**: Copy the final body outputs to EndDoWhile and finish both loop nodes.
///
/// A failed body invocation aborts the loop and fails the DoWhile node.
pub async fn run_do_while(ctx: HandlerContext, key: NodeKey) -> Result<(), InterpreterError> {
    let dispatcher = &ctx.dispatcher;

    let result = iterate(&ctx, key).await;
    match result {
        Ok(None) => Ok(()),
        Ok(Some(end)) => {
            dispatcher.mark_state(end, NodeState::Finished)?;
            dispatcher.mark_state(key, NodeState::Finished)?;
            Ok(())
        }
        Err(e) => {
            dispatcher.fail_node(key);
            Err(e)
        }
    }
}

/// # Returns
/// The EndDoWhile node once its outputs are written, `None` if the run was cancelled.
async fn iterate(ctx: &HandlerContext, key: NodeKey) -> Result<Option<NodeKey>, InterpreterError> {
    let dispatcher = &ctx.dispatcher;

    // Phase 1: Seed
    let (name, expression, seed, body, end) = {
        let graph = dispatcher.graph().read().expect("RwLock poisoned");
        let node = graph.node(key).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", key)))?;
        let name = node.id.to_string();
        let expression = node.kind.expression().map(str::to_string).ok_or_else(|| InterpreterError::MissingExpression { node: name.clone() })?;

        let inputs = dispatcher.store().resolve_inputs(&graph, key);
        let seed: HashMap<String, Value> = node
            .data_out
            .iter()
            .zip(inputs)
            .filter_map(|(port, value)| graph.port_name(*port).map(|port_name| (port_name.to_string(), value)))
            .collect();

        let (body, end) = locate_body(&graph, "DoWhile", key, |kind| matches!(kind, NodeKind::EndDoWhile), false)?;
        (name, expression, seed, body, end)
    };
    dispatcher.record_outputs(key, &seed);

    // Phase 2: Iterate
    let evaluator = ctx.services().evaluator.clone();
    let mut iterations = 0usize;
    loop {
        if ctx.cancel.is_cancelled() {
            log::info!("DoWhile {} cancelled after {} iterations.", name, iterations);
            return Ok(None);
        }

        let outputs = tokio::select! {
            outputs = dispatcher.invoke(body) => outputs?,
            _ = ctx.cancel.cancelled() => return Ok(None),
        };
        iterations += 1;

        let values: Vec<Value> = {
            let graph = dispatcher.graph().read().expect("RwLock poisoned");
            let ports = graph.node(body).map(|node| node.data_out.clone()).unwrap_or_default();
            ports.iter().map(|port| graph.port_name(*port).and_then(|port_name| outputs.get(port_name)).cloned().unwrap_or(Value::Null)).collect()
        };

        let again = evaluator
            .evaluate(&expression, &values)
            .map_err(|e| InterpreterError::Expression { node: name.clone(), expression: expression.clone(), reason: e.to_string() })?;
        log::debug!("DoWhile {} iteration {}: condition is {}.", name, iterations, again);

        if !again {
            break;
        }
        if ctx.config.max_loop_iterations.is_some_and(|cap| iterations >= cap) {
            tracing::warn!("DoWhile {} stopped at the iteration cap of {}.", name, iterations);
            break;
        }

        // Controlled reset of the body for the next iteration.
        dispatcher.graph().write().expect("RwLock poisoned").reset_node(body);
        dispatcher.store().clear(body);
    }

    // Phase 3: Hand the final values to EndDoWhile
    dispatcher.begin(end)?;
    let final_values: HashMap<String, Value> = {
        let graph = dispatcher.graph().read().expect("RwLock poisoned");
        let node = graph.node(end).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", end)))?;
        node.data_in
            .iter()
            .zip(node.data_out.iter())
            .filter_map(|(input, output)| {
                let value = dispatcher.store().resolve(&graph, *input).unwrap_or(Value::Null);
                graph.port_name(*output).map(|port_name| (port_name.to_string(), value))
            })
            .collect()
    };
    dispatcher.record_outputs(end, &final_values);

    log::info!("DoWhile {} converged after {} iterations.", name, iterations);
    Ok(Some(end))
}
