use std::collections::HashMap;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::domain::graph::graph::{NodeKey, WorkflowGraph};
use crate::domain::graph::node::{NodeKind, NodeState};
use crate::domain::interpreter::handlers::HandlerContext;
use crate::domain::interpreter::scheduler::WorkflowInterpreter;
use crate::domain::services::status_publisher::WorkflowStatus;
use crate::error::InterpreterError;

struct NestedRun {
    name: String,
    inner: WorkflowGraph,
    bindings: HashMap<String, Value>,
    output_names: Vec<String>,
}

/// Runs a SubWorkflow node to completion. The scheduler has already moved the
/// node to Executing.
pub async fn run_sub_workflow(ctx: HandlerContext, key: NodeKey) -> Result<(), InterpreterError> {
    let inputs = {
        let graph = ctx.dispatcher.graph().read().expect("RwLock poisoned");
        ctx.dispatcher.store().resolve_inputs(&graph, key)
    };

    match run_nested(&ctx, key, inputs).await {
        Ok(outputs) => {
            ctx.dispatcher.record_outputs(key, &outputs);
            ctx.dispatcher.mark_state(key, NodeState::Finished)?;
            Ok(())
        }
        Err(e) => {
            ctx.dispatcher.fail_node(key);
            Err(e)
        }
    }
}

/// Runs the inner graph of `key` in a nested interpreter.
///
/// `inputs` bind by outer data-in port name to inner Input node name, outputs
/// map back by outer data-out port name to inner Output node name. The nested
/// run shares the collaborators and the configuration, never the graph, store
/// or awaiting table.
pub fn run_nested(ctx: &HandlerContext, key: NodeKey, inputs: Vec<Value>) -> BoxFuture<'static, Result<HashMap<String, Value>, InterpreterError>> {
    let prepared = prepare(ctx, key, inputs);
    let services = ctx.services().clone();
    let config = ctx.config.clone();
    let cancel = ctx.cancel.child_token();

    async move {
        let NestedRun { name, inner, bindings, output_names } = prepared?;

        let interpreter = WorkflowInterpreter::new(inner, services, config).with_cancellation(cancel);
        log::info!("Sub-workflow {} starts nested run {}.", name, interpreter.workflow_id());

        let outcome = interpreter.run(bindings).await?;
        if outcome.status != WorkflowStatus::Completed {
            return Err(InterpreterError::SubWorkflowFailed { node: name, status: format!("{:?}", outcome.status) });
        }

        Ok(output_names
            .into_iter()
            .map(|output| {
                let value = outcome.outputs.get(&output).cloned().unwrap_or(Value::Null);
                (output, value)
            })
            .collect())
    }
    .boxed()
}

fn prepare(ctx: &HandlerContext, key: NodeKey, inputs: Vec<Value>) -> Result<NestedRun, InterpreterError> {
    let graph = ctx.dispatcher.graph().read().expect("RwLock poisoned");
    let node = graph.node(key).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", key)))?;
    let name = node.id.to_string();

    let NodeKind::SubWorkflow { graph: inner } = &node.kind else {
        return Err(InterpreterError::UnsupportedBody { construct: "SubWorkflow", node: name, kind: node.kind.label() });
    };

    let bindings: HashMap<String, Value> =
        node.data_in.iter().zip(inputs).filter_map(|(port, value)| graph.port_name(*port).map(|port_name| (port_name.to_string(), value))).collect();

    for (_, inner_node) in inner.nodes() {
        if let NodeKind::Input { default } = &inner_node.kind {
            if default.is_none() && !bindings.contains_key(&inner_node.name) {
                return Err(InterpreterError::InputNotSet { node: name, input: inner_node.name.clone() });
            }
        }
    }

    let output_names = node.data_out.iter().filter_map(|port| graph.port_name(*port).map(str::to_string)).collect();

    Ok(NestedRun { name, inner: inner.as_ref().clone(), bindings, output_names })
}
