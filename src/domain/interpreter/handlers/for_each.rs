use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::domain::graph::graph::{NodeKey, PortKey};
use crate::domain::graph::node::{NodeKind, NodeState};
use crate::domain::interpreter::handlers::combination::{InputCombination, combine, expand_list};
use crate::domain::interpreter::handlers::sub_workflow::run_nested;
use crate::domain::interpreter::handlers::{HandlerContext, locate_body};
use crate::domain::interpreter::join_barrier::JoinBarrier;
use crate::error::InterpreterError;

/// How one body input is fed during the fan-out.
#[derive(Debug, Clone)]
enum BodyInput {
    /// Field `n` of the run's input combination (fed by ForEach data-out `n`).
    Combination(usize),
    /// The same resolved value for every run.
    Fixed(Value),
}

/// Fan-out layout resolved from the graph before any run starts.
#[derive(Debug)]
struct FanOut {
    name: String,
    body: NodeKey,
    end: NodeKey,
    body_is_sub_workflow: bool,
    combinations: Vec<InputCombination>,
    body_inputs: Vec<BodyInput>,
}

/// Fans the single body node out over the ForEach's input combinations and
/// joins the results into EndForEach.
///
/// The scheduler has already moved the ForEach node to Executing. Runs are
/// bounded by `max_parallel_runs`. Each completion arrives at a `JoinBarrier`,
/// the join happens once all runs have arrived. Outputs are arrays in
/// dispatch order, one per body data-out port.
pub async fn run_for_each(ctx: HandlerContext, key: NodeKey) -> Result<(), InterpreterError> {
    let dispatcher = &ctx.dispatcher;

    let fan_out = match plan(&ctx, key) {
        Ok(fan_out) => fan_out,
        Err(e) => {
            dispatcher.fail_node(key);
            return Err(e);
        }
    };

    dispatcher.begin(fan_out.body)?;
    let expected = fan_out.combinations.len();
    log::info!("ForEach {} fans out into {} runs.", fan_out.name, expected);

    let barrier = JoinBarrier::new(expected);
    let permits = Arc::new(Semaphore::new(ctx.config.max_parallel_runs.max(1)));
    let mut runs = JoinSet::new();

    for (iteration, combination) in fan_out.combinations.iter().enumerate() {
        let inputs: Vec<Value> = fan_out
            .body_inputs
            .iter()
            .map(|input| match input {
                BodyInput::Combination(field) => combination.values.get(*field).cloned().unwrap_or(Value::Null),
                BodyInput::Fixed(value) => value.clone(),
            })
            .collect();
        let iteration_key = combination.joined(&ctx.config.for_each_delimiter);

        let run_ctx = ctx.clone();
        let run_barrier = barrier.clone();
        let run_permits = permits.clone();
        let body = fan_out.body;
        let nested = fan_out.body_is_sub_workflow;

        runs.spawn(async move {
            let result = match run_permits.acquire_owned().await {
                Ok(_permit) => {
                    if nested {
                        run_nested(&run_ctx, body, inputs).await
                    } else {
                        run_ctx.dispatcher.invoke_run(body, iteration, iteration_key, inputs).await
                    }
                }
                Err(_) => Err(InterpreterError::TaskFailed { node: run_ctx.dispatcher.node_name(body), reason: "Run limiter closed".to_string() }),
            };
            run_barrier.arrive();
            (iteration, result)
        });
    }

    tokio::select! {
        _ = barrier.wait() => {}
        _ = ctx.cancel.cancelled() => {
            runs.abort_all();
            log::info!("ForEach {} cancelled with {}/{} runs joined.", fan_out.name, barrier.arrived(), expected);
            return Ok(());
        }
    }

    let mut results: Vec<Option<Result<HashMap<String, Value>, InterpreterError>>> = (0..expected).map(|_| None).collect();
    while let Some(joined) = runs.join_next().await {
        match joined {
            Ok((iteration, result)) => results[iteration] = Some(result),
            Err(e) => log::error!("A run of ForEach {} panicked: {}", fan_out.name, e),
        }
    }

    join(&ctx, key, &fan_out, results)
}

fn plan(ctx: &HandlerContext, key: NodeKey) -> Result<FanOut, InterpreterError> {
    let dispatcher = &ctx.dispatcher;
    let graph = dispatcher.graph().read().expect("RwLock poisoned");
    let node = graph.node(key).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", key)))?;
    let name = node.id.to_string();

    let lists: Vec<Vec<Value>> =
        dispatcher.store().resolve_inputs(&graph, key).iter().map(|value| expand_list(value, &ctx.config.for_each_delimiter)).collect();
    let combinations = combine(&name, &lists, ctx.config.for_each_policy)?;

    let (body, end) = locate_body(&graph, "ForEach", key, |kind| matches!(kind, NodeKind::EndForEach), true)?;
    let body_node = graph.node(body).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", body)))?;
    let body_is_sub_workflow = matches!(body_node.kind, NodeKind::SubWorkflow { .. });

    let fan_ports: Vec<PortKey> = node.data_out.clone();
    let body_inputs = body_node
        .data_in
        .iter()
        .map(|port| match graph.source_port(*port).and_then(|source| fan_ports.iter().position(|fan| *fan == source)) {
            Some(field) => BodyInput::Combination(field),
            None => BodyInput::Fixed(dispatcher.store().resolve(&graph, *port).unwrap_or(Value::Null)),
        })
        .collect();

    Ok(FanOut { name, body, end, body_is_sub_workflow, combinations, body_inputs })
}

/// Writes the per-port result arrays to the body and EndForEach, then finishes
/// body, ForEach and EndForEach. Any failed run fails body and ForEach.
fn join(ctx: &HandlerContext, key: NodeKey, fan_out: &FanOut, results: Vec<Option<Result<HashMap<String, Value>, InterpreterError>>>) -> Result<(), InterpreterError> {
    let dispatcher = &ctx.dispatcher;

    let mut completed = Vec::with_capacity(results.len());
    let mut first_error = None;
    for (iteration, result) in results.into_iter().enumerate() {
        match result {
            Some(Ok(outputs)) => completed.push(outputs),
            Some(Err(e)) => {
                first_error.get_or_insert(e);
            }
            None => {
                first_error.get_or_insert(InterpreterError::TaskFailed { node: fan_out.name.clone(), reason: format!("Run {} never reported back", iteration) });
            }
        }
    }

    if let Some(e) = first_error {
        dispatcher.fail_node(fan_out.body);
        dispatcher.fail_node(key);
        return Err(e);
    }

    let (body_arrays, end_values) = {
        let graph = dispatcher.graph().read().expect("RwLock poisoned");
        let body_ports = graph.node(fan_out.body).map(|node| node.data_out.clone()).unwrap_or_default();

        let body_arrays: HashMap<String, Value> = body_ports
            .iter()
            .filter_map(|port| graph.port_name(*port))
            .map(|port_name| {
                let collected = completed.iter().map(|outputs| outputs.get(port_name).cloned().unwrap_or(Value::Null)).collect();
                (port_name.to_string(), Value::Array(collected))
            })
            .collect();

        let end_node = graph.node(fan_out.end).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", fan_out.end)))?;
        let end_values: HashMap<String, Value> = end_node
            .data_in
            .iter()
            .zip(end_node.data_out.iter())
            .filter_map(|(input, output)| {
                let source = graph.source_port(*input).and_then(|source| graph.port(source));
                let value = match source {
                    Some(port) if port.node == fan_out.body => body_arrays.get(&port.name).cloned(),
                    _ => dispatcher.store().resolve(&graph, *input),
                };
                graph.port_name(*output).map(|port_name| (port_name.to_string(), value.unwrap_or(Value::Null)))
            })
            .collect();

        (body_arrays, end_values)
    };

    dispatcher.record_outputs(fan_out.body, &body_arrays);
    dispatcher.mark_state(fan_out.body, NodeState::Finished)?;

    dispatcher.begin(fan_out.end)?;
    dispatcher.record_outputs(fan_out.end, &end_values);
    dispatcher.mark_state(key, NodeState::Finished)?;
    dispatcher.mark_state(fan_out.end, NodeState::Finished)?;

    log::info!("ForEach {} joined {} runs.", fan_out.name, completed.len());
    Ok(())
}
