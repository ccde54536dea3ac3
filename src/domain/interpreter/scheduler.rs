use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::domain::graph::graph::{NodeKey, WorkflowGraph};
use crate::domain::graph::node::{NodeKind, NodeState};
use crate::domain::interpreter::awaiting_tasks::AwaitingTaskTable;
use crate::domain::interpreter::config::InterpreterConfig;
use crate::domain::interpreter::control::{TransitionObserver, WorkflowControl, WorkflowExecutionState};
use crate::domain::interpreter::dispatcher::{SharedGraph, TaskDispatcher};
use crate::domain::interpreter::handlers::HandlerContext;
use crate::domain::interpreter::handlers::do_while::run_do_while;
use crate::domain::interpreter::handlers::for_each::run_for_each;
use crate::domain::interpreter::handlers::if_handler::{handle_end_if, handle_if};
use crate::domain::interpreter::handlers::sub_workflow::run_sub_workflow;
use crate::domain::interpreter::listener::CompletionListener;
use crate::domain::interpreter::outcome::WorkflowOutcome;
use crate::domain::interpreter::output_store::OutputStore;
use crate::domain::interpreter::readiness;
use crate::domain::services::InterpreterServices;
use crate::domain::services::event_bus::SubscriptionId;
use crate::domain::services::status_publisher::{NodeStatus, WorkflowStatus};
use crate::domain::utils::id::WorkflowId;
use crate::error::InterpreterError;

/// Store key under which an Output node keeps its drained value.
pub const OUTPUT_VALUE: &str = "value";

type HandlerSet = JoinSet<Result<(), InterpreterError>>;

/// How the scheduler executes a ready node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Condition,
    Merge,
    DoWhile,
    ForEach,
    SubWorkflow,
    Task,
    Inert,
}

impl Route {
    fn of(kind: &NodeKind) -> Route {
        match kind {
            NodeKind::If { .. } => Route::Condition,
            NodeKind::EndIf => Route::Merge,
            NodeKind::DoWhile { .. } => Route::DoWhile,
            NodeKind::ForEach => Route::ForEach,
            NodeKind::SubWorkflow { .. } => Route::SubWorkflow,
            kind if kind.is_task() => Route::Task,
            _ => Route::Inert,
        }
    }
}

/// Drives one workflow graph from its inputs to a terminal status.
///
/// A run is a cooperative polling loop. Each tick evaluates readiness once,
/// dispatches the ready set in graph order and drains finished Output nodes.
/// Task nodes are submitted fire-and-forget and complete through the
/// `CompletionListener`. DoWhile, ForEach and SubWorkflow nodes run as
/// spawned handler units.
///
/// The run stops when nothing is runnable and nothing is in flight, when it
/// is terminated through the [`WorkflowControl`], or when its cancellation
/// token fires.
#[derive(Debug)]
pub struct WorkflowInterpreter {
    workflow_id: WorkflowId,
    graph: SharedGraph,
    store: OutputStore,
    awaiting: AwaitingTaskTable,
    services: InterpreterServices,
    config: InterpreterConfig,
    control: WorkflowControl,
    cancel: CancellationToken,

    /// Inputs of the current run, kept to re-seed Input nodes on a re-run.
    bound_inputs: RwLock<HashMap<String, Value>>,
}

impl WorkflowInterpreter {
    pub fn new(graph: WorkflowGraph, services: InterpreterServices, config: InterpreterConfig) -> Self {
        WorkflowInterpreter {
            workflow_id: WorkflowId::generate(),
            graph: Arc::new(RwLock::new(graph)),
            store: OutputStore::new(),
            awaiting: AwaitingTaskTable::new(),
            services,
            config,
            control: WorkflowControl::new(),
            cancel: CancellationToken::new(),
            bound_inputs: RwLock::new(HashMap::new()),
        }
    }

    /// Ties the run to an outer cancellation token, e.g. the one of a parent workflow.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    /// Pause, resume, step and terminate handle. Clones share the run's state.
    pub fn control(&self) -> WorkflowControl {
        self.control.clone()
    }

    pub fn state(&self) -> WorkflowExecutionState {
        self.control.state()
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        let graph = self.graph.read().expect("RwLock poisoned");
        graph.node_key_by_str(node_id).and_then(|key| graph.state(key))
    }

    /// Runs the workflow to completion.
    ///
    /// `inputs` bind onto Input nodes by node name. The returned future is
    /// boxed so that sub-workflow handlers can run interpreters recursively.
    ///
    /// # Errors
    /// Only if a run of this interpreter is already active. Every failure
    /// during the run is reported through the returned `WorkflowOutcome`.
    pub fn run(&self, inputs: HashMap<String, Value>) -> BoxFuture<'_, Result<WorkflowOutcome, InterpreterError>> {
        self.run_inner(inputs).boxed()
    }

    async fn run_inner(&self, inputs: HashMap<String, Value>) -> Result<WorkflowOutcome, InterpreterError> {
        let dispatcher = self.dispatcher();
        self.control.start(self.status_observer(&dispatcher))?;
        *self.bound_inputs.write().expect("RwLock poisoned") = inputs.clone();

        let run_cancel = self.cancel.child_token();
        log::info!("Workflow {} ({}) starts with {} nodes.", self.workflow_id, self.graph_name(), self.graph.read().expect("RwLock poisoned").len());

        let subscription = self.services.event_bus.subscribe(CompletionListener::new(dispatcher.clone()).into_handler());
        let mut handlers = HandlerSet::new();
        let mut errors = Vec::new();

        match self.seed_inputs(&dispatcher, &inputs) {
            Ok(()) => {
                let ctx = HandlerContext { dispatcher: dispatcher.clone(), config: self.config.clone(), cancel: run_cancel.clone() };
                self.schedule(&ctx, &mut handlers, &mut errors).await;
            }
            Err(e) => raise(&mut errors, e),
        }

        run_cancel.cancel();
        Ok(self.cleanup(&dispatcher, subscription, handlers, errors).await)
    }

    fn dispatcher(&self) -> TaskDispatcher {
        TaskDispatcher::new(
            self.workflow_id.clone(),
            self.graph.clone(),
            self.store.clone(),
            self.awaiting.clone(),
            self.services.clone(),
            self.config.credential_token.clone(),
        )
    }

    /// Publishes Running and Paused at the moment the control moves between them.
    /// Terminal statuses are published by `cleanup`.
    fn status_observer(&self, dispatcher: &TaskDispatcher) -> TransitionObserver {
        let dispatcher = dispatcher.clone();
        let workflow_id = self.workflow_id.clone();
        Arc::new(move |from, to| {
            let Some(status) = published_status(to) else {
                return;
            };
            if published_status(from) == Some(status) {
                return;
            }
            match status {
                WorkflowStatus::Paused => log::info!("Workflow {} is paused.", workflow_id),
                _ if from == WorkflowExecutionState::Paused => log::info!("Workflow {} resumes.", workflow_id),
                _ => {}
            }
            dispatcher.publish_workflow_status(status);
        })
    }

    fn graph_name(&self) -> String {
        self.graph.read().expect("RwLock poisoned").name.clone()
    }

    /// Finishes every waiting Input and Constant node with its value.
    fn seed_inputs(&self, dispatcher: &TaskDispatcher, inputs: &HashMap<String, Value>) -> Result<(), InterpreterError> {
        let seeds: Vec<(NodeKey, HashMap<String, Value>)> = {
            let graph = self.graph.read().expect("RwLock poisoned");

            let known: Vec<&str> = graph.nodes().filter(|(_, node)| matches!(node.kind, NodeKind::Input { .. })).map(|(_, node)| node.name.as_str()).collect();
            for name in inputs.keys().filter(|name| !known.contains(&name.as_str())) {
                log::warn!("Workflow input '{}' does not match any Input node and is ignored.", name);
            }

            let mut seeds = Vec::new();
            for (key, node) in graph.nodes() {
                if node.state != NodeState::Waiting {
                    continue;
                }
                let value = match &node.kind {
                    NodeKind::Input { default } => match inputs.get(&node.name).or(default.as_ref()) {
                        Some(value) => value.clone(),
                        None => return Err(InterpreterError::InputNotSet { node: node.id.to_string(), input: node.name.clone() }),
                    },
                    NodeKind::Constant { value } => value.clone(),
                    _ => continue,
                };
                let outputs = node.data_out.iter().filter_map(|port| graph.port_name(*port)).map(|port_name| (port_name.to_string(), value.clone())).collect();
                seeds.push((key, outputs));
            }
            seeds
        };

        for (key, outputs) in seeds {
            dispatcher.begin(key)?;
            dispatcher.record_outputs(key, &outputs);
            dispatcher.mark_state(key, NodeState::Finished)?;
        }
        Ok(())
    }

    async fn schedule(&self, ctx: &HandlerContext, handlers: &mut HandlerSet, errors: &mut Vec<InterpreterError>) {
        let dispatcher = &ctx.dispatcher;
        let mut backoff = self.config.pause_backoff_initial;
        let mut changes = self.control.subscribe();
        let mut tick = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                log::info!("Workflow {} was cancelled.", self.workflow_id);
                if let Err(e) = self.control.transition(WorkflowExecutionState::Stopped) {
                    log::debug!("Cancelled workflow did not stop cleanly: {}", e);
                }
                break;
            }

            let state = self.control.state();
            match state {
                WorkflowExecutionState::Stopped | WorkflowExecutionState::None => break,
                WorkflowExecutionState::Paused => {
                    reap(handlers, errors);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = changes.changed() => {}
                        _ = self.cancel.cancelled() => {}
                    }
                    backoff = (backoff * 2).min(self.config.pause_backoff_max);
                    continue;
                }
                WorkflowExecutionState::Running | WorkflowExecutionState::Step => backoff = self.config.pause_backoff_initial,
            }

            tick += 1;
            reap(handlers, errors);

            // One snapshot: a completion between readiness and the in-flight count must not look like a stall.
            let (report, executing) = {
                let graph = self.graph.read().expect("RwLock poisoned");
                (readiness::evaluate(&graph), graph.count_in_state(NodeState::Executing))
            };

            if report.is_idle() && executing == 0 && handlers.is_empty() {
                log::info!("Workflow {}: nothing runnable and nothing in flight after {} ticks, stopping.", self.workflow_id, tick);
                if let Err(e) = self.control.transition(WorkflowExecutionState::Stopped) {
                    log::debug!("Workflow did not stop cleanly: {}", e);
                }
                break;
            }

            for (key, fault) in report.faults {
                if let Err(e) = dispatcher.begin(key) {
                    tracing::warn!("Could not start faulted node {}: {}", dispatcher.node_name(key), e);
                }
                dispatcher.fail_node(key);
                raise(errors, fault);
            }

            for key in report.ready {
                let (route, break_flag) = {
                    let graph = self.graph.read().expect("RwLock poisoned");
                    match graph.node(key) {
                        Some(node) => (Route::of(&node.kind), node.break_flag),
                        None => continue,
                    }
                };

                if break_flag {
                    // Fires once; resuming dispatches the node.
                    self.graph.write().expect("RwLock poisoned").set_break(key, false);
                    log::info!("Breakpoint at node {}, pausing workflow {}.", dispatcher.node_name(key), self.workflow_id);
                    if let Err(e) = self.control.transition(WorkflowExecutionState::Paused) {
                        tracing::warn!("Breakpoint could not pause the workflow: {}", e);
                    }
                    break;
                }

                self.launch(ctx, key, route, handlers, errors);
            }

            for key in report.outputs_ready {
                self.drain_output(dispatcher, key);
            }

            if self.control.state() == WorkflowExecutionState::Step {
                log::info!("Workflow {} finished a single step.", self.workflow_id);
                if let Err(e) = self.control.transition(WorkflowExecutionState::Paused) {
                    tracing::warn!("Step could not pause the workflow: {}", e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    fn launch(&self, ctx: &HandlerContext, key: NodeKey, route: Route, handlers: &mut HandlerSet, errors: &mut Vec<InterpreterError>) {
        let dispatcher = &ctx.dispatcher;
        match route {
            Route::Condition => {
                if let Err(e) = handle_if(dispatcher, key) {
                    raise(errors, e);
                }
            }
            Route::Merge => {
                if let Err(e) = handle_end_if(dispatcher, key) {
                    raise(errors, e);
                }
            }
            Route::DoWhile | Route::ForEach | Route::SubWorkflow => {
                if let Err(e) = dispatcher.begin(key) {
                    tracing::warn!("Could not start node {}: {}", dispatcher.node_name(key), e);
                    return;
                }
                let unit = ctx.clone();
                match route {
                    Route::DoWhile => handlers.spawn(run_do_while(unit, key)),
                    Route::ForEach => handlers.spawn(run_for_each(unit, key)),
                    _ => handlers.spawn(run_sub_workflow(unit, key)),
                };
            }
            Route::Task => {
                // Task failures stay on the node.
                if let Err(e) = dispatcher.dispatch(key) {
                    tracing::warn!("Could not dispatch node {}: {}", dispatcher.node_name(key), e);
                }
            }
            Route::Inert => log::debug!("Node {} has nothing to execute.", dispatcher.node_name(key)),
        }
    }

    /// Stores the value reaching an Output node and records it as a workflow output.
    fn drain_output(&self, dispatcher: &TaskDispatcher, key: NodeKey) {
        if let Err(e) = dispatcher.begin(key) {
            tracing::warn!("Could not drain output node {}: {}", dispatcher.node_name(key), e);
            return;
        }

        let (name, value) = {
            let graph = self.graph.read().expect("RwLock poisoned");
            let name = graph.node(key).map(|node| node.name.clone()).unwrap_or_default();
            let value = graph.node(key).and_then(|node| node.data_in.first()).and_then(|port| self.store.resolve(&graph, *port)).unwrap_or(Value::Null);
            (name, value)
        };

        dispatcher.record_outputs(key, &HashMap::from([(OUTPUT_VALUE.to_string(), value.clone())]));
        if let Err(e) = self.services.catalog.record_workflow_output(&self.workflow_id, &name, &value) {
            tracing::warn!("Failed to record workflow output '{}' in the catalog: {}", name, e);
        }
        log::info!("Workflow {} produced output '{}'.", self.workflow_id, name);

        if let Err(e) = dispatcher.mark_state(key, NodeState::Finished) {
            tracing::warn!("Could not finish output node {}: {}", name, e);
        }
    }

    /// Tears the run down and decides its terminal status.
    ///
    /// - **Phase 1**: Stop listening, abandon in-flight tasks and wind down handler units.
    /// - **Phase 2**: Announce Canceling for nodes left Executing.
    /// - **Phase 3**: Derive, record and publish the terminal status, then return to `None`.
    async fn cleanup(&self, dispatcher: &TaskDispatcher, subscription: SubscriptionId, mut handlers: HandlerSet, mut errors: Vec<InterpreterError>) -> WorkflowOutcome {
        // Phase 1: Detach
        if !self.services.event_bus.unsubscribe(subscription) {
            log::warn!("Completion listener of workflow {} was already unsubscribed.", self.workflow_id);
        }
        let abandoned = self.awaiting.clear();
        if !abandoned.is_empty() {
            log::info!("Workflow {} abandons {} in-flight tasks.", self.workflow_id, abandoned.len());
        }

        let grace = self.config.handler_grace_period;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = handlers.join_next().await {
                collect(joined, &mut errors);
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("Handler units of workflow {} did not wind down within {:?}, aborting them.", self.workflow_id, grace);
            handlers.shutdown().await;
        }

        // Phase 2: Cancel leftovers
        let leftovers: Vec<_> = {
            let graph = self.graph.read().expect("RwLock poisoned");
            graph.nodes().filter(|(_, node)| node.state == NodeState::Executing).map(|(_, node)| (node.id.clone(), node.instance_id.clone())).collect()
        };
        for (node_id, instance_id) in leftovers {
            dispatcher.publish_node_status(&node_id, instance_id, NodeStatus::Canceling);
        }

        // Phase 3: Terminal status
        let (outputs, node_states, failed) = {
            let graph = self.graph.read().expect("RwLock poisoned");
            let outputs: BTreeMap<String, Value> = graph
                .nodes()
                .filter(|(_, node)| matches!(node.kind, NodeKind::Output) && node.state == NodeState::Finished)
                .map(|(key, node)| (node.name.clone(), self.store.get(key, OUTPUT_VALUE).unwrap_or(Value::Null)))
                .collect();
            let node_states: BTreeMap<String, NodeState> = graph.nodes().map(|(_, node)| (node.id.to_string(), node.state)).collect();
            (outputs, node_states, graph.count_in_state(NodeState::Failed))
        };

        let interrupted = self.control.was_terminated() || self.cancel.is_cancelled();
        let status = if interrupted || failed > 0 || !errors.is_empty() { WorkflowStatus::Failed } else { WorkflowStatus::Completed };

        if let Err(e) = self.services.catalog.update_workflow_status(&self.workflow_id, status) {
            tracing::warn!("Failed to record status {:?} of workflow {} in the catalog: {}", status, self.workflow_id, e);
        }
        dispatcher.publish_workflow_status(status);
        self.control.finish();

        log::info!(
            "Workflow {} ended {:?}: {} outputs, {} failed nodes, {} errors{}.",
            self.workflow_id,
            status,
            outputs.len(),
            failed,
            errors.len(),
            if interrupted { ", interrupted" } else { "" }
        );

        WorkflowOutcome { workflow_id: self.workflow_id.clone(), status, outputs, errors, node_states }
    }

    /// Resets `node_id` and everything downstream of it to Waiting so the next
    /// tick, or the next run, executes them again.
    ///
    /// While paused, reset Input and Constant nodes are seeded again right away
    /// with the inputs of the current run, since the scheduler only seeds once
    /// per run. After a run they wait for the inputs of the next one.
    ///
    /// # Returns
    /// The number of reset nodes.
    pub fn rerun_from(&self, node_id: &str) -> Result<usize, InterpreterError> {
        let state = self.control.state();
        if !matches!(state, WorkflowExecutionState::None | WorkflowExecutionState::Paused) {
            return Err(InterpreterError::InvalidWorkflowTransition { from: state, to: WorkflowExecutionState::Running });
        }

        let reset = {
            let mut graph = self.graph.write().expect("RwLock poisoned");
            let start = graph.node_key_by_str(node_id).ok_or_else(|| InterpreterError::UnknownNode(node_id.to_string()))?;
            let closure = graph.downstream_closure(start);

            if let Some(executing) = closure.iter().find(|key| graph.state(**key) == Some(NodeState::Executing)) {
                return Err(InterpreterError::RerunWhileExecuting { node: node_id.to_string(), executing: graph.node_name(*executing) });
            }

            for key in &closure {
                graph.reset_node(*key);
                self.store.clear(*key);
            }
            closure.len()
        };
        log::info!("Reset {} nodes downstream of {} for a re-run.", reset, node_id);

        if state == WorkflowExecutionState::Paused {
            let inputs = self.bound_inputs.read().expect("RwLock poisoned").clone();
            self.seed_inputs(&self.dispatcher(), &inputs)?;
        }
        Ok(reset)
    }
}

/// Workflow status announced while a run is active, if any.
fn published_status(state: WorkflowExecutionState) -> Option<WorkflowStatus> {
    match state {
        WorkflowExecutionState::Running | WorkflowExecutionState::Step => Some(WorkflowStatus::Running),
        WorkflowExecutionState::Paused => Some(WorkflowStatus::Paused),
        WorkflowExecutionState::None | WorkflowExecutionState::Stopped => None,
    }
}

fn raise(errors: &mut Vec<InterpreterError>, error: InterpreterError) {
    tracing::error!("{}", error);
    errors.push(error);
}

/// Collects finished handler units without waiting.
fn reap(handlers: &mut HandlerSet, errors: &mut Vec<InterpreterError>) {
    while let Some(joined) = handlers.try_join_next() {
        collect(joined, errors);
    }
}

fn collect(joined: Result<Result<(), InterpreterError>, tokio::task::JoinError>, errors: &mut Vec<InterpreterError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => raise(errors, e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!("A handler unit panicked: {}", e),
    }
}
