use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::domain::graph::node::NodeState;
use crate::domain::interpreter::awaiting_tasks::TaskOutcome;
use crate::domain::interpreter::dispatcher::TaskDispatcher;
use crate::domain::services::event_bus::{EventHandler, TaskEvent, TaskOutputChanged, TaskPhase, TaskStatusChanged};

/// Receiver of task completion events.
pub trait TaskEventListener: Send + Sync {
    fn on_task_status_changed(&self, event: &TaskStatusChanged);

    fn on_task_output_changed(&self, event: &TaskOutputChanged);

    fn on_task_event(&self, event: &TaskEvent) {
        match event {
            TaskEvent::StatusChanged(status) => self.on_task_status_changed(status),
            TaskEvent::OutputChanged(outputs) => self.on_task_output_changed(outputs),
        }
    }
}

/// Advances node state from the execution service's events.
///
/// A bare `Completed` status is not final, the node finishes only when its
/// output event arrives. `Failed` and `Canceled` are final immediately.
/// Events for tasks that are no longer awaited (finished, failed, or from a
/// stopped run) are ignored.
#[derive(Debug, Clone)]
pub struct CompletionListener {
    dispatcher: TaskDispatcher,
}

impl CompletionListener {
    pub fn new(dispatcher: TaskDispatcher) -> Self {
        CompletionListener { dispatcher }
    }

    pub fn into_handler(self) -> EventHandler {
        let listener = Arc::new(self);
        Arc::new(move |event: &TaskEvent| listener.on_task_event(event))
    }
}

impl TaskEventListener for CompletionListener {
    fn on_task_status_changed(&self, event: &TaskStatusChanged) {
        let awaiting = self.dispatcher.awaiting();
        if awaiting.lookup(&event.task_id).is_none() {
            log::trace!("Ignoring status {:?} of task {} which is not awaited.", event.phase, event.task_id);
            return;
        }

        match event.phase {
            phase if phase.is_failure() => {
                let reason = event.reason.clone().unwrap_or_else(|| format!("Execution service reported {:?}", phase));
                if let Some((slot, waiter)) = awaiting.remove(&event.task_id) {
                    self.dispatcher.settle_failure(slot, waiter, reason);
                }
            }
            TaskPhase::Completed => log::debug!("Task {} completed, waiting for its outputs.", event.task_id),
            phase => log::trace!("Task {} is {:?}.", event.task_id, phase),
        }
    }

    fn on_task_output_changed(&self, event: &TaskOutputChanged) {
        let Some((slot, waiter)) = self.dispatcher.awaiting().remove(&event.task_id) else {
            log::debug!("Ignoring outputs of task {} which is not awaited.", event.task_id);
            return;
        };

        let declared: Vec<String> = {
            let graph = self.dispatcher.graph().read().expect("RwLock poisoned");
            graph.node(slot.node).map(|node| node.data_out.iter().filter_map(|port| graph.port_name(*port).map(str::to_string)).collect()).unwrap_or_default()
        };

        let outputs: HashMap<String, Value> =
            event.outputs.iter().filter(|output| declared.contains(&output.name)).map(|output| (output.name.clone(), output.value.clone())).collect();
        if outputs.len() < event.outputs.len() {
            log::debug!("Dropped {} undeclared outputs of task {}.", event.outputs.len() - outputs.len(), event.task_id);
        }

        // Fan-out runs are joined by the ForEach handler, which owns the body's state.
        if slot.iteration.is_none() {
            self.dispatcher.record_outputs(slot.node, &outputs);
            if let Err(e) = self.dispatcher.mark_state(slot.node, NodeState::Finished) {
                tracing::warn!("Completion of task {} was not applied: {}", event.task_id, e);
            }
        }

        if let Some(waiter) = waiter {
            let _ = waiter.send(TaskOutcome::Finished(outputs));
        }
    }
}
