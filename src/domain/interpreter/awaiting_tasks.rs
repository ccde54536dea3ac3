use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bimap::BiMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::domain::graph::graph::NodeKey;
use crate::domain::utils::id::TaskId;

/// One execution slot: a plain node has a single slot, a ForEach body one per fan-out run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AwaitKey {
    pub node: NodeKey,
    pub iteration: Option<usize>,
}

impl AwaitKey {
    pub fn node(node: NodeKey) -> Self {
        AwaitKey { node, iteration: None }
    }

    pub fn run(node: NodeKey, iteration: usize) -> Self {
        AwaitKey { node, iteration: Some(iteration) }
    }
}

/// Result delivered to a handler waiting on a single invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Finished(HashMap<String, Value>),
    Failed(String),
}

#[derive(Debug, Default)]
struct TableInner {
    /// Bidirectional, so a slot can never hold two in-flight tasks.
    tasks: BiMap<TaskId, AwaitKey>,
    waiters: HashMap<TaskId, oneshot::Sender<TaskOutcome>>,
}

/// Tasks submitted to the execution service and not completed yet.
#[derive(Debug, Clone, Default)]
pub struct AwaitingTaskTable {
    inner: Arc<Mutex<TableInner>>,
}

impl AwaitingTaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task for an execution slot.
    ///
    /// # Returns
    /// `false` if the slot (or the task id) is already in flight, nothing is inserted then.
    pub fn insert(&self, task_id: TaskId, key: AwaitKey, waiter: Option<oneshot::Sender<TaskOutcome>>) -> bool {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        if guard.tasks.insert_no_overwrite(task_id.clone(), key).is_err() {
            return false;
        }
        if let Some(waiter) = waiter {
            guard.waiters.insert(task_id, waiter);
        }
        true
    }

    pub fn lookup(&self, task_id: &TaskId) -> Option<AwaitKey> {
        let guard = self.inner.lock().expect("Mutex poisoned");
        guard.tasks.get_by_left(task_id).copied()
    }

    pub fn contains(&self, key: &AwaitKey) -> bool {
        let guard = self.inner.lock().expect("Mutex poisoned");
        guard.tasks.contains_right(key)
    }

    /// Removes a task, handing back its slot and the waiter if one was registered.
    pub fn remove(&self, task_id: &TaskId) -> Option<(AwaitKey, Option<oneshot::Sender<TaskOutcome>>)> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        let (_, key) = guard.tasks.remove_by_left(task_id)?;
        let waiter = guard.waiters.remove(task_id);
        Some((key, waiter))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry. Waiters see a closed channel.
    ///
    /// # Returns
    /// The abandoned tasks.
    pub fn clear(&self) -> Vec<(TaskId, AwaitKey)> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        guard.waiters.clear();
        let tasks = std::mem::take(&mut guard.tasks);
        tasks.into_iter().collect()
    }
}
