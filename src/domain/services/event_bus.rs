use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::utils::id::TaskId;

/// Phase of an external task as reported by the execution service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskPhase {
    Created,
    Validated,
    Scheduled,
    Launched,
    Executing,
    Completed,
    Failed,
    Canceling,
    Canceled,
    Unknown,
}

impl TaskPhase {
    pub fn is_failure(self) -> bool {
        matches!(self, TaskPhase::Failed | TaskPhase::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusChanged {
    pub task_id: TaskId,
    pub phase: TaskPhase,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutputChanged {
    pub task_id: TaskId,
    pub outputs: Vec<TaskOutput>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    StatusChanged(TaskStatusChanged),
    OutputChanged(TaskOutputChanged),
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEvent::StatusChanged(event) => &event.task_id,
            TaskEvent::OutputChanged(event) => &event.task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub type EventHandler = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Publish/subscribe transport for task completion events.
///
/// Handlers may be invoked on any thread.
pub trait EventBus: Send + Sync + fmt::Debug {
    fn subscribe(&self, handler: EventHandler) -> SubscriptionId;

    /// # Returns
    /// `true` if the subscription existed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn publish(&self, event: TaskEvent);
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: Vec<(SubscriptionId, EventHandler)>,
}

/// Event bus delivering synchronously on the publishing thread.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").handlers.len()
    }
}

impl fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventBus").field("subscribers", &self.subscriber_count()).finish()
    }
}

impl EventBus for InMemoryEventBus {
    fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        guard.next_id += 1;
        let id = SubscriptionId(guard.next_id);
        guard.handlers.push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        let before = guard.handlers.len();
        guard.handlers.retain(|(existing, _)| *existing != id);
        guard.handlers.len() != before
    }

    fn publish(&self, event: TaskEvent) {
        // Handlers run outside the bus lock so they may (un)subscribe.
        let handlers: Vec<EventHandler> = {
            let guard = self.inner.lock().expect("Mutex poisoned");
            guard.handlers.iter().map(|(_, handler)| handler.clone()).collect()
        };

        if handlers.is_empty() {
            log::debug!("No subscriber for event of task {}.", event.task_id());
        }

        for handler in handlers {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn status(phase: TaskPhase) -> TaskEvent {
        TaskEvent::StatusChanged(TaskStatusChanged { task_id: TaskId::new("t-1"), phase, reason: None })
    }

    #[test]
    fn test_publish_reaches_subscribers_until_unsubscribed() {
        let bus = InMemoryEventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let id = bus.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(status(TaskPhase::Launched));
        assert!(bus.unsubscribe(id));
        bus.publish(status(TaskPhase::Completed));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_failure_phases() {
        assert!(TaskPhase::Failed.is_failure());
        assert!(TaskPhase::Canceled.is_failure());
        assert!(!TaskPhase::Completed.is_failure());
        assert!(!TaskPhase::Canceling.is_failure());
    }
}
