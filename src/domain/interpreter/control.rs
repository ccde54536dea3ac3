use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;

use crate::error::InterpreterError;

/// Execution state of a workflow run.
///
/// `None -> Running -> {Paused, Step, Stopped}`, `Stopped -> None` after cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum WorkflowExecutionState {
    #[default]
    None,
    Running,
    Paused,
    /// Runs exactly one readiness pass, then pauses.
    Step,
    Stopped,
}

impl WorkflowExecutionState {
    pub fn can_transition_to(self, next: WorkflowExecutionState) -> bool {
        use WorkflowExecutionState::*;
        matches!(
            (self, next),
            (None, Running)
                | (Running, Paused)
                | (Running, Step)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Step)
                | (Paused, Stopped)
                | (Step, Running)
                | (Step, Paused)
                | (Step, Stopped)
                | (Stopped, None)
        )
    }
}

/// Called with `(from, to)` for every applied transition, while the control
/// is still locked. Observers must not call back into the control.
pub type TransitionObserver = Arc<dyn Fn(WorkflowExecutionState, WorkflowExecutionState) + Send + Sync>;

#[derive(Default)]
struct ControlInner {
    state: WorkflowExecutionState,

    /// Set by `terminate`. A terminated run always ends Failed.
    terminated: bool,

    /// Installed by `start` for the duration of one run.
    observer: Option<TransitionObserver>,
}

impl fmt::Debug for ControlInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlInner").field("state", &self.state).field("terminated", &self.terminated).field("observed", &self.observer.is_some()).finish()
    }
}

/// Handle to the workflow execution state, shared between the scheduler and
/// whoever controls the run. Clones refer to the same state.
///
/// Every transition is reported to the run's observer as it happens and is
/// broadcast on a watch channel, so a pause and resume in quick succession
/// are never lost between two scheduler ticks.
#[derive(Debug, Clone)]
pub struct WorkflowControl {
    inner: Arc<Mutex<ControlInner>>,
    changes: Arc<watch::Sender<WorkflowExecutionState>>,
}

impl Default for WorkflowControl {
    fn default() -> Self {
        let (changes, _) = watch::channel(WorkflowExecutionState::None);
        WorkflowControl { inner: Arc::new(Mutex::new(ControlInner::default())), changes: Arc::new(changes) }
    }
}

impl WorkflowControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkflowExecutionState {
        self.inner.lock().expect("Mutex poisoned").state
    }

    pub fn was_terminated(&self) -> bool {
        self.inner.lock().expect("Mutex poisoned").terminated
    }

    /// Receiver that wakes on every state change.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowExecutionState> {
        self.changes.subscribe()
    }

    pub fn pause(&self) -> Result<(), InterpreterError> {
        self.transition(WorkflowExecutionState::Paused)
    }

    pub fn resume(&self) -> Result<(), InterpreterError> {
        self.transition(WorkflowExecutionState::Running)
    }

    pub fn step(&self) -> Result<(), InterpreterError> {
        self.transition(WorkflowExecutionState::Step)
    }

    pub fn terminate(&self) -> Result<(), InterpreterError> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        self.apply(&mut guard, WorkflowExecutionState::Stopped)?;
        guard.terminated = true;
        log::info!("Workflow termination requested.");
        Ok(())
    }

    /// `None -> Running`, resetting the termination flag of a previous run.
    /// `observer` sees this transition and every later one until `finish`.
    pub(crate) fn start(&self, observer: TransitionObserver) -> Result<(), InterpreterError> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        // Paused -> Running is a resume, not a second run.
        if guard.state != WorkflowExecutionState::None {
            return Err(InterpreterError::InvalidWorkflowTransition { from: guard.state, to: WorkflowExecutionState::Running });
        }
        guard.observer = Some(observer);
        guard.terminated = false;
        self.apply(&mut guard, WorkflowExecutionState::Running)
    }

    pub(crate) fn transition(&self, next: WorkflowExecutionState) -> Result<(), InterpreterError> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        self.apply(&mut guard, next)
    }

    /// Returns to `None` after cleanup, from whatever state the run ended in,
    /// and drops the run's observer.
    pub(crate) fn finish(&self) {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        let from = guard.state;
        guard.state = WorkflowExecutionState::None;
        self.notify(&guard, from, WorkflowExecutionState::None);
        guard.observer = None;
    }

    fn apply(&self, inner: &mut ControlInner, next: WorkflowExecutionState) -> Result<(), InterpreterError> {
        if !inner.state.can_transition_to(next) {
            return Err(InterpreterError::InvalidWorkflowTransition { from: inner.state, to: next });
        }
        let from = inner.state;
        inner.state = next;
        self.notify(inner, from, next);
        Ok(())
    }

    fn notify(&self, inner: &ControlInner, from: WorkflowExecutionState, to: WorkflowExecutionState) {
        if let Some(observer) = &inner.observer {
            observer(from, to);
        }
        self.changes.send_replace(to);
    }
}
