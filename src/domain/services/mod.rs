use std::sync::Arc;

use crate::domain::services::catalog::{Catalog, InMemoryCatalog};
use crate::domain::services::evaluator::{PredicateEvaluator, SimpleExpressionEvaluator};
use crate::domain::services::event_bus::EventBus;
use crate::domain::services::status_publisher::{LogStatusPublisher, StatusPublisher};
use crate::domain::services::task_service::TaskService;

pub mod catalog;
pub mod evaluator;
pub mod event_bus;
pub mod status_publisher;
pub mod task_service;

/// The external collaborators of an interpreter run. Nested sub-workflow
/// interpreters share the same set.
#[derive(Debug, Clone)]
pub struct InterpreterServices {
    pub task_service: Arc<dyn TaskService>,
    pub event_bus: Arc<dyn EventBus>,
    pub catalog: Arc<dyn Catalog>,
    pub publisher: Arc<dyn StatusPublisher>,
    pub evaluator: Arc<dyn PredicateEvaluator>,
}

impl InterpreterServices {
    /// In-memory catalog, log publisher and the built-in expression evaluator
    /// around the given execution service and event bus.
    pub fn new(task_service: Arc<dyn TaskService>, event_bus: Arc<dyn EventBus>) -> Self {
        InterpreterServices {
            task_service,
            event_bus,
            catalog: Arc::new(InMemoryCatalog::new()),
            publisher: Arc::new(LogStatusPublisher),
            evaluator: Arc::new(SimpleExpressionEvaluator),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn PredicateEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }
}
