use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::domain::graph::graph::{NodeKey, PortKey, WorkflowGraph};

/// Values produced by nodes, keyed by (node, port name).
///
/// Only the producing node or its handler writes. Entries are cleared on
/// re-run and by the DoWhile handler between iterations.
#[derive(Debug, Clone, Default)]
pub struct OutputStore {
    inner: Arc<RwLock<HashMap<NodeKey, HashMap<String, Value>>>>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, node: NodeKey, port: &str, value: Value) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.entry(node).or_default().insert(port.to_string(), value);
    }

    pub fn get(&self, node: NodeKey, port: &str) -> Option<Value> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.get(&node).and_then(|outputs| outputs.get(port)).cloned()
    }

    pub fn outputs_of(&self, node: NodeKey) -> HashMap<String, Value> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.get(&node).cloned().unwrap_or_default()
    }

    pub fn clear(&self, node: NodeKey) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.remove(&node);
    }

    /// Value flowing into a data-in port, read from the producing node's output.
    pub fn resolve(&self, graph: &WorkflowGraph, input: PortKey) -> Option<Value> {
        let source = graph.source_port(input)?;
        let port = graph.port(source)?;
        self.get(port.node, &port.name)
    }

    /// Resolved values of all data-in ports of `node` in port order, `Null` where unresolved.
    pub fn resolve_inputs(&self, graph: &WorkflowGraph, node: NodeKey) -> Vec<Value> {
        let Some(owner) = graph.node(node) else {
            return Vec::new();
        };
        owner.data_in.iter().map(|port| self.resolve(graph, *port).unwrap_or(Value::Null)).collect()
    }
}
