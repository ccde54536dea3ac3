use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;
use slotmap::{SlotMap, new_key_type};

use crate::api::graph_dto::{GraphDto, NodeDto, PortDto};
use crate::domain::graph::node::{Node, NodeKind, NodeState, ResourceAction};
use crate::domain::graph::port::{Edge, Port, PortDirection, ValueType};
use crate::domain::utils::id::{NodeId, NodeInstanceId};
use crate::error::{Error, InterpreterError, Result};

new_key_type! {
    pub struct NodeKey;
    pub struct PortKey;
    pub struct EdgeKey;
}

/// Name of the single control-in port every node may carry.
pub const CONTROL_IN: &str = "control";

/// The workflow graph: arenas of nodes, ports and edges addressed by slotmap keys.
///
/// Topology is fixed once built. The interpreter only mutates runtime fields
/// (node state, break flag, catalog instance, condition flags on control edges).
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    pub name: String,

    nodes: SlotMap<NodeKey, Node>,
    ports: SlotMap<PortKey, Port>,
    edges: SlotMap<EdgeKey, Edge>,

    /// Insertion order of the nodes, which is the dispatch order within a tick.
    order: Vec<NodeKey>,

    /// Index lookup NodeKey using the user node id.
    id_index: HashMap<NodeId, NodeKey>,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        WorkflowGraph { name: name.into(), ..Default::default() }
    }

    /// Builds the graph from its serialized form.
    ///
    /// Phase 1 creates every node together with its ports, Phase 2 resolves the
    /// edge endpoints by node id and port name and connects them.
    pub fn from_dto(dto: GraphDto) -> Result<Self> {
        let mut graph = WorkflowGraph::new(dto.name);

        // Phase 1: Nodes and ports
        for node_dto in dto.nodes {
            graph.add_node_from_dto(node_dto)?;
        }

        // Phase 2: Edges
        for edge in &dto.edges {
            graph.connect_by_name(&edge.from.node, &edge.from.port, &edge.to.node, &edge.to.port)?;
        }

        log::debug!("Graph '{}' built with {} nodes, {} ports and {} edges.", graph.name, graph.nodes.len(), graph.ports.len(), graph.edges.len());

        Ok(graph)
    }

    fn add_node_from_dto(&mut self, dto: NodeDto) -> Result<NodeKey> {
        let NodeDto { id, name, kind, data_in, data_out, control_in, mut control_out, service, expression, value, sub_workflow, break_point } = dto;

        let kind = node_kind_from_dto(&id, &kind, service, expression, value, sub_workflow)?;
        let is_if = matches!(kind, NodeKind::If { .. });
        let name = name.unwrap_or_else(|| id.clone());
        let key = self.add_named_node(&id, &name, kind)?;
        self.set_break(key, break_point);

        for port in &data_in {
            self.add_port(key, &port.name, PortDirection::DataIn, parse_value_type(&id, port)?)?;
        }
        for port in &data_out {
            self.add_port(key, &port.name, PortDirection::DataOut, parse_value_type(&id, port)?)?;
        }
        if control_in {
            self.add_control_in(key)?;
        }

        if is_if {
            if control_out.is_empty() {
                control_out = vec!["true".to_string(), "false".to_string()];
            }
            if control_out.len() != 2 {
                return Err(Error::GraphConstructionError(format!("If '{}' needs exactly two control-out ports, got {}", id, control_out.len())));
            }
        }
        for port_name in &control_out {
            self.add_control_out(key, port_name)?;
        }

        Ok(key)
    }

    pub fn add_node(&mut self, id: &str, kind: NodeKind) -> Result<NodeKey> {
        self.add_named_node(id, id, kind)
    }

    pub fn add_named_node(&mut self, id: &str, name: &str, kind: NodeKind) -> Result<NodeKey> {
        let node_id = NodeId::new(id);
        if self.id_index.contains_key(&node_id) {
            return Err(Error::GraphConstructionError(format!("Duplicate node id '{}'", id)));
        }

        let key = self.nodes.insert(Node::new(node_id.clone(), name.to_string(), kind));
        self.order.push(key);
        self.id_index.insert(node_id, key);
        Ok(key)
    }

    pub fn add_port(&mut self, node: NodeKey, name: &str, direction: PortDirection, value_type: ValueType) -> Result<PortKey> {
        let Some(owner) = self.nodes.get(node) else {
            return Err(Error::GraphConstructionError(format!("Cannot add port '{}' to an unknown node", name)));
        };

        if direction == PortDirection::ControlIn && owner.control_in.is_some() {
            return Err(Error::GraphConstructionError(format!("Node '{}' already has a control-in port", owner.id)));
        }
        if self.port_by_name(node, direction, name).is_some() {
            return Err(Error::GraphConstructionError(format!("Node '{}' already has a {:?} port named '{}'", owner.id, direction, name)));
        }

        let key = self.ports.insert(Port { name: name.to_string(), direction, node, value_type, edges: Vec::new() });

        if let Some(owner) = self.nodes.get_mut(node) {
            match direction {
                PortDirection::DataIn => owner.data_in.push(key),
                PortDirection::DataOut => owner.data_out.push(key),
                PortDirection::ControlIn => owner.control_in = Some(key),
                PortDirection::ControlOut => owner.control_out.push(key),
            }
        }

        Ok(key)
    }

    pub fn add_data_in(&mut self, node: NodeKey, name: &str) -> Result<PortKey> {
        self.add_port(node, name, PortDirection::DataIn, ValueType::Any)
    }

    pub fn add_data_out(&mut self, node: NodeKey, name: &str) -> Result<PortKey> {
        self.add_port(node, name, PortDirection::DataOut, ValueType::Any)
    }

    pub fn add_control_in(&mut self, node: NodeKey) -> Result<PortKey> {
        self.add_port(node, CONTROL_IN, PortDirection::ControlIn, ValueType::Any)
    }

    pub fn add_control_out(&mut self, node: NodeKey, name: &str) -> Result<PortKey> {
        self.add_port(node, name, PortDirection::ControlOut, ValueType::Any)
    }

    /// Connects an output port to an input port.
    ///
    /// Data edges run DataOut -> DataIn, control edges ControlOut -> ControlIn.
    /// A data-in port accepts a single incoming edge.
    pub fn connect(&mut self, from: PortKey, to: PortKey) -> Result<EdgeKey> {
        let (Some(from_port), Some(to_port)) = (self.ports.get(from), self.ports.get(to)) else {
            return Err(Error::GraphConstructionError("Cannot connect unknown ports".to_string()));
        };

        if from_port.direction.is_input() || from_port.direction.counterpart() != to_port.direction {
            return Err(Error::GraphConstructionError(format!(
                "Edge '{}' ({:?}) -> '{}' ({:?}) violates port directions",
                from_port.name, from_port.direction, to_port.name, to_port.direction
            )));
        }
        if !to_port.direction.is_control() && !to_port.edges.is_empty() {
            return Err(Error::GraphConstructionError(format!(
                "Data port '{}' of '{}' is already connected",
                to_port.name,
                self.node_name(to_port.node)
            )));
        }

        let edge = self.edges.insert(Edge { from, to, condition_met: None });
        if let Some(port) = self.ports.get_mut(from) {
            port.edges.push(edge);
        }
        if let Some(port) = self.ports.get_mut(to) {
            port.edges.push(edge);
        }

        Ok(edge)
    }

    /// Connects two ports addressed by node id and port name. Data ports are
    /// preferred over control ports of the same name.
    pub fn connect_by_name(&mut self, from_node: &str, from_port: &str, to_node: &str, to_port: &str) -> Result<EdgeKey> {
        let from_key = self.node_key_by_str(from_node).ok_or_else(|| Error::GraphConstructionError(format!("Edge source node '{}' not found", from_node)))?;
        let to_key = self.node_key_by_str(to_node).ok_or_else(|| Error::GraphConstructionError(format!("Edge target node '{}' not found", to_node)))?;

        let source = self
            .port_by_name(from_key, PortDirection::DataOut, from_port)
            .or_else(|| self.port_by_name(from_key, PortDirection::ControlOut, from_port))
            .ok_or_else(|| Error::GraphConstructionError(format!("Output port '{}' not found on '{}'", from_port, from_node)))?;
        let target = self
            .port_by_name(to_key, PortDirection::DataIn, to_port)
            .or_else(|| self.port_by_name(to_key, PortDirection::ControlIn, to_port))
            .ok_or_else(|| Error::GraphConstructionError(format!("Input port '{}' not found on '{}'", to_port, to_node)))?;

        self.connect(source, target)
    }

    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn port(&self, key: PortKey) -> Option<&Port> {
        self.ports.get(key)
    }

    pub fn edge(&self, key: EdgeKey) -> Option<&Edge> {
        self.edges.get(key)
    }

    pub fn node_key(&self, id: &NodeId) -> Option<NodeKey> {
        self.id_index.get(id).copied()
    }

    pub fn node_key_by_str(&self, id: &str) -> Option<NodeKey> {
        self.node_key(&NodeId::new(id))
    }

    /// Nodes in graph order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeKey, &Node)> + '_ {
        self.order.iter().filter_map(|key| self.nodes.get(*key).map(|node| (*key, node)))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn state(&self, key: NodeKey) -> Option<NodeState> {
        self.nodes.get(key).map(|node| node.state)
    }

    pub fn is_finished(&self, key: NodeKey) -> bool {
        self.state(key) == Some(NodeState::Finished)
    }

    /// User id of a node, for logs and error messages.
    pub fn node_name(&self, key: NodeKey) -> String {
        self.nodes.get(key).map(|node| node.id.to_string()).unwrap_or_else(|| "<unknown>".to_string())
    }

    pub fn count_in_state(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|node| node.state == state).count()
    }

    pub fn port_by_name(&self, node: NodeKey, direction: PortDirection, name: &str) -> Option<PortKey> {
        let owner = self.nodes.get(node)?;
        let candidates: Vec<PortKey> = match direction {
            PortDirection::DataIn => owner.data_in.clone(),
            PortDirection::DataOut => owner.data_out.clone(),
            PortDirection::ControlIn => owner.control_in.into_iter().collect(),
            PortDirection::ControlOut => owner.control_out.clone(),
        };
        candidates.into_iter().find(|key| self.ports.get(*key).is_some_and(|port| port.name == name))
    }

    pub fn port_name(&self, key: PortKey) -> Option<&str> {
        self.ports.get(key).map(|port| port.name.as_str())
    }

    pub fn incoming_edges(&self, port: PortKey) -> impl Iterator<Item = &Edge> + '_ {
        self.edges_of(port).filter(move |edge| edge.to == port)
    }

    pub fn outgoing_edges(&self, port: PortKey) -> impl Iterator<Item = &Edge> + '_ {
        self.edges_of(port).filter(move |edge| edge.from == port)
    }

    fn edges_of(&self, port: PortKey) -> impl Iterator<Item = &Edge> + '_ {
        self.ports.get(port).into_iter().flat_map(|port| port.edges.iter()).filter_map(|key| self.edges.get(*key))
    }

    /// The output port feeding a data-in port, if it is connected.
    pub fn source_port(&self, input: PortKey) -> Option<PortKey> {
        self.incoming_edges(input).next().map(|edge| edge.from)
    }

    pub fn source_node(&self, input: PortKey) -> Option<NodeKey> {
        self.source_port(input).and_then(|port| self.ports.get(port)).map(|port| port.node)
    }

    /// Nodes fed by any data-out port of `node`, in first-seen order.
    pub fn data_consumers(&self, node: NodeKey) -> Vec<NodeKey> {
        let Some(owner) = self.nodes.get(node) else {
            return Vec::new();
        };
        self.consumers_of(&owner.data_out)
    }

    /// Data and control successors of `node`.
    pub fn successors(&self, node: NodeKey) -> Vec<NodeKey> {
        let Some(owner) = self.nodes.get(node) else {
            return Vec::new();
        };
        let ports: Vec<PortKey> = owner.data_out.iter().chain(owner.control_out.iter()).copied().collect();
        self.consumers_of(&ports)
    }

    fn consumers_of(&self, ports: &[PortKey]) -> Vec<NodeKey> {
        let mut seen = HashSet::new();
        let mut consumers = Vec::new();
        for port in ports {
            for edge in self.outgoing_edges(*port) {
                if let Some(target) = self.ports.get(edge.to) {
                    if seen.insert(target.node) {
                        consumers.push(target.node);
                    }
                }
            }
        }
        consumers
    }

    /// `start` and every node reachable from it, breadth first.
    pub fn downstream_closure(&self, start: NodeKey) -> Vec<NodeKey> {
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut closure = Vec::new();

        while let Some(current) = queue.pop_front() {
            closure.push(current);
            for next in self.successors(current) {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        closure
    }

    /// Moves a node to `next`, enforcing the monotonic state machine.
    ///
    /// # Returns
    /// The previous state.
    pub fn transition(&mut self, key: NodeKey, next: NodeState) -> std::result::Result<NodeState, InterpreterError> {
        let node = self.nodes.get_mut(key).ok_or_else(|| InterpreterError::UnknownNode(format!("{:?}", key)))?;
        let previous = node.state;
        if !previous.can_transition_to(next) {
            return Err(InterpreterError::InvalidNodeTransition { node: node.id.to_string(), from: previous, to: next });
        }
        node.state = next;
        Ok(previous)
    }

    /// Controlled reset back to `Waiting`, used by re-run and loop iterations.
    pub fn reset_node(&mut self, key: NodeKey) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.state = NodeState::Waiting;
            node.instance_id = None;
        }
        self.clear_conditions(key);
    }

    pub fn set_break(&mut self, key: NodeKey, enabled: bool) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.break_flag = enabled;
        }
    }

    pub fn set_instance_id(&mut self, key: NodeKey, instance_id: NodeInstanceId) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.instance_id = Some(instance_id);
        }
    }

    /// Sets the condition flag on every edge leaving a control-out port.
    pub fn set_condition(&mut self, control_out: PortKey, met: bool) {
        let edge_keys = self.ports.get(control_out).map(|port| port.edges.clone()).unwrap_or_default();
        for key in edge_keys {
            if let Some(edge) = self.edges.get_mut(key) {
                if edge.from == control_out {
                    edge.condition_met = Some(met);
                }
            }
        }
    }

    pub fn clear_conditions(&mut self, node: NodeKey) {
        let control_out = self.nodes.get(node).map(|node| node.control_out.clone()).unwrap_or_default();
        for port in control_out {
            let edge_keys = self.ports.get(port).map(|port| port.edges.clone()).unwrap_or_default();
            for key in edge_keys {
                if let Some(edge) = self.edges.get_mut(key) {
                    edge.condition_met = None;
                }
            }
        }
    }
}

fn parse_value_type(node_id: &str, port: &PortDto) -> Result<ValueType> {
    let tag = port.value_type.as_deref().unwrap_or("any");
    ValueType::parse(tag).ok_or_else(|| Error::GraphConstructionError(format!("Port '{}' of '{}' has unknown value type '{}'", port.name, node_id, tag)))
}

fn node_kind_from_dto(
    id: &str,
    kind: &str,
    service: Option<String>,
    expression: Option<String>,
    value: Option<Value>,
    sub_workflow: Option<Box<GraphDto>>,
) -> Result<NodeKind> {
    let required = |field: Option<String>, what: &str| field.ok_or_else(|| Error::GraphConstructionError(format!("Node '{}' of kind '{}' needs a {}", id, kind, what)));

    let normalized: String = kind.chars().filter(|c| *c != '_' && *c != '-').collect::<String>().to_ascii_lowercase();

    let node_kind = match normalized.as_str() {
        "input" => NodeKind::Input { default: value },
        "output" => NodeKind::Output,
        "constant" => NodeKind::Constant {
            value: value.ok_or_else(|| Error::GraphConstructionError(format!("Constant '{}' has no value", id)))?,
        },
        "service" | "serviceinvocation" => NodeKind::ServiceInvocation { service: required(service, "service")? },
        "dynamic" => NodeKind::Dynamic { service: required(service, "service")? },
        "if" => NodeKind::If { expression: required(expression, "expression")? },
        "endif" => NodeKind::EndIf,
        "dowhile" => NodeKind::DoWhile { expression: required(expression, "expression")? },
        "enddowhile" => NodeKind::EndDoWhile,
        "foreach" => NodeKind::ForEach,
        "endforeach" => NodeKind::EndForEach,
        "subworkflow" => {
            let inner = sub_workflow.ok_or_else(|| Error::GraphConstructionError(format!("Sub-workflow '{}' has no inner graph", id)))?;
            NodeKind::SubWorkflow { graph: Box::new(WorkflowGraph::from_dto(*inner)?) }
        }
        "resourcestart" | "instance" => NodeKind::ResourceLifecycle { action: ResourceAction::Start, service: service.unwrap_or_else(|| "resource".to_string()) },
        "resourceterminate" | "terminateinstance" => {
            NodeKind::ResourceLifecycle { action: ResourceAction::Terminate, service: service.unwrap_or_else(|| "resource".to_string()) }
        }
        "memo" => NodeKind::Memo { text: value.as_ref().and_then(Value::as_str).unwrap_or_default().to_string() },
        _ => return Err(Error::Interpreter(InterpreterError::UnknownNodeKind(kind.to_string()))),
    };

    Ok(node_kind)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn service(name: &str) -> NodeKind {
        NodeKind::ServiceInvocation { service: name.to_string() }
    }

    fn chain() -> (WorkflowGraph, NodeKey, NodeKey, NodeKey) {
        let mut graph = WorkflowGraph::new("chain");
        let a = graph.add_node("a", service("echo")).unwrap();
        let b = graph.add_node("b", service("echo")).unwrap();
        let c = graph.add_node("c", service("echo")).unwrap();
        let a_out = graph.add_data_out(a, "out").unwrap();
        let b_in = graph.add_data_in(b, "in").unwrap();
        let b_out = graph.add_data_out(b, "out").unwrap();
        let c_in = graph.add_data_in(c, "in").unwrap();
        graph.connect(a_out, b_in).unwrap();
        graph.connect(b_out, c_in).unwrap();
        (graph, a, b, c)
    }

    #[test]
    fn test_duplicate_node_id_is_rejected() {
        let mut graph = WorkflowGraph::new("dup");
        graph.add_node("a", NodeKind::Output).unwrap();
        let result = graph.add_node("a", NodeKind::Output);
        assert!(matches!(result, Err(Error::GraphConstructionError(_))));
    }

    #[test]
    fn test_connect_enforces_directions() {
        let mut graph = WorkflowGraph::new("dirs");
        let a = graph.add_node("a", service("echo")).unwrap();
        let b = graph.add_node("b", service("echo")).unwrap();
        let a_in = graph.add_data_in(a, "in").unwrap();
        let b_in = graph.add_data_in(b, "in").unwrap();
        let a_ctrl = graph.add_control_out(a, "done").unwrap();

        assert!(graph.connect(a_in, b_in).is_err());
        assert!(graph.connect(a_ctrl, b_in).is_err());
    }

    #[test]
    fn test_data_in_accepts_single_edge() {
        let (mut graph, a, _, c) = chain();
        let a_out = graph.port_by_name(a, PortDirection::DataOut, "out").unwrap();
        let c_in = graph.port_by_name(c, PortDirection::DataIn, "in").unwrap();
        assert!(graph.connect(a_out, c_in).is_err());
    }

    #[test]
    fn test_source_and_consumers() {
        let (graph, a, b, c) = chain();
        let b_in = graph.port_by_name(b, PortDirection::DataIn, "in").unwrap();
        assert_eq!(graph.source_node(b_in), Some(a));
        assert_eq!(graph.data_consumers(a), vec![b]);
        assert_eq!(graph.downstream_closure(b), vec![b, c]);
        assert_eq!(graph.downstream_closure(a), vec![a, b, c]);
    }

    #[test]
    fn test_transition_and_reset() {
        let (mut graph, a, _, _) = chain();
        assert_eq!(graph.transition(a, NodeState::Executing), Ok(NodeState::Waiting));
        assert!(graph.transition(a, NodeState::Executing).is_err());
        graph.transition(a, NodeState::Finished).unwrap();
        graph.reset_node(a);
        assert_eq!(graph.state(a), Some(NodeState::Waiting));
    }

    #[test]
    fn test_from_dto_builds_if_ports_and_edges() {
        let dto: GraphDto = serde_json::from_value(json!({
            "name": "branch",
            "nodes": [
                { "id": "x", "kind": "input", "dataOut": [{ "name": "value", "valueType": "integer" }] },
                { "id": "check", "kind": "if", "expression": "$0 > 3", "dataIn": [{ "name": "value" }] },
                { "id": "big", "kind": "service", "service": "echo", "controlIn": true }
            ],
            "edges": [
                { "from": { "node": "x", "port": "value" }, "to": { "node": "check", "port": "value" } },
                { "from": { "node": "check", "port": "true" }, "to": { "node": "big", "port": "control" } }
            ]
        }))
        .unwrap();

        let graph = WorkflowGraph::from_dto(dto).unwrap();
        let check = graph.node_key_by_str("check").unwrap();
        assert_eq!(graph.node(check).unwrap().control_out.len(), 2);

        let big = graph.node_key_by_str("big").unwrap();
        let control_in = graph.node(big).unwrap().control_in.unwrap();
        assert_eq!(graph.incoming_edges(control_in).count(), 1);
    }

    #[test]
    fn test_from_dto_rejects_unknown_kind() {
        let dto: GraphDto = serde_json::from_value(json!({
            "name": "bad",
            "nodes": [{ "id": "x", "kind": "teleport" }]
        }))
        .unwrap();

        let result = WorkflowGraph::from_dto(dto);
        assert!(matches!(result, Err(Error::Interpreter(InterpreterError::UnknownNodeKind(kind))) if kind == "teleport"));
    }
}
