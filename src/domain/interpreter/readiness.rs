use crate::domain::graph::graph::{NodeKey, WorkflowGraph};
use crate::domain::graph::node::{NodeKind, NodeState, ResourceAction};
use crate::domain::graph::port::Edge;
use crate::error::InterpreterError;

/// Result of one readiness pass over the graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadinessReport {
    /// Nodes to dispatch this tick, in graph order.
    pub ready: Vec<NodeKey>,

    /// Output nodes whose input is finished and can be drained.
    pub outputs_ready: Vec<NodeKey>,

    /// Structural errors detected while evaluating, e.g. an EndIf with both branches fired.
    pub faults: Vec<(NodeKey, InterpreterError)>,
}

impl ReadinessReport {
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.outputs_ready.is_empty() && self.faults.is_empty()
    }
}

/// Computes which nodes may run next. Pure: reads node and edge state only.
pub fn evaluate(graph: &WorkflowGraph) -> ReadinessReport {
    let mut report = ReadinessReport::default();

    for (key, node) in graph.nodes() {
        if node.state != NodeState::Waiting {
            continue;
        }

        match &node.kind {
            NodeKind::ServiceInvocation { .. }
            | NodeKind::Dynamic { .. }
            | NodeKind::SubWorkflow { .. }
            | NodeKind::ForEach
            | NodeKind::If { .. }
            | NodeKind::DoWhile { .. }
            | NodeKind::ResourceLifecycle { action: ResourceAction::Start, .. } => {
                if control_in_satisfied(graph, key, false) && data_in_satisfied(graph, key) {
                    report.ready.push(key);
                }
            }
            NodeKind::ResourceLifecycle { action: ResourceAction::Terminate, .. } => {
                if control_in_satisfied(graph, key, true) && data_in_satisfied(graph, key) {
                    report.ready.push(key);
                }
            }
            NodeKind::EndIf => match end_if_readiness(graph, key) {
                Ok(true) => report.ready.push(key),
                Ok(false) => {}
                Err(fault) => report.faults.push((key, fault)),
            },
            NodeKind::Output => {
                if !node.data_in.is_empty() && node.data_in.iter().all(|port| graph.source_node(*port).is_some_and(|source| graph.is_finished(source))) {
                    report.outputs_ready.push(key);
                }
            }
            // Seeded at start, finished by their handlers, or inert.
            NodeKind::Input { .. } | NodeKind::Constant { .. } | NodeKind::EndDoWhile | NodeKind::EndForEach | NodeKind::Memo { .. } => {}
        }
    }

    report
}

pub fn ready_nodes(graph: &WorkflowGraph) -> Vec<NodeKey> {
    evaluate(graph).ready
}

/// Every connected data-in port has a finished source. Unconnected ports are satisfied.
fn data_in_satisfied(graph: &WorkflowGraph, key: NodeKey) -> bool {
    let Some(node) = graph.node(key) else {
        return false;
    };
    node.data_in.iter().all(|port| graph.source_node(*port).is_none_or(|source| graph.is_finished(source)))
}

fn control_in_satisfied(graph: &WorkflowGraph, key: NodeKey, accept_either: bool) -> bool {
    let Some(control_in) = graph.node(key).and_then(|node| node.control_in) else {
        return true;
    };
    graph.incoming_edges(control_in).all(|edge| control_edge_satisfied(graph, edge, accept_either))
}

/// Edges leaving an If need their condition flag, Finished alone would release
/// both branches. `accept_either` (resource termination) takes Finished or the flag.
fn control_edge_satisfied(graph: &WorkflowGraph, edge: &Edge, accept_either: bool) -> bool {
    let Some(source) = graph.port(edge.from).map(|port| port.node) else {
        return false;
    };
    let condition_met = edge.condition_met == Some(true);
    let finished = graph.is_finished(source);
    let from_if = graph.node(source).is_some_and(|node| matches!(node.kind, NodeKind::If { .. }));

    if accept_either {
        return finished || condition_met;
    }
    if from_if { condition_met } else { finished }
}

/// Input slots `2i` and `2i+1` feed output `i`. Ready once exactly one slot of
/// every pair has a finished source. Two fired slots in a pair is a fault.
fn end_if_readiness(graph: &WorkflowGraph, key: NodeKey) -> Result<bool, InterpreterError> {
    let Some(node) = graph.node(key) else {
        return Ok(false);
    };
    let inputs = node.data_in.len();
    let outputs = node.data_out.len();
    if inputs != 2 * outputs {
        return Err(InterpreterError::EndIfArity { node: node.id.to_string(), inputs, outputs });
    }

    let fired = |slot: usize| node.data_in.get(slot).and_then(|port| graph.source_node(*port)).is_some_and(|source| graph.is_finished(source));

    let mut total = 0;
    for output in 0..outputs {
        let in_pair = usize::from(fired(2 * output)) + usize::from(fired(2 * output + 1));
        if in_pair > 1 {
            return Err(InterpreterError::EndIfBranchMismatch { node: node.id.to_string(), output, fired: in_pair });
        }
        total += in_pair;
    }

    Ok(outputs > 0 && total == outputs)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::graph::graph::PortKey;

    fn service() -> NodeKind {
        NodeKind::ServiceInvocation { service: "echo".to_string() }
    }

    fn finish(graph: &mut WorkflowGraph, key: NodeKey) {
        graph.transition(key, NodeState::Executing).unwrap();
        graph.transition(key, NodeState::Finished).unwrap();
    }

    struct Branching {
        graph: WorkflowGraph,
        check: NodeKey,
        yes: NodeKey,
        no: NodeKey,
        merge: NodeKey,
        true_port: PortKey,
        false_port: PortKey,
    }

    fn branching() -> Branching {
        let mut graph = WorkflowGraph::new("branching");
        let check = graph.add_node("check", NodeKind::If { expression: "$0 > 1".to_string() }).unwrap();
        let true_port = graph.add_control_out(check, "true").unwrap();
        let false_port = graph.add_control_out(check, "false").unwrap();

        let yes = graph.add_node("yes", service()).unwrap();
        let no = graph.add_node("no", service()).unwrap();
        let merge = graph.add_node("merge", NodeKind::EndIf).unwrap();
        for (branch, control_out) in [(yes, true_port), (no, false_port)] {
            let control_in = graph.add_control_in(branch).unwrap();
            graph.connect(control_out, control_in).unwrap();
        }
        let yes_out = graph.add_data_out(yes, "out").unwrap();
        let no_out = graph.add_data_out(no, "out").unwrap();
        let slot_a = graph.add_data_in(merge, "a").unwrap();
        let slot_b = graph.add_data_in(merge, "b").unwrap();
        graph.add_data_out(merge, "out").unwrap();
        graph.connect(yes_out, slot_a).unwrap();
        graph.connect(no_out, slot_b).unwrap();

        Branching { graph, check, yes, no, merge, true_port, false_port }
    }

    #[test]
    fn test_finished_if_alone_releases_no_branch() {
        let Branching { mut graph, check, yes, no, .. } = branching();
        assert_eq!(ready_nodes(&graph), vec![check]);

        finish(&mut graph, check);
        let ready = ready_nodes(&graph);
        assert!(!ready.contains(&yes));
        assert!(!ready.contains(&no));
    }

    #[test]
    fn test_condition_releases_taken_branch_and_end_if() {
        let Branching { mut graph, check, yes, merge, true_port, false_port, .. } = branching();
        graph.set_condition(true_port, true);
        graph.set_condition(false_port, false);
        finish(&mut graph, check);
        assert_eq!(ready_nodes(&graph), vec![yes]);

        finish(&mut graph, yes);
        assert_eq!(ready_nodes(&graph), vec![merge]);
    }

    #[test]
    fn test_end_if_with_both_branches_fired_is_a_fault() {
        let Branching { mut graph, check, yes, no, merge, true_port, false_port } = branching();
        graph.set_condition(true_port, true);
        graph.set_condition(false_port, true);
        finish(&mut graph, check);
        finish(&mut graph, yes);
        finish(&mut graph, no);

        let report = evaluate(&graph);
        assert!(report.ready.is_empty());
        assert_eq!(report.faults, vec![(merge, InterpreterError::EndIfBranchMismatch { node: "merge".to_string(), output: 0, fired: 2 })]);
    }

    #[test]
    fn test_terminate_accepts_finished_source() {
        let Branching { mut graph, check, .. } = branching();
        let stop = graph.add_node("stop", NodeKind::ResourceLifecycle { action: ResourceAction::Terminate, service: "vm".to_string() }).unwrap();
        let start = graph.add_node("start", NodeKind::ResourceLifecycle { action: ResourceAction::Start, service: "vm".to_string() }).unwrap();
        let done = graph.add_control_out(check, "done").unwrap();
        for node in [stop, start] {
            let control_in = graph.add_control_in(node).unwrap();
            graph.connect(done, control_in).unwrap();
        }

        finish(&mut graph, check);
        let ready = ready_nodes(&graph);
        assert!(ready.contains(&stop));
        assert!(!ready.contains(&start));
    }

    #[test]
    fn test_output_and_idempotence() {
        let mut graph = WorkflowGraph::new("drain");
        let source = graph.add_node("source", NodeKind::Constant { value: json!(1) }).unwrap();
        let consumer = graph.add_node("consumer", service()).unwrap();
        let sink = graph.add_node("sink", NodeKind::Output).unwrap();
        let out = graph.add_data_out(source, "value").unwrap();
        let consumer_in = graph.add_data_in(consumer, "value").unwrap();
        let sink_in = graph.add_data_in(sink, "value").unwrap();
        graph.connect(out, consumer_in).unwrap();
        graph.connect(out, sink_in).unwrap();

        assert!(evaluate(&graph).is_idle());

        finish(&mut graph, source);
        let first = evaluate(&graph);
        let second = evaluate(&graph);
        assert_eq!(first, second);
        assert_eq!(first.ready, vec![consumer]);
        assert_eq!(first.outputs_ready, vec![sink]);
    }
}
