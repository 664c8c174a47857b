//! Ephemeral dependency graph derived from port connections.
//!
//! Rebuilt on demand for topological analysis; never stored across
//! mutations. Connections between loop-port pairs are designated back edges:
//! depending on the [`LoopEdgePolicy`] they are either dropped entirely or
//! unrolled into per-iteration duplicates of the loop body, so a topological
//! order exists either way. A cycle that survives loop handling is a
//! configuration error surfaced as [`FlowError::CyclicGraph`].

use crate::core::error::{FlowError, Result};
use crate::core::network::network::ProcessorNetwork;
use crate::core::ports::PortRef;
use indexmap::IndexMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::{algo::toposort, Direction};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// How connections between loop-port pairs enter the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEdgePolicy {
    /// Loop connections contribute no edges; the graph covers one iteration.
    Ignore,
    /// Loop bodies are duplicated once per iteration, chained head to tail,
    /// so the topological order visits them repeatedly.
    Unroll,
}

/// Node weight: processor name plus an instance ordinal so unrolled
/// duplicates stay distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GraphNode {
    processor: String,
    instance: usize,
}

/// Read-only dependency graph over a processor network.
pub struct NetworkGraph {
    graph: DiGraph<GraphNode, ()>,
    /// Instance-0 node per processor, in network insertion order.
    primary: IndexMap<String, NodeIndex>,
}

impl NetworkGraph {
    /// Derive the graph from the network's current port connections
    /// (including coprocessor connections, excluding loop-pair connections).
    pub fn build(network: &ProcessorNetwork, policy: LoopEdgePolicy) -> Self {
        let mut graph = DiGraph::new();
        let mut primary = IndexMap::new();

        for name in network.processor_names() {
            let idx = graph.add_node(GraphNode {
                processor: name.clone(),
                instance: 0,
            });
            primary.insert(name, idx);
        }

        let mut loop_connections: Vec<(PortRef, PortRef)> = Vec::new();
        for (from, to) in network.connections() {
            let is_loop_pair = network
                .port(&from)
                .zip(network.port(&to))
                .map(|(o, i)| o.is_loop_port() && i.is_loop_port())
                .unwrap_or(false);
            if is_loop_pair {
                loop_connections.push((from, to));
                continue;
            }
            let (Some(&a), Some(&b)) = (primary.get(&from.processor), primary.get(&to.processor))
            else {
                continue;
            };
            graph.add_edge(a, b, ());
        }

        let mut this = Self { graph, primary };
        if policy == LoopEdgePolicy::Unroll {
            this.unroll_loops(network, loop_connections);
        }
        this
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, processor: &str) -> bool {
        self.primary.contains_key(processor)
    }

    /// True if `successor` is reachable from `predecessor` (reflexively).
    pub fn is_successor(&self, predecessor: &str, successor: &str) -> bool {
        let starts = self.find_indices(predecessor);
        if starts.is_empty() {
            return false;
        }
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = starts.into_iter().collect();
        while let Some(idx) = queue.pop_front() {
            if !visited.insert(idx) {
                continue;
            }
            if self.graph[idx].processor == successor {
                return true;
            }
            queue.extend(self.graph.neighbors_directed(idx, Direction::Outgoing));
        }
        false
    }

    /// True if `processor` lies on some path from `root` to `end`.
    pub fn is_path_element(&self, processor: &str, root: &str, end: &str) -> bool {
        self.is_successor(root, processor) && self.is_successor(processor, end)
    }

    /// Transitive closure of "must run before any of `ends`", including the
    /// end processors themselves.
    pub fn predecessors(&self, ends: &[String]) -> HashSet<String> {
        let end_set: HashSet<&str> = ends.iter().map(|s| s.as_str()).collect();
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&idx| end_set.contains(self.graph[idx].processor.as_str()))
            .collect();
        while let Some(idx) = queue.pop_front() {
            if !visited.insert(idx) {
                continue;
            }
            queue.extend(self.graph.neighbors_directed(idx, Direction::Incoming));
        }
        visited
            .into_iter()
            .map(|idx| self.graph[idx].processor.clone())
            .collect()
    }

    /// Linear order consistent with all edges, restricted to `subset` when
    /// given. Processors duplicated by loop unrolling appear once per
    /// instance. Fails on a true cycle.
    ///
    /// The order is deterministic for a fixed network: nodes enter the graph
    /// in network insertion order and the sort is index-driven.
    pub fn sort_topological(&self, subset: Option<&HashSet<String>>) -> Result<Vec<String>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let node = &self.graph[cycle.node_id()];
            FlowError::CyclicGraph(format!(
                "dependency cycle through processor '{}'",
                node.processor
            ))
        })?;
        Ok(sorted
            .into_iter()
            .map(|idx| self.graph[idx].processor.clone())
            .filter(|name| subset.is_none_or(|s| s.contains(name)))
            .collect())
    }

    fn find_indices(&self, processor: &str) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph[idx].processor == processor)
            .collect()
    }

    /// Validate the designated loop pairs and duplicate each loop body once
    /// per iteration beyond the first.
    ///
    /// A loop connection runs from a loop outport (owned by the loop's last
    /// processor) back to a loop inport (owned by its first processor). The
    /// iteration count lives on the inport. Pairs violating the contract are
    /// skipped with a warning rather than failing the build.
    fn unroll_loops(
        &mut self,
        network: &ProcessorNetwork,
        loop_connections: Vec<(PortRef, PortRef)>,
    ) {
        struct LoopBounds {
            first: String,
            last: String,
            iterations: usize,
        }

        let mut loops: Vec<LoopBounds> = Vec::new();
        for (outport_ref, inport_ref) in loop_connections {
            let Some(outport) = network.port(&outport_ref) else {
                continue;
            };
            let Some(inport) = network.port(&inport_ref) else {
                continue;
            };
            if outport.connections().len() > 1 || inport.connections().len() > 1 {
                warn!(
                    outport = %outport_ref,
                    inport = %inport_ref,
                    "loop port has multiple connections, skipping loop"
                );
                continue;
            }
            let multiple_loop_ports = |name: &str| {
                network
                    .node(name)
                    .map(|n| n.ports().filter(|p| p.is_loop_port()).count() > 2)
                    .unwrap_or(false)
            };
            if multiple_loop_ports(&outport_ref.processor) || multiple_loop_ports(&inport_ref.processor)
            {
                warn!(
                    outport = %outport_ref,
                    inport = %inport_ref,
                    "processor carries more than one loop port pair, skipping loop"
                );
                continue;
            }
            // the loop's first processor must feed its last through regular edges
            if !self.is_successor(&inport_ref.processor, &outport_ref.processor) {
                warn!(
                    first = %inport_ref.processor,
                    last = %outport_ref.processor,
                    "loop target is not an upstream processor, skipping loop"
                );
                continue;
            }
            loops.push(LoopBounds {
                first: inport_ref.processor.clone(),
                last: outport_ref.processor.clone(),
                iterations: inport.num_loop_iterations(),
            });
        }

        // discard overlapping (non-nested) loops pairwise: a loop must lie
        // either entirely inside or entirely outside another loop's path
        let mut overlapping: HashSet<usize> = HashSet::new();
        for i in 0..loops.len() {
            for j in 0..loops.len() {
                if i == j || overlapping.contains(&i) && overlapping.contains(&j) {
                    continue;
                }
                let first_inside =
                    self.is_path_element(&loops[j].first, &loops[i].first, &loops[i].last);
                let last_inside =
                    self.is_path_element(&loops[j].last, &loops[i].first, &loops[i].last);
                if first_inside != last_inside {
                    warn!(
                        a = %format!("{} -> {}", loops[i].first, loops[i].last),
                        b = %format!("{} -> {}", loops[j].first, loops[j].last),
                        "overlapping loops, skipping both"
                    );
                    overlapping.insert(i);
                    overlapping.insert(j);
                }
            }
        }
        let mut pending: Vec<LoopBounds> = loops
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !overlapping.contains(i))
            .map(|(_, l)| l)
            .collect();

        // unroll innermost loops first so outer bodies duplicate the already
        // expanded inner iterations
        while !pending.is_empty() {
            let position = pending.iter().position(|candidate| {
                !pending.iter().any(|other| {
                    !std::ptr::eq(other, candidate)
                        && self.is_path_element(&other.first, &candidate.first, &candidate.last)
                        && (other.first != candidate.first || other.last != candidate.last)
                })
            });
            let Some(position) = position else {
                warn!("could not order nested loops for unrolling, skipping remaining loops");
                break;
            };
            let bounds = pending.remove(position);
            self.unroll_one(&bounds.first, &bounds.last, bounds.iterations);
        }
    }

    fn unroll_one(&mut self, first: &str, last: &str, iterations: usize) {
        debug!(
            first,
            last, iterations, "unrolling loop"
        );
        if iterations <= 1 {
            return;
        }

        let first_indices = self.find_indices(first);
        let last_indices = self.find_indices(last);
        if first_indices.len() != 1 || last_indices.len() != 1 {
            warn!(
                first,
                last, "expected exactly one graph node per loop processor, skipping loop"
            );
            return;
        }
        let first_idx = first_indices[0];
        let last_idx = last_indices[0];

        // the loop body: nodes on any path first -> last
        let forward = self.reachable(first_idx, Direction::Outgoing);
        let backward = self.reachable(last_idx, Direction::Incoming);
        let path: HashSet<NodeIndex> = forward.intersection(&backward).copied().collect();

        // snapshot pre-unroll successor lists; iteration chaining edges must
        // not leak into later duplications
        let snapshot: Vec<(NodeIndex, Vec<NodeIndex>)> = path
            .iter()
            .map(|&idx| {
                (
                    idx,
                    self.graph
                        .neighbors_directed(idx, Direction::Outgoing)
                        .collect(),
                )
            })
            .collect();

        let mut prev_last = last_idx;
        for iteration in 1..iterations {
            let mut duplicates: HashMap<NodeIndex, NodeIndex> = HashMap::new();
            for &idx in &path {
                let duplicate = self.graph.add_node(GraphNode {
                    processor: self.graph[idx].processor.clone(),
                    instance: iteration,
                });
                duplicates.insert(idx, duplicate);
            }
            for (original, successors) in &snapshot {
                let from = duplicates[original];
                for succ in successors {
                    let to = duplicates.get(succ).copied().unwrap_or(*succ);
                    self.graph.add_edge(from, to, ());
                }
            }
            self.graph.add_edge(prev_last, duplicates[&first_idx], ());
            prev_last = duplicates[&last_idx];
        }
    }

    fn reachable(&self, start: NodeIndex, direction: Direction) -> HashSet<NodeIndex> {
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            if !visited.insert(idx) {
                continue;
            }
            queue.extend(self.graph.neighbors_directed(idx, direction));
        }
        visited
    }
}

impl std::fmt::Debug for NetworkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkGraph")
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::ProcessorNetwork;
    use crate::core::ports::{PortDescriptor, PortType};
    use crate::core::testing::TestProcessor;

    fn linear_network() -> ProcessorNetwork {
        let mut network = ProcessorNetwork::new();
        network
            .add_processor_named(Box::new(TestProcessor::source("Source")), Some("source"))
            .unwrap();
        network
            .add_processor_named(Box::new(TestProcessor::filter("Filter")), Some("filter"))
            .unwrap();
        network
            .add_processor_named(Box::new(TestProcessor::sink("Sink")), Some("sink"))
            .unwrap();
        assert!(network.connect_ports(
            &PortRef::new("source", "out"),
            &PortRef::new("filter", "in")
        ));
        assert!(network.connect_ports(&PortRef::new("filter", "out"), &PortRef::new("sink", "in")));
        network
    }

    #[test]
    fn test_linear_order() {
        let network = linear_network();
        let graph = NetworkGraph::build(&network, LoopEdgePolicy::Unroll);
        let order = graph.sort_topological(None).unwrap();
        assert_eq!(order, vec!["source", "filter", "sink"]);
    }

    #[test]
    fn test_is_successor() {
        let network = linear_network();
        let graph = NetworkGraph::build(&network, LoopEdgePolicy::Ignore);
        assert!(graph.is_successor("source", "sink"));
        assert!(graph.is_successor("source", "source"));
        assert!(!graph.is_successor("sink", "source"));
    }

    #[test]
    fn test_predecessors_prune_detached_branch() {
        let mut network = linear_network();
        // a dangling source that feeds nothing reaching the sink
        network
            .add_processor_named(Box::new(TestProcessor::source("Source")), Some("stray"))
            .unwrap();
        let graph = NetworkGraph::build(&network, LoopEdgePolicy::Unroll);
        let preds = graph.predecessors(&["sink".to_string()]);
        assert!(preds.contains("source"));
        assert!(preds.contains("filter"));
        assert!(preds.contains("sink"));
        assert!(!preds.contains("stray"));

        let order = graph.sort_topological(Some(&preds)).unwrap();
        assert_eq!(order, vec!["source", "filter", "sink"]);
    }

    #[test]
    fn test_deterministic_rebuild() {
        let network = linear_network();
        let order_a = NetworkGraph::build(&network, LoopEdgePolicy::Unroll)
            .sort_topological(None)
            .unwrap();
        let order_b = NetworkGraph::build(&network, LoopEdgePolicy::Unroll)
            .sort_topological(None)
            .unwrap();
        assert_eq!(order_a, order_b);
    }

    fn loop_network(iterations: usize) -> ProcessorNetwork {
        // source -> head -> tail -> sink, with tail's loop outport feeding
        // head's loop inport
        let mut network = ProcessorNetwork::new();
        network
            .add_processor_named(Box::new(TestProcessor::source("Source")), Some("source"))
            .unwrap();
        let head = TestProcessor::filter("Head").with_port(
            PortDescriptor::inport("loop", PortType::Data).looping(iterations),
        );
        network
            .add_processor_named(Box::new(head), Some("head"))
            .unwrap();
        let tail = TestProcessor::filter("Tail")
            .with_port(PortDescriptor::outport("loop", PortType::Data).looping(iterations));
        network
            .add_processor_named(Box::new(tail), Some("tail"))
            .unwrap();
        network
            .add_processor_named(Box::new(TestProcessor::sink("Sink")), Some("sink"))
            .unwrap();

        assert!(network.connect_ports(&PortRef::new("source", "out"), &PortRef::new("head", "in")));
        assert!(network.connect_ports(&PortRef::new("head", "out"), &PortRef::new("tail", "in")));
        assert!(network.connect_ports(&PortRef::new("tail", "out"), &PortRef::new("sink", "in")));
        assert!(network.connect_ports(
            &PortRef::new("tail", "loop"),
            &PortRef::new("head", "loop")
        ));
        network
    }

    #[test]
    fn test_loop_edge_ignored_without_unrolling() {
        let network = loop_network(3);
        let graph = NetworkGraph::build(&network, LoopEdgePolicy::Ignore);
        let order = graph.sort_topological(None).unwrap();
        assert_eq!(order, vec!["source", "head", "tail", "sink"]);
    }

    #[test]
    fn test_loop_unrolled_order_repeats_body() {
        let network = loop_network(3);
        let graph = NetworkGraph::build(&network, LoopEdgePolicy::Unroll);
        let order = graph.sort_topological(None).unwrap();

        let heads = order.iter().filter(|n| *n == "head").count();
        let tails = order.iter().filter(|n| *n == "tail").count();
        assert_eq!(heads, 3);
        assert_eq!(tails, 3);

        // source first, sink last, iterations alternate head/tail
        assert_eq!(order.first().map(String::as_str), Some("source"));
        assert_eq!(order.last().map(String::as_str), Some("sink"));
        let mut expect_head = true;
        for name in order.iter().filter(|n| *n == "head" || *n == "tail") {
            assert_eq!(name == "head", expect_head, "order was {order:?}");
            expect_head = !expect_head;
        }
    }

    #[test]
    fn test_unrolled_graph_is_acyclic_for_many_iterations() {
        let network = loop_network(5);
        let graph = NetworkGraph::build(&network, LoopEdgePolicy::Unroll);
        let order = graph.sort_topological(None).unwrap();
        assert_eq!(order.iter().filter(|n| *n == "head").count(), 5);
    }

    #[test]
    fn test_true_cycle_is_detected() {
        // assemble a cycle directly: the network refuses one through
        // connect_ports, so splice it at the graph level
        let network = linear_network();
        let mut graph = NetworkGraph::build(&network, LoopEdgePolicy::Ignore);
        let sink = graph.find_indices("sink")[0];
        let source = graph.find_indices("source")[0];
        graph.graph.add_edge(sink, source, ());

        let result = graph.sort_topological(None);
        assert!(matches!(result, Err(FlowError::CyclicGraph(_))));
    }

    #[test]
    fn test_edge_order_in_sort_holds_for_every_edge() {
        let network = loop_network(2);
        let graph = NetworkGraph::build(&network, LoopEdgePolicy::Ignore);
        let order = graph.sort_topological(None).unwrap();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(position("source") < position("head"));
        assert!(position("head") < position("tail"));
        assert!(position("tail") < position("sink"));
    }
}
