//! Copy-edge cycle collapsing.
//!
//! Both detectors only record merges while the SCC walk holds the graph and
//! apply them once the walk is over.

use std::collections::BTreeSet;

use log::{debug, trace};

use crate::util::{SccDetector, SccHooks};

use super::constraint::NodeId;
use super::constraint_graph::ConstraintGraph;

/// Applies `(node, rep)` pairs, resolving both sides first. Returns the
/// representatives that absorbed at least one node.
fn collapse(graph: &mut ConstraintGraph, merges: Vec<(NodeId, NodeId)>) -> Vec<NodeId> {
    let mut reps = BTreeSet::new();
    for (node, rep) in merges {
        let node = graph.get_merge_target(node);
        let rep = graph.get_merge_target(rep);
        if node == rep {
            continue;
        }
        trace!("merge n{} into n{}", node, rep);
        graph.merge_node(node, rep);
        reps.insert(rep);
    }
    reps.into_iter().collect()
}

#[derive(Default)]
struct OfflineHooks {
    scc_nodes: Vec<NodeId>,
    merges: Vec<(NodeId, NodeId)>,
}

impl SccHooks<ConstraintGraph> for OfflineHooks {
    fn proc_node_on_cycle(&mut self, _graph: &ConstraintGraph, node: NodeId, _rep: NodeId) {
        self.scc_nodes.push(node);
    }

    fn proc_rep_node_on_cycle(&mut self, _graph: &ConstraintGraph, rep: NodeId) {
        if self.scc_nodes.is_empty() {
            return;
        }
        self.scc_nodes.push(rep);
        let min = self.scc_nodes.iter().copied().min().unwrap_or(rep);
        for node in self.scc_nodes.drain(..) {
            if node != min {
                self.merges.push((node, min));
            }
        }
    }
}

/// Collapses the copy cycles present before solving. The smallest id of a
/// cycle becomes its representative, so sentinels are never folded away by
/// a later node.
#[derive(Default)]
pub struct OfflineCycleDetector {
    detector: SccDetector<NodeId>,
}

impl OfflineCycleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&mut self, graph: &mut ConstraintGraph) -> usize {
        let mut hooks = OfflineHooks::default();
        self.detector.run_on_graph(&*graph, &mut hooks);
        let count = hooks.merges.len();
        collapse(graph, hooks.merges);
        debug!("offline cycle detection merged {} nodes", count);
        count
    }
}

#[derive(Default)]
struct OnlineHooks {
    merges: Vec<(NodeId, NodeId)>,
}

impl SccHooks<ConstraintGraph> for OnlineHooks {
    fn rep_node(&self, graph: &ConstraintGraph, node: NodeId) -> NodeId {
        graph.get_merge_target2(node)
    }

    fn proc_node_on_cycle(&mut self, _graph: &ConstraintGraph, node: NodeId, rep: NodeId) {
        self.merges.push((node, rep));
    }

    fn proc_rep_node_on_cycle(&mut self, _graph: &ConstraintGraph, _rep: NodeId) {}
}

/// Detects cycles formed while solving. Candidates are copy destinations
/// whose points-to set did not change.
#[derive(Default)]
pub struct OnlineCycleDetector {
    candidates: BTreeSet<NodeId>,
    detector: SccDetector<NodeId>,
}

impl OnlineCycleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_candidate(&mut self, node: NodeId) {
        self.candidates.insert(node);
    }

    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// Returns the representatives whose points-to sets grew by merging.
    pub fn run_detect(&mut self, graph: &mut ConstraintGraph) -> Vec<NodeId> {
        if self.candidates.is_empty() {
            return Vec::new();
        }
        let mut hooks = OnlineHooks::default();
        for candidate in std::mem::take(&mut self.candidates) {
            self.detector.run_on_node(&*graph, &mut hooks, candidate);
        }
        self.detector.reset();
        collapse(graph, hooks.merges)
    }
}
