//! Constraint graph of the inclusion-based points-to analysis.
//!
//! Nodes live in a dense arena indexed by `NodeId`. Merged nodes keep their
//! slot; their `merge_target` names the node they were folded into.
//!
//! Edge directions:
//! * `dst = src` is a copy edge `src -> dst`;
//! * `dst = *ptr` is a load edge `ptr -> dst`;
//! * `*ptr = src` is a store edge `src -> ptr`.

use std::collections::BTreeSet;

use crate::ir::ValueId;
use crate::util::GraphTraits;

use super::constraint::NodeId;
use super::pts_set::PtsSet;

pub const UNIVERSAL_PTR: NodeId = 0;
pub const UNIVERSAL_OBJ: NodeId = 1;
pub const NULL_PTR: NodeId = 2;
pub const NULL_OBJECT: NodeId = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Value,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    Copy,
    Load,
    Store,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 3] = [EdgeKind::Copy, EdgeKind::Load, EdgeKind::Store];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Default)]
struct Adjacency {
    out: [BTreeSet<NodeId>; 3],
    incoming: [BTreeSet<NodeId>; 3],
}

#[derive(Debug, Clone)]
pub struct ConstraintNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub value: Option<ValueId>,
    pts: PtsSet,
    merge_target: NodeId,
    edges: Adjacency,
}

impl ConstraintNode {
    pub fn pts(&self) -> &PtsSet {
        &self.pts
    }

    pub fn is_rep(&self) -> bool {
        self.merge_target == self.id
    }
}

#[derive(Debug, Clone)]
pub struct ConstraintGraph {
    nodes: Vec<ConstraintNode>,
    /// Every live edge `(src, dst)`, bucketed by kind.
    buckets: [BTreeSet<(NodeId, NodeId)>; 3],
    merges: usize,
}

impl Default for ConstraintGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstraintGraph {
    /// A graph holding the four sentinel nodes.
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            buckets: Default::default(),
            merges: 0,
        };
        graph.add_node(NodeKind::Value, None);
        graph.add_node(NodeKind::Object, None);
        graph.add_node(NodeKind::Value, None);
        graph.add_node(NodeKind::Object, None);
        graph
    }

    pub fn add_node(&mut self, kind: NodeKind, value: Option<ValueId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(ConstraintNode {
            id,
            kind,
            value,
            pts: PtsSet::new(),
            merge_target: id,
            edges: Adjacency::default(),
        });
        id
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &ConstraintNode {
        &self.nodes[id]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self, kind: EdgeKind) -> usize {
        self.buckets[kind.index()].len()
    }

    pub fn merge_count(&self) -> usize {
        self.merges
    }

    /// Returns `false` without touching the graph for self edges and for
    /// edges that already exist.
    pub fn add_edge(&mut self, src: NodeId, dst: NodeId, kind: EdgeKind) -> bool {
        if src == dst {
            return false;
        }
        let k = kind.index();
        if !self.nodes[src].edges.out[k].insert(dst) {
            return false;
        }
        self.nodes[dst].edges.incoming[k].insert(src);
        self.buckets[k].insert((src, dst));
        true
    }

    pub fn has_edge(&self, src: NodeId, dst: NodeId, kind: EdgeKind) -> bool {
        self.nodes[src].edges.out[kind.index()].contains(&dst)
    }

    pub fn out_edges(&self, node: NodeId, kind: EdgeKind) -> &BTreeSet<NodeId> {
        &self.nodes[node].edges.out[kind.index()]
    }

    pub fn in_edges(&self, node: NodeId, kind: EdgeKind) -> &BTreeSet<NodeId> {
        &self.nodes[node].edges.incoming[kind.index()]
    }

    fn remove_edge(&mut self, src: NodeId, dst: NodeId, kind: EdgeKind) {
        let k = kind.index();
        self.nodes[src].edges.out[k].remove(&dst);
        self.nodes[dst].edges.incoming[k].remove(&src);
        self.buckets[k].remove(&(src, dst));
    }

    #[inline]
    pub fn pts(&self, node: NodeId) -> &PtsSet {
        &self.nodes[node].pts
    }

    pub fn add_pts(&mut self, node: NodeId, obj: NodeId) -> bool {
        self.nodes[node].pts.insert(obj)
    }

    /// `pts(dst) |= pts(src)`.
    pub fn union_pts(&mut self, dst: NodeId, src: NodeId) -> bool {
        if dst == src {
            return false;
        }
        let src_pts = std::mem::take(&mut self.nodes[src].pts);
        let changed = self.nodes[dst].pts.union_with(&src_pts);
        self.nodes[src].pts = src_pts;
        changed
    }

    /// Representative of `node`, compressing the walked chain.
    pub fn get_merge_target(&mut self, node: NodeId) -> NodeId {
        let rep = self.get_merge_target2(node);
        let mut cur = node;
        while cur != rep {
            let next = self.nodes[cur].merge_target;
            self.nodes[cur].merge_target = rep;
            cur = next;
        }
        rep
    }

    /// Representative of `node` without modifying the graph.
    pub fn get_merge_target2(&self, node: NodeId) -> NodeId {
        let mut cur = node;
        let mut steps = 0;
        while self.nodes[cur].merge_target != cur {
            cur = self.nodes[cur].merge_target;
            steps += 1;
            assert!(
                steps <= self.nodes.len(),
                "merge target chain of node {} does not terminate",
                node
            );
        }
        cur
    }

    /// Folds `src` into `dst`: every edge of `src` moves to `dst`, edges
    /// that would become self loops are dropped, and `pts(src)` is unioned
    /// into `pts(dst)`.
    pub fn merge_node(&mut self, src: NodeId, dst: NodeId) {
        assert_ne!(src, dst, "node {} merged into itself", src);
        debug_assert!(self.nodes[src].is_rep() && self.nodes[dst].is_rep());

        self.nodes[src].merge_target = dst;
        for kind in EdgeKind::ALL {
            let k = kind.index();
            let outs: Vec<NodeId> = self.nodes[src].edges.out[k].iter().copied().collect();
            for to in outs {
                self.remove_edge(src, to, kind);
                if to != dst {
                    self.add_edge(dst, to, kind);
                }
            }
            let ins: Vec<NodeId> = self.nodes[src].edges.incoming[k].iter().copied().collect();
            for from in ins {
                self.remove_edge(from, src, kind);
                if from != dst {
                    self.add_edge(from, dst, kind);
                }
            }
        }
        let pts = std::mem::take(&mut self.nodes[src].pts);
        self.nodes[dst].pts.union_with(&pts);
        self.nodes[src].edges = Adjacency::default();
        self.merges += 1;
    }
}

/// The copy subgraph over representative nodes.
impl GraphTraits for ConstraintGraph {
    type Node = NodeId;

    fn node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_rep())
            .map(|n| n.id)
            .collect()
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.out_edges(node, EdgeKind::Copy).iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph_with(n: usize) -> (ConstraintGraph, Vec<NodeId>) {
        let mut graph = ConstraintGraph::new();
        let ids = (0..n)
            .map(|_| graph.add_node(NodeKind::Value, None))
            .collect();
        (graph, ids)
    }

    #[test]
    fn test_sentinels() {
        let graph = ConstraintGraph::new();
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.node(UNIVERSAL_OBJ).kind, NodeKind::Object);
        assert_eq!(graph.node(NULL_PTR).kind, NodeKind::Value);
    }

    #[test]
    fn test_self_edges_rejected() {
        let (mut graph, ids) = graph_with(2);
        for kind in EdgeKind::ALL {
            assert!(!graph.add_edge(ids[0], ids[0], kind));
            assert_eq!(graph.edge_count(kind), 0);
        }
        assert!(graph.add_edge(ids[0], ids[1], EdgeKind::Copy));
        assert!(!graph.add_edge(ids[0], ids[1], EdgeKind::Copy));
        assert!(graph.add_edge(ids[0], ids[1], EdgeKind::Load));
        assert_eq!(graph.edge_count(EdgeKind::Copy), 1);
        assert_eq!(graph.edge_count(EdgeKind::Load), 1);
    }

    #[test]
    fn test_merge_rewires_edges_and_pts() {
        let (mut graph, ids) = graph_with(4);
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
        graph.add_edge(c, a, EdgeKind::Copy);
        graph.add_edge(a, d, EdgeKind::Load);
        graph.add_edge(a, b, EdgeKind::Copy);
        graph.add_edge(b, a, EdgeKind::Copy);
        graph.add_pts(a, NULL_OBJECT);
        graph.add_pts(b, UNIVERSAL_OBJ);

        graph.merge_node(a, b);

        assert_eq!(graph.get_merge_target(a), b);
        assert!(graph.has_edge(c, b, EdgeKind::Copy));
        assert!(graph.has_edge(b, d, EdgeKind::Load));
        assert!(!graph.has_edge(b, b, EdgeKind::Copy));
        assert!(graph.in_edges(d, EdgeKind::Load).contains(&b));
        assert!(!graph.in_edges(d, EdgeKind::Load).contains(&a));
        assert_eq!(
            graph.pts(b).iter().collect::<Vec<_>>(),
            vec![UNIVERSAL_OBJ, NULL_OBJECT]
        );
        assert!(graph.pts(a).is_empty());
        assert_eq!(graph.edge_count(EdgeKind::Copy), 1);
        assert_eq!(graph.merge_count(), 1);
        assert!(!graph.node_ids().contains(&a));
    }

    #[test]
    fn test_merge_target_compression() {
        let (mut graph, ids) = graph_with(3);
        graph.merge_node(ids[0], ids[1]);
        graph.merge_node(ids[1], ids[2]);
        assert_eq!(graph.get_merge_target2(ids[0]), ids[2]);
        assert_eq!(graph.node(ids[0]).merge_target, ids[1]);
        assert_eq!(graph.get_merge_target(ids[0]), ids[2]);
        assert_eq!(graph.node(ids[0]).merge_target, ids[2]);
    }

    #[test]
    #[should_panic]
    fn test_merge_into_self_panics() {
        let (mut graph, ids) = graph_with(1);
        graph.merge_node(ids[0], ids[0]);
    }
}
