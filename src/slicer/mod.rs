//! # slicer
//!
//! Decides how a root node (an allocation) reaches a set of sink nodes
//! (releases) in the dependence graph:
//!
//! 1. forward along DD edges from the root; finding a sink gives `Partial`;
//! 2. backward along DD edges from every sink found, keeping the nodes and
//!    functions that lead back to the root;
//! 3. over every CFG path from the root; if no path escapes without passing
//!    a sink the root gets `All`.
//!
//! All traversals keep explicit work stacks.

use std::collections::{BTreeSet, HashMap, VecDeque};

use log::{debug, trace};
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use serde::Serialize;

use crate::dependence::{DgEdge, DgGraph, DgNode, EdgeAttr};
use crate::ir::{FuncId, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Reachability {
    /// No sink depends on the root.
    None,
    /// Some sink depends on the root, but a control path avoids all of them.
    Partial,
    /// Every control path from the root passes a dependent sink.
    All,
}

struct CfgFrame {
    node: NodeIndex,
    edges: Vec<(NodeIndex, DgEdge)>,
    next: usize,
    edge_type: EdgeAttr,
}

pub struct ProgramSlice<'g, 'p> {
    dg: &'g DgGraph<'p>,
    root: NodeIndex,

    forward: BTreeSet<NodeIndex>,
    fd_funcs: BTreeSet<FuncId>,
    backward: BTreeSet<NodeIndex>,
    bd_funcs: BTreeSet<FuncId>,
    /// Functions met on any backward path; never cleared.
    path_funcs: BTreeSet<FuncId>,
    /// Largest node id reached in each function during the forward pass.
    func_max_id: HashMap<FuncId, usize>,
    sinks: BTreeSet<NodeIndex>,

    reach: Reachability,
    reach_out: bool,
    cross_func_num: usize,
}

impl<'g, 'p> ProgramSlice<'g, 'p> {
    pub fn new(dg: &'g DgGraph<'p>, root: NodeIndex) -> Self {
        Self {
            dg,
            root,
            forward: BTreeSet::new(),
            fd_funcs: BTreeSet::new(),
            backward: BTreeSet::new(),
            bd_funcs: BTreeSet::new(),
            path_funcs: BTreeSet::new(),
            func_max_id: HashMap::new(),
            sinks: BTreeSet::new(),
            reach: Reachability::None,
            reach_out: false,
            cross_func_num: 0,
        }
    }

    pub fn run_slicing(&mut self, sinks: &BTreeSet<NodeIndex>) -> Reachability {
        self.forward_traverse(sinks);
        let found: Vec<NodeIndex> = self.sinks.iter().copied().collect();
        for sink in found {
            self.backward_traverse(sink);
        }
        if self.sinks.is_empty() {
            self.reach = Reachability::None;
        } else {
            self.compute_path_reachable();
        }
        debug!(
            "slice of N{}: forward {}, backward {}, sinks {}, {:?}",
            self.dg.node(self.root).id,
            self.forward.len(),
            self.backward.len(),
            self.sinks.len(),
            self.reach
        );
        self.reach
    }

    pub fn reachability(&self) -> Reachability {
        self.reach
    }

    pub fn forward_slice(&self) -> &BTreeSet<NodeIndex> {
        &self.forward
    }

    pub fn backward_slice(&self) -> &BTreeSet<NodeIndex> {
        &self.backward
    }

    /// Sinks met by the forward pass.
    pub fn sinks(&self) -> &BTreeSet<NodeIndex> {
        &self.sinks
    }

    fn func_of(&self, node: NodeIndex) -> FuncId {
        self.dg.node(node).func
    }

    /// Accepts a node whose id is beyond everything reached so far in its
    /// function, and records it.
    fn is_forward(&mut self, node: NodeIndex) -> bool {
        let DgNode { id, func, .. } = *self.dg.node(node);
        match self.func_max_id.get(&func) {
            Some(max) if id <= *max => false,
            _ => {
                self.func_max_id.insert(func, id);
                true
            }
        }
    }

    fn forward_traverse(&mut self, sinks: &BTreeSet<NodeIndex>) {
        let mut visited = BTreeSet::from([self.root]);
        let mut stack = vec![(self.dg.edges_out(self.root), 0)];
        while let Some((edges, next)) = stack.last_mut() {
            let Some(&(dst, edge)) = edges.get(*next) else {
                stack.pop();
                continue;
            };
            *next += 1;
            if !edge.is_dd() || visited.contains(&dst) {
                continue;
            }
            if !self.is_forward(dst) && edge.attr.contains(EdgeAttr::RET) {
                trace!("N{} reached backward", self.dg.node(dst).id);
                continue;
            }
            self.forward.insert(dst);
            self.fd_funcs.insert(self.func_of(dst));
            if sinks.contains(&dst) {
                self.sinks.insert(dst);
                self.reach = Reachability::Partial;
                *next = edges.len();
                continue;
            }
            visited.insert(dst);
            stack.push((self.dg.edges_out(dst), 0));
        }
    }

    fn backward_traverse(&mut self, sink: NodeIndex) {
        self.path_funcs.insert(self.func_of(sink));
        let mut path = BTreeSet::from([sink]);
        let mut stack = vec![(sink, self.dg.edges_in(sink), 0)];
        while let Some((node, edges, next)) = stack.last_mut() {
            let Some(&(src, edge)) = edges.get(*next) else {
                stack.pop();
                continue;
            };
            *next += 1;
            if !edge.is_dd() {
                continue;
            }
            let src_func = self.func_of(src);
            if src_func != self.func_of(*node) {
                self.path_funcs.insert(src_func);
            }
            if src == self.root || self.backward.contains(&src) {
                self.bd_funcs.extend(self.path_funcs.iter().copied());
                self.backward.extend(path.iter().copied());
                self.backward.insert(src);
                *next = edges.len();
                continue;
            }
            if path.contains(&src)
                || !self.forward.contains(&src)
                || !self.fd_funcs.contains(&src_func)
            {
                continue;
            }
            path.insert(src);
            stack.push((src, self.dg.edges_in(src), 0));
        }
    }

    fn is_call(&self, node: NodeIndex) -> bool {
        let program = self.dg.program();
        program.inst(self.dg.node(node).inst).is_call()
    }

    /// Which CFG edges the path may follow out of `node`. A call into a
    /// function on a backward slice must be entered.
    fn visit_edge_type(&self, node: NodeIndex, path: &BTreeSet<NodeIndex>) -> EdgeAttr {
        if !self.is_call(node) {
            return EdgeAttr::CFG;
        }
        let mut edge_type = EdgeAttr::empty();
        for (dst, edge) in self.dg.edges_out(node) {
            if !edge.is_cfg() {
                continue;
            }
            edge_type |= edge.attr;
            if edge.attr.contains(EdgeAttr::CALL)
                && self.bd_funcs.contains(&self.func_of(dst))
                && !path.contains(&dst)
            {
                return EdgeAttr::CALL;
            }
        }
        if edge_type.contains(EdgeAttr::CFG_DUMMY) {
            EdgeAttr::CFG_DUMMY
        } else {
            EdgeAttr::CFG
        }
    }

    fn is_exit(&self, node: NodeIndex) -> bool {
        self.dg
            .program()
            .callee_named(self.dg.node(node).inst, "exit")
    }

    fn predom(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.dg
            .edges_in(node)
            .into_iter()
            .find(|(_, edge)| edge.is_dd())
            .map(|(src, _)| src)
    }

    /// Every branch on `path` lies on the forward slice and, when it tests
    /// a comparison, compares a pointer against null.
    fn is_de_branch(&self, path: &BTreeSet<NodeIndex>) -> bool {
        let program = self.dg.program();
        let mut branches = 0;
        for node in path {
            if program.inst(self.dg.node(*node).inst).opcode != Opcode::Br {
                continue;
            }
            branches += 1;
            if !self.forward.contains(node) {
                return false;
            }
            let Some(pre) = self.predom(*node) else {
                continue;
            };
            let cmp = program.inst(self.dg.node(pre).inst);
            if cmp.opcode != Opcode::ICmp {
                continue;
            }
            let (Some(&lhs), Some(&rhs)) = (cmp.operands.first(), cmp.operands.get(1)) else {
                continue;
            };
            let null_check = (program.is_null_constant(lhs) && program.is_pointer(rhs))
                || (program.is_null_constant(rhs) && program.is_pointer(lhs));
            if !null_check {
                return false;
            }
        }
        trace!("{} branches on path", branches);
        branches != 0
    }

    /// Whether the sink depends on the root through nodes of the path (or
    /// calls) on the backward slice. Otherwise the path only counts when it
    /// is guarded by null checks of the root.
    fn is_path_valid(&self, sink: NodeIndex, path: &BTreeSet<NodeIndex>) -> bool {
        let mut visited = BTreeSet::from([sink]);
        let mut queue = VecDeque::from([sink]);
        while let Some(node) = queue.pop_front() {
            for (src, edge) in self.dg.edges_in(node) {
                if !edge.is_dd() {
                    continue;
                }
                if !path.contains(&src) && !self.is_call(src) {
                    continue;
                }
                if !self.backward.contains(&src) {
                    continue;
                }
                if src == self.root {
                    return true;
                }
                if visited.insert(src) {
                    queue.push_back(src);
                }
            }
        }
        self.is_de_branch(path)
    }

    /// A return may only be taken back into the context the path came from.
    fn is_ret_context(&self, path: &BTreeSet<NodeIndex>, dst: NodeIndex) -> bool {
        self.dg.edges_in(dst).into_iter().all(|(src, edge)| {
            !edge.is_cfg()
                || edge.attr.contains(EdgeAttr::RET)
                || self.cross_func_num == 0
                || path.contains(&src)
        })
    }

    fn enter_cfg(&self, node: NodeIndex, path: &mut BTreeSet<NodeIndex>) -> Option<CfgFrame> {
        if self.is_exit(node) {
            return None;
        }
        path.insert(node);
        let edge_type = self.visit_edge_type(node, path);
        Some(CfgFrame {
            node,
            edges: self.dg.edges_out(node),
            next: 0,
            edge_type,
        })
    }

    fn compute_path_reachable(&mut self) {
        self.reach_out = false;
        self.cross_func_num = 0;

        let mut path = BTreeSet::new();
        let mut stack: Vec<CfgFrame> = self.enter_cfg(self.root, &mut path).into_iter().collect();
        while let Some(frame) = stack.last_mut() {
            let Some(&(dst, edge)) = frame.edges.get(frame.next) else {
                let node = frame.node;
                stack.pop();
                path.remove(&node);
                if self.reach_out {
                    if let Some(parent) = stack.last_mut() {
                        parent.next = parent.edges.len();
                    }
                }
                continue;
            };
            frame.next += 1;
            if !edge.is_cfg() || path.contains(&dst) || !edge.attr.intersects(frame.edge_type) {
                continue;
            }
            let graph = self.dg.graph();
            if graph.edges_directed(dst, Direction::Outgoing).next().is_none() {
                trace!("N{} reaches out", self.dg.node(dst).id);
                self.reach_out = true;
                frame.next = frame.edges.len();
                continue;
            }
            if edge.attr.contains(EdgeAttr::RET) {
                if !self.fd_funcs.contains(&self.func_of(dst)) {
                    trace!("N{} reaches out through a return", self.dg.node(dst).id);
                    self.reach_out = true;
                    continue;
                }
                if !self.is_ret_context(&path, dst) {
                    continue;
                }
                self.cross_func_num += 1;
            }
            if self.sinks.contains(&dst) {
                self.reach_out = !self.is_path_valid(dst, &path);
                continue;
            }
            match self.enter_cfg(dst, &mut path) {
                Some(child) => stack.push(child),
                None => {
                    if self.reach_out {
                        frame.next = frame.edges.len();
                    }
                }
            }
        }

        if !self.reach_out {
            self.reach = Reachability::All;
        }
    }
}
