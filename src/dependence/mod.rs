//! # dependence
//!
//! Whole-program dependence graph. One node per non-debug instruction of
//! every reachable function, numbered from 1. Edges are tagged with
//! `EdgeAttr` bits; one edge may be both control flow and data dependence.
//!
//! Building runs in order:
//! 1. intraprocedural CFG, then call and return edges;
//! 2. possible def/use refinement along call paths, then for the functions
//!    no path visited;
//! 3. reaching definitions and DD edges per function;
//! 4. DD edges between actual and formal parameters and return values;
//! 5. DD edges from stores to loads of the same global.

mod def_use;
mod dot;
mod func_dg;
mod node;

pub use def_use::{DefUse, Element, ElementDef, InstAnalyzer};
pub use func_dg::{FuncDg, ReachingDefs};
pub use node::{DgEdge, DgNode, EdgeAttr};

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use log::{debug, info};
use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::{Direction, Graph};

use crate::callgraph::{CallPathVisitor, Callgraph};
use crate::config::Config;
use crate::error::Result;
use crate::ir::{FuncId, InstId, Opcode, Program, ValueId};
use crate::pointer_analysis::PointerAnalysis;

use def_use::gep_element;

pub struct DgGraph<'p> {
    program: &'p Program,
    pta: PointerAnalysis<'p>,
    callgraph: Callgraph,
    graph: Graph<DgNode, DgEdge>,
    inst_nodes: HashMap<InstId, NodeIndex>,
    func_dgs: BTreeMap<FuncId, FuncDg>,
    /// Functions refined along at least one call path.
    refined: BTreeSet<FuncId>,
    path_count: usize,
}

/// Refines the possible defs and uses of every function on a call path,
/// sharing one value set along the path.
struct PathRefiner<'a, 'p> {
    program: &'p Program,
    pta: &'a PointerAnalysis<'p>,
    func_dgs: &'a mut BTreeMap<FuncId, FuncDg>,
    refined: &'a mut BTreeSet<FuncId>,
}

impl CallPathVisitor for PathRefiner<'_, '_> {
    fn visit_path(&mut self, path: &[FuncId]) -> Result<()> {
        let mut value_set = BTreeSet::new();
        for func in path {
            if let Some(fdg) = self.func_dgs.get_mut(func) {
                fdg.analyzer
                    .update_pd_info(self.program, self.pta, Some(&mut value_set))?;
                self.refined.insert(*func);
            }
        }
        Ok(())
    }
}

impl<'p> DgGraph<'p> {
    /// Builds the graph of the functions `callgraph` marks reachable. `pta`
    /// must have been run and `callgraph` analyzed and linked.
    pub fn build(pta: PointerAnalysis<'p>, callgraph: Callgraph, config: &Config) -> Result<Self> {
        let mut dg = Self {
            program: pta.program(),
            pta,
            callgraph,
            graph: Graph::new(),
            inst_nodes: HashMap::new(),
            func_dgs: BTreeMap::new(),
            refined: BTreeSet::new(),
            path_count: 0,
        };
        dg.build_cfg();
        dg.update_pts_by_fs(config.path_depth)?;
        dg.build_ddg();
        info!(
            "dependence graph: {} nodes, {} edges, {} functions",
            dg.graph.node_count(),
            dg.graph.edge_count(),
            dg.func_dgs.len()
        );
        Ok(dg)
    }

    // ---------------------------------------------------------------------
    // Graph primitives
    // ---------------------------------------------------------------------

    fn add_node(&mut self, inst: InstId, func: FuncId) -> NodeIndex {
        let id = self.graph.node_count() + 1;
        let node = self.graph.add_node(DgNode { id, inst, func });
        self.inst_nodes.insert(inst, node);
        node
    }

    /// Adds `src -> dst` or, if the pair is already linked, ORs `attr` into
    /// the existing edge. The first carried value is kept.
    fn add_edge(&mut self, src: NodeIndex, dst: NodeIndex, attr: EdgeAttr, value: Option<ValueId>) {
        match self.graph.find_edge(src, dst) {
            Some(edge) => {
                let weight = &mut self.graph[edge];
                weight.attr |= attr;
                if weight.value.is_none() {
                    weight.value = value;
                }
            }
            None => {
                self.graph.add_edge(src, dst, DgEdge::new(attr, value));
            }
        }
    }

    fn edge_indices(&self, node: NodeIndex, dir: Direction) -> Vec<EdgeIndex> {
        let mut edges: Vec<EdgeIndex> = self
            .graph
            .edges_directed(node, dir)
            .map(|e| e.id())
            .collect();
        edges.sort_unstable();
        edges
    }

    // ---------------------------------------------------------------------
    // CFG
    // ---------------------------------------------------------------------

    fn build_cfg(&mut self) {
        for func in self.callgraph.reachable_functions() {
            if self.program.inst_count(func) == 0 {
                continue;
            }
            let in_callsites = self
                .callgraph
                .node(func)
                .map(|n| n.in_callsites.clone())
                .unwrap_or_default();
            let analyzer = InstAnalyzer::new(self.program, &self.callgraph, func, &in_callsites);
            let mut fdg = FuncDg::new(analyzer);
            self.build_intra_cfg(&mut fdg);
            if fdg.entry.is_some() {
                self.func_dgs.insert(func, fdg);
            }
        }
        info!(
            "intraprocedural cfg: {} functions, {} nodes, {} edges",
            self.func_dgs.len(),
            self.graph.node_count(),
            self.graph.edge_count()
        );
        self.build_inter_cfg();
    }

    fn build_intra_cfg(&mut self, fdg: &mut FuncDg) {
        let program = self.program;
        let func = program.func(fdg.func());
        // (head, tail) of every block that kept a node
        let mut segments: BTreeMap<usize, (NodeIndex, NodeIndex)> = BTreeMap::new();
        for bb in &func.blocks {
            let mut segment: Option<(NodeIndex, NodeIndex)> = None;
            for inst in &program.block(*bb).insts {
                if program.is_debug_inst(*inst) {
                    continue;
                }
                let node = self.add_node(*inst, func.id);
                fdg.nodes.push(node);
                segment = match segment {
                    None => Some((node, node)),
                    Some((head, tail)) => {
                        self.add_edge(tail, node, EdgeAttr::CFG, None);
                        Some((head, node))
                    }
                };
            }
            if let Some(segment) = segment {
                segments.insert(*bb, segment);
            }
        }
        let Some(entry_bb) = func.blocks.first() else {
            return;
        };
        fdg.entry = segments.get(entry_bb).map(|(head, _)| *head);

        for bb in &func.blocks {
            let Some(&(_, tail)) = segments.get(bb) else {
                continue;
            };
            let succs = &program.block(*bb).succs;
            if succs.is_empty() {
                fdg.exit = Some(tail);
                continue;
            }
            for succ in succs {
                if let Some(&(head, _)) = segments.get(succ) {
                    self.add_edge(tail, head, EdgeAttr::CFG, None);
                }
            }
        }
    }

    /// Splices every resolved call into its callees: `CFG|CALL` from the
    /// call site to the callee entry and `CFG|RET` from the callee exit to
    /// the instruction after the call. A fallthrough edge whose target ends
    /// up with several predecessors is marked `CFG_DUMMY`.
    fn build_inter_cfg(&mut self) {
        let sites: Vec<InstId> = self.callgraph.call_sites().collect();
        let mut spliced = 0;
        for site in sites {
            let Some(&cs_node) = self.inst_nodes.get(&site) else {
                continue;
            };
            let Some(&fallthrough) = self.edge_indices(cs_node, Direction::Outgoing).first() else {
                continue;
            };
            let Some((_, next)) = self.graph.edge_endpoints(fallthrough) else {
                continue;
            };
            for (callee, _) in self.callgraph.callees_at(site) {
                let Some(cfdg) = self.func_dgs.get(&callee) else {
                    continue;
                };
                let (entry, exit) = (cfdg.entry, cfdg.exit);
                if let Some(entry) = entry {
                    self.add_edge(cs_node, entry, EdgeAttr::CFG | EdgeAttr::CALL, None);
                }
                if let Some(exit) = exit {
                    self.add_edge(exit, next, EdgeAttr::CFG | EdgeAttr::RET, None);
                }
                spliced += 1;
            }
            if self.graph.edges_directed(next, Direction::Incoming).count() > 1 {
                self.graph[fallthrough].attr = EdgeAttr::CFG | EdgeAttr::CFG_DUMMY;
            }
        }
        info!("interprocedural cfg: {} calls spliced", spliced);
    }

    // ---------------------------------------------------------------------
    // Possible def/use refinement
    // ---------------------------------------------------------------------

    fn update_pts_by_fs(&mut self, depth: usize) -> Result<()> {
        let mut refiner = PathRefiner {
            program: self.program,
            pta: &self.pta,
            func_dgs: &mut self.func_dgs,
            refined: &mut self.refined,
        };
        self.path_count = self
            .callgraph
            .update_pts_by_fs(self.program, depth, &mut refiner)?;

        let mut rest = 0;
        for (func, fdg) in self.func_dgs.iter_mut() {
            if self.refined.contains(func) {
                continue;
            }
            fdg.analyzer.update_pd_info(self.program, &self.pta, None)?;
            rest += 1;
        }
        info!(
            "refined {} functions along {} call paths, {} without a path",
            self.refined.len(),
            self.path_count,
            rest
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // DDG
    // ---------------------------------------------------------------------

    fn build_ddg(&mut self) {
        self.build_intra_ddg();
        self.build_inter_ddg();
        self.update_global_dd();
    }

    fn build_intra_ddg(&mut self) {
        let mut edges = Vec::new();
        for fdg in self.func_dgs.values() {
            let reaching = fdg.reaching_definitions(&self.graph);
            edges.extend(fdg.data_dependences(&self.graph, &reaching));
        }
        debug!("intraprocedural ddg: {} dependences", edges.len());
        for (src, dst, value) in edges {
            self.add_edge(src, dst, EdgeAttr::DD, Some(value));
        }
    }

    fn build_inter_ddg(&mut self) {
        let sites: Vec<InstId> = self.callgraph.call_sites().collect();
        for site in sites {
            let Some(&cs_node) = self.inst_nodes.get(&site) else {
                continue;
            };
            for (callee, _) in self.callgraph.callees_at(site) {
                if !self.func_dgs.contains_key(&callee) {
                    continue;
                }
                self.relate_act_para(callee, cs_node);
                self.relate_fp_ret(callee, cs_node);
            }
        }
    }

    /// Links the stores through which `callee` may write the caller's
    /// actual parameters to the instructions after the call that use them.
    /// The walk follows the caller's CFG and stops at the first return.
    fn relate_act_para(&mut self, callee: FuncId, cs_node: NodeIndex) {
        let Some(cfdg) = self.func_dgs.get(&callee) else {
            return;
        };
        let pdefs = cfdg.analyzer.pdef_actuals();
        if pdefs.is_empty() {
            return;
        }

        let mut found: Vec<(InstId, NodeIndex, ValueId)> = Vec::new();
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        let mut stop = self.push_cfg_successors(cs_node, &mut queue);
        while !stop {
            let Some(node) = queue.pop_front() else {
                break;
            };
            if !visited.insert(node) {
                continue;
            }
            let DgNode { inst, func, .. } = self.graph[node];
            let instruction = self.program.inst(inst);
            if instruction.opcode == Opcode::GetElementPtr {
                if let Some(def) = gep_element(self.program, instruction).and_then(|e| pdefs.get(&e)) {
                    found.push((def.def_inst, node, def.def_val));
                }
            } else if let Some(du) = self.func_dgs.get(&func).and_then(|f| f.analyzer.def_use(inst)) {
                for used in du.uses().filter(|v| !du.is_puse(*v)) {
                    let whole = Element {
                        base: used,
                        offset: None,
                    };
                    match pdefs.get(&whole) {
                        Some(def) => found.push((def.def_inst, node, used)),
                        None => found.extend(
                            pdefs
                                .iter()
                                .filter(|(elem, _)| elem.base == used)
                                .map(|(_, def)| (def.def_inst, node, used)),
                        ),
                    }
                }
            }
            stop = self.push_cfg_successors(node, &mut queue);
        }

        for (def_inst, node, value) in found {
            if let Some(&def_node) = self.inst_nodes.get(&def_inst) {
                self.add_edge(def_node, node, EdgeAttr::DD, Some(value));
            }
        }
    }

    /// Queues the non-call CFG successors of `node`. Returns `true` when a
    /// return edge leaves it.
    fn push_cfg_successors(&self, node: NodeIndex, queue: &mut VecDeque<NodeIndex>) -> bool {
        for (dst, edge) in self.edges_out(node) {
            if !edge.is_cfg() || edge.attr.contains(EdgeAttr::CALL) {
                continue;
            }
            if edge.attr.contains(EdgeAttr::RET) {
                return true;
            }
            queue.push_back(dst);
        }
        false
    }

    /// The formal parameter `actual` is bound to at `site`.
    fn formal_of_actual(&self, site: InstId, callee: FuncId, actual: ValueId) -> Option<ValueId> {
        self.program
            .func(callee)
            .params
            .iter()
            .zip(self.program.inst(site).call_args())
            .find(|(_, arg)| **arg == actual)
            .map(|(formal, _)| *formal)
    }

    /// Connects definitions of actual parameters to the stores spilling the
    /// matching formals, and the callee's `ret` to the call site.
    fn relate_fp_ret(&mut self, callee: FuncId, cs_node: NodeIndex) {
        let Some(cfdg) = self.func_dgs.get(&callee) else {
            return;
        };
        let DgNode {
            inst: site,
            func: caller,
            ..
        } = self.graph[cs_node];

        let mut found = Vec::new();
        for (def_node, edge) in self.edges_in(cs_node) {
            if !edge.is_dd() {
                continue;
            }
            let Some(actual) = edge.value else {
                continue;
            };
            let Some(formal) = self.formal_of_actual(site, callee, actual) else {
                continue;
            };
            let Some(use_node) = cfdg
                .analyzer
                .formal_store(formal)
                .and_then(|inst| self.inst_nodes.get(&inst).copied())
            else {
                continue;
            };
            let attr = if self.graph[def_node].func == caller {
                EdgeAttr::DD | EdgeAttr::CALL
            } else {
                EdgeAttr::DD
            };
            found.push((def_node, use_node, attr, actual));
        }

        let mut ret_edge = None;
        let ddef = self
            .func_dgs
            .get(&caller)
            .and_then(|f| f.analyzer.def_use(site))
            .and_then(|du| du.ddef());
        if let (false, Some(ddef)) = (self.program.func(callee).returns_void, ddef) {
            let ret_node = cfdg
                .analyzer
                .ret_inst()
                .and_then(|inst| self.inst_nodes.get(&inst).copied());
            if let Some(ret_node) = ret_node {
                if self.edges_in(ret_node).iter().any(|(_, e)| e.is_dd()) {
                    ret_edge = Some((ret_node, ddef));
                }
            }
        }

        for (src, dst, attr, value) in found {
            self.add_edge(src, dst, attr, Some(value));
        }
        if let Some((ret_node, ddef)) = ret_edge {
            self.add_edge(ret_node, cs_node, EdgeAttr::DD | EdgeAttr::RET, Some(ddef));
        }
    }

    /// Every load of a global depends on every store to it, wherever the
    /// two live.
    fn update_global_dd(&mut self) {
        let mut defs: BTreeMap<ValueId, BTreeSet<InstId>> = BTreeMap::new();
        for fdg in self.func_dgs.values() {
            for (global, insts) in fdg.analyzer.global_defs() {
                defs.entry(*global).or_default().extend(insts);
            }
        }
        let mut edges = Vec::new();
        for fdg in self.func_dgs.values() {
            for (global, uses) in fdg.analyzer.global_uses() {
                let Some(def_insts) = defs.get(global) else {
                    continue;
                };
                for use_inst in uses {
                    for def_inst in def_insts {
                        edges.push((*def_inst, *use_inst, *global));
                    }
                }
            }
        }
        debug!("global def-use: {} dependences", edges.len());
        for (def_inst, use_inst, global) in edges {
            if let (Some(&src), Some(&dst)) =
                (self.inst_nodes.get(&def_inst), self.inst_nodes.get(&use_inst))
            {
                self.add_edge(src, dst, EdgeAttr::DD, Some(global));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn pta(&self) -> &PointerAnalysis<'p> {
        &self.pta
    }

    pub fn callgraph(&self) -> &Callgraph {
        &self.callgraph
    }

    pub fn graph(&self) -> &Graph<DgNode, DgEdge> {
        &self.graph
    }

    pub fn node_of(&self, inst: InstId) -> Option<NodeIndex> {
        self.inst_nodes.get(&inst).copied()
    }

    pub fn node(&self, node: NodeIndex) -> &DgNode {
        &self.graph[node]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn func_dg(&self, func: FuncId) -> Option<&FuncDg> {
        self.func_dgs.get(&func)
    }

    pub fn def_use(&self, inst: InstId) -> Option<&DefUse> {
        let func = self.program.inst(inst).func;
        self.func_dgs.get(&func)?.analyzer.def_use(inst)
    }

    /// `(dst, edge)` in insertion order.
    pub fn edges_out(&self, node: NodeIndex) -> Vec<(NodeIndex, DgEdge)> {
        self.edge_indices(node, Direction::Outgoing)
            .into_iter()
            .filter_map(|e| {
                let (_, dst) = self.graph.edge_endpoints(e)?;
                Some((dst, self.graph[e]))
            })
            .collect()
    }

    /// `(src, edge)` in insertion order.
    pub fn edges_in(&self, node: NodeIndex) -> Vec<(NodeIndex, DgEdge)> {
        self.edge_indices(node, Direction::Incoming)
            .into_iter()
            .filter_map(|e| {
                let (src, _) = self.graph.edge_endpoints(e)?;
                Some((src, self.graph[e]))
            })
            .collect()
    }

    pub fn edge(&self, src: NodeIndex, dst: NodeIndex) -> Option<DgEdge> {
        self.graph.find_edge(src, dst).map(|e| self.graph[e])
    }

    /// Recomputes the reaching definitions of `func` on the final def/use
    /// information.
    pub fn reaching_definitions(&self, func: FuncId) -> Option<ReachingDefs> {
        self.func_dgs
            .get(&func)
            .map(|fdg| fdg.reaching_definitions(&self.graph))
    }

    /// Call paths handed to the def/use refinement.
    pub fn path_count(&self) -> usize {
        self.path_count
    }
}
