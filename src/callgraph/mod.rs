//! # callgraph
//!
//! Whole-program callgraph. One node per function, declarations included.
//! Edge (A, B, S) means function A calls B at the call sites in S; S keeps
//! direct and indirect sites apart. Indirect sites are resolved against the
//! points-to results of the called value.
//! Every (call site, callee) pair gets a numeric id, starting at 1, in the
//! order it is discovered.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info, warn};
use petgraph::dot::Dot;
use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::{Directed, Direction, Graph};

use crate::error::Result;
use crate::ir::{FuncId, InstId, Program};
use crate::pointer_analysis::external_lib::is_debug_function;
use crate::pointer_analysis::PointerAnalysis;
use crate::util::scc::strongly_connected_components;
use crate::util::GraphTraits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    DirectCall,
    IndirectCall,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSites {
    pub direct: BTreeSet<InstId>,
    pub indirect: BTreeSet<InstId>,
}

impl CallSites {
    fn insert(&mut self, call_type: CallType, site: InstId) -> bool {
        match call_type {
            CallType::DirectCall => self.direct.insert(site),
            CallType::IndirectCall => self.indirect.insert(site),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (CallType, InstId)> + '_ {
        self.direct
            .iter()
            .map(|s| (CallType::DirectCall, *s))
            .chain(self.indirect.iter().map(|s| (CallType::IndirectCall, *s)))
    }
}

#[derive(Debug, Clone)]
pub struct CallGraphNode {
    pub func: FuncId,
    pub reachable: bool,
    /// Calls no function that has a body.
    pub is_leaf: bool,
    pub has_ptr_arg: bool,
    /// Sites calling this function; only recorded when it has a body.
    pub in_callsites: BTreeSet<InstId>,
    pub out_callsites: BTreeSet<InstId>,
}

/// Receives the call paths enumerated by `CallGraph::update_pts_by_fs`.
pub trait CallPathVisitor {
    fn visit_path(&mut self, path: &[FuncId]) -> Result<()>;
}

pub struct Callgraph {
    pub graph: Graph<CallGraphNode, CallSites, Directed>,
    func_index: HashMap<FuncId, NodeIndex>,
    site_edges: BTreeMap<InstId, Vec<EdgeIndex>>,
    site_ids: BTreeMap<(InstId, FuncId), usize>,
    failed: BTreeSet<InstId>,
    entry: Option<FuncId>,
}

impl Default for Callgraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Callgraph {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            func_index: HashMap::new(),
            site_edges: BTreeMap::new(),
            site_ids: BTreeMap::new(),
            failed: BTreeSet::new(),
            entry: None,
        }
    }

    pub fn func_index(&self, func: FuncId) -> Option<NodeIndex> {
        self.func_index.get(&func).copied()
    }

    pub fn node(&self, func: FuncId) -> Option<&CallGraphNode> {
        self.func_index(func).and_then(|idx| self.graph.node_weight(idx))
    }

    /// Builds nodes for every function and edges for every resolvable call
    /// site. `pta` must have been run.
    pub fn analyze(&mut self, program: &Program, pta: &PointerAnalysis<'_>) -> Result<()> {
        for func in &program.functions {
            let idx = self.graph.add_node(CallGraphNode {
                func: func.id,
                reachable: false,
                is_leaf: true,
                has_ptr_arg: func.params.iter().any(|p| program.is_pointer(*p)),
                in_callsites: BTreeSet::new(),
                out_callsites: BTreeSet::new(),
            });
            self.func_index.insert(func.id, idx);
        }

        for func in &program.functions {
            if func.is_declaration() || is_debug_function(&func.name) {
                continue;
            }
            for site in program.func_insts(func.id) {
                let inst = program.inst(site);
                if !inst.is_call() || program.is_debug_inst(site) {
                    continue;
                }
                if let Some(callee) = program.callee(site) {
                    if callee != func.id {
                        self.add_call(program, func.id, callee, site, CallType::DirectCall);
                    }
                    continue;
                }

                let argc = inst.call_args().len();
                let targets = match inst.called_value() {
                    Some(called) => pta.function_targets(called)?,
                    None => Vec::new(),
                };
                if targets.is_empty() {
                    self.failed.insert(site);
                }
                for callee in targets {
                    if callee == func.id {
                        continue;
                    }
                    if program.func(callee).accepts_args(argc) {
                        self.add_call(program, func.id, callee, site, CallType::IndirectCall);
                    } else {
                        self.failed.insert(site);
                    }
                }
            }
        }

        for site in &self.failed {
            warn!("unresolved indirect call at {}", program.source_loc(*site));
        }
        info!(
            "callgraph: {} functions, {} edges, {} call sites, {} unresolved",
            self.graph.node_count(),
            self.graph.edge_count(),
            self.site_ids.len(),
            self.failed.len()
        );
        Ok(())
    }

    fn add_call(
        &mut self,
        program: &Program,
        caller: FuncId,
        callee: FuncId,
        site: InstId,
        call_type: CallType,
    ) {
        let caller_idx = self.func_index[&caller];
        let callee_idx = self.func_index[&callee];
        let edge = match self.graph.find_edge(caller_idx, callee_idx) {
            Some(edge) => edge,
            None => self
                .graph
                .add_edge(caller_idx, callee_idx, CallSites::default()),
        };
        self.graph[edge].insert(call_type, site);

        let edges = self.site_edges.entry(site).or_default();
        if !edges.contains(&edge) {
            edges.push(edge);
        }
        let next_id = self.site_ids.len() + 1;
        self.site_ids.entry((site, callee)).or_insert(next_id);

        if !program.func(callee).is_declaration() {
            self.graph[caller_idx].is_leaf = false;
            self.graph[callee_idx].in_callsites.insert(site);
        }
        self.graph[caller_idx].out_callsites.insert(site);
    }

    /// Marks everything reachable from `entry_name`. Without such a function
    /// nothing is reachable.
    pub fn link_graph(&mut self, program: &Program, entry_name: &str) {
        let Some(entry) = program.function_by_name(entry_name) else {
            warn!("entry function `{}` not found", entry_name);
            return;
        };
        self.entry = Some(entry);
        let root = self.func_index[&entry];
        let mut bfs = Bfs::new(&self.graph, root);
        let mut count = 0;
        while let Some(idx) = bfs.next(&self.graph) {
            self.graph[idx].reachable = true;
            count += 1;
        }
        info!("{} functions reachable from {}", count, entry_name);
    }

    pub fn entry(&self) -> Option<FuncId> {
        self.entry
    }

    pub fn is_reachable(&self, func: FuncId) -> bool {
        self.node(func).map_or(false, |n| n.reachable)
    }

    /// Reachable functions in program order.
    pub fn reachable_functions(&self) -> Vec<FuncId> {
        let mut funcs: Vec<FuncId> = self
            .graph
            .node_weights()
            .filter(|n| n.reachable)
            .map(|n| n.func)
            .collect();
        funcs.sort_unstable();
        funcs
    }

    fn neighbors(&self, func: FuncId, dir: Direction) -> Vec<FuncId> {
        let Some(idx) = self.func_index(func) else {
            return Vec::new();
        };
        let mut funcs: Vec<FuncId> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n].func)
            .collect();
        funcs.sort_unstable();
        funcs.dedup();
        funcs
    }

    pub fn callees_of(&self, func: FuncId) -> Vec<FuncId> {
        self.neighbors(func, Direction::Outgoing)
    }

    pub fn callers_of(&self, func: FuncId) -> Vec<FuncId> {
        self.neighbors(func, Direction::Incoming)
    }

    /// Resolved callees of one call site, in callee order.
    pub fn callees_at(&self, site: InstId) -> Vec<(FuncId, CallType)> {
        let mut callees = Vec::new();
        for edge in self.site_edges.get(&site).into_iter().flatten() {
            let Some((_, to)) = self.graph.edge_endpoints(*edge) else {
                continue;
            };
            let sites = &self.graph[*edge];
            let call_type = if sites.direct.contains(&site) {
                CallType::DirectCall
            } else {
                CallType::IndirectCall
            };
            callees.push((self.graph[to].func, call_type));
        }
        callees.sort_by_key(|(func, _)| *func);
        callees
    }

    pub fn call_site_id(&self, site: InstId, callee: FuncId) -> Option<usize> {
        self.site_ids.get(&(site, callee)).copied()
    }

    /// Call sites with at least one resolved callee, in instruction order.
    pub fn call_sites(&self) -> impl Iterator<Item = InstId> + '_ {
        self.site_edges.keys().copied()
    }

    /// Indirect call sites with no matching target.
    pub fn failed_call_sites(&self) -> Vec<InstId> {
        self.failed.iter().copied().collect()
    }

    /// Enumerates call paths from the entry. A path ends at a leaf or when
    /// it reaches `depth` functions; every such path is handed to `visitor`.
    /// Returns the number of paths.
    pub fn update_pts_by_fs<V: CallPathVisitor>(
        &self,
        program: &Program,
        depth: usize,
        visitor: &mut V,
    ) -> Result<usize> {
        let Some(entry) = self.entry else {
            return Ok(0);
        };
        let is_leaf = |func: FuncId| self.node(func).map_or(true, |n| n.is_leaf);
        let descend = |func: FuncId| -> Vec<FuncId> {
            self.callees_of(func)
                .into_iter()
                .filter(|callee| !program.func(*callee).is_declaration())
                .collect()
        };

        let mut count = 0;
        let mut path = vec![entry];
        if is_leaf(entry) || depth <= 1 {
            visitor.visit_path(&path)?;
            return Ok(1);
        }
        let mut stack: Vec<(Vec<FuncId>, usize)> = vec![(descend(entry), 0)];
        while let Some((children, next)) = stack.last_mut() {
            let Some(&child) = children.get(*next) else {
                stack.pop();
                path.pop();
                continue;
            };
            *next += 1;
            if path.contains(&child) {
                continue;
            }
            path.push(child);
            if is_leaf(child) || path.len() >= depth {
                visitor.visit_path(&path)?;
                count += 1;
                path.pop();
            } else {
                stack.push((descend(child), 0));
            }
        }
        debug!("enumerated {} call paths of depth <= {}", count, depth);
        Ok(count)
    }

    /// Cycles of mutually recursive reachable functions.
    pub fn recursive_components(&self) -> Vec<Vec<FuncId>> {
        strongly_connected_components(self)
    }

    /// Dot rendering with function names on nodes and call site counts on
    /// edges.
    pub fn to_dot(&self, program: &Program) -> String {
        let named = self.graph.map(
            |_, node| program.func(node.func).name.clone(),
            |_, sites| {
                format!(
                    "direct: {} indirect: {}",
                    sites.direct.len(),
                    sites.indirect.len()
                )
            },
        );
        format!("{}", Dot::new(&named))
    }
}

/// The subgraph of reachable functions.
impl GraphTraits for Callgraph {
    type Node = FuncId;

    fn node_ids(&self) -> Vec<FuncId> {
        self.graph
            .node_weights()
            .filter(|node| node.reachable)
            .map(|node| node.func)
            .collect()
    }

    fn children(&self, func: FuncId) -> Vec<FuncId> {
        self.callees_of(func)
            .into_iter()
            .filter(|callee| self.is_reachable(*callee))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ProgramBuilder, RetKind};
    use pretty_assertions::assert_eq;

    struct Recorder(Vec<Vec<FuncId>>);

    impl CallPathVisitor for Recorder {
        fn visit_path(&mut self, path: &[FuncId]) -> Result<()> {
            self.0.push(path.to_vec());
            Ok(())
        }
    }

    fn build(program: &Program) -> Callgraph {
        let mut pta = PointerAnalysis::new(program, true);
        pta.run().unwrap();
        let mut cg = Callgraph::new();
        cg.analyze(program, &pta).unwrap();
        cg.link_graph(program, "main");
        cg
    }

    /// main -> a -> b -> c, main -> c; d is never called.
    fn chain() -> (Program, [FuncId; 5]) {
        let mut pb = ProgramBuilder::new();
        let c = pb.define("c", RetKind::Void, &[]);
        let bb = pb.block(c);
        pb.ret(bb, None);
        let b = pb.define("b", RetKind::Void, &[true]);
        let bb = pb.block(b);
        let c_fn = pb.func_value(c);
        pb.call(bb, c_fn, &[]);
        pb.ret(bb, None);
        let a = pb.define("a", RetKind::Void, &[]);
        let bb = pb.block(a);
        let b_fn = pb.func_value(b);
        let null = pb.null();
        pb.call(bb, b_fn, &[null]);
        pb.ret(bb, None);
        let d = pb.define("d", RetKind::Void, &[]);
        let bb = pb.block(d);
        pb.call(bb, c_fn, &[]);
        pb.ret(bb, None);
        let main = pb.define("main", RetKind::Scalar, &[]);
        let bb = pb.block(main);
        let a_fn = pb.func_value(a);
        pb.call(bb, a_fn, &[]);
        pb.call(bb, c_fn, &[]);
        let zero = pb.const_int(0);
        pb.ret(bb, Some(zero));
        (pb.finish(), [a, b, c, d, main])
    }

    #[test_log::test]
    fn test_direct_edges_and_reachability() {
        let (program, [a, b, c, d, main]) = chain();
        let cg = build(&program);

        assert_eq!(cg.callees_of(main), vec![c, a]);
        assert_eq!(cg.callers_of(c), vec![b, d, main]);
        assert!(cg.is_reachable(b));
        assert!(!cg.is_reachable(d));
        assert_eq!(cg.reachable_functions(), vec![c, b, a, main]);
        assert!(cg.node(c).unwrap().is_leaf);
        assert!(!cg.node(main).unwrap().is_leaf);
        assert!(cg.node(b).unwrap().has_ptr_arg);
        assert_eq!(cg.node(c).unwrap().in_callsites.len(), 3);
        assert!(cg.failed_call_sites().is_empty());
    }

    #[test_log::test]
    fn test_call_site_ids_start_at_one() {
        let (program, [a, _, c, _, main]) = chain();
        let cg = build(&program);
        let sites: Vec<InstId> = program.func_insts(main).collect();
        assert_eq!(cg.call_site_id(sites[0], a).map(|id| id >= 1), Some(true));
        assert_eq!(cg.callees_at(sites[1]), vec![(c, CallType::DirectCall)]);
        assert_eq!(cg.call_site_id(sites[1], a), None);
        let mut ids: Vec<usize> = cg.site_ids.values().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=ids.len()).collect::<Vec<_>>());
    }

    #[test_log::test]
    fn test_call_paths_respect_depth() {
        let (program, [a, b, c, _, main]) = chain();
        let cg = build(&program);

        let mut recorder = Recorder(Vec::new());
        let count = cg.update_pts_by_fs(&program, 5, &mut recorder).unwrap();
        assert_eq!(count, 2);
        assert_eq!(recorder.0, vec![vec![main, c], vec![main, a, b, c]]);

        let mut recorder = Recorder(Vec::new());
        cg.update_pts_by_fs(&program, 2, &mut recorder).unwrap();
        assert_eq!(recorder.0, vec![vec![main, c], vec![main, a]]);
    }

    #[test_log::test]
    fn test_indirect_call_resolution() {
        let mut pb = ProgramBuilder::new();
        let handler = pb.define("handler", RetKind::Void, &[true]);
        let bb = pb.block(handler);
        pb.ret(bb, None);
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        let slot = pb.alloca(bb);
        let handler_fn = pb.func_value(handler);
        pb.store(bb, handler_fn, slot);
        let fp = pb.load(bb, slot, true);
        let arg = pb.alloca(bb);
        let resolved = pb.call_with(bb, fp, &[arg], RetKind::Void);
        let empty_slot = pb.alloca(bb);
        let dangling = pb.load(bb, empty_slot, true);
        let unresolved = pb.call_with(bb, dangling, &[], RetKind::Void);
        pb.ret(bb, None);
        let program = pb.finish();
        let cg = build(&program);

        let resolved = program.as_inst(resolved).unwrap();
        let unresolved = program.as_inst(unresolved).unwrap();
        assert_eq!(
            cg.callees_at(resolved),
            vec![(handler, CallType::IndirectCall)]
        );
        assert!(cg.callees_at(unresolved).is_empty());
        assert_eq!(cg.failed_call_sites(), vec![unresolved]);
        assert!(cg.is_reachable(handler));
    }

    #[test_log::test]
    fn test_indirect_self_call_adds_no_edge() {
        let mut pb = ProgramBuilder::new();
        let worker = pb.define("worker", RetKind::Void, &[]);
        let bb = pb.block(worker);
        let slot = pb.alloca(bb);
        let worker_fn = pb.func_value(worker);
        pb.store(bb, worker_fn, slot);
        let fp = pb.load(bb, slot, true);
        let site = pb.call_with(bb, fp, &[], RetKind::Void);
        pb.ret(bb, None);
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        pb.call(bb, worker_fn, &[]);
        pb.ret(bb, None);
        let program = pb.finish();
        let cg = build(&program);

        let site = program.as_inst(site).unwrap();
        assert!(cg.callees_at(site).is_empty());
        assert!(cg.failed_call_sites().is_empty());
        let idx = cg.func_index(worker).unwrap();
        assert!(cg.graph.find_edge(idx, idx).is_none());
        assert!(cg.recursive_components().is_empty());
    }

    #[test_log::test]
    fn test_indirect_call_to_variadic_function() {
        let mut pb = ProgramBuilder::new();
        let logger = pb.define("logger", RetKind::Void, &[true]);
        pb.set_vararg(logger);
        let bb = pb.block(logger);
        pb.ret(bb, None);
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        let slot = pb.alloca(bb);
        let logger_fn = pb.func_value(logger);
        pb.store(bb, logger_fn, slot);
        let fp = pb.load(bb, slot, true);
        let fmt = pb.alloca(bb);
        let one = pb.const_int(1);
        let extra = pb.alloca(bb);
        let site = pb.call_with(bb, fp, &[fmt, one, extra], RetKind::Void);
        let short = pb.call_with(bb, fp, &[], RetKind::Void);
        pb.ret(bb, None);
        let program = pb.finish();
        let cg = build(&program);

        let site = program.as_inst(site).unwrap();
        let short = program.as_inst(short).unwrap();
        assert_eq!(cg.callees_at(site), vec![(logger, CallType::IndirectCall)]);
        assert!(cg.callees_at(short).is_empty());
        assert_eq!(cg.failed_call_sites(), vec![short]);
    }

    #[test_log::test]
    fn test_recursive_components_and_dot() {
        let mut pb = ProgramBuilder::new();
        let even = pb.define("even", RetKind::Void, &[]);
        let odd = pb.define("odd", RetKind::Void, &[]);
        let even_fn = pb.func_value(even);
        let odd_fn = pb.func_value(odd);
        let bb = pb.block(even);
        pb.call(bb, odd_fn, &[]);
        pb.ret(bb, None);
        let bb = pb.block(odd);
        pb.call(bb, even_fn, &[]);
        pb.ret(bb, None);
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        pb.call(bb, even_fn, &[]);
        pb.ret(bb, None);
        let program = pb.finish();
        let cg = build(&program);

        assert_eq!(cg.recursive_components(), vec![vec![even, odd]]);
        let dot = cg.to_dot(&program);
        assert!(dot.contains("\"odd\""));
        assert!(dot.contains("direct: 1 indirect: 0"));
    }
}
