//! Inclusion-based (Andersen) points-to analysis.
//!
//! Constraints are collected from every global, function and instruction,
//! turned into a constraint graph, and solved with a worklist. Copy cycles
//! are collapsed once before solving and incrementally while solving.
//! Indirect call sites are bound to the functions their called value points
//! to whenever the worklist drains, until no new binding appears.
//!
//! Object nodes carry the value that names the abstract object: the alloca
//! or allocating call, the global, or the function.

pub mod constraint;
pub mod constraint_graph;
pub mod cycle_detect;
pub mod external_lib;
mod pts_set;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::{debug, info, trace};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::ir::{CastKind, FuncId, Initializer, InstId, Opcode, Program, ValueId, ValueKind};
use crate::util::SparseBitSet;

pub use constraint::{Constraint, ConstraintKind, NodeId};
pub use constraint_graph::{
    ConstraintGraph, EdgeKind, NodeKind, NULL_OBJECT, NULL_PTR, UNIVERSAL_OBJ, UNIVERSAL_PTR,
};
pub use cycle_detect::{OfflineCycleDetector, OnlineCycleDetector};
pub use external_lib::ExternalKind;
pub use pts_set::PtsSet;

/// An abstract memory object as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MemObject {
    /// Unknown memory, reached through external code.
    Universal,
    Null,
    /// The object allocated or named by this value.
    Value(ValueId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PtsStats {
    pub constraints: usize,
    pub nodes: usize,
    pub copy_edges: usize,
    pub load_edges: usize,
    pub store_edges: usize,
    pub merges: usize,
    pub iterations: usize,
    pub indirect_bindings: usize,
}

pub struct PointerAnalysis<'p> {
    program: &'p Program,
    refine_indirect_calls: bool,
    graph: ConstraintGraph,
    constraints: Vec<Constraint>,
    value_nodes: HashMap<ValueId, NodeId>,
    object_nodes: HashMap<ValueId, NodeId>,
    ret_nodes: HashMap<FuncId, NodeId>,
    vararg_nodes: HashMap<FuncId, NodeId>,
    unsolved: BTreeSet<FuncId>,
    fp_sites: Vec<InstId>,
    bound: HashSet<(InstId, FuncId)>,
    worklist: VecDeque<NodeId>,
    in_worklist: SparseBitSet,
    online: OnlineCycleDetector,
    stats: PtsStats,
    solved: bool,
}

impl<'p> PointerAnalysis<'p> {
    pub fn new(program: &'p Program, refine_indirect_calls: bool) -> Self {
        Self {
            program,
            refine_indirect_calls,
            graph: ConstraintGraph::new(),
            constraints: Vec::new(),
            value_nodes: HashMap::new(),
            object_nodes: HashMap::new(),
            ret_nodes: HashMap::new(),
            vararg_nodes: HashMap::new(),
            unsolved: BTreeSet::new(),
            fp_sites: Vec::new(),
            bound: HashSet::new(),
            worklist: VecDeque::new(),
            in_worklist: SparseBitSet::new(),
            online: OnlineCycleDetector::new(),
            stats: PtsStats::default(),
            solved: false,
        }
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn graph(&self) -> &ConstraintGraph {
        &self.graph
    }

    /// Collects constraints, builds the graph and solves it.
    pub fn run(&mut self) -> Result<()> {
        self.collect();
        info!("collected {} constraints", self.constraints.len());
        self.init()?;

        let merged = OfflineCycleDetector::new().run(&mut self.graph);
        info!("offline cycle detection collapsed {} nodes", merged);

        self.solve();
        if self.refine_indirect_calls {
            loop {
                let added = self.refine_indirect_calls()?;
                if added == 0 {
                    break;
                }
                debug!("bound {} new indirect callees", added);
                self.solve();
            }
        }
        self.solved = true;

        let stats = self.stats();
        info!(
            "points-to solved: {} nodes, {} merges, {} iterations, {} unsolved externals",
            stats.nodes,
            stats.merges,
            stats.iterations,
            self.unsolved.len()
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Node maps
    // ---------------------------------------------------------------------

    fn value_node(&mut self, value: ValueId) -> NodeId {
        if let Some(node) = self.value_nodes.get(&value) {
            return *node;
        }
        let node = self.graph.add_node(NodeKind::Value, Some(value));
        self.value_nodes.insert(value, node);
        node
    }

    fn new_object(&mut self, value: ValueId) -> NodeId {
        let node = self.graph.add_node(NodeKind::Object, Some(value));
        self.object_nodes.insert(value, node);
        node
    }

    /// Node standing for an operand. Integer constants have none.
    fn operand_node(&mut self, value: ValueId) -> Option<NodeId> {
        match self.program.value(value).kind {
            ValueKind::ConstantNull | ValueKind::Undef => Some(NULL_PTR),
            ValueKind::ConstantInt(_) => None,
            _ => Some(self.value_node(value)),
        }
    }

    fn ret_node(&mut self, func: FuncId) -> NodeId {
        if let Some(node) = self.ret_nodes.get(&func) {
            return *node;
        }
        let node = self.graph.add_node(NodeKind::Value, None);
        self.ret_nodes.insert(func, node);
        node
    }

    fn vararg_node(&mut self, func: FuncId) -> NodeId {
        if let Some(node) = self.vararg_nodes.get(&func) {
            return *node;
        }
        let node = self.graph.add_node(NodeKind::Object, None);
        self.vararg_nodes.insert(func, node);
        node
    }

    /// Node of a value without creating one.
    pub fn node_of(&self, value: ValueId) -> Option<NodeId> {
        match self.program.values.get(value)?.kind {
            ValueKind::ConstantNull | ValueKind::Undef => Some(NULL_PTR),
            _ => self.value_nodes.get(&value).copied(),
        }
    }

    // ---------------------------------------------------------------------
    // Constraint collection
    // ---------------------------------------------------------------------

    fn emit(&mut self, constraint: Constraint) {
        trace!("constraint {}", constraint);
        self.constraints.push(constraint);
    }

    fn collect(&mut self) {
        self.emit(Constraint::addr_of(UNIVERSAL_PTR, UNIVERSAL_OBJ));
        self.emit(Constraint::store(UNIVERSAL_OBJ, UNIVERSAL_OBJ));
        self.emit(Constraint::addr_of(NULL_PTR, NULL_OBJECT));

        let program = self.program;
        for &global in &program.globals {
            let val = self.value_node(global);
            let obj = if program.value(global).name.starts_with(".str") {
                self.object_nodes.insert(global, UNIVERSAL_OBJ);
                UNIVERSAL_OBJ
            } else {
                self.new_object(global)
            };
            self.emit(Constraint::addr_of(val, obj));
        }
        for func in &program.functions {
            let val = self.value_node(func.value);
            let obj = self.new_object(func.value);
            self.emit(Constraint::addr_of(val, obj));
            if !func.is_declaration() {
                self.ret_node(func.id);
            }
            if func.is_vararg {
                self.vararg_node(func.id);
            }
        }
        for &global in &program.globals {
            let obj = self.object_nodes[&global];
            match &program.value(global).kind {
                ValueKind::Global {
                    initializer: Some(init),
                } => self.collect_initializer(obj, init),
                ValueKind::Global { initializer: None } => {
                    self.emit(Constraint::copy(obj, UNIVERSAL_OBJ))
                }
                _ => {}
            }
        }
        for func in &program.functions {
            for inst in program.func_insts(func.id) {
                if !program.is_debug_inst(inst) {
                    self.collect_inst(inst);
                }
            }
        }
    }

    /// Field-insensitive: every pointer field of an aggregate lands on the
    /// global's one object.
    fn collect_initializer(&mut self, obj: NodeId, init: &Initializer) {
        match init {
            Initializer::Pointer(target) => {
                if let Some(target_obj) = self.object_nodes.get(target).copied() {
                    self.emit(Constraint::addr_of(obj, target_obj));
                }
            }
            Initializer::Null => self.emit(Constraint::copy(obj, NULL_OBJECT)),
            Initializer::Aggregate(fields) => {
                for field in fields {
                    self.collect_initializer(obj, field);
                }
            }
            Initializer::Scalar => {}
        }
    }

    fn collect_inst(&mut self, inst: InstId) {
        let program = self.program;
        let i = program.inst(inst);
        let is_pointer = program.is_pointer(i.value);
        match i.opcode {
            Opcode::Alloca | Opcode::Cast(CastKind::IntToPtr) => {
                let val = self.value_node(i.value);
                let obj = self.new_object(i.value);
                self.emit(Constraint::addr_of(val, obj));
            }
            Opcode::Load if is_pointer => {
                if let Some(ptr) = self.operand_node(i.operands[0]) {
                    let val = self.value_node(i.value);
                    self.emit(Constraint::load(val, ptr));
                }
            }
            Opcode::Store => {
                let (value, ptr) = (i.operands[0], i.operands[1]);
                if program.is_pointer(value) {
                    if let (Some(src), Some(dst)) = (self.operand_node(value), self.operand_node(ptr))
                    {
                        self.emit(Constraint::store(dst, src));
                    }
                }
            }
            Opcode::GetElementPtr | Opcode::Cast(CastKind::BitCast) if is_pointer => {
                self.copy_from(i.value, &i.operands[..1]);
            }
            Opcode::Phi if is_pointer => self.copy_from(i.value, &i.operands),
            Opcode::Select if is_pointer => self.copy_from(i.value, &i.operands[1..]),
            Opcode::VaArg if is_pointer => {
                if let Some(node) = self.vararg_nodes.get(&i.func).copied() {
                    let val = self.value_node(i.value);
                    self.emit(Constraint::copy(val, node));
                }
            }
            Opcode::ExtractValue if is_pointer => {
                let val = self.value_node(i.value);
                self.emit(Constraint::copy(val, NULL_PTR));
            }
            Opcode::Ret => {
                if let Some(&value) = i.operands.first() {
                    if program.is_pointer(value) {
                        if let Some(src) = self.operand_node(value) {
                            let ret = self.ret_node(i.func);
                            self.emit(Constraint::copy(ret, src));
                        }
                    }
                }
            }
            Opcode::Call => self.collect_call(inst),
            _ => {}
        }
    }

    fn copy_from(&mut self, dst: ValueId, srcs: &[ValueId]) {
        let val = self.value_node(dst);
        for src in srcs {
            if let Some(node) = self.operand_node(*src) {
                self.emit(Constraint::copy(val, node));
            }
        }
    }

    fn collect_call(&mut self, inst: InstId) {
        let program = self.program;
        let i = program.inst(inst);
        let Some(callee) = program.callee(inst) else {
            self.fp_sites.push(inst);
            if program.is_pointer(i.value) {
                let val = self.value_node(i.value);
                self.emit(Constraint::copy(val, UNIVERSAL_PTR));
            }
            return;
        };
        let func = program.func(callee);
        if external_lib::is_debug_function(&func.name) {
            return;
        }
        if !func.is_declaration() {
            if callee != i.func {
                for constraint in self.bind_call(inst, callee) {
                    self.emit(constraint);
                }
            }
            return;
        }

        let args = i.call_args();
        let arg = |n: usize| args.get(n).copied();
        match external_lib::classify(&func.name) {
            Some(ExternalKind::Malloc) => self.fresh_object(i.value),
            Some(ExternalKind::Realloc) => {
                if !arg(0).map_or(false, |a| program.is_null_constant(a)) {
                    self.fresh_object(i.value);
                }
            }
            Some(ExternalKind::RetArg0) => {
                if let Some(a0) = arg(0).and_then(|a| self.operand_node(a)) {
                    let val = self.value_node(i.value);
                    self.emit(Constraint::copy(val, a0));
                }
            }
            Some(ExternalKind::Memcpy) => {
                let dst = arg(0).and_then(|a| self.operand_node(a));
                let src = arg(1).and_then(|a| self.operand_node(a));
                if let (Some(dst), Some(src)) = (dst, src) {
                    let tmp = self.graph.add_node(NodeKind::Value, None);
                    self.emit(Constraint::load(tmp, src));
                    self.emit(Constraint::store(dst, tmp));
                    if program.is_pointer(i.value) {
                        let val = self.value_node(i.value);
                        self.emit(Constraint::copy(val, dst));
                    }
                }
            }
            Some(ExternalKind::Cast) => {
                if let (Some(a0), Some(a1)) = (arg(0), arg(1)) {
                    if !program.is_null_constant(a1) {
                        if let (Some(ptr), Some(src)) = (self.operand_node(a0), self.operand_node(a1))
                        {
                            self.emit(Constraint::store(ptr, src));
                        }
                    }
                }
            }
            Some(ExternalKind::Normal) => {}
            None => {
                self.unsolved.insert(callee);
                if program.is_pointer(i.value) {
                    let val = self.value_node(i.value);
                    self.emit(Constraint::copy(val, UNIVERSAL_PTR));
                }
                for &a in args {
                    if program.is_pointer(a) {
                        if let Some(node) = self.operand_node(a) {
                            self.emit(Constraint::copy(node, UNIVERSAL_PTR));
                        }
                    }
                }
            }
        }
    }

    fn fresh_object(&mut self, value: ValueId) {
        let val = self.value_node(value);
        let obj = self.new_object(value);
        self.emit(Constraint::addr_of(val, obj));
    }

    /// Formal/actual and return bindings of `inst` calling `callee`.
    fn bind_call(&mut self, inst: InstId, callee: FuncId) -> Vec<Constraint> {
        let program = self.program;
        let i = program.inst(inst);
        let func = program.func(callee);
        let mut out = Vec::new();
        for (index, &actual) in i.call_args().iter().enumerate() {
            match func.params.get(index) {
                Some(&formal) => {
                    if !program.is_pointer(formal) {
                        continue;
                    }
                    let formal = self.value_node(formal);
                    let src = if program.is_pointer(actual) {
                        self.operand_node(actual).unwrap_or(UNIVERSAL_PTR)
                    } else {
                        UNIVERSAL_PTR
                    };
                    out.push(Constraint::copy(formal, src));
                }
                None if func.is_vararg => {
                    if program.is_pointer(actual) {
                        if let Some(src) = self.operand_node(actual) {
                            let vararg = self.vararg_node(callee);
                            out.push(Constraint::copy(vararg, src));
                        }
                    }
                }
                None => {}
            }
        }
        if program.is_pointer(i.value) && func.returns_pointer {
            let val = self.value_node(i.value);
            let ret = self.ret_node(callee);
            out.push(Constraint::copy(val, ret));
        }
        self.bound.insert((inst, callee));
        out
    }

    // ---------------------------------------------------------------------
    // Solving
    // ---------------------------------------------------------------------

    fn push(&mut self, node: NodeId) {
        if self.in_worklist.insert(node) {
            self.worklist.push_back(node);
        }
    }

    fn pop(&mut self) -> Option<NodeId> {
        let node = self.worklist.pop_front()?;
        self.in_worklist.remove(node);
        Some(node)
    }

    /// Adds one constraint to the live graph, scheduling what it affects.
    fn add_constraint_to_graph(&mut self, constraint: &Constraint) -> Result<()> {
        constraint.check()?;
        let dst = self.graph.get_merge_target(constraint.dst);
        let src = self.graph.get_merge_target(constraint.src);
        match constraint.kind {
            ConstraintKind::AddrOf => {
                if self.graph.add_pts(dst, constraint.src) {
                    self.push(dst);
                }
            }
            ConstraintKind::Copy => {
                if self.graph.add_edge(src, dst, EdgeKind::Copy) {
                    self.push(src);
                }
            }
            ConstraintKind::Load => {
                if self.graph.add_edge(src, dst, EdgeKind::Load) {
                    self.push(src);
                }
            }
            ConstraintKind::Store => {
                if self.graph.add_edge(src, dst, EdgeKind::Store) {
                    self.push(dst);
                }
            }
        }
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        let constraints = std::mem::take(&mut self.constraints);
        for constraint in &constraints {
            self.add_constraint_to_graph(constraint)?;
        }
        self.stats.constraints += constraints.len();
        Ok(())
    }

    fn solve(&mut self) {
        while let Some(node) = self.pop() {
            let node = self.graph.get_merge_target(node);
            self.stats.iterations += 1;
            trace!("visit n{} |pts| = {}", node, self.graph.pts(node).len());

            let pts: Vec<NodeId> = self.graph.pts(node).iter().collect();
            let loads: Vec<NodeId> = self.graph.out_edges(node, EdgeKind::Load).iter().copied().collect();
            let stores: Vec<NodeId> =
                self.graph.in_edges(node, EdgeKind::Store).iter().copied().collect();
            if !loads.is_empty() || !stores.is_empty() {
                let universal = self.graph.get_merge_target(UNIVERSAL_OBJ);
                for pt in pts {
                    let pt = self.graph.get_merge_target(pt);
                    if pt == universal {
                        continue;
                    }
                    for &dst in &loads {
                        let dst = self.graph.get_merge_target(dst);
                        if self.graph.add_edge(pt, dst, EdgeKind::Copy) {
                            self.push(pt);
                        }
                    }
                    for &src in &stores {
                        let src = self.graph.get_merge_target(src);
                        if self.graph.add_edge(src, pt, EdgeKind::Copy) {
                            self.push(src);
                        }
                    }
                }
            }

            let copies: Vec<NodeId> =
                self.graph.out_edges(node, EdgeKind::Copy).iter().copied().collect();
            for dst in copies {
                if self.graph.union_pts(dst, node) {
                    self.push(dst);
                } else {
                    self.online.add_candidate(dst);
                }
            }

            for rep in self.online.run_detect(&mut self.graph) {
                self.push(rep);
            }
        }
    }

    /// Binds indirect call sites to the functions their called value now
    /// points to. Returns the number of new (site, callee) bindings.
    fn refine_indirect_calls(&mut self) -> Result<usize> {
        let program = self.program;
        let mut constraints = Vec::new();
        let mut added = 0;
        for site in self.fp_sites.clone() {
            let Some(called) = program.inst(site).called_value() else {
                continue;
            };
            let argc = program.inst(site).call_args().len();
            for callee in self.pointee_functions(called) {
                let func = program.func(callee);
                if func.is_declaration()
                    || !func.accepts_args(argc)
                    || self.bound.contains(&(site, callee))
                {
                    continue;
                }
                trace!("bind indirect call {} to {}", site, func.name);
                constraints.extend(self.bind_call(site, callee));
                added += 1;
            }
        }
        for constraint in &constraints {
            self.add_constraint_to_graph(constraint)?;
        }
        self.stats.constraints += constraints.len();
        self.stats.indirect_bindings += added;
        Ok(added)
    }

    /// Functions whose object is in `pts(value)`.
    fn pointee_functions(&self, value: ValueId) -> Vec<FuncId> {
        let Some(node) = self.node_of(value) else {
            return Vec::new();
        };
        let node = self.graph.get_merge_target2(node);
        self.graph
            .pts(node)
            .iter()
            .filter_map(|obj| self.graph.node(obj).value)
            .filter_map(|v| self.program.as_function(v))
            .collect()
    }

    /// Re-runs the solver over every node. Returns whether any points-to
    /// set changed, which never happens on a solved graph.
    pub fn resolve(&mut self) -> bool {
        let before: Vec<usize> = (0..self.graph.node_count())
            .map(|n| self.graph.pts(n).len())
            .collect();
        for node in 0..self.graph.node_count() {
            if self.graph.node(node).is_rep() {
                self.push(node);
            }
        }
        self.solve();
        (0..before.len()).any(|n| self.graph.pts(n).len() != before[n])
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Objects `value` may point to, in node order. Values the analysis
    /// never saw point to nothing.
    pub fn points_to(&self, value: ValueId) -> Result<Vec<MemObject>> {
        if !self.solved {
            return Err(Error::NotSolved);
        }
        if value >= self.program.values.len() {
            return Err(Error::UnknownValue(value));
        }
        let Some(node) = self.node_of(value) else {
            return Ok(Vec::new());
        };
        let node = self.graph.get_merge_target2(node);
        Ok(self
            .graph
            .pts(node)
            .iter()
            .filter_map(|obj| match obj {
                UNIVERSAL_OBJ => Some(MemObject::Universal),
                NULL_OBJECT => Some(MemObject::Null),
                _ => self.graph.node(obj).value.map(MemObject::Value),
            })
            .collect())
    }

    /// The concrete objects of `points_to`.
    pub fn points_to_values(&self, value: ValueId) -> Result<Vec<ValueId>> {
        Ok(self
            .points_to(value)?
            .into_iter()
            .filter_map(|obj| match obj {
                MemObject::Value(v) => Some(v),
                _ => None,
            })
            .collect())
    }

    pub fn may_point_to_null(&self, value: ValueId) -> Result<bool> {
        Ok(self.points_to(value)?.contains(&MemObject::Null))
    }

    /// Functions `value` may point to.
    pub fn function_targets(&self, value: ValueId) -> Result<Vec<FuncId>> {
        Ok(self
            .points_to_values(value)?
            .into_iter()
            .filter_map(|v| self.program.as_function(v))
            .collect())
    }

    /// External functions absent from the effect tables.
    pub fn unsolved_functions(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.unsolved.iter().copied()
    }

    /// Call sites whose callee is not known syntactically.
    pub fn function_pointer_sites(&self) -> &[InstId] {
        &self.fp_sites
    }

    pub fn stats(&self) -> PtsStats {
        PtsStats {
            nodes: self.graph.node_count(),
            copy_edges: self.graph.edge_count(EdgeKind::Copy),
            load_edges: self.graph.edge_count(EdgeKind::Load),
            store_edges: self.graph.edge_count(EdgeKind::Store),
            merges: self.graph.merge_count(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ProgramBuilder, RetKind};
    use pretty_assertions::assert_eq;

    fn solve(program: &Program) -> PointerAnalysis<'_> {
        let mut pta = PointerAnalysis::new(program, true);
        pta.run().unwrap();
        pta
    }

    #[test_log::test]
    fn test_query_before_run_fails() {
        let program = ProgramBuilder::new().finish();
        let pta = PointerAnalysis::new(&program, true);
        assert!(matches!(pta.points_to(0), Err(Error::NotSolved)));
    }

    #[test_log::test]
    fn test_addr_of_and_copy() {
        let mut pb = ProgramBuilder::new();
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        let a = pb.alloca(bb);
        let b = pb.alloca(bb);
        let p = pb.cast(bb, CastKind::BitCast, a, true);
        let q = pb.phi(bb, &[p, b], true);
        let five = pb.const_int(5);
        pb.ret(bb, None);
        let program = pb.finish();
        let pta = solve(&program);

        assert_eq!(pta.points_to(a).unwrap(), vec![MemObject::Value(a)]);
        assert_eq!(pta.points_to(p).unwrap(), vec![MemObject::Value(a)]);
        assert_eq!(
            pta.points_to(q).unwrap(),
            vec![MemObject::Value(a), MemObject::Value(b)]
        );
        assert!(pta.points_to(five).unwrap().is_empty());
        assert!(matches!(pta.points_to(10_000), Err(Error::UnknownValue(_))));
    }

    #[test_log::test]
    fn test_load_store_through_memory() {
        let mut pb = ProgramBuilder::new();
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        let slot = pb.alloca(bb);
        let obj = pb.alloca(bb);
        pb.store(bb, obj, slot);
        let loaded = pb.load(bb, slot, true);
        let null = pb.null();
        let other = pb.alloca(bb);
        pb.store(bb, null, other);
        let maybe_null = pb.load(bb, other, true);
        pb.ret(bb, None);
        let program = pb.finish();
        let pta = solve(&program);

        assert_eq!(pta.points_to_values(loaded).unwrap(), vec![obj]);
        assert!(pta.may_point_to_null(maybe_null).unwrap());
        assert!(!pta.may_point_to_null(loaded).unwrap());
    }

    /// After solving: ADDR_OF holds, COPY is an inclusion, and another pass
    /// changes nothing.
    #[test_log::test]
    fn test_fixpoint_properties() {
        let mut pb = ProgramBuilder::new();
        let main = pb.define("main", RetKind::Void, &[]);
        let entry = pb.block(main);
        let looped = pb.block(main);
        let a = pb.alloca(entry);
        let b = pb.alloca(entry);
        pb.br(entry, looped);
        let x = pb.phi(looped, &[a, b], true);
        let y = pb.cast(looped, CastKind::BitCast, x, true);
        let z = pb.phi(looped, &[y, x], true);
        pb.store(looped, z, a);
        let w = pb.load(looped, b, true);
        pb.store(looped, w, b);
        pb.cond_br(looped, w, looped, looped);
        let program = pb.finish();

        let mut pta = PointerAnalysis::new(&program, true);
        pta.collect();
        let constraints = pta.constraints.clone();
        pta.init().unwrap();
        OfflineCycleDetector::new().run(&mut pta.graph);
        pta.solve();
        pta.solved = true;

        for c in &constraints {
            let dst = pta.graph.get_merge_target2(c.dst);
            let src = pta.graph.get_merge_target2(c.src);
            match c.kind {
                ConstraintKind::AddrOf => assert!(pta.graph.pts(dst).contains(c.src)),
                ConstraintKind::Copy => {
                    let mut sub = pta.graph.pts(src).clone();
                    sub.subtract(pta.graph.pts(dst));
                    assert!(sub.is_empty(), "{} violated", c);
                }
                _ => {}
            }
        }
        assert!(!pta.resolve());
        assert_eq!(pta.points_to(y).unwrap(), pta.points_to(x).unwrap());
        assert_eq!(pta.points_to_values(z).unwrap(), vec![a, b]);
    }

    #[test_log::test]
    fn test_external_fallback() {
        let mut pb = ProgramBuilder::new();
        let mystery = pb.declare("mystery", RetKind::Pointer, &[true]);
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        let buf = pb.alloca(bb);
        let mystery_fn = pb.func_value(mystery);
        let r = pb.call(bb, mystery_fn, &[buf]);
        pb.ret(bb, None);
        let program = pb.finish();
        let pta = solve(&program);

        assert!(pta.points_to(buf).unwrap().contains(&MemObject::Universal));
        assert_eq!(pta.points_to(r).unwrap(), vec![MemObject::Universal]);
        assert_eq!(pta.unsolved_functions().collect::<Vec<_>>(), vec![mystery]);
    }

    #[test_log::test]
    fn test_malloc_and_memcpy_models() {
        let mut pb = ProgramBuilder::new();
        let malloc = pb.declare("malloc", RetKind::Pointer, &[false]);
        let memcpy = pb.declare("llvm.memcpy.p0i8.p0i8.i64", RetKind::Void, &[true, true, false]);
        let realloc = pb.declare("realloc", RetKind::Pointer, &[true, false]);
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        let size = pb.const_int(8);
        let malloc_fn = pb.func_value(malloc);
        let heap = pb.call(bb, malloc_fn, &[size]);
        let src = pb.alloca(bb);
        let dst = pb.alloca(bb);
        pb.store(bb, heap, src);
        let memcpy_fn = pb.func_value(memcpy);
        pb.call(bb, memcpy_fn, &[dst, src, size]);
        let copied = pb.load(bb, dst, true);
        let null = pb.null();
        let realloc_fn = pb.func_value(realloc);
        let fresh = pb.call(bb, realloc_fn, &[null, size]);
        let grown = pb.call(bb, realloc_fn, &[heap, size]);
        pb.ret(bb, None);
        let program = pb.finish();
        let pta = solve(&program);

        assert_eq!(pta.points_to_values(heap).unwrap(), vec![heap]);
        assert_eq!(pta.points_to_values(copied).unwrap(), vec![heap]);
        assert!(pta.points_to(fresh).unwrap().is_empty());
        assert_eq!(pta.points_to_values(grown).unwrap(), vec![grown]);
        assert_eq!(pta.unsolved_functions().count(), 0);
    }

    #[test_log::test]
    fn test_interprocedural_binding() {
        let mut pb = ProgramBuilder::new();
        let id = pb.define("id", RetKind::Pointer, &[true]);
        let body = pb.block(id);
        let formal = pb.param(id, 0);
        pb.ret(body, Some(formal));
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        let a = pb.alloca(bb);
        let id_fn = pb.func_value(id);
        let r = pb.call(bb, id_fn, &[a]);
        pb.ret(bb, None);
        let program = pb.finish();
        let pta = solve(&program);

        assert_eq!(pta.points_to_values(formal).unwrap(), vec![a]);
        assert_eq!(pta.points_to_values(r).unwrap(), vec![a]);
    }

    #[test_log::test]
    fn test_indirect_call_refinement() {
        let mut pb = ProgramBuilder::new();
        let target = pb.define("target", RetKind::Pointer, &[true]);
        let body = pb.block(target);
        let formal = pb.param(target, 0);
        pb.ret(body, Some(formal));
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        let slot = pb.alloca(bb);
        let target_fn = pb.func_value(target);
        pb.store(bb, target_fn, slot);
        let fp = pb.load(bb, slot, true);
        let arg = pb.alloca(bb);
        let r = pb.call_with(bb, fp, &[arg], RetKind::Pointer);
        pb.ret(bb, None);
        let program = pb.finish();

        let pta = solve(&program);
        assert_eq!(pta.function_targets(fp).unwrap(), vec![target]);
        assert_eq!(pta.points_to_values(formal).unwrap(), vec![arg]);
        assert!(pta.points_to_values(r).unwrap().contains(&arg));
        assert_eq!(pta.stats().indirect_bindings, 1);

        let mut plain = PointerAnalysis::new(&program, false);
        plain.run().unwrap();
        assert!(plain.points_to_values(formal).unwrap().is_empty());
        assert_eq!(plain.function_pointer_sites().len(), 1);
    }

    #[test_log::test]
    fn test_indirect_call_refinement_with_varargs() {
        let mut pb = ProgramBuilder::new();
        let target = pb.define("target", RetKind::Void, &[true]);
        pb.set_vararg(target);
        let body = pb.block(target);
        let formal = pb.param(target, 0);
        pb.ret(body, None);
        let main = pb.define("main", RetKind::Void, &[]);
        let bb = pb.block(main);
        let slot = pb.alloca(bb);
        let target_fn = pb.func_value(target);
        pb.store(bb, target_fn, slot);
        let fp = pb.load(bb, slot, true);
        let first = pb.alloca(bb);
        let second = pb.alloca(bb);
        pb.call_with(bb, fp, &[first, second], RetKind::Void);
        pb.ret(bb, None);
        let program = pb.finish();

        let pta = solve(&program);
        assert_eq!(pta.points_to_values(formal).unwrap(), vec![first]);
        assert_eq!(pta.stats().indirect_bindings, 1);
    }

    #[test_log::test]
    fn test_globals() {
        let mut pb = ProgramBuilder::new();
        let main = pb.define("main", RetKind::Void, &[]);
        let main_fn = pb.func_value(main);
        let table = pb.global(
            "table",
            Some(Initializer::Aggregate(vec![
                Initializer::Scalar,
                Initializer::Pointer(main_fn),
            ])),
        );
        let ext = pb.global("environ", None);
        let s = pb.global(".str.1", Some(Initializer::Scalar));
        let bb = pb.block(main);
        let entry = pb.load(bb, table, true);
        pb.ret(bb, None);
        let program = pb.finish();
        let pta = solve(&program);

        assert_eq!(pta.points_to_values(table).unwrap(), vec![table]);
        assert_eq!(pta.function_targets(entry).unwrap(), vec![main]);
        assert_eq!(pta.points_to_values(ext).unwrap(), vec![ext]);
        assert_eq!(pta.points_to(s).unwrap(), vec![MemObject::Universal]);
    }
}
