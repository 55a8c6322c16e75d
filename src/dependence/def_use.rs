//! Per-instruction definitions and uses.
//!
//! `InstAnalyzer` first records what every instruction defines and uses
//! syntactically. `update_pd_info` later adds the possible definitions and
//! uses that follow from the points-to results: a load may read, and a store
//! may write, every object its pointer points to.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::trace;

use crate::callgraph::Callgraph;
use crate::error::Result;
use crate::ir::{FuncId, InstId, Instruction, Opcode, Program, ValueId};
use crate::pointer_analysis::{MemObject, PointerAnalysis};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefUse {
    defs: BTreeSet<ValueId>,
    ddef: Option<ValueId>,
    pdefs: BTreeSet<ValueId>,
    uses: BTreeSet<ValueId>,
    puses: BTreeSet<ValueId>,
}

impl DefUse {
    /// A definite definition. An instruction has at most one.
    fn set_def(&mut self, value: ValueId) {
        debug_assert!(self.ddef.is_none());
        self.defs.insert(value);
        self.ddef = Some(value);
    }

    fn set_pdef(&mut self, value: ValueId) {
        self.defs.insert(value);
        self.pdefs.insert(value);
    }

    fn set_use(&mut self, value: ValueId) {
        self.uses.insert(value);
    }

    fn set_puse(&mut self, value: ValueId) {
        self.uses.insert(value);
        self.puses.insert(value);
    }

    /// Definite and possible definitions.
    pub fn defs(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.defs.iter().copied()
    }

    pub fn ddef(&self) -> Option<ValueId> {
        self.ddef
    }

    pub fn is_pdef(&self, value: ValueId) -> bool {
        self.pdefs.contains(&value)
    }

    /// Definite and possible uses.
    pub fn uses(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.uses.iter().copied()
    }

    pub fn is_puse(&self, value: ValueId) -> bool {
        self.puses.contains(&value)
    }

    pub fn has_def_use(&self) -> bool {
        !self.defs.is_empty() || !self.uses.is_empty()
    }
}

/// A field of an aggregate, named by its base pointer and constant offset.
/// `offset == None` stands for the whole object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Element {
    pub base: ValueId,
    pub offset: Option<ValueId>,
}

/// The store that possibly defines an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementDef {
    pub def_val: ValueId,
    pub def_inst: InstId,
}

/// The base a gep addresses: a pointer loaded from memory is named by the
/// location it was loaded from.
pub(crate) fn element_base(program: &Program, value: ValueId) -> ValueId {
    match program.as_inst(value).map(|i| program.inst(i)) {
        Some(inst) if inst.opcode == Opcode::Load => inst.operands.first().copied().unwrap_or(value),
        _ => value,
    }
}

pub(crate) fn gep_element(program: &Program, inst: &Instruction) -> Option<Element> {
    let base = *inst.operands.first()?;
    let offset = *inst.operands.last()?;
    Some(Element {
        base: element_base(program, base),
        offset: Some(offset),
    })
}

pub struct InstAnalyzer {
    func: FuncId,
    params: Vec<ValueId>,
    /// Arguments of the call sites that call this function.
    actuals: BTreeSet<ValueId>,
    ret_inst: Option<InstId>,
    def_uses: BTreeMap<InstId, DefUse>,
    formal_stores: BTreeMap<ValueId, InstId>,
    elements: BTreeMap<Element, Option<ValueId>>,
    elem_ptrs: HashMap<ValueId, Element>,
    global_defs: BTreeMap<ValueId, BTreeSet<InstId>>,
    global_uses: BTreeMap<ValueId, BTreeSet<InstId>>,
    pdef_actuals: BTreeMap<Element, ElementDef>,
    kept_pts: usize,
    skipped_pts: usize,
}

impl InstAnalyzer {
    pub fn new(
        program: &Program,
        callgraph: &Callgraph,
        func: FuncId,
        in_callsites: &BTreeSet<InstId>,
    ) -> Self {
        let actuals = in_callsites
            .iter()
            .flat_map(|site| program.inst(*site).call_args().iter().copied())
            .collect();
        let mut analyzer = Self {
            func,
            params: program.func(func).params.clone(),
            actuals,
            ret_inst: None,
            def_uses: BTreeMap::new(),
            formal_stores: BTreeMap::new(),
            elements: BTreeMap::new(),
            elem_ptrs: HashMap::new(),
            global_defs: BTreeMap::new(),
            global_uses: BTreeMap::new(),
            pdef_actuals: BTreeMap::new(),
            kept_pts: 0,
            skipped_pts: 0,
        };
        analyzer.analyze(program, callgraph);
        analyzer
    }

    fn analyze(&mut self, program: &Program, callgraph: &Callgraph) {
        for inst in program.func_insts(self.func) {
            if program.is_debug_inst(inst) {
                continue;
            }
            self.set_formal_para(program.inst(inst));
            let mut du = DefUse::default();
            self.proc_inst(program, callgraph, program.inst(inst), &mut du);
            if du.has_def_use() {
                self.def_uses.insert(inst, du);
            }
        }
    }

    /// Remembers the store that spills each formal parameter.
    fn set_formal_para(&mut self, inst: &Instruction) {
        if self.formal_stores.len() == self.params.len() || inst.opcode != Opcode::Store {
            return;
        }
        if let Some(value) = inst.operands.first() {
            if self.params.contains(value) {
                self.formal_stores.insert(*value, inst.id);
            }
        }
    }

    fn proc_inst(
        &mut self,
        program: &Program,
        callgraph: &Callgraph,
        inst: &Instruction,
        du: &mut DefUse,
    ) {
        let ops = &inst.operands;
        match inst.opcode {
            Opcode::Call => {
                let callee = program
                    .callee(inst.id)
                    .or_else(|| callgraph.callees_at(inst.id).first().map(|(f, _)| *f));
                let Some(callee) = callee else {
                    return;
                };
                if !program.func(callee).returns_void {
                    du.set_def(inst.value);
                }
                for arg in inst.call_args() {
                    du.set_use(*arg);
                }
            }
            Opcode::Ret => {
                self.ret_inst = Some(inst.id);
                if let Some(value) = ops.first() {
                    du.set_use(*value);
                }
            }
            Opcode::Load => {
                let Some(&ptr) = ops.first() else {
                    return;
                };
                du.set_use(ptr);
                du.set_def(inst.value);
                if program.is_global_value(ptr) {
                    self.global_uses.entry(ptr).or_default().insert(inst.id);
                }
            }
            Opcode::Store => {
                let (Some(&value), Some(&ptr)) = (ops.first(), ops.get(1)) else {
                    return;
                };
                du.set_def(ptr);
                du.set_use(value);
                if program.is_global_value(ptr) {
                    self.global_defs.entry(ptr).or_default().insert(inst.id);
                }
                if let Some(elem) = self.elem_ptrs.get(&ptr) {
                    self.elements.insert(*elem, Some(ptr));
                }
            }
            Opcode::GetElementPtr => {
                let (Some(&base), Some(elem)) = (ops.first(), gep_element(program, inst)) else {
                    return;
                };
                let used = match self.elements.get(&elem) {
                    None => {
                        self.elements.insert(elem, None);
                        self.elem_ptrs.insert(inst.value, elem);
                        base
                    }
                    Some(def_val) => def_val.unwrap_or(base),
                };
                du.set_use(used);
                if used != base {
                    du.set_use(base);
                }
                du.set_def(inst.value);
            }
            Opcode::Phi => {
                du.set_def(inst.value);
                for op in ops {
                    du.set_use(*op);
                }
            }
            Opcode::Cast(_) => {
                if let Some(value) = ops.first() {
                    du.set_use(*value);
                }
                du.set_def(inst.value);
            }
            Opcode::Select => {
                for value in ops.iter().skip(1).take(2) {
                    du.set_use(*value);
                }
                du.set_def(inst.value);
            }
            Opcode::VaArg => {
                du.set_use(program.func(self.func).value);
                du.set_def(inst.value);
            }
            Opcode::ICmp | Opcode::BinaryOp => {
                du.set_def(inst.value);
                for value in ops.iter().take(2) {
                    du.set_use(*value);
                }
            }
            Opcode::Shift => {
                du.set_def(inst.value);
                if let Some(value) = ops.first() {
                    du.set_use(*value);
                }
            }
            Opcode::Br => {
                if let Some(cond) = ops.first() {
                    du.set_use(*cond);
                }
            }
            Opcode::Alloca | Opcode::ExtractValue | Opcode::Other => {}
        }
    }

    /// Pointees of `ptr` that pass the value-set filter.
    fn filtered_pointees(
        &mut self,
        program: &Program,
        pta: &PointerAnalysis<'_>,
        ptr: ValueId,
        value_set: Option<&BTreeSet<ValueId>>,
    ) -> Result<Vec<ValueId>> {
        let mut kept = Vec::new();
        for obj in pta.points_to(ptr)? {
            let MemObject::Value(obj) = obj else {
                continue;
            };
            if obj == ptr {
                continue;
            }
            if let Some(set) = value_set {
                if !set.contains(&obj) && !program.is_global_value(obj) {
                    self.skipped_pts += 1;
                    continue;
                }
            }
            self.kept_pts += 1;
            kept.push(obj);
        }
        Ok(kept)
    }

    /// Adds possible definitions and uses through pointers. With a value
    /// set, only pointees defined earlier on the current call path (or
    /// globals) are kept, and the instructions of this function join the set.
    pub fn update_pd_info(
        &mut self,
        program: &Program,
        pta: &PointerAnalysis<'_>,
        mut value_set: Option<&mut BTreeSet<ValueId>>,
    ) -> Result<()> {
        let insts: Vec<InstId> = program.func_insts(self.func).collect();
        for id in insts {
            if program.is_debug_inst(id) {
                continue;
            }
            let inst = program.inst(id);
            match inst.opcode {
                Opcode::Load => {
                    if let Some(&ptr) = inst.operands.first() {
                        let mut puses = self.filtered_pointees(program, pta, ptr, value_set.as_deref())?;
                        if !self.actuals.contains(&ptr) {
                            puses.extend(
                                self.elements
                                    .iter()
                                    .filter(|(elem, _)| elem.base == ptr)
                                    .filter_map(|(_, def_val)| *def_val),
                            );
                        }
                        if let Some(du) = self.def_uses.get_mut(&id) {
                            for value in puses {
                                du.set_puse(value);
                            }
                        }
                    }
                }
                Opcode::Store => {
                    if let Some(&ptr) = inst.operands.get(1) {
                        let pdefs = self.filtered_pointees(program, pta, ptr, value_set.as_deref())?;
                        for value in pdefs {
                            if let Some(du) = self.def_uses.get_mut(&id) {
                                du.set_pdef(value);
                            }
                            if self.actuals.contains(&value) {
                                self.record_actual_def(id, ptr, value);
                            }
                        }
                    }
                }
                Opcode::Br | Opcode::Ret => continue,
                _ => {}
            }
            if let Some(set) = value_set.as_deref_mut() {
                set.insert(inst.value);
                if inst.opcode == Opcode::Store {
                    set.extend(inst.operands.get(1));
                }
            }
        }
        trace!(
            "function {}: kept {} pointees, skipped {}",
            self.func,
            self.kept_pts,
            self.skipped_pts
        );
        Ok(())
    }

    /// A store through `ptr` may write the caller's `actual`.
    fn record_actual_def(&mut self, inst: InstId, ptr: ValueId, actual: ValueId) {
        let offset = self.elem_ptrs.get(&ptr).and_then(|elem| elem.offset);
        self.pdef_actuals
            .entry(Element {
                base: actual,
                offset,
            })
            .or_insert(ElementDef {
                def_val: ptr,
                def_inst: inst,
            });
    }

    pub fn func(&self) -> FuncId {
        self.func
    }

    pub fn def_use(&self, inst: InstId) -> Option<&DefUse> {
        self.def_uses.get(&inst)
    }

    pub fn ret_inst(&self) -> Option<InstId> {
        self.ret_inst
    }

    /// The store that spills `formal`.
    pub fn formal_store(&self, formal: ValueId) -> Option<InstId> {
        self.formal_stores.get(&formal).copied()
    }

    /// Caller objects possibly defined by this function, keyed by element.
    pub fn pdef_actuals(&self) -> &BTreeMap<Element, ElementDef> {
        &self.pdef_actuals
    }

    pub fn global_defs(&self) -> &BTreeMap<ValueId, BTreeSet<InstId>> {
        &self.global_defs
    }

    pub fn global_uses(&self) -> &BTreeMap<ValueId, BTreeSet<InstId>> {
        &self.global_uses
    }

    /// Pointees kept and skipped by the value-set filter so far.
    pub fn pts_filter_counts(&self) -> (usize, usize) {
        (self.kept_pts, self.skipped_pts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Initializer, ProgramBuilder, RetKind};
    use pretty_assertions::assert_eq;

    fn solved(program: &Program) -> (PointerAnalysis<'_>, Callgraph) {
        let mut pta = PointerAnalysis::new(program, true);
        pta.run().unwrap();
        let mut callgraph = Callgraph::new();
        callgraph.analyze(program, &pta).unwrap();
        callgraph.link_graph(program, "main");
        (pta, callgraph)
    }

    #[test]
    fn test_syntactic_def_use() {
        let mut b = ProgramBuilder::new();
        let malloc = b.declare("malloc", RetKind::Pointer, &[false]);
        let free = b.declare("free", RetKind::Void, &[true]);
        let main = b.define("main", RetKind::Scalar, &[]);
        let bb = b.block(main);
        let eight = b.const_int(8);
        let malloc_v = b.func_value(malloc);
        let free_v = b.func_value(free);
        let p = b.call(bb, malloc_v, &[eight]);
        let slot = b.alloca(bb);
        let st = b.store(bb, p, slot);
        let q = b.load(bb, slot, true);
        let fr = b.call(bb, free_v, &[q]);
        let zero = b.const_int(0);
        let ret = b.ret(bb, Some(zero));
        let program = b.finish();
        let (_pta, callgraph) = solved(&program);

        let analyzer = InstAnalyzer::new(&program, &callgraph, main, &BTreeSet::new());
        let inst = |v: ValueId| program.as_inst(v).unwrap();

        let du = analyzer.def_use(inst(p)).unwrap();
        assert_eq!(du.ddef(), Some(p));
        assert_eq!(du.uses().collect::<Vec<_>>(), vec![eight]);

        assert!(analyzer.def_use(inst(slot)).is_none());

        let du = analyzer.def_use(inst(st)).unwrap();
        assert_eq!(du.ddef(), Some(slot));
        assert_eq!(du.uses().collect::<Vec<_>>(), vec![p]);

        let du = analyzer.def_use(inst(q)).unwrap();
        assert_eq!(du.ddef(), Some(q));
        assert_eq!(du.uses().collect::<Vec<_>>(), vec![slot]);

        let du = analyzer.def_use(inst(fr)).unwrap();
        assert_eq!(du.ddef(), None);
        assert_eq!(du.uses().collect::<Vec<_>>(), vec![q]);

        assert_eq!(analyzer.ret_inst(), Some(inst(ret)));
    }

    #[test]
    fn test_gep_reuses_stored_element() {
        let mut b = ProgramBuilder::new();
        let main = b.define("main", RetKind::Void, &[]);
        let bb = b.block(main);
        let obj = b.alloca(bb);
        let one = b.const_int(1);
        let g1 = b.gep(bb, obj, one);
        let v = b.const_int(7);
        b.store(bb, v, g1);
        let g2 = b.gep(bb, obj, one);
        b.ret(bb, None);
        let program = b.finish();
        let (_pta, callgraph) = solved(&program);

        let analyzer = InstAnalyzer::new(&program, &callgraph, main, &BTreeSet::new());
        let g2_du = analyzer.def_use(program.as_inst(g2).unwrap()).unwrap();
        assert_eq!(g2_du.uses().collect::<Vec<_>>(), {
            let mut uses = vec![obj, g1];
            uses.sort_unstable();
            uses
        });
    }

    #[test]
    fn test_possible_defs_and_uses() {
        let mut b = ProgramBuilder::new();
        let g = b.global("g", Some(Initializer::Scalar));
        let main = b.define("main", RetKind::Void, &[]);
        let bb = b.block(main);
        let local = b.alloca(bb);
        let pp = b.alloca(bb);
        b.store(bb, local, pp);
        let p = b.load(bb, pp, true);
        let v = b.const_int(3);
        let st = b.store(bb, v, p);
        let ld = b.load(bb, p, false);
        b.store(bb, v, g);
        b.ret(bb, None);
        let program = b.finish();
        let (pta, callgraph) = solved(&program);

        let mut analyzer = InstAnalyzer::new(&program, &callgraph, main, &BTreeSet::new());
        analyzer.update_pd_info(&program, &pta, None).unwrap();

        let st_du = analyzer.def_use(program.as_inst(st).unwrap()).unwrap();
        assert!(st_du.is_pdef(local));
        assert_eq!(st_du.ddef(), Some(p));
        let ld_du = analyzer.def_use(program.as_inst(ld).unwrap()).unwrap();
        assert!(ld_du.is_puse(local));
        assert!(!ld_du.is_puse(p));

        assert_eq!(analyzer.global_defs().keys().copied().collect::<Vec<_>>(), vec![g]);
    }

    #[test]
    fn test_value_set_filters_pointees() {
        let mut b = ProgramBuilder::new();
        let reader = b.define("reader", RetKind::Scalar, &[true]);
        let main = b.define("main", RetKind::Void, &[]);

        let rbb = b.block(reader);
        let q = b.param(reader, 0);
        let ld = b.load(rbb, q, false);
        b.ret(rbb, Some(ld));

        let mbb = b.block(main);
        let obj = b.alloca(mbb);
        let reader_v = b.func_value(reader);
        b.call(mbb, reader_v, &[obj]);
        b.ret(mbb, None);
        let program = b.finish();
        let (pta, callgraph) = solved(&program);
        let ld_inst = program.as_inst(ld).unwrap();

        // a path on which `obj` was never defined
        let mut analyzer = InstAnalyzer::new(&program, &callgraph, reader, &BTreeSet::new());
        let mut value_set = BTreeSet::new();
        analyzer
            .update_pd_info(&program, &pta, Some(&mut value_set))
            .unwrap();
        assert!(!analyzer.def_use(ld_inst).unwrap().is_puse(obj));
        assert_eq!(analyzer.pts_filter_counts(), (0, 1));
        assert!(value_set.contains(&ld));

        // a path through main, which allocated it
        let mut analyzer = InstAnalyzer::new(&program, &callgraph, reader, &BTreeSet::new());
        let mut value_set: BTreeSet<ValueId> = [obj].into_iter().collect();
        analyzer
            .update_pd_info(&program, &pta, Some(&mut value_set))
            .unwrap();
        assert!(analyzer.def_use(ld_inst).unwrap().is_puse(obj));
        assert_eq!(analyzer.pts_filter_counts(), (1, 0));
    }

    #[test]
    fn test_formal_para_and_actual_defs() {
        let mut b = ProgramBuilder::new();
        let init = b.define("init", RetKind::Void, &[true]);
        let main = b.define("main", RetKind::Void, &[]);

        let ibb = b.block(init);
        let arg = b.param(init, 0);
        let slot = b.alloca(ibb);
        let spill = b.store(ibb, arg, slot);
        let p = b.load(ibb, slot, true);
        let v = b.const_int(1);
        let st = b.store(ibb, v, p);
        b.ret(ibb, None);

        let mbb = b.block(main);
        let obj = b.alloca(mbb);
        let init_v = b.func_value(init);
        let site = b.call(mbb, init_v, &[obj]);
        b.ret(mbb, None);
        let program = b.finish();
        let (pta, callgraph) = solved(&program);

        let sites: BTreeSet<InstId> = [program.as_inst(site).unwrap()].into_iter().collect();
        let mut analyzer = InstAnalyzer::new(&program, &callgraph, init, &sites);
        assert_eq!(analyzer.formal_store(arg), program.as_inst(spill));
        analyzer.update_pd_info(&program, &pta, None).unwrap();

        let expected = ElementDef {
            def_val: p,
            def_inst: program.as_inst(st).unwrap(),
        };
        assert_eq!(
            analyzer.pdef_actuals().get(&Element {
                base: obj,
                offset: None
            }),
            Some(&expected)
        );
    }
}
