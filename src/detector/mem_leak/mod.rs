//! Memory-leak detector.
//!
//! Every allocation call is a source and every release call a sink. A source
//! fully freed on every control path is fine; one freed on some paths is a
//! partial free; one never reaching a release is never freed. Allocations
//! inside small allocation wrappers are checked at the wrapper's call sites
//! instead.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::dependence::{DgGraph, EdgeAttr};
use crate::error::Result;
use crate::ir::{FuncId, Opcode};
use crate::slicer::{ProgramSlice, Reachability};

use super::Detector;

const MALLOC: &[&str] = &[
    "malloc",
    "valloc",
    "calloc",
    "strdup",
    "strndup",
    "alloc",
    "alloc_check",
    "alloc_clear",
    "jpeg_alloc_huff_table",
    "jpeg_alloc_quant_table",
    "lalloc",
    "lalloc_clear",
    "nhalloc",
    "oballoc",
    "permalloc",
    "png_create_info_struct",
    "png_create_write_struct",
    "safe_calloc",
    "safe_malloc",
    "safecalloc",
    "safemalloc",
    "safexcalloc",
    "safexmalloc",
    "savealloc",
    "xalloc",
    "xcalloc",
    "xmalloc",
    "SSL_CTX_new",
    "SSL_new",
];

const FREE: &[&str] = &[
    "cfree",
    "free",
    "free_all_mem",
    "freeaddrinfo",
    "gcry_mpi_release",
    "gcry_sexp_release",
    "globfree",
    "nhfree",
    "obstack_free",
    "safe_cfree",
    "safe_free",
    "safefree",
    "safexfree",
    "sm_free",
    "vim_free",
    "xfree",
    "SSL_CTX_free",
    "SSL_free",
];

/// Wrappers with this many blocks or more are treated as real code.
const WRAPPER_MAX_BLOCKS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemFunc {
    Alloc,
    Release,
}

static MEM_FUNCTIONS: Lazy<HashMap<&'static str, MemFunc>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for (names, kind) in [(MALLOC, MemFunc::Alloc), (FREE, MemFunc::Release)] {
        for name in names {
            m.insert(*name, kind);
        }
    }
    m
});

pub fn is_alloc_function(name: &str) -> bool {
    MEM_FUNCTIONS.get(name) == Some(&MemFunc::Alloc)
}

pub fn is_release_function(name: &str) -> bool {
    MEM_FUNCTIONS.get(name) == Some(&MemFunc::Release)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LeakKind {
    NeverFree,
    PartialFree,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct LeakReport {
    /// Source location of the allocation.
    pub location: String,
    pub kind: LeakKind,
}

pub struct MemLeak<'g, 'p> {
    dg: &'g DgGraph<'p>,
    sources: BTreeSet<NodeIndex>,
    sinks: BTreeSet<NodeIndex>,
    /// Outcome per allocation site, fully freed ones included.
    results: BTreeMap<String, Reachability>,
}

impl<'g, 'p> MemLeak<'g, 'p> {
    pub fn new(dg: &'g DgGraph<'p>) -> Self {
        Self {
            dg,
            sources: BTreeSet::new(),
            sinks: BTreeSet::new(),
            results: BTreeMap::new(),
        }
    }

    pub fn sources(&self) -> &BTreeSet<NodeIndex> {
        &self.sources
    }

    pub fn sinks(&self) -> &BTreeSet<NodeIndex> {
        &self.sinks
    }

    pub fn results(&self) -> &BTreeMap<String, Reachability> {
        &self.results
    }

    /// `(call site node, callee)` of every resolved call.
    fn call_nodes(&self) -> Vec<(NodeIndex, FuncId)> {
        let callgraph = self.dg.callgraph();
        let mut nodes = Vec::new();
        for site in callgraph.call_sites() {
            let Some(node) = self.dg.node_of(site) else {
                continue;
            };
            for (callee, _) in callgraph.callees_at(site) {
                nodes.push((node, callee));
            }
        }
        nodes
    }

    /// Small function with a single direct allocator call.
    fn is_alloc_wrapper(&self, func: FuncId) -> bool {
        let program = self.dg.program();
        if program.func(func).blocks.len() >= WRAPPER_MAX_BLOCKS {
            return false;
        }
        let Some(node) = self.dg.callgraph().node(func) else {
            return false;
        };
        let allocs = node
            .out_callsites
            .iter()
            .filter_map(|site| program.callee(*site))
            .filter(|callee| is_alloc_function(&program.func(*callee).name))
            .count();
        allocs == 1
    }

    /// Whether the allocation at `root` is returned by a wrapper. If so the
    /// wrapper's call sites are queued as new candidates.
    fn is_src_in_a_wrapper(&self, root: NodeIndex, candidates: &mut VecDeque<NodeIndex>) -> bool {
        let func = self.dg.node(root).func;
        if !self.is_alloc_wrapper(func) {
            return false;
        }
        let program = self.dg.program();

        let mut ret_node = None;
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }
            for (dst, edge) in self.dg.edges_out(node) {
                if !edge.is_dd() {
                    continue;
                }
                let dst_node = self.dg.node(dst);
                let inst = program.inst(dst_node.inst);
                if inst.opcode == Opcode::Ret {
                    if inst.operands.is_empty() {
                        return false;
                    }
                    ret_node = Some(dst);
                    break;
                }
                if dst_node.func == func {
                    queue.push_back(dst);
                }
            }
        }
        let Some(ret_node) = ret_node else {
            return false;
        };

        for (dst, edge) in self.dg.edges_out(ret_node) {
            if edge.attr.contains(EdgeAttr::DD | EdgeAttr::RET) {
                candidates.push_back(dst);
            }
        }
        debug!(
            "allocation wrapper {} lifted to its call sites",
            program.func(func).name
        );
        true
    }

    fn report(&mut self, source: NodeIndex, reach: Reachability) -> Option<LeakReport> {
        let location = self.dg.program().source_loc(self.dg.node(source).inst);
        self.results.insert(location.clone(), reach);
        let kind = match reach {
            Reachability::None => LeakKind::NeverFree,
            Reachability::Partial => LeakKind::PartialFree,
            Reachability::All => {
                debug!("memory allocation at {} is always freed", location);
                return None;
            }
        };
        match kind {
            LeakKind::NeverFree => warn!("NeverFree: memory allocation at {}", location),
            LeakKind::PartialFree => warn!("Partial Free: memory allocation at {}", location),
        }
        Some(LeakReport { location, kind })
    }
}

impl Detector for MemLeak<'_, '_> {
    type Report = LeakReport;

    fn collect_sources(&mut self) -> Result<()> {
        let program = self.dg.program();
        let mut seen = BTreeSet::new();
        for (node, callee) in self.call_nodes() {
            if !is_alloc_function(&program.func(callee).name) || !seen.insert(node) {
                continue;
            }
            debug!(
                "allocation {} at {}",
                program.func(callee).name,
                program.source_loc(self.dg.node(node).inst)
            );
            let mut candidates = VecDeque::from([node]);
            while let Some(candidate) = candidates.pop_front() {
                let mut lifted = VecDeque::new();
                if self.is_src_in_a_wrapper(candidate, &mut lifted) {
                    candidates.extend(lifted.into_iter().filter(|n| seen.insert(*n)));
                } else if self.sources.insert(candidate) {
                    debug!("source N{}", self.dg.node(candidate).id);
                }
            }
        }
        Ok(())
    }

    fn collect_sinks(&mut self) -> Result<()> {
        let program = self.dg.program();
        for (node, callee) in self.call_nodes() {
            if is_release_function(&program.func(callee).name) && self.sinks.insert(node) {
                debug!("sink N{}", self.dg.node(node).id);
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<Vec<LeakReport>> {
        self.collect_sources()?;
        self.collect_sinks()?;
        info!(
            "leak check: {} sources, {} sinks",
            self.sources.len(),
            self.sinks.len()
        );

        let mut reports = Vec::new();
        let sources: Vec<NodeIndex> = self.sources.iter().copied().collect();
        for source in sources {
            let mut slice = ProgramSlice::new(self.dg, source);
            let reach = slice.run_slicing(&self.sinks);
            reports.extend(self.report(source, reach));
        }
        reports.sort();
        reports.dedup();
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::Callgraph;
    use crate::config::Config;
    use crate::ir::{Program, ProgramBuilder, RetKind};
    use crate::pointer_analysis::PointerAnalysis;
    use pretty_assertions::assert_eq;

    fn build(program: &Program) -> DgGraph<'_> {
        let mut pta = PointerAnalysis::new(program, true);
        pta.run().unwrap();
        let mut callgraph = Callgraph::new();
        callgraph.analyze(program, &pta).unwrap();
        callgraph.link_graph(program, "main");
        DgGraph::build(pta, callgraph, &Config::default()).unwrap()
    }

    #[test]
    fn test_function_tables() {
        assert!(is_alloc_function("xmalloc"));
        assert!(is_alloc_function("SSL_new"));
        assert!(!is_alloc_function("free"));
        assert!(is_release_function("vim_free"));
        assert!(!is_release_function("realloc"));
    }

    #[test_log::test]
    fn test_never_and_partially_freed() {
        let mut b = ProgramBuilder::new();
        let malloc = b.declare("malloc", RetKind::Pointer, &[false]);
        let free = b.declare("free", RetKind::Void, &[true]);
        let rand = b.declare("rand", RetKind::Scalar, &[]);
        let main = b.define("main", RetKind::Void, &[]);
        let entry = b.block(main);
        let then_bb = b.block(main);
        let else_bb = b.block(main);

        let eight = b.const_int(8);
        let malloc_v = b.func_value(malloc);
        let kept = b.call(entry, malloc_v, &[eight]);
        b.located(kept, 3, "leak.c");
        let lost = b.call(entry, malloc_v, &[eight]);
        b.located(lost, 4, "leak.c");
        let rand_v = b.func_value(rand);
        let r = b.call(entry, rand_v, &[]);
        b.cond_br(entry, r, then_bb, else_bb);
        let free_v = b.func_value(free);
        b.call(then_bb, free_v, &[kept]);
        b.ret(then_bb, None);
        b.ret(else_bb, None);
        let program = b.finish();
        let dg = build(&program);

        let mut detector = MemLeak::new(&dg);
        let reports = detector.run().unwrap();
        assert_eq!(
            reports,
            vec![
                LeakReport {
                    location: "line: 3 file: leak.c".to_owned(),
                    kind: LeakKind::PartialFree,
                },
                LeakReport {
                    location: "line: 4 file: leak.c".to_owned(),
                    kind: LeakKind::NeverFree,
                },
            ]
        );
        assert_eq!(detector.sources().len(), 2);
        assert_eq!(detector.sinks().len(), 1);
    }

    #[test_log::test]
    fn test_wrapper_is_checked_at_call_site() {
        let mut b = ProgramBuilder::new();
        let malloc = b.declare("malloc", RetKind::Pointer, &[false]);
        let free = b.declare("free", RetKind::Void, &[true]);
        let my_alloc = b.define("my_alloc", RetKind::Pointer, &[]);
        let main = b.define("main", RetKind::Void, &[]);

        let wbb = b.block(my_alloc);
        let eight = b.const_int(8);
        let malloc_v = b.func_value(malloc);
        let m = b.call(wbb, malloc_v, &[eight]);
        b.located(m, 2, "wrap.c");
        b.ret(wbb, Some(m));

        let mbb = b.block(main);
        let my_alloc_v = b.func_value(my_alloc);
        let p = b.call(mbb, my_alloc_v, &[]);
        b.located(p, 10, "wrap.c");
        let free_v = b.func_value(free);
        b.call(mbb, free_v, &[p]);
        b.ret(mbb, None);
        let program = b.finish();
        let dg = build(&program);

        let mut detector = MemLeak::new(&dg);
        assert!(detector.run().unwrap().is_empty());
        let source = dg.node_of(program.as_inst(p).unwrap()).unwrap();
        assert_eq!(detector.sources(), &BTreeSet::from([source]));
        assert_eq!(
            detector.results().get("line: 10 file: wrap.c"),
            Some(&Reachability::All)
        );
    }

    #[test_log::test]
    fn test_wrapper_leaking_at_call_site() {
        let mut b = ProgramBuilder::new();
        let malloc = b.declare("malloc", RetKind::Pointer, &[false]);
        let my_alloc = b.define("my_alloc", RetKind::Pointer, &[]);
        let main = b.define("main", RetKind::Void, &[]);

        let wbb = b.block(my_alloc);
        let eight = b.const_int(8);
        let malloc_v = b.func_value(malloc);
        let m = b.call(wbb, malloc_v, &[eight]);
        b.ret(wbb, Some(m));

        let mbb = b.block(main);
        let my_alloc_v = b.func_value(my_alloc);
        let p = b.call(mbb, my_alloc_v, &[]);
        b.located(p, 7, "wrap.c");
        b.ret(mbb, None);
        let program = b.finish();
        let dg = build(&program);

        let reports = MemLeak::new(&dg).run().unwrap();
        assert_eq!(
            reports,
            vec![LeakReport {
                location: "line: 7 file: wrap.c".to_owned(),
                kind: LeakKind::NeverFree,
            }]
        );
    }
}
