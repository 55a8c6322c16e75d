//! Whole-program memory-safety analysis.
//!
//! The pipeline runs an inclusion-based points-to analysis, builds a call
//! graph on its results, and then a dependence graph (control flow plus data
//! dependences) over every function reachable from the entry. Detectors
//! slice that graph to find leaks, or query the points-to sets directly for
//! null dereferences.

pub mod callgraph;
pub mod config;
pub mod dependence;
pub mod detector;
pub mod error;
pub mod ir;
pub mod pointer_analysis;
pub mod slicer;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};

use log::info;

use crate::callgraph::Callgraph;
use crate::dependence::DgGraph;
use crate::ir::Program;
use crate::pointer_analysis::PointerAnalysis;

/// Points-to analysis followed by the call graph.
pub fn analyze_pointers<'p>(
    program: &'p Program,
    config: &Config,
) -> Result<(PointerAnalysis<'p>, Callgraph)> {
    program.validate()?;
    let mut pta = PointerAnalysis::new(program, config.refine_indirect_calls);
    pta.run()?;
    let mut callgraph = Callgraph::new();
    callgraph.analyze(program, &pta)?;
    callgraph.link_graph(program, &config.entry_function);
    Ok((pta, callgraph))
}

/// Runs every phase and returns the dependence graph.
pub fn analyze<'p>(program: &'p Program, config: &Config) -> Result<DgGraph<'p>> {
    info!(
        "analyzing {} functions, {} instructions",
        program.functions.len(),
        program.insts.len()
    );
    let (pta, callgraph) = analyze_pointers(program, config)?;
    DgGraph::build(pta, callgraph, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Detector, LeakKind, MemLeak};
    use crate::ir::{ProgramBuilder, RetKind};
    use pretty_assertions::assert_eq;

    #[test_log::test]
    fn test_pipeline_from_json() {
        let mut b = ProgramBuilder::new();
        let malloc = b.declare("malloc", RetKind::Pointer, &[false]);
        let main = b.define("main", RetKind::Void, &[]);
        let bb = b.block(main);
        let eight = b.const_int(8);
        let malloc_v = b.func_value(malloc);
        let p = b.call(bb, malloc_v, &[eight]);
        b.located(p, 1, "a.c");
        b.ret(bb, None);
        let text = b.finish().to_json().unwrap();

        let program = Program::from_json(&text).unwrap();
        let dg = analyze(&program, &Config::default()).unwrap();
        assert_eq!(dg.node_count(), 2);
        let reports = MemLeak::new(&dg).run().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, LeakKind::NeverFree);
        assert_eq!(reports[0].location, "line: 1 file: a.c");
    }

    #[test_log::test]
    fn test_missing_entry_reaches_nothing() {
        let mut b = ProgramBuilder::new();
        let start = b.define("start", RetKind::Void, &[]);
        let bb = b.block(start);
        b.ret(bb, None);
        let program = b.finish();

        let dg = analyze(&program, &Config::default()).unwrap();
        assert_eq!(dg.node_count(), 0);

        let config = Config {
            entry_function: "start".to_owned(),
            ..Config::default()
        };
        let dg = analyze(&program, &config).unwrap();
        assert_eq!(dg.node_count(), 1);
    }
}
