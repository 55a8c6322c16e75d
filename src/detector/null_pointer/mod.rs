//! Null-pointer dereference checker.
//!
//! Works on the points-to results alone. Every function with a body is
//! scanned, reachable or not.

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::Result;
use crate::ir::{InstId, Opcode};
use crate::pointer_analysis::PointerAnalysis;

use super::Detector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum NullDerefKind {
    /// A loaded pointer may be null.
    Load,
    /// A store may write through a null pointer.
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct NullDerefReport {
    pub location: String,
    pub inst: InstId,
    pub kind: NullDerefKind,
}

pub struct NullPointer<'a, 'p> {
    pta: &'a PointerAnalysis<'p>,
    /// Loads and stores to check, in program order.
    sources: Vec<(InstId, NullDerefKind)>,
    /// The ones whose pointer may be null.
    sinks: Vec<(InstId, NullDerefKind)>,
}

impl<'a, 'p> NullPointer<'a, 'p> {
    pub fn new(pta: &'a PointerAnalysis<'p>) -> Self {
        Self {
            pta,
            sources: Vec::new(),
            sinks: Vec::new(),
        }
    }

    pub fn checked(&self) -> usize {
        self.sources.len()
    }
}

impl Detector for NullPointer<'_, '_> {
    type Report = NullDerefReport;

    fn collect_sources(&mut self) -> Result<()> {
        let program = self.pta.program();
        for func in &program.functions {
            for id in program.func_insts(func.id) {
                let inst = program.inst(id);
                match inst.opcode {
                    Opcode::Load if program.is_pointer(inst.value) => {
                        self.sources.push((id, NullDerefKind::Load));
                    }
                    Opcode::Store => {
                        let stores_pointer = inst
                            .operands
                            .first()
                            .map_or(true, |value| program.is_pointer(*value));
                        if !stores_pointer {
                            self.sources.push((id, NullDerefKind::Store));
                        }
                    }
                    _ => {}
                }
            }
        }
        debug!("{} dereferences to check", self.sources.len());
        Ok(())
    }

    fn collect_sinks(&mut self) -> Result<()> {
        let program = self.pta.program();
        for &(id, kind) in &self.sources {
            let inst = program.inst(id);
            let checked = match kind {
                NullDerefKind::Load => Some(inst.value),
                NullDerefKind::Store => inst.operands.get(1).copied(),
            };
            let Some(checked) = checked else {
                continue;
            };
            if self.pta.may_point_to_null(checked)? {
                self.sinks.push((id, kind));
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<Vec<NullDerefReport>> {
        self.collect_sources()?;
        self.collect_sinks()?;
        let program = self.pta.program();
        let reports: Vec<NullDerefReport> = self
            .sinks
            .iter()
            .map(|&(inst, kind)| {
                let location = program.source_loc(inst);
                match kind {
                    NullDerefKind::Load => warn!("reading from a null pointer at {}", location),
                    NullDerefKind::Store => warn!("writing through a null pointer at {}", location),
                }
                NullDerefReport {
                    location,
                    inst,
                    kind,
                }
            })
            .collect();
        info!(
            "null check: {} dereferences, {} may be null",
            self.sources.len(),
            reports.len()
        );
        Ok(reports)
    }
}
