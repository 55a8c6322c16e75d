//! Client analyses built on the dependence graph and the points-to results.

pub mod mem_leak;
pub mod null_pointer;

pub use mem_leak::{LeakKind, LeakReport, MemLeak};
pub use null_pointer::{NullDerefKind, NullDerefReport, NullPointer};

use crate::error::Result;

/// A checker that pairs sources with sinks and reports what it finds.
pub trait Detector {
    type Report;

    fn collect_sources(&mut self) -> Result<()>;

    fn collect_sinks(&mut self) -> Result<()>;

    /// Collects sources and sinks, then checks every source.
    fn run(&mut self) -> Result<Vec<Self::Report>>;
}
