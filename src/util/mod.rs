mod bitset;
mod graph;
pub mod scc;

pub use bitset::SparseBitSet;
pub use graph::GraphTraits;
pub use scc::{SccDetector, SccHooks};
