use std::fmt::Debug;
use std::hash::Hash;

/// Graph capability the generic SCC engine is written against: node
/// iteration and child iteration.
pub trait GraphTraits {
    type Node: Copy + Eq + Hash + Ord + Debug;

    fn node_ids(&self) -> Vec<Self::Node>;
    fn children(&self, node: Self::Node) -> Vec<Self::Node>;
}
