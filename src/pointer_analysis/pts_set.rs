use crate::util::SparseBitSet;

use super::constraint::NodeId;

/// Points-to set of a constraint node: object node ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtsSet {
    bits: SparseBitSet,
}

impl PtsSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn insert(&mut self, node: NodeId) -> bool {
        self.bits.insert(node)
    }

    #[inline]
    pub fn contains(&self, node: NodeId) -> bool {
        self.bits.contains(node)
    }

    #[inline]
    pub fn union_with(&mut self, other: &PtsSet) -> bool {
        self.bits.union_with(&other.bits)
    }

    pub fn intersects(&self, other: &PtsSet) -> bool {
        self.bits.intersects(&other.bits)
    }

    pub fn subtract(&mut self, other: &PtsSet) -> bool {
        self.bits.subtract(&other.bits)
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.bits.iter()
    }
}

impl FromIterator<NodeId> for PtsSet {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        Self {
            bits: iter.into_iter().collect(),
        }
    }
}
