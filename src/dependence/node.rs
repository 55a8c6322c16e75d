use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::Serialize;

use crate::ir::{FuncId, InstId, ValueId};

/// Edge tags of the dependence graph. One edge may carry several, e.g. a
/// call edge is `CFG | CALL`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct EdgeAttr(u8);

impl EdgeAttr {
    pub const CFG: EdgeAttr = EdgeAttr(1);
    pub const DD: EdgeAttr = EdgeAttr(2);
    pub const CALL: EdgeAttr = EdgeAttr(4);
    pub const RET: EdgeAttr = EdgeAttr(8);
    pub const CFG_DUMMY: EdgeAttr = EdgeAttr(16);

    pub const fn empty() -> Self {
        EdgeAttr(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[inline]
    pub fn contains(self, other: EdgeAttr) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set.
    #[inline]
    pub fn intersects(self, other: EdgeAttr) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EdgeAttr {
    type Output = EdgeAttr;

    fn bitor(self, rhs: EdgeAttr) -> EdgeAttr {
        EdgeAttr(self.0 | rhs.0)
    }
}

impl BitOrAssign for EdgeAttr {
    fn bitor_assign(&mut self, rhs: EdgeAttr) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EdgeAttr {
    type Output = EdgeAttr;

    fn bitand(self, rhs: EdgeAttr) -> EdgeAttr {
        EdgeAttr(self.0 & rhs.0)
    }
}

impl fmt::Debug for EdgeAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EdgeAttr, &str); 5] = [
            (EdgeAttr::CFG, "CFG"),
            (EdgeAttr::DD, "DD"),
            (EdgeAttr::CALL, "CALL"),
            (EdgeAttr::RET, "RET"),
            (EdgeAttr::CFG_DUMMY, "CFG_DUMMY"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(attr, _)| self.contains(*attr))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "EdgeAttr(empty)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// One instruction of a reachable function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DgNode {
    /// 1-based, in creation order.
    pub id: usize,
    pub inst: InstId,
    pub func: FuncId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DgEdge {
    pub attr: EdgeAttr,
    /// The value a data dependence carries.
    pub value: Option<ValueId>,
}

impl DgEdge {
    pub fn new(attr: EdgeAttr, value: Option<ValueId>) -> Self {
        Self { attr, value }
    }

    #[inline]
    pub fn is_cfg(&self) -> bool {
        self.attr.contains(EdgeAttr::CFG)
    }

    #[inline]
    pub fn is_dd(&self) -> bool {
        self.attr.contains(EdgeAttr::DD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_attr_bits() {
        assert_eq!(EdgeAttr::CFG.bits(), 1);
        assert_eq!(EdgeAttr::DD.bits(), 2);
        assert_eq!(EdgeAttr::CALL.bits(), 4);
        assert_eq!(EdgeAttr::RET.bits(), 8);
        assert_eq!(EdgeAttr::CFG_DUMMY.bits(), 16);

        let call = EdgeAttr::CFG | EdgeAttr::CALL;
        assert!(call.contains(EdgeAttr::CFG));
        assert!(!call.contains(EdgeAttr::CFG | EdgeAttr::RET));
        assert!(call.intersects(EdgeAttr::RET | EdgeAttr::CALL));
        assert!((call & EdgeAttr::DD).is_empty());
        assert_eq!(format!("{:?}", call), "CFG|CALL");
    }
}
