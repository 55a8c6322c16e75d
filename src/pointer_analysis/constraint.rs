use std::fmt;

use crate::error::{Error, Result};

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstraintKind {
    /// `dst = &src`
    AddrOf,
    /// `dst = src`
    Copy,
    /// `dst = *src`
    Load,
    /// `*dst = src`
    Store,
}

/// One inclusion rule over constraint-graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub dst: NodeId,
    pub src: NodeId,
    pub offset: usize,
}

impl Constraint {
    fn new(kind: ConstraintKind, dst: NodeId, src: NodeId) -> Self {
        Self {
            kind,
            dst,
            src,
            offset: 0,
        }
    }

    pub fn addr_of(dst: NodeId, src: NodeId) -> Self {
        Self::new(ConstraintKind::AddrOf, dst, src)
    }

    pub fn copy(dst: NodeId, src: NodeId) -> Self {
        Self::new(ConstraintKind::Copy, dst, src)
    }

    /// `dst = *ptr`
    pub fn load(dst: NodeId, ptr: NodeId) -> Self {
        Self::new(ConstraintKind::Load, dst, ptr)
    }

    /// `*ptr = src`
    pub fn store(ptr: NodeId, src: NodeId) -> Self {
        Self::new(ConstraintKind::Store, ptr, src)
    }

    pub fn with_offset(self, offset: usize) -> Result<Self> {
        let constraint = Self { offset, ..self };
        constraint.check()?;
        Ok(constraint)
    }

    /// An address-of never carries a field offset.
    pub fn check(&self) -> Result<()> {
        if self.kind == ConstraintKind::AddrOf && self.offset != 0 {
            return Err(Error::AddrOfWithOffset {
                dst: self.dst,
                src: self.src,
                offset: self.offset,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConstraintKind::AddrOf => write!(f, "n{} = &n{}", self.dst, self.src),
            ConstraintKind::Copy => write!(f, "n{} = n{}", self.dst, self.src),
            ConstraintKind::Load => write!(f, "n{} = *n{}", self.dst, self.src),
            ConstraintKind::Store => write!(f, "*n{} = n{}", self.dst, self.src),
        }?;
        if self.offset != 0 {
            write!(f, " (+{})", self.offset)?;
        }
        Ok(())
    }
}
