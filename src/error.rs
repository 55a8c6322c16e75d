//! Error type shared by every analysis phase.

use thiserror::Error;

use crate::ir::ValueId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed program: {0}")]
    MalformedProgram(String),

    #[error("ADDR_OF constraint {dst} <- &{src} carries nonzero offset {offset}")]
    AddrOfWithOffset { dst: usize, src: usize, offset: usize },

    #[error("points-to query issued before the solver ran")]
    NotSolved,

    #[error("value {0} is not part of the program")]
    UnknownValue(ValueId),

    #[error("invalid value `{value}` for {key}")]
    InvalidConfig { key: &'static str, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
