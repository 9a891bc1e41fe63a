//! Error types
//!
//! Rejected edits leave the world untouched; the caller re-prompts the user.
//! Insufficient coins are not errors (paid actions return `Ok(false)`).

use thiserror::Error;

use crate::sim::{LineId, PortRef, SystemId};

/// Reasons a bend cannot be placed on a wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BendError {
    #[error("wire already carries the maximum of {max} bends")]
    TooManyBends { max: usize },
    #[error("bend middle must lie between its two feet along the wire axis")]
    MiddleOutsideSpan,
    #[error("bend must lie entirely before the first bend or after the last bend")]
    OverlapsExisting,
}

/// Rejected world edits
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorldError {
    #[error("unknown system {0:?}")]
    UnknownSystem(SystemId),
    #[error("duplicate system id {0:?}")]
    DuplicateSystem(SystemId),
    #[error("unknown line {0:?}")]
    UnknownLine(LineId),
    #[error("unknown port {0:?}")]
    UnknownPort(PortRef),
    #[error("port {0:?} has the wrong role for this end of a line")]
    PortRole(PortRef),
    #[error("port {0:?} is already wired")]
    PortOccupied(PortRef),
    #[error("a system cannot be wired to itself")]
    SelfLoop,
    #[error("system {0:?} cannot move that far from its original position")]
    MoveOutOfRange(SystemId),
    #[error("bend rejected: {0}")]
    Bend(#[from] BendError),
}

/// Level description problems
#[derive(Debug, Error)]
pub enum LevelError {
    #[error("failed to read level: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse level: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid level: {0}")]
    Invalid(#[from] WorldError),
}

/// Profile persistence problems
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("profile is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}
