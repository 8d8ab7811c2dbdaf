use std::fmt;

use chrono::NaiveDate;

use crate::housekeeping::TransitionError;
use crate::model::{BookingId, BookingStatus, RoomId, RoomTypeId};

/// A date whose requested allotment is below what is already sold or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllotmentViolation {
    pub date: NaiveDate,
    pub requested: i64,
    pub committed: u32,
}

impl fmt::Display for AllotmentViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: allotment {} is below {} booked+tentative units",
            self.date, self.requested, self.committed
        )
    }
}

/// How a caller should surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before touching the ledger.
    Validation,
    /// Well-formed request the current state does not allow.
    Conflict,
    /// Persistence failure or broken internal invariant.
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("allotment update rejected: {}", join(.0))]
    AllotmentBelowCommitted(Vec<AllotmentViolation>),
    #[error("no availability for room type {room_type_id} on {date}")]
    NoAvailability {
        room_type_id: RoomTypeId,
        date: NaiveDate,
    },
    #[error("cannot {action}: booking is {from}")]
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
    },
    #[error(transparent)]
    Housekeeping(#[from] TransitionError),
    #[error("room {room_id} unavailable: {reason}")]
    RoomUnavailable { room_id: RoomId, reason: String },
    #[error("not authorized to modify booking {0}")]
    Unauthorized(BookingId),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("ledger inconsistency: {0}")]
    Inconsistent(String),
    #[error("WAL error: {0}")]
    WalError(String),
}

fn join(violations: &[AllotmentViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Validation(_)
            | EngineError::AllotmentBelowCommitted(_)
            | EngineError::LimitExceeded(_) => ErrorClass::Validation,
            EngineError::NoAvailability { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::Housekeeping(_)
            | EngineError::RoomUnavailable { .. }
            | EngineError::Unauthorized(_)
            | EngineError::NotFound { .. } => ErrorClass::Conflict,
            EngineError::Inconsistent(_) | EngineError::WalError(_) => ErrorClass::Infrastructure,
        }
    }
}
