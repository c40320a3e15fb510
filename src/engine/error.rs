use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{LineStatus, ParseError};

use super::hours::ClosedReason;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: Ulid },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("capacity exceeded on {instance_id}: requested {requested}, {available} remaining")]
    CapacityExceeded {
        instance_id: Ulid,
        requested: u32,
        available: u32,
    },
    #[error("park {park_id} closed on {date}: {reason}")]
    ClosedDay {
        park_id: Ulid,
        date: NaiveDate,
        reason: ClosedReason,
    },
    #[error("concurrent update on {0}, try again")]
    ConcurrencyConflict(Ulid),
    #[error("cannot {action} line {line_id} while {from}")]
    InvalidTransition {
        line_id: Ulid,
        from: LineStatus,
        action: &'static str,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn not_found(what: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { what, id }
    }

    /// Stable machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::NotFound { .. } => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::ClosedDay { .. } => "closed_day",
            EngineError::ConcurrencyConflict(_) => "concurrency_conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage",
        }
    }
}

impl From<ParseError> for EngineError {
    fn from(e: ParseError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}
