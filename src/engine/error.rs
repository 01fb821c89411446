use ulid::Ulid;

use crate::calendar::CalendarError;
use crate::model::AppointmentStatus;
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    /// Missing, inactive, or not eligible for the request.
    NotFound {
        entity: &'static str,
        id: Ulid,
    },
    AlreadyExists {
        entity: &'static str,
        id: Ulid,
    },
    /// The slot was taken between query and commit.
    Conflict {
        employee_id: Ulid,
        with: Ulid,
    },
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    LimitExceeded(&'static str),
    /// Transient store failure; nothing was written.
    Store(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            EngineError::AlreadyExists { entity, id } => write!(f, "{entity} already exists: {id}"),
            EngineError::Conflict { employee_id, with } => write!(
                f,
                "slot no longer available for employee {employee_id} (taken by {with}); pick another time"
            ),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "appointment cannot go from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}; try again"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Overlap { employee_id, with } => EngineError::Conflict { employee_id, with },
            StoreError::InvalidTransition { from, to } => EngineError::InvalidTransition { from, to },
            StoreError::NotFound { entity, id } => EngineError::NotFound { entity, id },
            StoreError::Duplicate { entity, id } => EngineError::AlreadyExists { entity, id },
            StoreError::Limit(msg) => EngineError::LimitExceeded(msg),
            StoreError::Unavailable(msg) => EngineError::Store(msg),
        }
    }
}

impl From<CalendarError> for EngineError {
    fn from(e: CalendarError) -> Self {
        EngineError::Validation(e.to_string())
    }
}
