use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{AppointmentStatus, TimeRange};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Malformed input rejected before persistence.
    Validation(String),
    /// Stored schedule data violates its invariants.
    ScheduleIntegrity(String),
    /// Requested span overlaps a live appointment, or the commit lost the race.
    SlotUnavailable {
        provider_id: Ulid,
        date: NaiveDate,
        span: TimeRange,
    },
    /// Requested span is not a bookable slot under the provider's schedule.
    OutsideAvailability {
        provider_id: Ulid,
        date: NaiveDate,
        span: TimeRange,
    },
    ServiceInactive(Ulid),
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    CompletionRejected(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::ScheduleIntegrity(msg) => {
                write!(f, "schedule configuration error, contact support ({msg})")
            }
            EngineError::SlotUnavailable {
                provider_id,
                date,
                span,
            } => write!(
                f,
                "slot {span} on {date} is no longer available for provider {provider_id}; please pick another time"
            ),
            EngineError::OutsideAvailability {
                provider_id,
                date,
                span,
            } => write!(
                f,
                "{span} on {date} is not a bookable slot for provider {provider_id}"
            ),
            EngineError::ServiceInactive(id) => write!(f, "service {id} is not active"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::CompletionRejected(id) => {
                write!(f, "completion code rejected for appointment {id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
