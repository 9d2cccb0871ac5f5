use async_trait::async_trait;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::{now_ms, validate_reason};
use super::{Engine, EngineError};

impl AppointmentStatus {
    /// Completed, canceled and no-show appointments never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Canceled | AppointmentStatus::NoShow
        )
    }

    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Canceled)
                | (Confirmed, Completed)
                | (Confirmed, Canceled)
                | (Confirmed, NoShow)
        )
    }

    /// Transitions that must record who ended the appointment and why.
    pub fn requires_reason(&self) -> bool {
        matches!(self, AppointmentStatus::Canceled | AppointmentStatus::NoShow)
    }
}

/// External precondition for `confirmed → completed` (e.g. a one-time code
/// the client hands to the provider).
#[async_trait]
pub trait CompletionGate: Send + Sync {
    async fn validate_completion_code(&self, appointment_id: Ulid, code: Option<&str>) -> bool;
}

/// Accepts every completion.
#[derive(Debug, Default)]
pub struct NoCompletionGate;

#[async_trait]
impl CompletionGate for NoCompletionGate {
    async fn validate_completion_code(&self, _appointment_id: Ulid, _code: Option<&str>) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub appointment_id: Ulid,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
    /// Acting user; required for cancellation and no-show.
    pub actor: Option<Ulid>,
    pub completion_code: Option<String>,
}

impl TransitionRequest {
    pub fn to(appointment_id: Ulid, status: AppointmentStatus) -> Self {
        Self {
            appointment_id,
            status,
            reason: None,
            actor: None,
            completion_code: None,
        }
    }
}

impl Engine {
    /// Move an appointment to a new status. Leaving pending/confirmed frees
    /// its time for the next slot generation.
    pub async fn transition(&self, req: TransitionRequest) -> Result<Appointment, EngineError> {
        let id = req.appointment_id;
        let to = req.status;

        let cancellation = if to.requires_reason() {
            let reason = req.reason.clone().unwrap_or_default();
            validate_reason(&reason)?;
            let by = req
                .actor
                .ok_or_else(|| EngineError::Validation(format!("{to} requires an acting user")))?;
            Some(Cancellation {
                reason,
                cancelled_at: now_ms(),
                cancelled_by: by,
            })
        } else {
            None
        };
        if let Some(code) = &req.completion_code
            && code.len() > MAX_COMPLETION_CODE_LEN {
                return Err(EngineError::LimitExceeded("completion code too long"));
            }

        let (provider_id, date) = self
            .get_day_for_appointment(&id)
            .ok_or(EngineError::NotFound(id))?;

        // The gate is external and may be slow, so it runs before any lock.
        if to == AppointmentStatus::Completed {
            let current = self.get_appointment(id).await?;
            if !current.status.can_transition_to(to) {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to,
                });
            }
            if !self
                .completion_gate
                .validate_completion_code(id, req.completion_code.as_deref())
                .await
            {
                return Err(EngineError::CompletionRejected(id));
            }
        }

        let _gate = self.wal_gate.read().await;
        let ledger = self
            .get_day(&(provider_id, date))
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = ledger.write().await;
        let from = guard.get(&id).ok_or(EngineError::NotFound(id))?.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }

        let event = Event::AppointmentStatusChanged {
            id,
            provider_id,
            date,
            status: to,
            cancellation,
        };
        self.persist_day(&mut guard, &event).await?;
        let updated = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        info!("appointment {id}: {from} -> {to}");
        self.notify.send(updated.client_id, &event);
        self.notify.send(updated.provider_id, &event);
        Ok(updated)
    }
}
