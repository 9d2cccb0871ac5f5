use chrono::NaiveDate;
use dashmap::DashSet;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::slots::blocked_by;
use super::validate::now_ms;
use super::{Engine, EngineError};

/// A client's request to take one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub client_id: Ulid,
    pub date: NaiveDate,
    pub start: Minute,
    /// Caller policy: book straight into `confirmed` instead of `pending`.
    pub auto_confirm: bool,
}

impl Engine {
    /// Validate and take a slot. Check and insert happen under the
    /// provider-day write lock, so concurrent commits for the same provider
    /// and date are serialized and at most one of two overlapping requests
    /// can succeed.
    pub async fn commit(&self, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let result = self.commit_inner(&req).await;
        let outcome = match &result {
            Ok(_) => "booked",
            Err(EngineError::SlotUnavailable { .. }) => "unavailable",
            Err(_) => "rejected",
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);

        let receipt = result?;
        let appointment = &receipt.appointment;
        info!(
            "booked {} for provider {} on {} at {}",
            appointment.id, appointment.provider_id, appointment.date, appointment.span
        );
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.notify.send(appointment.client_id, &event);
        self.notify.send(appointment.provider_id, &event);
        Ok(receipt)
    }

    async fn commit_inner(&self, req: &BookingRequest) -> Result<BookingReceipt, EngineError> {
        let _reservation = self.reserve_id(req.id)?;

        // Step 1: duration and end
        let snapshot = self.day_snapshot(req.provider_id, req.service_id, req.date).await?;
        let duration = match &snapshot {
            Some(s) => s.duration,
            None => self.resolve(req.provider_id, req.service_id).await?,
        };
        let end = req.start as u32 + duration as u32;
        if req.start >= MINUTES_PER_DAY || end > MINUTES_PER_DAY as u32 {
            return Err(EngineError::Validation(format!(
                "appointment starting at {} for {duration} minutes runs past midnight",
                fmt_minute(req.start.min(MINUTES_PER_DAY))
            )));
        }
        let span = TimeRange::new(req.start, end as Minute);

        let service = self.service(&req.service_id)?;
        if !service.active {
            return Err(EngineError::ServiceInactive(req.service_id));
        }

        let Some(snapshot) = snapshot else {
            return Err(self.outside(req, span));
        };

        // Step 2: exclusive provider-day lock, bounded wait
        let _gate = self.wal_gate.read().await;
        let ledger = self.day_or_create(req.provider_id, req.date);
        let Ok(mut guard) = tokio::time::timeout(COMMIT_LOCK_TIMEOUT, ledger.write()).await else {
            debug!("commit lock timeout for provider {} on {}", req.provider_id, req.date);
            return Err(self.unavailable(req, span));
        };
        let occupied = guard.occupied();
        if occupied.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on one day"));
        }
        if guard.appointments.len() >= MAX_LEDGER_ENTRIES_PER_DAY {
            return Err(EngineError::LimitExceeded("appointment history for one day is full"));
        }

        // Step 3: re-check against the current appointments, not the caller's list
        let (_, before) = snapshot.plan(&occupied)?;
        if before.binary_search(&span).is_err() {
            if let Some(existing) = guard.first_overlap(&span) {
                debug!("slot {span} taken by {} on {}", existing.id, req.date);
                return Err(self.unavailable(req, span));
            }
            let (_, open) = snapshot.plan(&[])?;
            if open.binary_search(&span).is_ok() {
                return Err(self.unavailable(req, span));
            }
            return Err(self.outside(req, span));
        }

        // Step 4: insert inside the same critical section
        let appointment = Appointment {
            id: req.id,
            provider_id: req.provider_id,
            service_id: req.service_id,
            client_id: req.client_id,
            date: req.date,
            span,
            status: if req.auto_confirm {
                AppointmentStatus::Confirmed
            } else {
                AppointmentStatus::Pending
            },
            created_at: now_ms(),
            cancellation: None,
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_day(&mut guard, &event).await?;

        // Step 5: what this booking took away besides its own slot
        let (_, after) = snapshot.plan(&guard.occupied())?;
        let blocked_adjacent_slots = blocked_by(&before, &after, &span);

        Ok(BookingReceipt {
            appointment,
            blocked_adjacent_slots,
        })
    }

    /// Claim an appointment id until the returned guard drops. Checked against
    /// the index after claiming: a finished commit indexes its id before it
    /// releases the claim.
    fn reserve_id(&self, id: Ulid) -> Result<IdReservation<'_>, EngineError> {
        if !self.reserved_ids.insert(id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let reservation = IdReservation {
            ids: &self.reserved_ids,
            id,
        };
        if self.appointment_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(reservation)
    }

    fn unavailable(&self, req: &BookingRequest, span: TimeRange) -> EngineError {
        EngineError::SlotUnavailable {
            provider_id: req.provider_id,
            date: req.date,
            span,
        }
    }

    fn outside(&self, req: &BookingRequest, span: TimeRange) -> EngineError {
        EngineError::OutsideAvailability {
            provider_id: req.provider_id,
            date: req.date,
            span,
        }
    }
}

struct IdReservation<'a> {
    ids: &'a DashSet<Ulid>,
    id: Ulid,
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}
