use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::free_windows;
use super::duration::resolve_duration;
use super::slots::{candidate_slots, rank_slots};
use super::{Engine, EngineError};

/// Everything slot generation needs from the provider and catalog, copied out
/// of their locks so the computation itself is pure.
#[derive(Debug, Clone)]
pub(super) struct DaySnapshot {
    pub day: DaySchedule,
    pub config: ServiceScheduleConfig,
    pub duration: Minute,
}

impl DaySnapshot {
    /// Free windows and the full ascending candidate set for `occupied`.
    pub fn plan(&self, occupied: &[TimeRange]) -> Result<(Vec<TimeRange>, Vec<TimeRange>), EngineError> {
        let windows = free_windows(&self.day, &self.config, occupied)?;
        let candidates = candidate_slots(&windows, self.duration);
        Ok((windows, candidates))
    }
}

impl Engine {
    /// `None` when nothing can be booked that day: inactive service, unknown
    /// provider, day off, or weekday excluded by the service config.
    pub(super) async fn day_snapshot(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Option<DaySnapshot>, EngineError> {
        let service = self.service(&service_id)?;
        if !service.active {
            return Ok(None);
        }
        let Some(ps) = self.get_provider(&provider_id) else {
            return Ok(None);
        };
        let guard = ps.read().await;

        let weekday = weekday_index(date);
        let day = guard.schedule.day(weekday);
        if !day.is_working {
            return Ok(None);
        }
        let config = guard.config_for(&service_id);
        if !config.days_of_week.contains(&weekday) {
            return Ok(None);
        }

        Ok(Some(DaySnapshot {
            day: day.clone(),
            config,
            duration: resolve_duration(&service, guard.execution_times.get(&service_id)),
        }))
    }

    async fn occupied_on(&self, provider_id: Ulid, date: NaiveDate) -> Vec<TimeRange> {
        match self.get_day(&(provider_id, date)) {
            Some(ledger) => ledger.read().await.occupied(),
            None => Vec::new(),
        }
    }

    /// Bookable slots for a service on a date, in presentation order.
    pub async fn generate_slots(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeRange>, EngineError> {
        let started = std::time::Instant::now();
        let Some(snapshot) = self.day_snapshot(provider_id, service_id, date).await? else {
            return Ok(Vec::new());
        };
        let occupied = self.occupied_on(provider_id, date).await;
        let (windows, candidates) = snapshot.plan(&occupied).inspect_err(|e| {
            tracing::warn!("slot generation failed for provider {provider_id} on {date}: {e}");
        })?;
        let ranked = rank_slots(candidates, &windows, &snapshot.config);
        metrics::histogram!(crate::observability::SLOT_GENERATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(ranked)
    }

    /// The full ascending candidate set, with no ranking applied.
    pub async fn bookable_slots(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeRange>, EngineError> {
        let Some(snapshot) = self.day_snapshot(provider_id, service_id, date).await? else {
            return Ok(Vec::new());
        };
        let occupied = self.occupied_on(provider_id, date).await;
        Ok(snapshot.plan(&occupied)?.1)
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let key = self
            .get_day_for_appointment(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ledger = self.get_day(&key).ok_or(EngineError::NotFound(id))?;
        let guard = ledger.read().await;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Appointments of a provider, optionally for one date, ordered by date then start.
    pub async fn list_appointments(
        &self,
        provider_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Vec<Appointment> {
        let mut ledgers: Vec<_> = self
            .days
            .iter()
            .filter(|e| e.key().0 == provider_id && date.is_none_or(|d| e.key().1 == d))
            .map(|e| (e.key().1, e.value().clone()))
            .collect();
        ledgers.sort_by_key(|(d, _)| *d);

        let mut out = Vec::new();
        for (_, ledger) in ledgers {
            out.extend(ledger.read().await.appointments.iter().cloned());
        }
        out
    }

    /// A provider's weekly schedule; every day off if they never wrote one.
    pub async fn get_schedule(&self, provider_id: Ulid) -> WeeklySchedule {
        match self.get_provider(&provider_id) {
            Some(ps) => ps.read().await.schedule.clone(),
            None => WeeklySchedule::default(),
        }
    }

    pub async fn get_service_config(&self, provider_id: Ulid, service_id: Ulid) -> ServiceScheduleConfig {
        match self.get_provider(&provider_id) {
            Some(ps) => ps.read().await.config_for(&service_id),
            None => ServiceScheduleConfig::default(),
        }
    }

    pub async fn get_execution_time(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
    ) -> Option<ExecutionTimeOverride> {
        let ps = self.get_provider(&provider_id)?;
        let guard = ps.read().await;
        guard.execution_times.get(&service_id).copied()
    }
}
