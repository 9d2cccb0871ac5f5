use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::duration::normalize_minutes;
use super::validate::{validate_service_config, validate_weekly_schedule};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Mirror a catalog entry. Last write wins.
    pub async fn upsert_service(
        &self,
        id: Ulid,
        reference_minutes: u32,
        active: bool,
    ) -> Result<(), EngineError> {
        if !self.services.contains_key(&id) && self.services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if reference_minutes == 0 || reference_minutes > MAX_EXECUTION_MINUTES {
            return Err(EngineError::Validation(format!(
                "reference duration {reference_minutes} out of range 1..{MAX_EXECUTION_MINUTES}"
            )));
        }
        let _gate = self.wal_gate.read().await;
        let service = ServiceInfo {
            id,
            reference_minutes,
            active,
        };
        let event = Event::ServiceUpserted { service };
        self.wal_append(&event).await?;
        self.services.insert(id, service);
        self.notify.send(id, &event);
        Ok(())
    }

    /// Overwrite a provider's weekly schedule.
    pub async fn set_schedule(
        &self,
        provider_id: Ulid,
        schedule: WeeklySchedule,
    ) -> Result<(), EngineError> {
        validate_weekly_schedule(&schedule)?;
        let _gate = self.wal_gate.read().await;
        let ps = self.writable_provider(provider_id)?;
        let mut guard = ps.write().await;
        let event = Event::ScheduleSet {
            provider_id,
            schedule,
        };
        self.persist_provider(provider_id, &mut guard, &event).await?;
        info!("schedule updated for provider {provider_id}");
        Ok(())
    }

    pub async fn set_service_config(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
        config: ServiceScheduleConfig,
    ) -> Result<(), EngineError> {
        validate_service_config(&config)?;
        self.service(&service_id)?;
        let _gate = self.wal_gate.read().await;
        let ps = self.writable_provider(provider_id)?;
        let mut guard = ps.write().await;
        let event = Event::ServiceConfigSet {
            provider_id,
            service_id,
            config,
        };
        self.persist_provider(provider_id, &mut guard, &event).await
    }

    /// Customize execution time. The stored value is already on the grid.
    pub async fn set_execution_time(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
        minutes: u32,
    ) -> Result<Minute, EngineError> {
        if minutes == 0 || minutes > MAX_EXECUTION_MINUTES {
            return Err(EngineError::Validation(format!(
                "execution time {minutes} out of range 1..{MAX_EXECUTION_MINUTES}"
            )));
        }
        self.service(&service_id)?;
        let minutes = normalize_minutes(minutes);
        let _gate = self.wal_gate.read().await;
        let ps = self.writable_provider(provider_id)?;
        let mut guard = ps.write().await;
        let event = Event::ExecutionTimeSet {
            provider_id,
            service_id,
            minutes,
        };
        self.persist_provider(provider_id, &mut guard, &event).await?;
        Ok(minutes)
    }

    /// "Restore default": soft-deactivate the override.
    pub async fn restore_execution_time(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
    ) -> Result<(), EngineError> {
        let _gate = self.wal_gate.read().await;
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let mut guard = ps.write().await;
        match guard.execution_times.get(&service_id) {
            Some(o) if o.is_active => {}
            Some(_) => return Ok(()),
            None => return Err(EngineError::NotFound(service_id)),
        }
        let event = Event::ExecutionTimeRestored {
            provider_id,
            service_id,
        };
        self.persist_provider(provider_id, &mut guard, &event).await
    }

    fn writable_provider(&self, provider_id: Ulid) -> Result<super::SharedProviderState, EngineError> {
        if !self.providers.contains_key(&provider_id)
            && self.providers.len() >= MAX_PROVIDERS_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        Ok(self.provider_or_create(provider_id))
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.wal_gate.write().await;
        let mut events = Vec::new();

        for entry in self.services.iter() {
            events.push(Event::ServiceUpserted {
                service: *entry.value(),
            });
        }

        let providers: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        for ps in providers {
            let guard = ps.read().await;
            events.push(Event::ScheduleSet {
                provider_id: guard.id,
                schedule: guard.schedule.clone(),
            });
            for (service_id, config) in &guard.service_configs {
                events.push(Event::ServiceConfigSet {
                    provider_id: guard.id,
                    service_id: *service_id,
                    config: config.clone(),
                });
            }
            for (service_id, o) in &guard.execution_times {
                events.push(Event::ExecutionTimeSet {
                    provider_id: guard.id,
                    service_id: *service_id,
                    minutes: o.execution_time_minutes,
                });
                if !o.is_active {
                    events.push(Event::ExecutionTimeRestored {
                        provider_id: guard.id,
                        service_id: *service_id,
                    });
                }
            }
        }

        let days: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        for ledger in days {
            let guard = ledger.read().await;
            for appointment in &guard.appointments {
                events.push(Event::AppointmentBooked {
                    appointment: appointment.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
