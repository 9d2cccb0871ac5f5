mod availability;
mod booking;
mod duration;
mod lifecycle;
mod mutations;
mod queries;
mod slots;
mod validate;

pub use availability::{free_windows, intersect_intervals, merge_overlapping, open_windows, subtract_intervals};
pub use booking::BookingRequest;
pub use duration::{normalize_minutes, resolve_duration};
pub use error::EngineError;
pub use lifecycle::{CompletionGate, NoCompletionGate, TransitionRequest};
pub use slots::{blocked_by, candidate_slots, rank_slots};

mod error;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;
pub type SharedDayLedger = Arc<RwLock<DayLedger>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub providers: DashMap<Ulid, SharedProviderState>,
    pub services: DashMap<Ulid, ServiceInfo>,
    /// One ledger per (provider, date); its write lock serializes commits.
    pub days: DashMap<DayKey, SharedDayLedger>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) completion_gate: Arc<dyn CompletionGate>,
    /// Reverse lookup: appointment id → (provider, date)
    pub(super) appointment_index: DashMap<Ulid, DayKey>,
    /// Appointment ids claimed by commits still in flight.
    pub(super) reserved_ids: DashSet<Ulid>,
    /// Mutations hold this shared from before they lock state until their
    /// event is applied; compaction holds it exclusively so no event can land
    /// between its snapshot and the WAL swap.
    pub(super) wal_gate: RwLock<()>,
}

/// Apply a provider-scoped event. The caller holds the lock.
fn apply_to_provider(ps: &mut ProviderState, event: &Event) {
    match event {
        Event::ScheduleSet { schedule, .. } => {
            ps.schedule = schedule.clone();
        }
        Event::ServiceConfigSet {
            service_id, config, ..
        } => {
            ps.service_configs.insert(*service_id, config.clone());
        }
        Event::ExecutionTimeSet {
            service_id, minutes, ..
        } => {
            ps.execution_times.insert(
                *service_id,
                ExecutionTimeOverride {
                    execution_time_minutes: *minutes,
                    is_active: true,
                },
            );
        }
        Event::ExecutionTimeRestored { service_id, .. } => {
            if let Some(o) = ps.execution_times.get_mut(service_id) {
                o.is_active = false;
            }
        }
        // Catalog and appointment events are applied elsewhere
        Event::ServiceUpserted { .. }
        | Event::AppointmentBooked { .. }
        | Event::AppointmentStatusChanged { .. } => {}
    }
}

/// Apply an appointment event to its day ledger (caller holds the lock).
fn apply_to_day(ledger: &mut DayLedger, event: &Event, index: &DashMap<Ulid, DayKey>) {
    match event {
        Event::AppointmentBooked { appointment } => {
            index.insert(appointment.id, (appointment.provider_id, appointment.date));
            ledger.insert(appointment.clone());
        }
        Event::AppointmentStatusChanged {
            id,
            status,
            cancellation,
            ..
        } => {
            if let Some(a) = ledger.get_mut(id) {
                a.status = *status;
                if cancellation.is_some() {
                    a.cancellation = cancellation.clone();
                }
            }
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        Self::with_completion_gate(wal_path, notify, Arc::new(NoCompletionGate))
    }

    pub fn with_completion_gate(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        completion_gate: Arc<dyn CompletionGate>,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            providers: DashMap::new(),
            services: DashMap::new(),
            days: DashMap::new(),
            wal_tx,
            notify,
            completion_gate,
            appointment_index: DashMap::new(),
            reserved_ids: DashSet::new(),
            wal_gate: RwLock::new(()),
        };

        // Replay events. We are the sole owner of these Arcs, so try_write
        // always succeeds instantly. Never use blocking_write here because
        // this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::ServiceUpserted { service } => {
                    engine.services.insert(service.id, *service);
                }
                Event::AppointmentBooked { appointment } => {
                    let ledger = engine.day_or_create(appointment.provider_id, appointment.date);
                    let mut guard = ledger.try_write().expect("replay: uncontended write");
                    apply_to_day(&mut guard, event, &engine.appointment_index);
                }
                Event::AppointmentStatusChanged { provider_id, date, .. } => {
                    if let Some(ledger) = engine.get_day(&(*provider_id, *date)) {
                        let mut guard = ledger.try_write().expect("replay: uncontended write");
                        apply_to_day(&mut guard, event, &engine.appointment_index);
                    }
                }
                other => {
                    if let Some(provider_id) = event_provider_id(other) {
                        let ps = engine.provider_or_create(provider_id);
                        let mut guard = ps.try_write().expect("replay: uncontended write");
                        apply_to_provider(&mut guard, other);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    /// Providers come into existence on their first write (onboarding default:
    /// every day off).
    pub(super) fn provider_or_create(&self, id: Ulid) -> SharedProviderState {
        self.providers
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ProviderState::new(id))))
            .value()
            .clone()
    }

    pub fn get_day(&self, key: &DayKey) -> Option<SharedDayLedger> {
        self.days.get(key).map(|e| e.value().clone())
    }

    pub(super) fn day_or_create(&self, provider_id: Ulid, date: chrono::NaiveDate) -> SharedDayLedger {
        self.days
            .entry((provider_id, date))
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(provider_id, date))))
            .value()
            .clone()
    }

    pub fn service(&self, id: &Ulid) -> Result<ServiceInfo, EngineError> {
        self.services
            .get(id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*id))
    }

    pub fn get_day_for_appointment(&self, id: &Ulid) -> Option<DayKey> {
        self.appointment_index.get(id).map(|e| *e.value())
    }

    /// WAL-append + apply for provider-owned data.
    pub(super) async fn persist_provider(
        &self,
        provider_id: Ulid,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_provider(ps, event);
        self.notify.send(provider_id, event);
        Ok(())
    }

    /// WAL-append + apply for appointment events. Notification is left to the
    /// caller so it can fire after the ledger lock is released.
    pub(super) async fn persist_day(&self, ledger: &mut DayLedger, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(ledger, event, &self.appointment_index);
        Ok(())
    }
}

/// Extract the owning provider from a provider-scoped event.
fn event_provider_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ScheduleSet { provider_id, .. }
        | Event::ServiceConfigSet { provider_id, .. }
        | Event::ExecutionTimeSet { provider_id, .. }
        | Event::ExecutionTimeRestored { provider_id, .. } => Some(*provider_id),
        Event::ServiceUpserted { .. }
        | Event::AppointmentBooked { .. }
        | Event::AppointmentStatusChanged { .. } => None,
    }
}
