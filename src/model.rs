use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, for instants (creation, cancellation).
pub type Ms = i64;

/// Minute of day. `1440` is representable so a range can end at midnight.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 1440;

/// Every resolved duration and every slot step sits on this grid.
pub const GRID_MINUTES: Minute = 15;

/// Half-open interval `[start, end)` in minutes of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Minute,
    pub end: Minute,
}

impl TimeRange {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Minute, end: Minute) -> Option<Self> {
        (start < end && end <= MINUTES_PER_DAY).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end && self.end <= MINUTES_PER_DAY
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", fmt_minute(self.start), fmt_minute(self.end))
    }
}

/// Render a minute of day as `HH:MM`.
pub fn fmt_minute(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// 0 = Sunday .. 6 = Saturday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Provider availability ────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub is_working: bool,
    pub work_blocks: Vec<TimeRange>,
    pub break_blocks: Vec<TimeRange>,
}

impl DaySchedule {
    pub fn off() -> Self {
        Self::default()
    }

    pub fn working(work_blocks: Vec<TimeRange>, break_blocks: Vec<TimeRange>) -> Self {
        Self {
            is_working: true,
            work_blocks,
            break_blocks,
        }
    }
}

/// Recurring availability, indexed by weekday (0 = Sunday).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    pub days: [DaySchedule; 7],
}

impl WeeklySchedule {
    pub fn day(&self, weekday: u8) -> &DaySchedule {
        &self.days[weekday as usize % 7]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
}

impl TimeOfDay {
    /// Morning before 12:00, afternoon 12:00–18:00, evening from 18:00.
    pub fn of(m: Minute) -> Self {
        match m {
            0..720 => TimeOfDay::Morning,
            720..1080 => TimeOfDay::Afternoon,
            _ => TimeOfDay::Evening,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "morning" => Some(TimeOfDay::Morning),
            "afternoon" => Some(TimeOfDay::Afternoon),
            "evening" => Some(TimeOfDay::Evening),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeOfDay::Morning => "morning",
            TimeOfDay::Afternoon => "afternoon",
            TimeOfDay::Evening => "evening",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingPreferences {
    pub prioritize_even_spacing: bool,
    pub prioritize_consecutive_slots: bool,
    pub time_of_day_preference: Option<TimeOfDay>,
}

/// Per-(provider, service) restrictions and ranking preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceScheduleConfig {
    pub restrict_to_time_ranges: bool,
    pub time_ranges: Vec<TimeRange>,
    pub days_of_week: BTreeSet<u8>,
    pub use_intelligent_scheduling: bool,
    pub preferences: SchedulingPreferences,
}

impl Default for ServiceScheduleConfig {
    /// No restriction, every day, intelligent scheduling on.
    fn default() -> Self {
        Self {
            restrict_to_time_ranges: false,
            time_ranges: Vec::new(),
            days_of_week: (0..7).collect(),
            use_intelligent_scheduling: true,
            preferences: SchedulingPreferences::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTimeOverride {
    pub execution_time_minutes: Minute,
    pub is_active: bool,
}

/// Everything a provider owns. Mutated only through provider-scoped writes.
#[derive(Debug, Clone, Default)]
pub struct ProviderState {
    pub id: Ulid,
    pub schedule: WeeklySchedule,
    pub service_configs: HashMap<Ulid, ServiceScheduleConfig>,
    pub execution_times: HashMap<Ulid, ExecutionTimeOverride>,
}

impl ProviderState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn config_for(&self, service_id: &Ulid) -> ServiceScheduleConfig {
        self.service_configs
            .get(service_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Local mirror of the external service catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub reference_minutes: u32,
    pub active: bool,
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Canceled,
    NoShow,
}

impl AppointmentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(AppointmentStatus::Pending),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "completed" => Some(AppointmentStatus::Completed),
            "canceled" | "cancelled" => Some(AppointmentStatus::Canceled),
            "no_show" => Some(AppointmentStatus::NoShow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Canceled => "canceled",
            AppointmentStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: String,
    pub cancelled_at: Ms,
    pub cancelled_by: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub client_id: Ulid,
    pub date: NaiveDate,
    pub span: TimeRange,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub cancellation: Option<Cancellation>,
}

impl Appointment {
    /// Pending and confirmed appointments hold their time on the calendar.
    pub fn occupies_calendar(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Key for the per-provider-per-day appointment ledger.
pub type DayKey = (Ulid, NaiveDate);

/// All appointments of one provider on one date, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub appointments: Vec<Appointment>,
}

impl DayLedger {
    pub fn new(provider_id: Ulid, date: NaiveDate) -> Self {
        Self {
            provider_id,
            date,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Spans of the appointments that still occupy the calendar, sorted.
    pub fn occupied(&self) -> Vec<TimeRange> {
        self.appointments
            .iter()
            .filter(|a| a.occupies_calendar())
            .map(|a| a.span)
            .collect()
    }

    /// First calendar-occupying appointment overlapping `span`.
    pub fn first_overlap(&self, span: &TimeRange) -> Option<&Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < span.end);
        self.appointments[..right_bound]
            .iter()
            .find(|a| a.occupies_calendar() && a.span.overlaps(span))
    }
}

/// WAL record format. Flat, no nesting beyond value types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceUpserted {
        service: ServiceInfo,
    },
    ScheduleSet {
        provider_id: Ulid,
        schedule: WeeklySchedule,
    },
    ServiceConfigSet {
        provider_id: Ulid,
        service_id: Ulid,
        config: ServiceScheduleConfig,
    },
    ExecutionTimeSet {
        provider_id: Ulid,
        service_id: Ulid,
        minutes: Minute,
    },
    ExecutionTimeRestored {
        provider_id: Ulid,
        service_id: Ulid,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentStatusChanged {
        id: Ulid,
        provider_id: Ulid,
        date: NaiveDate,
        status: AppointmentStatus,
        cancellation: Option<Cancellation>,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub appointment: Appointment,
    pub blocked_adjacent_slots: Vec<TimeRange>,
}
