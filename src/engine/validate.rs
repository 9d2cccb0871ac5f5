use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Check the invariants of a single day. Returns a description of the first
/// violation found.
pub(crate) fn day_integrity(day: &DaySchedule) -> Result<(), String> {
    if !day.is_working {
        return Ok(());
    }
    if day.work_blocks.is_empty() {
        return Err("working day has no work blocks".into());
    }
    check_ranges("work block", &day.work_blocks)?;
    check_ranges("break block", &day.break_blocks)?;

    for b in &day.break_blocks {
        if !day.work_blocks.iter().any(|w| w.contains_range(b)) {
            return Err(format!("break block {b} is not within any work block"));
        }
    }
    Ok(())
}

/// Well-formed and pairwise non-overlapping.
fn check_ranges(what: &str, ranges: &[TimeRange]) -> Result<(), String> {
    for r in ranges {
        if !r.is_well_formed() {
            return Err(format!("{what} {}..{} is malformed", r.start, r.end));
        }
    }
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| r.start);
    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(format!("{what}s {} and {} overlap", pair[0], pair[1]));
        }
    }
    Ok(())
}

pub(crate) fn validate_weekly_schedule(schedule: &WeeklySchedule) -> Result<(), EngineError> {
    for (weekday, day) in schedule.days.iter().enumerate() {
        if day.work_blocks.len() > MAX_BLOCKS_PER_DAY || day.break_blocks.len() > MAX_BLOCKS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many blocks on one day"));
        }
        day_integrity(day).map_err(|e| EngineError::Validation(format!("weekday {weekday}: {e}")))?;
    }
    Ok(())
}

pub(crate) fn validate_service_config(config: &ServiceScheduleConfig) -> Result<(), EngineError> {
    if config.days_of_week.is_empty() {
        return Err(EngineError::Validation("days_of_week must not be empty".into()));
    }
    if let Some(d) = config.days_of_week.iter().find(|d| **d > 6) {
        return Err(EngineError::Validation(format!("weekday {d} out of range 0..6")));
    }
    if config.time_ranges.len() > MAX_TIME_RANGES {
        return Err(EngineError::LimitExceeded("too many time ranges"));
    }
    if config.restrict_to_time_ranges && config.time_ranges.is_empty() {
        return Err(EngineError::Validation(
            "restricted service needs at least one time range".into(),
        ));
    }
    for r in &config.time_ranges {
        if !r.is_well_formed() {
            return Err(EngineError::Validation(format!(
                "time range {}..{} is malformed",
                r.start, r.end
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_reason(reason: &str) -> Result<(), EngineError> {
    if reason.trim().is_empty() {
        return Err(EngineError::Validation("a reason is required".into()));
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}
