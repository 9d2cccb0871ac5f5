use crate::model::*;

use super::validate::day_integrity;
use super::EngineError;

// ── Availability Algorithm ────────────────────────────────────────

/// Compute the free windows of one provider-day for one service.
///
/// Work blocks minus break blocks, intersected with the service's restriction
/// windows when it is restricted, minus every span still occupied by an
/// appointment. `occupied` must be sorted by start.
///
/// A day that violates the schedule invariants fails with `ScheduleIntegrity`
/// rather than producing slots from inconsistent data.
pub fn free_windows(
    day: &DaySchedule,
    config: &ServiceScheduleConfig,
    occupied: &[TimeRange],
) -> Result<Vec<TimeRange>, EngineError> {
    let base = open_windows(day, config)?;
    if occupied.is_empty() {
        return Ok(base);
    }
    let occupied = merge_overlapping(occupied);
    Ok(subtract_intervals(&base, &occupied))
}

/// Windows before any appointment is taken into account.
pub fn open_windows(
    day: &DaySchedule,
    config: &ServiceScheduleConfig,
) -> Result<Vec<TimeRange>, EngineError> {
    if !day.is_working {
        return Ok(Vec::new());
    }
    day_integrity(day).map_err(EngineError::ScheduleIntegrity)?;

    // Step 1: work minus breaks
    let mut work = day.work_blocks.clone();
    work.sort_by_key(|r| r.start);
    let work = merge_overlapping(&work);

    let mut breaks = day.break_blocks.clone();
    breaks.sort_by_key(|r| r.start);
    let mut free = subtract_intervals(&work, &breaks);

    // Step 2: restriction windows
    if config.restrict_to_time_ranges {
        let mut allowed = config.time_ranges.clone();
        allowed.sort_by_key(|r| r.start);
        let allowed = merge_overlapping(&allowed);
        free = intersect_intervals(&free, &allowed);
    }

    Ok(free)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end {
                last.end = last.end.max(range.end);
                continue;
            }
        merged.push(range);
    }
    merged
}

/// Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(TimeRange::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(TimeRange::new(current_start, current_end));
        }
    }

    result
}

/// Two-pointer sweep over sorted, disjoint inputs.
pub fn intersect_intervals(a: &[TimeRange], b: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        let start = a[i].start.max(b[j].start);
        let end = a[i].end.min(b[j].end);
        if start < end {
            result.push(TimeRange::new(start, end));
        }
        if a[i].end < b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Minute = 60;

    fn r(start: Minute, end: Minute) -> TimeRange {
        TimeRange::new(start, end)
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![r(100, 200), r(300, 400)];
        let remove = vec![r(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let result = subtract_intervals(&[r(100, 200)], &[r(50, 250)]);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        assert_eq!(subtract_intervals(&[r(100, 200)], &[r(50, 150)]), vec![r(150, 200)]);
        assert_eq!(subtract_intervals(&[r(100, 200)], &[r(150, 250)]), vec![r(100, 150)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let result = subtract_intervals(&[r(0, 1000)], &[r(100, 200), r(400, 500), r(800, 900)]);
        assert_eq!(result, vec![r(0, 100), r(200, 400), r(500, 800), r(900, 1000)]);
    }

    // ── intersect_intervals ───────────────────────────────

    #[test]
    fn intersect_clips_to_both() {
        let a = vec![r(9 * H, 12 * H), r(13 * H, 17 * H)];
        let b = vec![r(11 * H, 14 * H)];
        assert_eq!(intersect_intervals(&a, &b), vec![r(11 * H, 12 * H), r(13 * H, 14 * H)]);
    }

    #[test]
    fn intersect_disjoint_is_empty() {
        assert!(intersect_intervals(&[r(0, 100)], &[r(100, 200)]).is_empty());
    }

    #[test]
    fn intersect_one_spans_many() {
        let a = vec![r(0, 1440)];
        let b = vec![r(60, 120), r(300, 360), r(900, 960)];
        assert_eq!(intersect_intervals(&a, &b), b);
    }

    // ── merge_overlapping ─────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let merged = merge_overlapping(&[r(100, 300), r(200, 400), r(500, 600)]);
        assert_eq!(merged, vec![r(100, 400), r(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        assert_eq!(merge_overlapping(&[r(100, 200), r(200, 300)]), vec![r(100, 300)]);
    }

    // ── free_windows ──────────────────────────────────────

    #[test]
    fn non_working_day_is_closed() {
        let free = free_windows(&DaySchedule::off(), &ServiceScheduleConfig::default(), &[]).unwrap();
        assert!(free.is_empty());
    }

    #[test]
    fn breaks_carve_holes() {
        let day = DaySchedule::working(vec![r(9 * H, 17 * H)], vec![r(12 * H, 13 * H)]);
        let free = free_windows(&day, &ServiceScheduleConfig::default(), &[]).unwrap();
        assert_eq!(free, vec![r(9 * H, 12 * H), r(13 * H, 17 * H)]);
    }

    #[test]
    fn restriction_intersects() {
        let day = DaySchedule::working(vec![r(9 * H, 17 * H)], vec![r(12 * H, 13 * H)]);
        let config = ServiceScheduleConfig {
            restrict_to_time_ranges: true,
            time_ranges: vec![r(11 * H, 15 * H)],
            ..Default::default()
        };
        let free = free_windows(&day, &config, &[]).unwrap();
        assert_eq!(free, vec![r(11 * H, 12 * H), r(13 * H, 15 * H)]);
    }

    #[test]
    fn appointments_subtracted() {
        let day = DaySchedule::working(vec![r(9 * H, 12 * H)], vec![]);
        let occupied = vec![r(10 * H, 11 * H)];
        let free = free_windows(&day, &ServiceScheduleConfig::default(), &occupied).unwrap();
        assert_eq!(free, vec![r(9 * H, 10 * H), r(11 * H, 12 * H)]);
    }

    #[test]
    fn break_outside_work_is_integrity_error() {
        let day = DaySchedule::working(vec![r(9 * H, 12 * H)], vec![r(13 * H, 14 * H)]);
        let err = free_windows(&day, &ServiceScheduleConfig::default(), &[]).unwrap_err();
        assert!(matches!(err, EngineError::ScheduleIntegrity(_)));
    }

    #[test]
    fn working_without_blocks_is_integrity_error() {
        let day = DaySchedule::working(vec![], vec![]);
        let err = free_windows(&day, &ServiceScheduleConfig::default(), &[]).unwrap_err();
        assert!(matches!(err, EngineError::ScheduleIntegrity(_)));
    }
}
