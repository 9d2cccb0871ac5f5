use crate::model::*;

/// Emit every slot of length `duration` inside `windows`, stepping by the
/// 15-minute grid from each window's start. Output is sorted by start.
pub fn candidate_slots(windows: &[TimeRange], duration: Minute) -> Vec<TimeRange> {
    let mut slots = Vec::new();
    if duration == 0 {
        return slots;
    }
    for w in windows {
        let mut start = w.start;
        while start + duration <= w.end {
            slots.push(TimeRange::new(start, start + duration));
            start += GRID_MINUTES;
        }
    }
    slots
}

/// Presentation order for a day's candidates. Never adds a slot, so every
/// ranked slot is still a valid candidate.
///
/// - even spacing (intelligent only): keep a slot only if it starts at or after
///   the end of the previously kept one.
/// - consecutive (intelligent only): slots flush against a window edge first.
/// - time of day: slots in the preferred band first.
///
/// Later criteria dominate since each pass is a stable sort.
pub fn rank_slots(
    candidates: Vec<TimeRange>,
    windows: &[TimeRange],
    config: &ServiceScheduleConfig,
) -> Vec<TimeRange> {
    let prefs = &config.preferences;
    let mut slots = candidates;

    if config.use_intelligent_scheduling && prefs.prioritize_even_spacing {
        slots = spread_evenly(&slots);
    }

    if config.use_intelligent_scheduling && prefs.prioritize_consecutive_slots {
        slots.sort_by_key(|s| !abuts_window_edge(s, windows));
    }

    if let Some(band) = prefs.time_of_day_preference {
        slots.sort_by_key(|s| TimeOfDay::of(s.start) != band);
    }

    slots
}

/// Greedy stride selection over slots sorted by start.
fn spread_evenly(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut picked: Vec<TimeRange> = Vec::new();
    for &slot in sorted {
        match picked.last() {
            Some(last) if slot.start < last.end => {}
            _ => picked.push(slot),
        }
    }
    picked
}

fn abuts_window_edge(slot: &TimeRange, windows: &[TimeRange]) -> bool {
    windows
        .iter()
        .any(|w| w.contains_range(slot) && (slot.start == w.start || slot.end == w.end))
}

/// Slots present in `before` but gone from `after`, minus the booked span.
pub fn blocked_by(before: &[TimeRange], after: &[TimeRange], booked: &TimeRange) -> Vec<TimeRange> {
    before
        .iter()
        .filter(|s| *s != booked && after.binary_search_by_key(&s.start, |a| a.start).is_err())
        .copied()
        .collect()
}
