use ulid::Ulid;

use crate::limits::MAX_EXECUTION_MINUTES;
use crate::model::*;

use super::{Engine, EngineError};

/// Snap a duration onto the 15-minute grid: nearest multiple (halves round
/// up), never below one grid step, never longer than a day.
pub fn normalize_minutes(minutes: u32) -> Minute {
    let grid = GRID_MINUTES as u32;
    let rounded = (minutes.min(MAX_EXECUTION_MINUTES) + grid / 2) / grid * grid;
    rounded.clamp(grid, MINUTES_PER_DAY as u32) as Minute
}

/// Pure resolution: an active override wins, otherwise the catalog duration.
pub fn resolve_duration(
    service: &ServiceInfo,
    override_: Option<&ExecutionTimeOverride>,
) -> Minute {
    match override_ {
        Some(o) if o.is_active => normalize_minutes(o.execution_time_minutes as u32),
        _ => normalize_minutes(service.reference_minutes),
    }
}

impl Engine {
    /// Effective execution time for a (provider, service) pair.
    pub async fn resolve(&self, provider_id: Ulid, service_id: Ulid) -> Result<Minute, EngineError> {
        let service = self.service(&service_id)?;
        let Some(provider) = self.get_provider(&provider_id) else {
            return Ok(resolve_duration(&service, None));
        };
        let guard = provider.read().await;
        Ok(resolve_duration(&service, guard.execution_times.get(&service_id)))
    }
}
