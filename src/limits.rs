use std::time::Duration;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_PROVIDERS_PER_TENANT: usize = 1_000_000;
pub const MAX_SERVICES_PER_TENANT: usize = 1_000_000;

/// Work or break blocks on a single day.
pub const MAX_BLOCKS_PER_DAY: usize = 48;
/// Restriction windows on a single service config.
pub const MAX_TIME_RANGES: usize = 48;

/// Live (pending or confirmed) appointments on one provider-day.
pub const MAX_APPOINTMENTS_PER_DAY: usize = 1440 / 15;
/// Every appointment ever booked on one provider-day, terminal ones included.
pub const MAX_LEDGER_ENTRIES_PER_DAY: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_COMPLETION_CODE_LEN: usize = 64;

/// Longest reference duration or override accepted, in minutes.
pub const MAX_EXECUTION_MINUTES: u32 = 1440;

/// Upper bound on waiting for a provider-day lock during commit.
pub const COMMIT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
