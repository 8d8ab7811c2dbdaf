use std::time::Duration;

/// Longest stay a single hold or booking detail may cover.
pub const MAX_STAY_NIGHTS: i64 = 30;

pub const MAX_DETAILS_PER_BOOKING: usize = 10;

pub const MAX_GUESTS_PER_DETAIL: usize = 10;

/// Widest inclusive range accepted by a bulk allotment update.
pub const MAX_BULK_DAYS: i64 = 366;

pub const MAX_SESSION_ID_LEN: usize = 128;

/// Days on each side of the requested check-in offered when a search finds nothing.
pub const ALTERNATIVE_DATE_WINDOW: i64 = 3;

pub const DEFAULT_HOLD_TTL: Duration = Duration::from_secs(15 * 60);

pub const DEFAULT_SWEEP_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

/// How often the compactor checks the WAL append counter.
pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
