use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 63;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 128;

/// Longest bookable service (one day).
pub const MAX_SERVICE_DURATION_MIN: u32 = 24 * 60;

/// Slot step bounds (minutes).
pub const MIN_SLOT_STEP_MIN: u32 = 1;
pub const MAX_SLOT_STEP_MIN: u32 = 24 * 60;

/// UTC offsets accepted for a location, in minutes (-14:00 ..= +14:00).
pub const MAX_UTC_OFFSET_MIN: i32 = 14 * 60;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Widest time-off or block interval (one year).
pub const MAX_BUSY_SPAN_MS: Ms = 366 * 24 * 3_600_000;

/// Largest WAL frame payload replay will read; a bigger length prefix is corruption.
pub const MAX_WAL_FRAME_LEN: usize = 1 << 20;

pub const MAX_APPOINTMENTS_PER_EMPLOYEE: usize = 100_000;
pub const MAX_EMPLOYEES_PER_TENANT: usize = 10_000;
pub const MAX_AVAILABILITY_ROWS_PER_EMPLOYEE: usize = 7 * 16;
