//! Hard safety limits. Requests past these fail with `LimitExceeded`.

use crate::model::{DAY, Ms};

pub const MAX_FACILITIES: usize = 1_024;
pub const MAX_FACILITY_NAME_LEN: usize = 128;

pub const MAX_SESSIONS_PER_FACILITY: usize = 500_000;
pub const MAX_SESSION_CAPACITY: u32 = 1_000;
pub const MAX_SESSION_DURATION_MS: Ms = DAY;

pub const MAX_SESSIONS_PER_HOLD: usize = 64;
pub const MAX_OWNER_LEN: usize = 256;

/// Free text: locations, cancellation reasons, billing notes, references.
pub const MAX_LABEL_LEN: usize = 1_024;

pub const MAX_RECURRENCE_DAYS: i64 = 366;
pub const MAX_INSTRUCTOR_CANDIDATES: usize = 64;
pub const MAX_IN_CLAUSE_IDS: usize = 256;

pub const MAX_SESSIONS_PER_PO: u32 = 200;

/// Re-reads of a booking whose status moved under a concurrent cancel.
/// Booking status only moves forward, so a handful always suffices.
pub const MAX_CANCEL_RETRIES: usize = 8;

/// 1970-01-01 .. 2100-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
