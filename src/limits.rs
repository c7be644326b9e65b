//! Hard bounds applied at the engine and wire edges.

use crate::model::Ms;

const MINUTE_MS: Ms = 60_000;
const DAY_MS: Ms = 24 * 60 * MINUTE_MS;

// ── Tenants ──────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 63;

// ── Directory ────────────────────────────────────────────

pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_TEAMS_PER_TENANT: usize = 10_000;
pub const MAX_SCHEDULES_PER_TENANT: usize = 200_000;
pub const MAX_EVENT_TYPES_PER_TENANT: usize = 200_000;
pub const MAX_TEAM_DEPTH: usize = 8;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_HOSTS_PER_EVENT_TYPE: usize = 100;
pub const MAX_AVAILABILITY_RULES: usize = 64;
pub const MAX_DATE_OVERRIDES: usize = 512;
pub const MAX_WINDOWS_PER_OVERRIDE: usize = 16;
pub const MAX_MULTIPLE_DURATIONS: usize = 16;

// ── Event type settings (minutes) ────────────────────────

pub const MAX_EVENT_LENGTH_MIN: u32 = 24 * 60;
pub const MAX_BUFFER_MIN: u32 = 24 * 60;
pub const MAX_BOOKING_NOTICE_MIN: u32 = 365 * 24 * 60;
pub const MAX_SEATS_PER_SLOT: u32 = 10_000;
pub const MAX_ROLLING_PERIOD_DAYS: u32 = 3650;

// ── Allocations ──────────────────────────────────────────

pub const MAX_INTERVALS_PER_HOST: usize = 100_000;
pub const DEFAULT_RESERVATION_DURATION_MIN: u32 = 5;
pub const MAX_RESERVATION_DURATION_MIN: u32 = 60;

// ── Queries ──────────────────────────────────────────────

pub const MAX_QUERY_WINDOW_MS: Ms = 93 * DAY_MS;
pub const MAX_DYNAMIC_USERS: usize = 32;
pub const DYNAMIC_EVENT_LENGTH_MIN: u32 = 30;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

// ── WAL ──────────────────────────────────────────────────

pub const MAX_WAL_ENTRY_BYTES: usize = 16 * 1024 * 1024;
