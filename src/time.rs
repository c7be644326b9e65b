//! Wall-clock conversions between schedule timezones and UTC milliseconds.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat,
    TimeZone,
};
use chrono_tz::Tz;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::{MinuteOfDay, Ms};

pub const DAY_MS: Ms = 86_400_000;

/// Convert a local wall-clock time on `date` to a UTC instant.
///
/// Times that fall into a DST gap are shifted forward by an hour. Times in a
/// fold resolve to the earlier of the two instants. `24:00` is midnight of the
/// following day.
pub fn local_to_utc(tz: Tz, date: NaiveDate, minute: MinuteOfDay) -> Ms {
    let (date, minute) = if minute == MinuteOfDay::END_OF_DAY {
        (date.succ_opt().unwrap_or(date), MinuteOfDay::MIDNIGHT)
    } else {
        (date, minute)
    };
    let time = NaiveTime::from_hms_opt(minute.hour(), minute.minute(), 0).unwrap_or(NaiveTime::MIN);
    resolve_local(tz, date.and_time(time))
}

fn resolve_local(tz: Tz, local: NaiveDateTime) -> Ms {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(first, second) => first.timestamp_millis().min(second.timestamp_millis()),
        LocalResult::None => {
            // Nonexistent wall time. Gaps are at most an hour in the tz database,
            // except a handful of historical transitions covered by the second try.
            for shift in [1, 2] {
                if let Some(dt) = tz.from_local_datetime(&(local + Duration::hours(shift))).earliest() {
                    return dt.timestamp_millis();
                }
            }
            local.and_utc().timestamp_millis()
        }
    }
}

/// UTC instant as a timezone-aware datetime. Out-of-range values clamp to the epoch.
pub fn to_zoned(tz: Tz, ms: Ms) -> DateTime<Tz> {
    DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .with_timezone(&tz)
}

/// Local calendar date of an instant in `tz`.
pub fn local_date(tz: Tz, ms: Ms) -> NaiveDate {
    to_zoned(tz, ms).date_naive()
}

/// RFC 3339 rendering with the zone's offset (`Z` for UTC).
pub fn format_instant(tz: Tz, ms: Ms) -> String {
    to_zoned(tz, ms).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an instant given as RFC 3339, a bare `YYYY-MM-DD` date (UTC midnight),
/// or integer Unix milliseconds. Instants outside the supported range are rejected.
pub fn parse_instant(s: &str) -> Result<Ms, String> {
    let s = s.trim();
    let ms = parse_any_instant(s).ok_or_else(|| format!("invalid timestamp: {s:?}"))?;
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(format!("timestamp out of range: {s:?}"));
    }
    Ok(ms)
}

fn parse_any_instant(s: &str) -> Option<Ms> {
    if let Ok(ms) = s.parse::<Ms>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    // PostgreSQL clients tend to send a space instead of `T`.
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s.replacen(' ', "T", 1)) {
        return Some(dt.timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN).and_utc().timestamp_millis())
}

/// A range end at exactly UTC midnight is read as the last second of that day.
pub fn adjust_end_time(end: Ms) -> Ms {
    if end.rem_euclid(DAY_MS) == 0 {
        end + DAY_MS - 1_000
    } else {
        end
    }
}

pub fn parse_time_zone(s: &str) -> Result<Tz, String> {
    s.trim()
        .parse::<Tz>()
        .map_err(|_| format!("unknown time zone: {s:?}"))
}

/// Calendar bucket used by booking limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPeriod {
    Day,
    /// ISO 8601 week.
    Week,
    Month,
    Year,
}

impl LimitPeriod {
    pub const ALL: [LimitPeriod; 4] = [
        LimitPeriod::Day,
        LimitPeriod::Week,
        LimitPeriod::Month,
        LimitPeriod::Year,
    ];

    /// Bucket key of a local date. Two dates share a bucket iff their keys match.
    pub fn key(self, date: NaiveDate) -> (i32, u32) {
        match self {
            LimitPeriod::Day => (date.year(), date.ordinal()),
            LimitPeriod::Week => {
                let iso = date.iso_week();
                (iso.year(), iso.week())
            }
            LimitPeriod::Month => (date.year(), date.month()),
            LimitPeriod::Year => (date.year(), 0),
        }
    }
}
