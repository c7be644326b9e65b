use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Unix milliseconds. Every instant in the engine is one of these.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Convert a minute count from event-type settings to milliseconds.
pub fn minutes(m: u32) -> Ms {
    Ms::from(m) * MINUTE_MS
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Widen by `before` on the left and `after` on the right.
    pub fn padded(&self, before: Ms, after: Ms) -> Span {
        Span::new(self.start - before, self.end + after)
    }
}

// ── Schedules ────────────────────────────────────────────────────

/// Minutes since local midnight, `0..=1440`. `24:00` is the following midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MinuteOfDay(u16);

impl MinuteOfDay {
    pub const MIDNIGHT: MinuteOfDay = MinuteOfDay(0);
    pub const END_OF_DAY: MinuteOfDay = MinuteOfDay(1440);

    pub fn new(minutes: u16) -> Option<Self> {
        (minutes <= 1440).then_some(Self(minutes))
    }

    pub fn hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::new(hour * 60 + minute)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u32 {
        u32::from(self.0 / 60)
    }

    pub fn minute(self) -> u32 {
        u32::from(self.0 % 60)
    }
}

impl fmt::Display for MinuteOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for MinuteOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got {s:?}"))?;
        let hour: u16 = h.parse().map_err(|_| format!("bad hour in {s:?}"))?;
        let minute: u16 = m.parse().map_err(|_| format!("bad minute in {s:?}"))?;
        MinuteOfDay::hm(hour, minute).ok_or_else(|| format!("time of day out of range: {s:?}"))
    }
}

impl Serialize for MinuteOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MinuteOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A local wall-clock window within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: MinuteOfDay,
    pub end: MinuteOfDay,
}

/// Weekly recurring working hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub days: Vec<Weekday>,
    pub start: MinuteOfDay,
    pub end: MinuteOfDay,
}

/// Replaces the weekly rules for one local date. No windows means the day is off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverride {
    pub date: NaiveDate,
    #[serde(default)]
    pub windows: Vec<TimeWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Ulid,
    pub user_id: Ulid,
    pub name: Option<String>,
    pub time_zone: Tz,
    pub availability: Vec<Availability>,
    pub overrides: Vec<DateOverride>,
}

impl Schedule {
    /// Working windows for a local date: the override if one exists, otherwise
    /// every weekly rule that names the date's weekday.
    pub fn windows_on(&self, date: NaiveDate) -> Vec<TimeWindow> {
        use chrono::Datelike;

        if let Some(o) = self.overrides.iter().find(|o| o.date == date) {
            return o.windows.clone();
        }
        let weekday = date.weekday();
        self.availability
            .iter()
            .filter(|a| a.days.contains(&weekday))
            .map(|a| TimeWindow {
                start: a.start,
                end: a.end,
            })
            .collect()
    }
}

// ── Directory ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub username: String,
    pub default_schedule_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: Ulid,
    /// The organization this team belongs to, if any.
    pub parent_id: Option<Ulid>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: Ulid,
    pub team_id: Ulid,
    pub accepted: bool,
}

// ── Event types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Owner {
    User(Ulid),
    Team(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchedulingType {
    /// Any single free host can take the slot.
    #[default]
    RoundRobin,
    /// Every host must be free.
    Collective,
}

impl SchedulingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingType::RoundRobin => "round_robin",
            SchedulingType::Collective => "collective",
        }
    }
}

impl FromStr for SchedulingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round_robin" | "roundrobin" => Ok(SchedulingType::RoundRobin),
            "collective" => Ok(SchedulingType::Collective),
            other => Err(format!("unknown scheduling type: {other}")),
        }
    }
}

/// Maximum accepted bookings of one event type per calendar period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BookingLimits {
    #[serde(rename = "PER_DAY", default)]
    pub per_day: Option<u32>,
    #[serde(rename = "PER_WEEK", default)]
    pub per_week: Option<u32>,
    #[serde(rename = "PER_MONTH", default)]
    pub per_month: Option<u32>,
    #[serde(rename = "PER_YEAR", default)]
    pub per_year: Option<u32>,
}

impl BookingLimits {
    pub fn is_empty(&self) -> bool {
        self.per_day.is_none()
            && self.per_week.is_none()
            && self.per_month.is_none()
            && self.per_year.is_none()
    }
}

/// How far into the future an event type can be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Period {
    #[default]
    Unlimited,
    /// Up to `days` calendar days after today, in the schedule's zone.
    Rolling { days: u32 },
    /// Inclusive local date range.
    Range { start_date: NaiveDate, end_date: NaiveDate },
}

/// Text form: `unlimited`, `rolling:<days>` or `range:<start>..<end>`.
impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Unlimited => f.write_str("unlimited"),
            Period::Rolling { days } => write!(f, "rolling:{days}"),
            Period::Range { start_date, end_date } => write!(f, "range:{start_date}..{end_date}"),
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Period::Unlimited);
        }
        if let Some(days) = s.strip_prefix("rolling:") {
            let days = days.parse().map_err(|_| format!("bad rolling period: {s}"))?;
            return Ok(Period::Rolling { days });
        }
        if let Some(range) = s.strip_prefix("range:")
            && let Some((start, end)) = range.split_once("..")
        {
            let parse = |d: &str| {
                NaiveDate::parse_from_str(d, "%Y-%m-%d").map_err(|_| format!("bad period date: {d}"))
            };
            return Ok(Period::Range {
                start_date: parse(start)?,
                end_date: parse(end)?,
            });
        }
        Err(format!("unknown period: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub id: Ulid,
    pub slug: String,
    pub owner: Owner,
    /// Default duration in minutes.
    pub length: u32,
    /// Step between candidate starts, in minutes. Defaults to `length`.
    pub slot_interval: Option<u32>,
    pub minimum_booking_notice: u32,
    pub before_event_buffer: u32,
    pub after_event_buffer: u32,
    pub seats_per_time_slot: Option<u32>,
    pub multiple_duration: Option<Vec<u32>>,
    /// Schedule locked to this event type (user-owned only).
    pub schedule_id: Option<Ulid>,
    pub hosts: Vec<Ulid>,
    pub scheduling_type: SchedulingType,
    pub booking_limits: BookingLimits,
    pub period: Period,
}

impl EventType {
    /// A user-owned event type with no extras, used as a starting point by callers.
    pub fn new(id: Ulid, slug: impl Into<String>, owner: Owner, length: u32) -> Self {
        Self {
            id,
            slug: slug.into(),
            owner,
            length,
            slot_interval: None,
            minimum_booking_notice: 0,
            before_event_buffer: 0,
            after_event_buffer: 0,
            seats_per_time_slot: None,
            multiple_duration: None,
            schedule_id: None,
            hosts: Vec::new(),
            scheduling_type: SchedulingType::default(),
            booking_limits: BookingLimits::default(),
            period: Period::default(),
        }
    }

    pub fn is_seated(&self) -> bool {
        self.seats_per_time_slot.is_some()
    }

    pub fn step_ms(&self) -> Ms {
        minutes(self.slot_interval.unwrap_or(self.length).max(1))
    }

    pub fn buffers_ms(&self) -> (Ms, Ms) {
        (
            minutes(self.before_event_buffer),
            minutes(self.after_event_buffer),
        )
    }

    /// Users whose calendars this event type books against, in host order.
    pub fn host_ids(&self) -> Vec<Ulid> {
        match self.owner {
            Owner::User(uid) => vec![uid],
            Owner::Team(_) => self.hosts.clone(),
        }
    }
}

// ── Allocations ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Accepted,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Accepted => "accepted",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accepted" => Ok(BookingStatus::Accepted),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub event_type_id: Ulid,
    pub host_ids: Vec<Ulid>,
    pub span: Span,
    /// Seats taken. Always 1 for non-seated event types.
    pub attendees: u32,
    /// Buffers captured from the event type at confirmation.
    pub buffer_before: Ms,
    pub buffer_after: Ms,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    /// The span the hosts are considered unavailable for.
    pub fn busy_span(&self) -> Span {
        self.span.padded(self.buffer_before, self.buffer_after)
    }
}

/// A short-lived hold on a slot while a booker checks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReservation {
    pub uid: Ulid,
    pub event_type_id: Ulid,
    pub host_ids: Vec<Ulid>,
    pub span: Span,
    /// Minutes the hold was granted for.
    pub reservation_duration: u32,
    pub release_at: Ms,
    pub is_seat: bool,
    pub created_by: Option<Ulid>,
}

impl SlotReservation {
    pub fn is_active(&self, now: Ms) -> bool {
        self.release_at > now
    }
}

// ── Host calendars ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalKind {
    Booking { event_type_id: Ulid, attendees: u32 },
    Reservation { event_type_id: Ulid, release_at: Ms, is_seat: bool },
}

/// One allocation on a host's calendar. Bookings and reservations are both intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    /// Booking id or reservation uid.
    pub id: Ulid,
    /// The booked or held time.
    pub span: Span,
    /// `span` widened by the allocation's buffers.
    pub busy: Span,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn for_booking(booking: &Booking) -> Self {
        Self {
            id: booking.id,
            span: booking.span,
            busy: booking.busy_span(),
            kind: IntervalKind::Booking {
                event_type_id: booking.event_type_id,
                attendees: booking.attendees,
            },
        }
    }

    pub fn for_reservation(r: &SlotReservation) -> Self {
        Self {
            id: r.uid,
            span: r.span,
            busy: r.span,
            kind: IntervalKind::Reservation {
                event_type_id: r.event_type_id,
                release_at: r.release_at,
                is_seat: r.is_seat,
            },
        }
    }

    /// Expired reservations are inert; bookings are always active.
    pub fn is_active(&self, now: Ms) -> bool {
        match self.kind {
            IntervalKind::Booking { .. } => true,
            IntervalKind::Reservation { release_at, .. } => release_at > now,
        }
    }

    pub fn event_type_id(&self) -> Ulid {
        match self.kind {
            IntervalKind::Booking { event_type_id, .. }
            | IntervalKind::Reservation { event_type_id, .. } => event_type_id,
        }
    }
}

/// One user's calendar of allocations.
#[derive(Debug, Clone)]
pub struct HostState {
    pub user_id: Ulid,
    /// Bookings and reservations, sorted by `busy.start`.
    pub intervals: Vec<Interval>,
}

impl HostState {
    pub fn new(user_id: Ulid) -> Self {
        Self {
            user_id,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by busy.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .partition_point(|i| i.busy.start <= interval.busy.start);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Intervals whose busy span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .intervals
            .partition_point(|i| i.busy.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.busy.end > query.start)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Every state change, flat. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated { user: User },
    UserUpdated { user: User },
    UserDeleted { id: Ulid },
    TeamCreated { team: Team },
    TeamDeleted { id: Ulid },
    MembershipSet { membership: Membership },
    MembershipRemoved { user_id: Ulid, team_id: Ulid },
    ScheduleSaved { schedule: Schedule },
    ScheduleDeleted { id: Ulid },
    EventTypeSaved { event_type: EventType },
    EventTypeDeleted { id: Ulid },
    ReservationPlaced { reservation: SlotReservation },
    ReservationUpdated { reservation: SlotReservation },
    ReservationReleased { uid: Ulid, host_ids: Vec<Ulid> },
    /// `consumed` names a reservation released by the same write.
    BookingConfirmed { booking: Booking, consumed: Option<Ulid> },
    SeatAdded { booking_id: Ulid, attendees: u32, consumed: Option<Ulid> },
    BookingRescheduled { id: Ulid, span: Span },
    BookingCancelled { id: Ulid },
}

// ── Query types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotFormat {
    /// Start instants only.
    #[default]
    Time,
    /// Start and end instants.
    Range,
}

impl FromStr for SlotFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "time" => Ok(SlotFormat::Time),
            "range" => Ok(SlotFormat::Range),
            other => Err(format!("unknown slot format: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotTarget {
    EventType(Ulid),
    Slug { username: String, slug: String },
    /// Ad-hoc collective meeting across several users.
    Dynamic { usernames: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotsQuery {
    pub target: SlotTarget,
    pub start: Ms,
    pub end: Ms,
    pub duration: Option<u32>,
    pub time_zone: Option<Tz>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatInfo {
    pub booked: u32,
    pub total: u32,
    pub booking_id: Option<Ulid>,
}

impl SeatInfo {
    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.booked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
    pub seats: Option<SeatInfo>,
}

/// Slots keyed by local date in the output zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotsByDate {
    pub time_zone: Tz,
    pub days: Vec<(NaiveDate, Vec<Slot>)>,
}

impl SlotsByDate {
    pub fn slot_count(&self) -> usize {
        self.days.iter().map(|(_, s)| s.len()).sum()
    }

    pub fn all_starts(&self) -> Vec<Ms> {
        self.days
            .iter()
            .flat_map(|(_, s)| s.iter().map(|slot| slot.start))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveSlotInput {
    pub event_type_id: Ulid,
    pub slot_start: Ms,
    pub slot_duration: Option<u32>,
    pub reservation_duration: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub slot_start: Option<Ms>,
    pub slot_duration: Option<u32>,
    pub reservation_duration: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInput {
    pub event_type_id: Ulid,
    pub start: Ms,
    pub duration: Option<u32>,
    pub reservation_uid: Option<Ulid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking_interval(start: Ms, end: Ms) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(start, end),
            busy: Span::new(start, end),
            kind: IntervalKind::Booking {
                event_type_id: Ulid::new(),
                attendees: 1,
            },
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.overlaps(&Span::new(199, 300)));
        assert!(!s.overlaps(&Span::new(200, 300))); // half-open
    }

    #[test]
    fn span_overlap_and_padding() {
        let a = Span::new(100, 200);
        let c = Span::new(200, 300);
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(a.padded(0, 1).overlaps(&c));
        assert_eq!(a.padded(10, 20), Span::new(90, 220));
    }

    #[test]
    fn minute_of_day_parses_and_prints() {
        let t: MinuteOfDay = "09:30".parse().unwrap();
        assert_eq!(t.minutes(), 570);
        assert_eq!(t.to_string(), "09:30");
        assert_eq!("24:00".parse::<MinuteOfDay>().unwrap(), MinuteOfDay::END_OF_DAY);
        assert!("24:01".parse::<MinuteOfDay>().is_err());
        assert!("9h".parse::<MinuteOfDay>().is_err());
        assert!("10:75".parse::<MinuteOfDay>().is_err());
    }

    #[test]
    fn availability_json_shape() {
        let json = r#"[{"days":["Mon","Tue"],"start":"09:00","end":"17:00"}]"#;
        let rules: Vec<Availability> = serde_json::from_str(json).unwrap();
        assert_eq!(rules[0].days, vec![Weekday::Mon, Weekday::Tue]);
        assert_eq!(rules[0].end, MinuteOfDay::hm(17, 0).unwrap());
    }

    #[test]
    fn override_replaces_weekly_rules() {
        let schedule = Schedule {
            id: Ulid::new(),
            user_id: Ulid::new(),
            name: None,
            time_zone: chrono_tz::UTC,
            availability: vec![Availability {
                days: vec![Weekday::Wed],
                start: MinuteOfDay::hm(9, 0).unwrap(),
                end: MinuteOfDay::hm(17, 0).unwrap(),
            }],
            overrides: vec![DateOverride {
                date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                windows: vec![],
            }],
        };
        // 2025-01-01 and 2025-01-08 are both Wednesdays.
        assert!(schedule
            .windows_on(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
            .is_empty());
        assert_eq!(
            schedule.windows_on(NaiveDate::from_ymd_opt(2025, 1, 8).unwrap()).len(),
            1
        );
    }

    #[test]
    fn host_intervals_sorted_by_busy_start() {
        let mut host = HostState::new(Ulid::new());
        host.insert_interval(booking_interval(300, 400));
        host.insert_interval(booking_interval(100, 200));
        host.insert_interval(booking_interval(200, 300));
        let starts: Vec<Ms> = host.intervals.iter().map(|i| i.busy.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_uses_busy_span() {
        let mut host = HostState::new(Ulid::new());
        let mut padded = booking_interval(450, 500);
        padded.busy = Span::new(400, 600);
        host.insert_interval(padded);
        host.insert_interval(booking_interval(1000, 1100));

        let hits: Vec<_> = host.overlapping(&Span::new(550, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 500));

        // Ending exactly at query.start is not overlapping (half-open).
        assert_eq!(host.overlapping(&Span::new(600, 1000)).count(), 0);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut host = HostState::new(Ulid::new());
        let intervals: Vec<Interval> = (0..3)
            .map(|i| booking_interval(i * 100, i * 100 + 50))
            .collect();
        let ids: Vec<Ulid> = intervals.iter().map(|i| i.id).collect();
        for i in intervals {
            host.insert_interval(i);
        }
        assert!(host.remove_interval(ids[1]).is_some());
        assert!(host.remove_interval(Ulid::new()).is_none());
        assert_eq!(host.intervals.len(), 2);
        assert_eq!(host.intervals[0].id, ids[0]);
        assert_eq!(host.intervals[1].id, ids[2]);
    }

    #[test]
    fn expired_reservation_is_inert() {
        let r = SlotReservation {
            uid: Ulid::new(),
            event_type_id: Ulid::new(),
            host_ids: vec![],
            span: Span::new(0, 100),
            reservation_duration: 5,
            release_at: 1_000,
            is_seat: false,
            created_by: None,
        };
        let interval = Interval::for_reservation(&r);
        assert!(interval.is_active(999));
        assert!(!interval.is_active(1_000));
        assert!(!r.is_active(1_000));
    }

    #[test]
    fn event_survives_bincode() {
        let event = Event::ScheduleSaved {
            schedule: Schedule {
                id: Ulid::new(),
                user_id: Ulid::new(),
                name: Some("Working hours".into()),
                time_zone: chrono_tz::Europe::Rome,
                availability: vec![Availability {
                    days: vec![Weekday::Mon, Weekday::Fri],
                    start: MinuteOfDay::hm(9, 0).unwrap(),
                    end: MinuteOfDay::END_OF_DAY,
                }],
                overrides: vec![],
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn period_text_forms() {
        assert_eq!("unlimited".parse::<Period>().unwrap(), Period::Unlimited);
        assert_eq!("rolling:30".parse::<Period>().unwrap(), Period::Rolling { days: 30 });
        let range: Period = "range:2030-01-01..2030-01-31".parse().unwrap();
        assert_eq!(range.to_string(), "range:2030-01-01..2030-01-31");
        assert!("rolling:soon".parse::<Period>().is_err());
        assert!("range:2030-01-01".parse::<Period>().is_err());
    }

    #[test]
    fn scheduling_type_text_forms() {
        assert_eq!("COLLECTIVE".parse::<SchedulingType>().unwrap(), SchedulingType::Collective);
        assert_eq!(SchedulingType::RoundRobin.as_str(), "round_robin");
    }
}
