use std::collections::{BTreeMap, HashMap};

use chrono::Duration;
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;
use crate::time::{local_date, local_to_utc, LimitPeriod};

// ── Interval arithmetic ───────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

// ── Working hours ─────────────────────────────────────────────────

/// UTC spans of a schedule's working hours for every local date touching `range`,
/// merged. Windows that miss `range` entirely are dropped.
pub fn working_windows(schedule: &Schedule, range: &Span) -> Vec<Span> {
    let tz = schedule.time_zone;
    let first = local_date(tz, range.start) - Duration::days(1);
    let last = local_date(tz, range.end);

    let mut spans = Vec::new();
    for date in first.iter_days().take_while(|d| *d <= last) {
        for window in schedule.windows_on(date) {
            let start = local_to_utc(tz, date, window.start);
            let end = local_to_utc(tz, date, window.end);
            if start < end && start < range.end && end > range.start {
                spans.push(Span::new(start, end));
            }
        }
    }
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Times that govern one event type's slots, in milliseconds.
#[derive(Debug, Clone)]
pub struct SlotRules {
    pub event_type_id: Ulid,
    pub duration: Ms,
    pub step: Ms,
    pub notice: Ms,
    pub before: Ms,
    pub after: Ms,
    pub seats: Option<u32>,
    pub period: Period,
    pub limits: BookingLimits,
}

impl SlotRules {
    pub fn new(event_type: &EventType, duration_min: u32) -> Self {
        let (before, after) = event_type.buffers_ms();
        Self {
            event_type_id: event_type.id,
            duration: minutes(duration_min),
            step: event_type.step_ms(),
            notice: minutes(event_type.minimum_booking_notice),
            before,
            after,
            seats: event_type.seats_per_time_slot,
            period: event_type.period,
            limits: event_type.booking_limits,
        }
    }

    /// The slot widened by this event type's buffers.
    pub fn footprint(&self, start: Ms) -> Span {
        Span::new(start - self.before, start + self.duration + self.after)
    }
}

/// Candidate starts: each window's beginning plus whole steps, while the
/// slot still fits the window. Only starts in `[range.start, range.end)` and
/// not before `earliest` are returned.
pub fn candidate_starts(windows: &[Span], range: &Span, rules: &SlotRules, earliest: Ms) -> Vec<Ms> {
    let lower = range.start.max(earliest);
    let step = rules.step.max(1);
    let mut starts = Vec::new();
    for w in windows {
        let mut s = w.start;
        if s < lower {
            s += (lower - s + step - 1) / step * step;
        }
        while s < range.end && s + rules.duration <= w.end {
            starts.push(s);
            s += step;
        }
    }
    starts.dedup();
    starts
}

pub fn period_allows(period: &Period, tz: Tz, now: Ms, start: Ms) -> bool {
    match period {
        Period::Unlimited => true,
        Period::Rolling { days } => {
            local_date(tz, start) <= local_date(tz, now) + Duration::days(i64::from(*days))
        }
        Period::Range { start_date, end_date } => {
            let date = local_date(tz, start);
            *start_date <= date && date <= *end_date
        }
    }
}

fn limit_for(limits: &BookingLimits, period: LimitPeriod) -> Option<u32> {
    match period {
        LimitPeriod::Day => limits.per_day,
        LimitPeriod::Week => limits.per_week,
        LimitPeriod::Month => limits.per_month,
        LimitPeriod::Year => limits.per_year,
    }
}

/// Accepted bookings of one event type bucketed by local calendar period.
pub struct LimitCounter {
    tz: Tz,
    counts: HashMap<(u8, (i32, u32)), u32>,
}

impl LimitCounter {
    pub fn new(tz: Tz, booked_starts: &[Ms]) -> Self {
        let mut counts = HashMap::new();
        for &start in booked_starts {
            let date = local_date(tz, start);
            for (i, period) in LimitPeriod::ALL.iter().enumerate() {
                *counts.entry((i as u8, period.key(date))).or_insert(0) += 1;
            }
        }
        Self { tz, counts }
    }

    pub fn allows(&self, limits: &BookingLimits, start: Ms) -> bool {
        let date = local_date(self.tz, start);
        LimitPeriod::ALL.iter().enumerate().all(|(i, period)| {
            match limit_for(limits, *period) {
                None => true,
                Some(max) => {
                    let used = self
                        .counts
                        .get(&(i as u8, period.key(date)))
                        .copied()
                        .unwrap_or(0);
                    used < max
                }
            }
        })
    }
}

// ── Busy time and seats ───────────────────────────────────────────

/// Outcome of checking one start against one host's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Free,
    /// Seated slot with room left.
    Seats(SeatInfo),
    Booked(Ulid),
    Reserved(Ulid),
    /// Seated slot at capacity.
    Full(SeatInfo),
}

impl Verdict {
    pub fn seats(&self) -> Option<SeatInfo> {
        match self {
            Verdict::Seats(info) | Verdict::Full(info) => Some(*info),
            _ => None,
        }
    }
}

/// Check a start against a host's allocations. Allocations in `exclude`
/// and reservations released at or before `now` are ignored. For seated
/// rules, same-event-type allocations starting exactly at `start` count
/// as taken seats instead of conflicts.
pub fn evaluate_slot(
    host: &HostState,
    rules: &SlotRules,
    start: Ms,
    now: Ms,
    exclude: &[Ulid],
) -> Verdict {
    let footprint = rules.footprint(start);
    let mut booked = 0u32;
    let mut booking_id = None;

    for interval in host.overlapping(&footprint) {
        if exclude.contains(&interval.id) || !interval.is_active(now) {
            continue;
        }
        let seat_mate = rules.seats.is_some()
            && interval.event_type_id() == rules.event_type_id
            && interval.span.start == start;
        match interval.kind {
            IntervalKind::Booking { attendees, .. } if seat_mate => {
                booked += attendees;
                booking_id = Some(interval.id);
            }
            IntervalKind::Reservation { is_seat: true, .. } if seat_mate => booked += 1,
            IntervalKind::Booking { .. } => return Verdict::Booked(interval.id),
            IntervalKind::Reservation { .. } => return Verdict::Reserved(interval.id),
        }
    }

    match rules.seats {
        None => Verdict::Free,
        Some(total) => {
            let info = SeatInfo {
                booked,
                total,
                booking_id,
            };
            if booked >= total {
                Verdict::Full(info)
            } else {
                Verdict::Seats(info)
            }
        }
    }
}

// ── Slot assembly ─────────────────────────────────────────────────

pub type HostSlots = Vec<(Ms, Option<SeatInfo>)>;

/// Bookable starts for one host within `range`, in order.
pub fn host_slots(
    schedule: &Schedule,
    host: &HostState,
    rules: &SlotRules,
    range: &Span,
    now: Ms,
    exclude: &[Ulid],
    booked_starts: &[Ms],
) -> HostSlots {
    let tz = schedule.time_zone;
    let windows = working_windows(schedule, range);
    let counter = (!rules.limits.is_empty()).then(|| LimitCounter::new(tz, booked_starts));
    let within_limits = |s: Ms| counter.as_ref().is_none_or(|c| c.allows(&rules.limits, s));

    let mut slots = Vec::new();
    for s in candidate_starts(&windows, range, rules, now + rules.notice) {
        if !period_allows(&rules.period, tz, now, s) {
            continue;
        }
        match evaluate_slot(host, rules, s, now, exclude) {
            Verdict::Free if within_limits(s) => slots.push((s, None)),
            // Joining an existing seated booking does not add a booking.
            Verdict::Seats(info) if info.booking_id.is_some() || within_limits(s) => {
                slots.push((s, Some(info)))
            }
            _ => {}
        }
    }
    slots
}

/// Round-robin keeps a start if any host has it; collective only if all do.
/// Seat details come from the first host listing the start.
pub fn combine_hosts(per_host: Vec<HostSlots>, scheduling: SchedulingType) -> HostSlots {
    let hosts = per_host.len();
    if hosts == 1 {
        return per_host.into_iter().next().unwrap_or_default();
    }

    let mut merged: BTreeMap<Ms, (usize, Option<SeatInfo>)> = BTreeMap::new();
    for slots in per_host {
        for (start, seats) in slots {
            let entry = merged.entry(start).or_insert((0, seats));
            entry.0 += 1;
        }
    }
    merged
        .into_iter()
        .filter(|(_, (count, _))| match scheduling {
            SchedulingType::RoundRobin => true,
            SchedulingType::Collective => *count == hosts,
        })
        .map(|(start, (_, seats))| (start, seats))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Weekday};
    use chrono_tz::{America::New_York, UTC};

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    /// 2030-01-07T00:00:00Z, a Monday.
    const MON: Ms = 1_893_974_400_000;

    fn hm(h: u16, m: u16) -> MinuteOfDay {
        MinuteOfDay::hm(h, m).unwrap()
    }

    fn weekday_schedule(tz: Tz, start: MinuteOfDay, end: MinuteOfDay) -> Schedule {
        Schedule {
            id: Ulid::new(),
            user_id: Ulid::new(),
            name: None,
            time_zone: tz,
            availability: vec![Availability {
                days: vec![
                    Weekday::Mon,
                    Weekday::Tue,
                    Weekday::Wed,
                    Weekday::Thu,
                    Weekday::Fri,
                ],
                start,
                end,
            }],
            overrides: vec![],
        }
    }

    fn event_type(length: u32) -> EventType {
        EventType::new(Ulid::new(), "intro", Owner::User(Ulid::new()), length)
    }

    fn booking_on(host: &mut HostState, et: &EventType, start: Ms, attendees: u32) -> Ulid {
        let (before, after) = et.buffers_ms();
        let booking = Booking {
            id: Ulid::new(),
            event_type_id: et.id,
            host_ids: vec![host.user_id],
            span: Span::new(start, start + minutes(et.length)),
            attendees,
            buffer_before: before,
            buffer_after: after,
            status: BookingStatus::Accepted,
            created_at: 0,
        };
        host.insert_interval(Interval::for_booking(&booking));
        booking.id
    }

    fn reservation_on(host: &mut HostState, et: &EventType, start: Ms, release_at: Ms, is_seat: bool) -> Ulid {
        let r = SlotReservation {
            uid: Ulid::new(),
            event_type_id: et.id,
            host_ids: vec![host.user_id],
            span: Span::new(start, start + minutes(et.length)),
            reservation_duration: 5,
            release_at,
            is_seat,
            created_by: None,
        };
        host.insert_interval(Interval::for_reservation(&r));
        r.uid
    }

    #[test]
    fn merge_adjacent_and_overlapping() {
        let merged = merge_overlapping(&[Span::new(0, 10), Span::new(10, 20), Span::new(15, 30), Span::new(40, 50)]);
        assert_eq!(merged, vec![Span::new(0, 30), Span::new(40, 50)]);
    }

    #[test]
    fn windows_follow_schedule_zone() {
        let schedule = weekday_schedule(New_York, hm(9, 0), hm(17, 0));
        let windows = working_windows(&schedule, &Span::new(MON, MON + 24 * H));
        // 09:00-17:00 EST is 14:00-22:00Z. Friday's window ends before Monday starts.
        assert_eq!(windows, vec![Span::new(MON + 14 * H, MON + 22 * H)]);
    }

    #[test]
    fn windows_join_across_midnight() {
        let mut schedule = weekday_schedule(UTC, hm(20, 0), MinuteOfDay::END_OF_DAY);
        schedule.availability.push(Availability {
            days: vec![Weekday::Tue],
            start: MinuteOfDay::MIDNIGHT,
            end: hm(2, 0),
        });
        let windows = working_windows(&schedule, &Span::new(MON, MON + 2 * 24 * H));
        assert_eq!(windows[0], Span::new(MON + 20 * H, MON + 26 * H));
    }

    #[test]
    fn override_removes_day() {
        let mut schedule = weekday_schedule(UTC, hm(9, 0), hm(17, 0));
        schedule.overrides.push(DateOverride {
            date: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
            windows: vec![],
        });
        assert!(working_windows(&schedule, &Span::new(MON, MON + 24 * H)).is_empty());
    }

    #[test]
    fn candidates_step_from_window_start() {
        let mut et = event_type(30);
        et.slot_interval = Some(45);
        let rules = SlotRules::new(&et, 30);
        let window = [Span::new(MON + 9 * H, MON + 11 * H)];
        let starts = candidate_starts(&window, &Span::new(MON, MON + 24 * H), &rules, 0);
        // 09:00, 09:45, 10:30 (10:30 + 30 = 11:00 still fits).
        assert_eq!(starts, vec![MON + 9 * H, MON + 9 * H + 45 * M, MON + 10 * H + 30 * M]);
    }

    #[test]
    fn candidates_respect_range_and_notice() {
        let rules = SlotRules::new(&event_type(30), 30);
        let window = [Span::new(MON + 9 * H, MON + 12 * H)];
        let range = Span::new(MON + 10 * H, MON + 11 * H);
        let starts = candidate_starts(&window, &range, &rules, MON + 10 * H + 1);
        assert_eq!(starts, vec![MON + 10 * H + 30 * M]);
    }

    #[test]
    fn buffered_booking_blocks_neighbours() {
        let mut et = event_type(30);
        et.before_event_buffer = 15;
        et.after_event_buffer = 15;
        let rules = SlotRules::new(&et, 30);
        let mut host = HostState::new(Ulid::new());
        let id = booking_on(&mut host, &et, MON + 10 * H, 1);

        // 10:30 slot needs 10:15-11:15; the booking is busy 09:45-10:45.
        assert_eq!(evaluate_slot(&host, &rules, MON + 10 * H + 30 * M, 0, &[]), Verdict::Booked(id));
        // 11:00 slot needs 10:45-11:45; adjacent, so free.
        assert_eq!(evaluate_slot(&host, &rules, MON + 11 * H, 0, &[]), Verdict::Free);
        assert_eq!(evaluate_slot(&host, &rules, MON + 10 * H, 0, &[id]), Verdict::Free);
    }

    #[test]
    fn expired_reservation_is_ignored() {
        let et = event_type(30);
        let rules = SlotRules::new(&et, 30);
        let mut host = HostState::new(Ulid::new());
        let uid = reservation_on(&mut host, &et, MON + 9 * H, 1_000, false);
        assert_eq!(evaluate_slot(&host, &rules, MON + 9 * H, 999, &[]), Verdict::Reserved(uid));
        assert_eq!(evaluate_slot(&host, &rules, MON + 9 * H, 1_000, &[]), Verdict::Free);
    }

    #[test]
    fn seats_accumulate_until_full() {
        let mut et = event_type(60);
        et.seats_per_time_slot = Some(3);
        let rules = SlotRules::new(&et, 60);
        let mut host = HostState::new(Ulid::new());
        let start = MON + 9 * H;
        let bid = booking_on(&mut host, &et, start, 2);

        let verdict = evaluate_slot(&host, &rules, start, 0, &[]);
        assert_eq!(
            verdict,
            Verdict::Seats(SeatInfo {
                booked: 2,
                total: 3,
                booking_id: Some(bid)
            })
        );
        assert_eq!(verdict.seats().unwrap().remaining(), 1);

        reservation_on(&mut host, &et, start, i64::MAX, true);
        assert!(matches!(evaluate_slot(&host, &rules, start, 0, &[]), Verdict::Full(_)));

        // A different start overlapping the seated booking is still a conflict.
        assert_eq!(evaluate_slot(&host, &rules, start + 30 * M, 0, &[]), Verdict::Booked(bid));
    }

    #[test]
    fn rolling_and_range_periods() {
        let rolling = Period::Rolling { days: 2 };
        assert!(period_allows(&rolling, UTC, MON, MON + 2 * 24 * H + 23 * H));
        assert!(!period_allows(&rolling, UTC, MON, MON + 3 * 24 * H));

        let range = Period::Range {
            start_date: NaiveDate::from_ymd_opt(2030, 1, 8).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2030, 1, 8).unwrap(),
        };
        assert!(!period_allows(&range, UTC, 0, MON + 9 * H));
        assert!(period_allows(&range, UTC, 0, MON + 24 * H + 9 * H));
    }

    #[test]
    fn daily_limit_counts_local_dates() {
        let limits = BookingLimits {
            per_day: Some(1),
            ..Default::default()
        };
        // A booking at 02:00Z Tuesday is still Monday evening in New York.
        let counter = LimitCounter::new(New_York, &[MON + 26 * H]);
        assert!(!counter.allows(&limits, MON + 20 * H));
        assert!(counter.allows(&limits, MON + 24 * H + 14 * H));
    }

    #[test]
    fn host_slots_apply_every_rule() {
        let mut et = event_type(60);
        et.booking_limits.per_day = Some(2);
        let schedule = weekday_schedule(UTC, hm(9, 0), hm(13, 0));
        let rules = SlotRules::new(&et, 60);
        let mut host = HostState::new(schedule.user_id);
        booking_on(&mut host, &et, MON + 10 * H, 1);

        let range = Span::new(MON, MON + 24 * H);
        let slots = host_slots(&schedule, &host, &rules, &range, 0, &[], &[MON + 10 * H]);
        let starts: Vec<Ms> = slots.iter().map(|(s, _)| *s).collect();
        assert_eq!(starts, vec![MON + 9 * H, MON + 11 * H, MON + 12 * H]);

        // Second booking on the day reaches the daily limit.
        let full_day = host_slots(&schedule, &host, &rules, &range, 0, &[], &[MON + 10 * H, MON + 12 * H]);
        assert!(full_day.is_empty());
    }

    #[test]
    fn combine_union_and_intersection() {
        let a = vec![(1, None), (2, None)];
        let b = vec![(2, None), (3, None)];
        let union = combine_hosts(vec![a.clone(), b.clone()], SchedulingType::RoundRobin);
        assert_eq!(union.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![1, 2, 3]);
        let both = combine_hosts(vec![a, b], SchedulingType::Collective);
        assert_eq!(both, vec![(2, None)]);
    }
}
