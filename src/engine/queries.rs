use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::{adjust_end_time, local_date};

use super::availability::{combine_hosts, host_slots, SlotRules};
use super::conflict::{now_ms, resolve_duration, validate_instant, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Find the event type a slot query refers to. Dynamic groups get a
    /// synthetic collective event type hosted by every listed user.
    pub(super) fn resolve_target(
        &self,
        target: &SlotTarget,
        duration: Option<u32>,
    ) -> Result<(EventType, bool), EngineError> {
        match target {
            SlotTarget::EventType(id) => self
                .store
                .get_event_type(id)
                .map(|et| (et, false))
                .ok_or(EngineError::NotFound(*id)),
            SlotTarget::Slug { username, slug } => self
                .event_type_by_slug(username, slug)
                .map(|et| (et, false)),
            SlotTarget::Dynamic { usernames } => {
                if usernames.is_empty() {
                    return Err(EngineError::InvalidInput("no usernames given".into()));
                }
                if usernames.len() > MAX_DYNAMIC_USERS {
                    return Err(EngineError::LimitExceeded("too many users in dynamic group"));
                }
                let mut hosts = Vec::with_capacity(usernames.len());
                for name in usernames {
                    let user = self
                        .store
                        .user_by_username(name)
                        .ok_or_else(|| EngineError::NotFoundKey(format!("user {name}")))?;
                    if !hosts.contains(&user.id) {
                        hosts.push(user.id);
                    }
                }
                let length = duration.unwrap_or(DYNAMIC_EVENT_LENGTH_MIN);
                let mut et = EventType::new(Ulid::nil(), "dynamic", Owner::Team(Ulid::nil()), length);
                et.hosts = hosts;
                et.scheduling_type = SchedulingType::Collective;
                Ok((et, true))
            }
        }
    }

    /// A user-owned event type by its owner's username and its slug.
    pub fn event_type_by_slug(&self, username: &str, slug: &str) -> Result<EventType, EngineError> {
        let user = self
            .store
            .user_by_username(username)
            .ok_or_else(|| EngineError::NotFoundKey(format!("user {username}")))?;
        self.store
            .event_types()
            .into_iter()
            .find(|et| et.owner == Owner::User(user.id) && et.slug == slug)
            .ok_or_else(|| EngineError::NotFoundKey(format!("event type {username}/{slug}")))
    }

    /// The schedule that governs a host's hours for an event type: the
    /// event type's locked schedule, else the host's default.
    pub(super) fn schedule_for(&self, event_type: &EventType, host_id: Ulid) -> Option<Schedule> {
        if let Owner::User(_) = event_type.owner
            && let Some(schedule_id) = event_type.schedule_id
        {
            return self.store.get_schedule(&schedule_id);
        }
        let user = self.store.get_user(&host_id)?;
        self.store.get_schedule(&user.default_schedule_id?)
    }

    pub async fn get_available_slots(&self, query: &SlotsQuery) -> Result<SlotsByDate, EngineError> {
        self.available_slots_at(query, now_ms()).await
    }

    pub(crate) async fn available_slots_at(
        &self,
        query: &SlotsQuery,
        now: Ms,
    ) -> Result<SlotsByDate, EngineError> {
        validate_instant(query.start)?;
        validate_instant(query.end)?;
        let end = adjust_end_time(query.end);
        if end <= query.start {
            return Err(EngineError::InvalidInput("end must be after start".into()));
        }
        if end - query.start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let range = Span::new(query.start, end);
        validate_span(&range)?;

        let (event_type, dynamic) = self.resolve_target(&query.target, query.duration)?;
        let duration = resolve_duration(&event_type, query.duration, dynamic)?;
        let rules = SlotRules::new(&event_type, duration);
        let booked_starts = if dynamic {
            Vec::new()
        } else {
            self.store.accepted_starts(event_type.id, &[])
        };

        let host_ids = event_type.host_ids();
        let mut per_host = Vec::with_capacity(host_ids.len());
        for host_id in &host_ids {
            let (Some(schedule), Some(host)) =
                (self.schedule_for(&event_type, *host_id), self.store.get_host(host_id))
            else {
                // No schedule, no hours.
                per_host.push(Vec::new());
                continue;
            };
            let guard = host.read().await;
            per_host.push(host_slots(&schedule, &guard, &rules, &range, now, &[], &booked_starts));
        }
        let combined = if per_host.is_empty() {
            Vec::new()
        } else {
            combine_hosts(per_host, event_type.scheduling_type)
        };

        let time_zone = query.time_zone.unwrap_or(chrono_tz::UTC);
        let mut days: Vec<(chrono::NaiveDate, Vec<Slot>)> = Vec::new();
        for (start, seats) in combined {
            let slot = Slot {
                start,
                end: start + rules.duration,
                seats,
            };
            let date = local_date(time_zone, start);
            match days.last_mut() {
                Some((d, slots)) if *d == date => slots.push(slot),
                _ => days.push((date, vec![slot])),
            }
        }

        let result = SlotsByDate { time_zone, days };
        metrics::counter!(crate::observability::SLOTS_SERVED_TOTAL).increment(result.slot_count() as u64);
        Ok(result)
    }

    // ── Directory reads ──────────────────────────────────────

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.store.get_user(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn list_users(&self) -> Vec<User> {
        self.store.users()
    }

    pub fn list_teams(&self) -> Vec<Team> {
        self.store.teams()
    }

    pub fn list_memberships(&self, team_id: Option<Ulid>) -> Vec<Membership> {
        self.store
            .memberships()
            .into_iter()
            .filter(|m| team_id.is_none_or(|t| m.team_id == t))
            .collect()
    }

    pub fn get_schedule(&self, id: Ulid) -> Result<Schedule, EngineError> {
        self.store.get_schedule(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn list_schedules(&self, user_id: Option<Ulid>) -> Vec<Schedule> {
        self.store
            .schedules()
            .into_iter()
            .filter(|s| user_id.is_none_or(|u| s.user_id == u))
            .collect()
    }

    pub fn get_event_type(&self, id: Ulid) -> Result<EventType, EngineError> {
        self.store.get_event_type(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn list_event_types(&self, owner: Option<Owner>) -> Vec<EventType> {
        self.store
            .event_types()
            .into_iter()
            .filter(|et| owner.is_none_or(|o| et.owner == o))
            .collect()
    }

    pub fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store.get_booking(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn list_bookings(
        &self,
        event_type_id: Option<Ulid>,
        status: Option<BookingStatus>,
    ) -> Vec<Booking> {
        self.store
            .bookings()
            .into_iter()
            .filter(|b| event_type_id.is_none_or(|id| b.event_type_id == id))
            .filter(|b| status.is_none_or(|s| b.status == s))
            .collect()
    }
}
