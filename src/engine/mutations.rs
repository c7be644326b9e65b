use std::collections::HashSet;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, WalCommand};

fn check_name(value: &str, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{what} must not be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_optional_name(value: &Option<String>) -> Result<(), EngineError> {
    match value {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("name too long")),
        _ => Ok(()),
    }
}

fn check_minutes(value: u32, max: u32, what: &str) -> Result<(), EngineError> {
    if value > max {
        return Err(EngineError::InvalidInput(format!("{what} must be at most {max} minutes")));
    }
    Ok(())
}

fn check_window(start: MinuteOfDay, end: MinuteOfDay) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInput(format!(
            "window start {start} must be before end {end}"
        )));
    }
    Ok(())
}

fn validate_schedule_body(schedule: &Schedule) -> Result<(), EngineError> {
    check_optional_name(&schedule.name)?;
    if schedule.availability.len() > MAX_AVAILABILITY_RULES {
        return Err(EngineError::LimitExceeded("too many availability rules"));
    }
    if schedule.overrides.len() > MAX_DATE_OVERRIDES {
        return Err(EngineError::LimitExceeded("too many date overrides"));
    }
    for rule in &schedule.availability {
        if rule.days.is_empty() {
            return Err(EngineError::InvalidInput("availability rule has no days".into()));
        }
        check_window(rule.start, rule.end)?;
    }
    let mut dates = HashSet::new();
    for o in &schedule.overrides {
        if !dates.insert(o.date) {
            return Err(EngineError::InvalidInput(format!("duplicate override for {}", o.date)));
        }
        if o.windows.len() > MAX_WINDOWS_PER_OVERRIDE {
            return Err(EngineError::LimitExceeded("too many windows in override"));
        }
        for w in &o.windows {
            check_window(w.start, w.end)?;
        }
    }
    Ok(())
}

fn validate_event_type_body(et: &EventType) -> Result<(), EngineError> {
    check_name(&et.slug, "slug")?;
    if et.length == 0 || et.length > MAX_EVENT_LENGTH_MIN {
        return Err(EngineError::InvalidInput(format!(
            "length must be between 1 and {MAX_EVENT_LENGTH_MIN} minutes"
        )));
    }
    if let Some(step) = et.slot_interval
        && (step == 0 || step > MAX_EVENT_LENGTH_MIN)
    {
        return Err(EngineError::InvalidInput("slot_interval out of range".into()));
    }
    check_minutes(et.before_event_buffer, MAX_BUFFER_MIN, "before_event_buffer")?;
    check_minutes(et.after_event_buffer, MAX_BUFFER_MIN, "after_event_buffer")?;
    check_minutes(et.minimum_booking_notice, MAX_BOOKING_NOTICE_MIN, "minimum_booking_notice")?;
    if let Some(seats) = et.seats_per_time_slot
        && (seats == 0 || seats > MAX_SEATS_PER_SLOT)
    {
        return Err(EngineError::InvalidInput(format!(
            "seats_per_time_slot must be between 1 and {MAX_SEATS_PER_SLOT}"
        )));
    }
    if let Some(lengths) = &et.multiple_duration {
        if lengths.is_empty() || lengths.len() > MAX_MULTIPLE_DURATIONS {
            return Err(EngineError::InvalidInput("multiple_duration must list 1 to 16 lengths".into()));
        }
        if lengths.iter().any(|&l| l == 0 || l > MAX_EVENT_LENGTH_MIN) {
            return Err(EngineError::InvalidInput("multiple_duration entry out of range".into()));
        }
        if !lengths.contains(&et.length) {
            return Err(EngineError::InvalidInput(
                "multiple_duration must include the default length".into(),
            ));
        }
    }
    match et.period {
        Period::Rolling { days } if days == 0 || days > MAX_ROLLING_PERIOD_DAYS => {
            return Err(EngineError::InvalidInput("rolling period out of range".into()));
        }
        Period::Range { start_date, end_date } if start_date > end_date => {
            return Err(EngineError::InvalidInput("period range ends before it starts".into()));
        }
        _ => {}
    }
    if et.hosts.len() > MAX_HOSTS_PER_EVENT_TYPE {
        return Err(EngineError::LimitExceeded("too many hosts"));
    }
    let unique: HashSet<&Ulid> = et.hosts.iter().collect();
    if unique.len() != et.hosts.len() {
        return Err(EngineError::InvalidInput("duplicate host".into()));
    }
    Ok(())
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn create_user(&self, user: User) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        if self.store.user_count() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        check_name(&user.username, "username")?;
        if self.store.get_user(&user.id).is_some() {
            return Err(EngineError::AlreadyExists(user.id.to_string()));
        }
        if self.store.user_by_username(&user.username).is_some() {
            return Err(EngineError::AlreadyExists(format!("username {}", user.username)));
        }
        if user.default_schedule_id.is_some() {
            return Err(EngineError::InvalidInput(
                "a new user has no schedules to default to".into(),
            ));
        }
        self.persist_directory(Event::UserCreated { user }).await
    }

    pub async fn update_user(&self, user: User) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        check_name(&user.username, "username")?;
        if self.store.get_user(&user.id).is_none() {
            return Err(EngineError::NotFound(user.id));
        }
        if let Some(other) = self.store.user_by_username(&user.username)
            && other.id != user.id
        {
            return Err(EngineError::AlreadyExists(format!("username {}", user.username)));
        }
        if let Some(sid) = user.default_schedule_id {
            let schedule = self.store.get_schedule(&sid).ok_or(EngineError::NotFound(sid))?;
            if schedule.user_id != user.id {
                return Err(EngineError::InvalidInput(
                    "default schedule belongs to another user".into(),
                ));
            }
        }
        self.persist_directory(Event::UserUpdated { user }).await
    }

    /// Refused while the user has allocations or appears on an event type.
    /// Their schedules and memberships go with them.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        if self.store.get_user(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let on_event_type = self
            .store
            .event_types()
            .iter()
            .any(|et| et.owner == Owner::User(id) || et.hosts.contains(&id));
        if on_event_type {
            return Err(EngineError::InUse(format!("user {id} (event types)")));
        }
        let mut guards = self.lock_hosts(&[id]).await?;
        if guards.values().any(|host| !host.intervals.is_empty()) {
            return Err(EngineError::InUse(format!("user {id} (allocations)")));
        }
        self.persist_and_apply(&mut guards, Event::UserDeleted { id }).await
    }

    // ── Teams ────────────────────────────────────────────────

    pub async fn create_team(&self, team: Team) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        if self.store.team_count() >= MAX_TEAMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many teams"));
        }
        check_optional_name(&team.name)?;
        if self.store.get_team(&team.id).is_some() {
            return Err(EngineError::AlreadyExists(team.id.to_string()));
        }
        if let Some(pid) = team.parent_id {
            if pid == team.id {
                return Err(EngineError::CycleDetected(team.id));
            }
            let mut depth = 0usize;
            let mut visited = HashSet::from([team.id]);
            let mut current = Some(pid);
            while let Some(cid) = current {
                depth += 1;
                if depth > MAX_TEAM_DEPTH {
                    return Err(EngineError::LimitExceeded("team hierarchy too deep"));
                }
                if !visited.insert(cid) {
                    return Err(EngineError::CycleDetected(cid));
                }
                let parent = self.store.get_team(&cid).ok_or(EngineError::NotFound(cid))?;
                current = parent.parent_id;
            }
        }
        self.persist_directory(Event::TeamCreated { team }).await
    }

    pub async fn delete_team(&self, id: Ulid) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        if self.store.get_team(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        if self.store.has_children(&id) {
            return Err(EngineError::HasChildren(id));
        }
        if self.store.event_types().iter().any(|et| et.owner == Owner::Team(id)) {
            return Err(EngineError::InUse(format!("team {id} (event types)")));
        }
        self.persist_directory(Event::TeamDeleted { id }).await
    }

    // ── Memberships ──────────────────────────────────────────

    pub async fn set_membership(&self, membership: Membership) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        if self.store.get_user(&membership.user_id).is_none() {
            return Err(EngineError::NotFound(membership.user_id));
        }
        if self.store.get_team(&membership.team_id).is_none() {
            return Err(EngineError::NotFound(membership.team_id));
        }
        self.persist_directory(Event::MembershipSet { membership }).await
    }

    pub async fn remove_membership(&self, user_id: Ulid, team_id: Ulid) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        if self.store.get_membership(user_id, team_id).is_none() {
            return Err(EngineError::NotFoundKey(format!("membership {user_id}/{team_id}")));
        }
        self.persist_directory(Event::MembershipRemoved { user_id, team_id }).await
    }

    // ── Schedules ────────────────────────────────────────────

    pub async fn create_schedule(&self, schedule: Schedule) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        if self.store.schedule_count() >= MAX_SCHEDULES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many schedules"));
        }
        if self.store.get_schedule(&schedule.id).is_some() {
            return Err(EngineError::AlreadyExists(schedule.id.to_string()));
        }
        if self.store.get_user(&schedule.user_id).is_none() {
            return Err(EngineError::NotFound(schedule.user_id));
        }
        validate_schedule_body(&schedule)?;
        self.persist_directory(Event::ScheduleSaved { schedule }).await
    }

    pub async fn update_schedule(&self, schedule: Schedule) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        let existing = self
            .store
            .get_schedule(&schedule.id)
            .ok_or(EngineError::NotFound(schedule.id))?;
        if existing.user_id != schedule.user_id {
            return Err(EngineError::InvalidInput("a schedule cannot change owner".into()));
        }
        validate_schedule_body(&schedule)?;
        self.persist_directory(Event::ScheduleSaved { schedule }).await
    }

    pub async fn delete_schedule(&self, id: Ulid) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        if self.store.get_schedule(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let is_default = self
            .store
            .users()
            .iter()
            .any(|u| u.default_schedule_id == Some(id));
        let is_locked = self
            .store
            .event_types()
            .iter()
            .any(|et| et.schedule_id == Some(id));
        if is_default || is_locked {
            return Err(EngineError::InUse(format!("schedule {id}")));
        }
        self.persist_directory(Event::ScheduleDeleted { id }).await
    }

    // ── Event types ──────────────────────────────────────────

    fn validate_event_type(&self, et: &EventType) -> Result<(), EngineError> {
        validate_event_type_body(et)?;
        match et.owner {
            Owner::User(uid) => {
                if self.store.get_user(&uid).is_none() {
                    return Err(EngineError::NotFound(uid));
                }
                if !et.hosts.is_empty() {
                    return Err(EngineError::InvalidInput(
                        "hosts apply to team event types only".into(),
                    ));
                }
                if let Some(sid) = et.schedule_id {
                    let schedule = self.store.get_schedule(&sid).ok_or(EngineError::NotFound(sid))?;
                    if schedule.user_id != uid {
                        return Err(EngineError::InvalidInput(
                            "locked schedule belongs to another user".into(),
                        ));
                    }
                }
            }
            Owner::Team(tid) => {
                if self.store.get_team(&tid).is_none() {
                    return Err(EngineError::NotFound(tid));
                }
                if et.schedule_id.is_some() {
                    return Err(EngineError::InvalidInput(
                        "team event types use each host's schedule".into(),
                    ));
                }
                for host in &et.hosts {
                    if self.store.get_user(host).is_none() {
                        return Err(EngineError::NotFound(*host));
                    }
                }
            }
        }
        let slug_taken = self
            .store
            .event_types()
            .iter()
            .any(|other| other.id != et.id && other.owner == et.owner && other.slug == et.slug);
        if slug_taken {
            return Err(EngineError::AlreadyExists(format!("slug {}", et.slug)));
        }
        Ok(())
    }

    pub async fn create_event_type(&self, event_type: EventType) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        if self.store.event_type_count() >= MAX_EVENT_TYPES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many event types"));
        }
        if self.store.get_event_type(&event_type.id).is_some() {
            return Err(EngineError::AlreadyExists(event_type.id.to_string()));
        }
        self.validate_event_type(&event_type)?;
        self.persist_directory(Event::EventTypeSaved { event_type }).await
    }

    /// Existing bookings keep the buffers they were confirmed with.
    pub async fn update_event_type(&self, event_type: EventType) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        let existing = self
            .store
            .get_event_type(&event_type.id)
            .ok_or(EngineError::NotFound(event_type.id))?;
        if existing.owner != event_type.owner {
            return Err(EngineError::InvalidInput("an event type cannot change owner".into()));
        }
        self.validate_event_type(&event_type)?;
        self.persist_directory(Event::EventTypeSaved { event_type }).await
    }

    pub async fn delete_event_type(&self, id: Ulid) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        if self.store.get_event_type(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        if self.store.event_type_in_use(id, now_ms()) {
            return Err(EngineError::InUse(format!("event type {id}")));
        }
        self.persist_directory(Event::EventTypeDeleted { id }).await
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL as the minimal event list for the current state.
    /// Every lock is held so no write can slip between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        let host_ids: Vec<Ulid> = self.store.users().iter().map(|u| u.id).collect();
        let _guards = self.lock_hosts(&host_ids).await?;
        let events = self.store.snapshot();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
