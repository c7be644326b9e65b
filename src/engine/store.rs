use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::SharedHostState;

/// Write guards for every host an event touches, keyed (and so locked) in id order.
pub type HostGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<HostState>>;

/// In-memory state of one tenant. Mutated only through [`Store::apply`].
pub struct Store {
    users: DashMap<Ulid, User>,
    usernames: DashMap<String, Ulid>,
    hosts: DashMap<Ulid, SharedHostState>,
    teams: DashMap<Ulid, Team>,
    /// Parent → children index.
    children: DashMap<Ulid, Vec<Ulid>>,
    memberships: DashMap<(Ulid, Ulid), Membership>,
    schedules: DashMap<Ulid, Schedule>,
    event_types: DashMap<Ulid, EventType>,
    bookings: DashMap<Ulid, Booking>,
    reservations: DashMap<Ulid, SlotReservation>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            usernames: DashMap::new(),
            hosts: DashMap::new(),
            teams: DashMap::new(),
            children: DashMap::new(),
            memberships: DashMap::new(),
            schedules: DashMap::new(),
            event_types: DashMap::new(),
            bookings: DashMap::new(),
            reservations: DashMap::new(),
        }
    }

    // ── Users and host calendars ─────────────────────────────

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn user_by_username(&self, username: &str) -> Option<User> {
        let id = *self.usernames.get(username)?.value();
        self.get_user(&id)
    }

    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    pub fn get_host(&self, id: &Ulid) -> Option<SharedHostState> {
        self.hosts.get(id).map(|e| e.value().clone())
    }

    // ── Teams and memberships ────────────────────────────────

    pub fn team_count(&self) -> usize {
        self.teams.len()
    }

    pub fn get_team(&self, id: &Ulid) -> Option<Team> {
        self.teams.get(id).map(|e| e.value().clone())
    }

    pub fn teams(&self) -> Vec<Team> {
        let mut teams: Vec<Team> = self.teams.iter().map(|e| e.value().clone()).collect();
        teams.sort_by_key(|t| t.id);
        teams
    }

    pub fn has_children(&self, team_id: &Ulid) -> bool {
        self.children
            .get(team_id)
            .is_some_and(|kids| !kids.is_empty())
    }

    pub fn get_membership(&self, user_id: Ulid, team_id: Ulid) -> Option<Membership> {
        self.memberships
            .get(&(user_id, team_id))
            .map(|e| e.value().clone())
    }

    pub fn is_accepted_member(&self, user_id: Ulid, team_id: Ulid) -> bool {
        self.memberships
            .get(&(user_id, team_id))
            .is_some_and(|m| m.accepted)
    }

    /// Teams in which the user holds an accepted membership.
    pub fn accepted_teams(&self, user_id: Ulid) -> Vec<Ulid> {
        self.memberships
            .iter()
            .filter(|e| e.key().0 == user_id && e.value().accepted)
            .map(|e| e.key().1)
            .collect()
    }

    pub fn memberships(&self) -> Vec<Membership> {
        let mut all: Vec<Membership> = self.memberships.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|m| (m.team_id, m.user_id));
        all
    }

    // ── Schedules and event types ────────────────────────────

    pub fn schedule_count(&self) -> usize {
        self.schedules.len()
    }

    pub fn get_schedule(&self, id: &Ulid) -> Option<Schedule> {
        self.schedules.get(id).map(|e| e.value().clone())
    }

    pub fn schedules(&self) -> Vec<Schedule> {
        let mut all: Vec<Schedule> = self.schedules.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn event_type_count(&self) -> usize {
        self.event_types.len()
    }

    pub fn get_event_type(&self, id: &Ulid) -> Option<EventType> {
        self.event_types.get(id).map(|e| e.value().clone())
    }

    pub fn event_types(&self) -> Vec<EventType> {
        let mut all: Vec<EventType> = self.event_types.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|et| et.id);
        all
    }

    // ── Allocations ──────────────────────────────────────────

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn bookings(&self) -> Vec<Booking> {
        let mut all: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|b| (b.span.start, b.id));
        all
    }

    /// Start instants of accepted bookings of one event type.
    pub fn accepted_starts(&self, event_type_id: Ulid, exclude: &[Ulid]) -> Vec<Ms> {
        self.bookings
            .iter()
            .filter(|e| {
                let b = e.value();
                b.event_type_id == event_type_id
                    && b.status == BookingStatus::Accepted
                    && !exclude.contains(&b.id)
            })
            .map(|e| e.value().span.start)
            .collect()
    }

    pub fn get_reservation(&self, uid: &Ulid) -> Option<SlotReservation> {
        self.reservations.get(uid).map(|e| e.value().clone())
    }

    pub fn reservations(&self) -> Vec<SlotReservation> {
        let mut all: Vec<SlotReservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|r| r.uid);
        all
    }

    /// Reservations whose hold ended before `cutoff`.
    pub fn reservations_released_before(&self, cutoff: Ms) -> Vec<SlotReservation> {
        self.reservations
            .iter()
            .filter(|e| e.value().release_at <= cutoff)
            .map(|e| e.value().clone())
            .collect()
    }

    /// True while any accepted booking or unexpired reservation references the event type.
    pub fn event_type_in_use(&self, event_type_id: Ulid, now: Ms) -> bool {
        self.bookings.iter().any(|e| {
            e.value().event_type_id == event_type_id && e.value().status == BookingStatus::Accepted
        }) || self
            .reservations
            .iter()
            .any(|e| e.value().event_type_id == event_type_id && e.value().is_active(now))
    }

    // ── Event application ────────────────────────────────────

    /// Hosts whose calendars an event changes. These must be write-locked before `apply`.
    pub fn hosts_touched(&self, event: &Event) -> Vec<Ulid> {
        match event {
            Event::ReservationPlaced { reservation } => reservation.host_ids.clone(),
            Event::ReservationUpdated { reservation } => {
                let mut ids = reservation.host_ids.clone();
                if let Some(old) = self.get_reservation(&reservation.uid) {
                    ids.extend(old.host_ids);
                }
                ids
            }
            Event::ReservationReleased { host_ids, .. } => host_ids.clone(),
            Event::BookingConfirmed { booking, consumed } => {
                let mut ids = booking.host_ids.clone();
                if let Some(r) = consumed.and_then(|uid| self.get_reservation(&uid)) {
                    ids.extend(r.host_ids);
                }
                ids
            }
            Event::SeatAdded { booking_id, consumed, .. } => {
                let mut ids = self
                    .get_booking(booking_id)
                    .map(|b| b.host_ids)
                    .unwrap_or_default();
                if let Some(r) = consumed.and_then(|uid| self.get_reservation(&uid)) {
                    ids.extend(r.host_ids);
                }
                ids
            }
            Event::BookingRescheduled { id, .. } | Event::BookingCancelled { id } => self
                .get_booking(id)
                .map(|b| b.host_ids)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub fn apply(&self, event: &Event, guards: &mut HostGuards) {
        match event {
            Event::UserCreated { user } => {
                self.usernames.insert(user.username.clone(), user.id);
                self.hosts
                    .entry(user.id)
                    .or_insert_with(|| Arc::new(RwLock::new(HostState::new(user.id))));
                self.users.insert(user.id, user.clone());
            }
            Event::UserUpdated { user } => {
                if let Some(old) = self.users.insert(user.id, user.clone())
                    && old.username != user.username
                {
                    self.usernames.remove(&old.username);
                }
                self.usernames.insert(user.username.clone(), user.id);
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    self.usernames.remove(&user.username);
                }
                self.hosts.remove(id);
                self.memberships.retain(|(uid, _), _| uid != id);
                self.schedules.retain(|_, s| s.user_id != *id);
            }
            Event::TeamCreated { team } => {
                if let Some(pid) = team.parent_id {
                    self.children.entry(pid).or_default().push(team.id);
                }
                self.teams.insert(team.id, team.clone());
            }
            Event::TeamDeleted { id } => {
                if let Some((_, team)) = self.teams.remove(id)
                    && let Some(pid) = team.parent_id
                    && let Some(mut kids) = self.children.get_mut(&pid)
                {
                    kids.retain(|c| c != id);
                }
                self.children.remove(id);
                self.memberships.retain(|(_, tid), _| tid != id);
            }
            Event::MembershipSet { membership } => {
                self.memberships
                    .insert((membership.user_id, membership.team_id), membership.clone());
            }
            Event::MembershipRemoved { user_id, team_id } => {
                self.memberships.remove(&(*user_id, *team_id));
            }
            Event::ScheduleSaved { schedule } => {
                self.schedules.insert(schedule.id, schedule.clone());
            }
            Event::ScheduleDeleted { id } => {
                self.schedules.remove(id);
            }
            Event::EventTypeSaved { event_type } => {
                self.event_types.insert(event_type.id, event_type.clone());
            }
            Event::EventTypeDeleted { id } => {
                self.event_types.remove(id);
            }
            Event::ReservationPlaced { reservation } => {
                for host_id in &reservation.host_ids {
                    if let Some(host) = guards.get_mut(host_id) {
                        host.insert_interval(Interval::for_reservation(reservation));
                    }
                }
                self.reservations.insert(reservation.uid, reservation.clone());
            }
            Event::ReservationUpdated { reservation } => {
                // The hosts may change when a round-robin hold moves.
                self.release(reservation.uid, guards);
                for host_id in &reservation.host_ids {
                    if let Some(host) = guards.get_mut(host_id) {
                        host.insert_interval(Interval::for_reservation(reservation));
                    }
                }
                self.reservations.insert(reservation.uid, reservation.clone());
            }
            Event::ReservationReleased { uid, .. } => self.release(*uid, guards),
            Event::BookingConfirmed { booking, consumed } => {
                if let Some(uid) = consumed {
                    self.release(*uid, guards);
                }
                if booking.status == BookingStatus::Accepted {
                    for host_id in &booking.host_ids {
                        if let Some(host) = guards.get_mut(host_id) {
                            host.insert_interval(Interval::for_booking(booking));
                        }
                    }
                }
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::SeatAdded {
                booking_id,
                attendees,
                consumed,
            } => {
                if let Some(uid) = consumed {
                    self.release(*uid, guards);
                }
                if let Some(mut booking) = self.bookings.get_mut(booking_id) {
                    booking.attendees = *attendees;
                    self.replace_booking_intervals(&booking, guards);
                }
            }
            Event::BookingRescheduled { id, span } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.span = *span;
                    self.replace_booking_intervals(&booking, guards);
                }
            }
            Event::BookingCancelled { id } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.status = BookingStatus::Cancelled;
                    for host_id in &booking.host_ids {
                        if let Some(host) = guards.get_mut(host_id) {
                            host.remove_interval(*id);
                        }
                    }
                }
            }
        }
    }

    fn release(&self, uid: Ulid, guards: &mut HostGuards) {
        if let Some((_, reservation)) = self.reservations.remove(&uid) {
            for host_id in &reservation.host_ids {
                if let Some(host) = guards.get_mut(host_id) {
                    host.remove_interval(uid);
                }
            }
        }
    }

    fn replace_booking_intervals(&self, booking: &Booking, guards: &mut HostGuards) {
        if booking.status != BookingStatus::Accepted {
            return;
        }
        for host_id in &booking.host_ids {
            if let Some(host) = guards.get_mut(host_id) {
                host.remove_interval(booking.id);
                host.insert_interval(Interval::for_booking(booking));
            }
        }
    }

    // ── Compaction ───────────────────────────────────────────

    /// The minimal event list that rebuilds the current state.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();

        // Parents before children so replay can index them.
        let mut teams = self.teams();
        let mut emitted = std::collections::HashSet::new();
        while !teams.is_empty() {
            let before = teams.len();
            teams.retain(|team| {
                let ready = team.parent_id.is_none_or(|pid| emitted.contains(&pid));
                if ready {
                    emitted.insert(team.id);
                    events.push(Event::TeamCreated { team: team.clone() });
                }
                !ready
            });
            if teams.len() == before {
                // Orphaned parents cannot occur through the engine; keep them anyway.
                events.extend(teams.drain(..).map(|team| Event::TeamCreated { team }));
            }
        }

        events.extend(self.users().into_iter().map(|user| Event::UserCreated { user }));
        events.extend(
            self.memberships()
                .into_iter()
                .map(|membership| Event::MembershipSet { membership }),
        );
        events.extend(
            self.schedules()
                .into_iter()
                .map(|schedule| Event::ScheduleSaved { schedule }),
        );
        events.extend(
            self.event_types()
                .into_iter()
                .map(|event_type| Event::EventTypeSaved { event_type }),
        );
        events.extend(self.bookings().into_iter().map(|booking| Event::BookingConfirmed {
            booking,
            consumed: None,
        }));
        events.extend(
            self.reservations()
                .into_iter()
                .map(|reservation| Event::ReservationPlaced { reservation }),
        );
        events
    }
}
