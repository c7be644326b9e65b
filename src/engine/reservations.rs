use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{evaluate_slot, SlotRules};
use super::conflict::{
    check_interval_room, now_ms, pick_hosts, require_open, resolve_duration, validate_instant, validate_span,
};
use super::{Engine, EngineError};

impl Engine {
    /// Whether `user_id` may choose how long a hold on this event type lasts:
    /// the owner, or someone sharing an accepted team membership with them;
    /// for team event types, an accepted member of the team or its parent
    /// organization.
    pub fn can_set_reservation_duration(&self, event_type: &EventType, user_id: Ulid) -> bool {
        match event_type.owner {
            Owner::User(owner) => {
                if owner == user_id {
                    return true;
                }
                let owner_teams = self.store.accepted_teams(owner);
                self.store
                    .accepted_teams(user_id)
                    .iter()
                    .any(|t| owner_teams.contains(t))
            }
            Owner::Team(team_id) => {
                self.store.is_accepted_member(user_id, team_id)
                    || self
                        .store
                        .get_team(&team_id)
                        .and_then(|t| t.parent_id)
                        .is_some_and(|org| self.store.is_accepted_member(user_id, org))
            }
        }
    }

    fn reservation_minutes(
        &self,
        event_type: &EventType,
        requested: Option<u32>,
        auth_user: Option<Ulid>,
    ) -> Result<Option<u32>, EngineError> {
        let Some(minutes) = requested else {
            return Ok(None);
        };
        let Some(user_id) = auth_user else {
            return Err(EngineError::PermissionDenied(
                "a custom reservation duration requires an authenticated user",
            ));
        };
        if minutes == 0 || minutes > MAX_RESERVATION_DURATION_MIN {
            return Err(EngineError::InvalidInput(format!(
                "reservation duration must be between 1 and {MAX_RESERVATION_DURATION_MIN} minutes"
            )));
        }
        if !self.can_set_reservation_duration(event_type, user_id) {
            return Err(EngineError::PermissionDenied(
                "not allowed to set the reservation duration of this event type",
            ));
        }
        Ok(Some(minutes))
    }

    pub async fn reserve_slot(
        &self,
        input: ReserveSlotInput,
        auth_user: Option<Ulid>,
    ) -> Result<SlotReservation, EngineError> {
        let result = self.reserve_slot_at(input, auth_user, now_ms()).await;
        match &result {
            Ok(_) => metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1),
            Err(_) => metrics::counter!(crate::observability::RESERVATIONS_REJECTED_TOTAL).increment(1),
        }
        result
    }

    pub(crate) async fn reserve_slot_at(
        &self,
        input: ReserveSlotInput,
        auth_user: Option<Ulid>,
        now: Ms,
    ) -> Result<SlotReservation, EngineError> {
        let event_type = self
            .store
            .get_event_type(&input.event_type_id)
            .ok_or(EngineError::NotFound(input.event_type_id))?;
        let hold_minutes = self
            .reservation_minutes(&event_type, input.reservation_duration, auth_user)?
            .unwrap_or(DEFAULT_RESERVATION_DURATION_MIN);
        let duration = resolve_duration(&event_type, input.slot_duration, false)?;
        validate_instant(input.slot_start)?;
        let span = Span::new(input.slot_start, input.slot_start + minutes(duration));
        validate_span(&span)?;

        let candidates = event_type.host_ids();
        if candidates.is_empty() {
            return Err(EngineError::NoHosts(event_type.id));
        }
        let rules = SlotRules::new(&event_type, duration);
        let mut guards = self.lock_hosts(&candidates).await?;

        let (host_ids, _) = pick_hosts(event_type.scheduling_type, &candidates, |id| {
            let host = guards.get(&id).ok_or(EngineError::NotFound(id))?;
            check_interval_room(host)?;
            require_open(evaluate_slot(host, &rules, span.start, now, &[]), event_type.id, span.start)
        })?;
        guards.retain(|id, _| host_ids.contains(id));

        let reservation = SlotReservation {
            uid: Ulid::new(),
            event_type_id: event_type.id,
            host_ids,
            span,
            reservation_duration: hold_minutes,
            release_at: now + minutes(hold_minutes),
            is_seat: event_type.is_seated(),
            created_by: auth_user,
        };
        self.persist_and_apply(
            &mut guards,
            Event::ReservationPlaced {
                reservation: reservation.clone(),
            },
        )
        .await?;
        tracing::debug!(uid = %reservation.uid, event_type = %event_type.id, "slot reserved");
        Ok(reservation)
    }

    /// Expired holds are still returned; their `release_at` tells the caller.
    pub fn get_reservation(&self, uid: Ulid) -> Result<SlotReservation, EngineError> {
        self.store.get_reservation(&uid).ok_or(EngineError::NotFound(uid))
    }

    pub async fn update_reservation(
        &self,
        uid: Ulid,
        patch: ReservationPatch,
        auth_user: Option<Ulid>,
    ) -> Result<SlotReservation, EngineError> {
        self.update_reservation_at(uid, patch, auth_user, now_ms()).await
    }

    /// Re-validate a hold at its new position, ignoring the hold itself,
    /// and restart its clock.
    pub(crate) async fn update_reservation_at(
        &self,
        uid: Ulid,
        patch: ReservationPatch,
        auth_user: Option<Ulid>,
        now: Ms,
    ) -> Result<SlotReservation, EngineError> {
        let existing = self.get_reservation(uid)?;
        let event_type = self
            .store
            .get_event_type(&existing.event_type_id)
            .ok_or(EngineError::NotFound(existing.event_type_id))?;
        let hold_minutes = self
            .reservation_minutes(&event_type, patch.reservation_duration, auth_user)?
            .unwrap_or(existing.reservation_duration);
        let duration = match patch.slot_duration {
            Some(_) => resolve_duration(&event_type, patch.slot_duration, false)?,
            None => (existing.span.duration_ms() / MINUTE_MS) as u32,
        };
        let start = patch.slot_start.unwrap_or(existing.span.start);
        validate_instant(start)?;
        let span = Span::new(start, start + minutes(duration));
        validate_span(&span)?;

        let candidates = event_type.host_ids();
        if candidates.is_empty() {
            return Err(EngineError::NoHosts(event_type.id));
        }
        let rules = SlotRules::new(&event_type, duration);
        let mut lock_ids = candidates.clone();
        lock_ids.extend(existing.host_ids.iter().copied());
        let mut guards = self.lock_hosts(&lock_ids).await?;
        if self.store.get_reservation(&uid).is_none() {
            return Err(EngineError::NotFound(uid));
        }

        let exclude = [uid];
        let (host_ids, _) = pick_hosts(event_type.scheduling_type, &candidates, |id| {
            let host = guards.get(&id).ok_or(EngineError::NotFound(id))?;
            require_open(evaluate_slot(host, &rules, span.start, now, &exclude), event_type.id, span.start)
        })?;
        guards.retain(|id, _| host_ids.contains(id) || existing.host_ids.contains(id));

        let reservation = SlotReservation {
            host_ids,
            span,
            reservation_duration: hold_minutes,
            release_at: now + minutes(hold_minutes),
            ..existing
        };
        self.persist_and_apply(
            &mut guards,
            Event::ReservationUpdated {
                reservation: reservation.clone(),
            },
        )
        .await?;
        Ok(reservation)
    }

    pub async fn release_reservation(&self, uid: Ulid) -> Result<(), EngineError> {
        let existing = self.get_reservation(uid)?;
        let mut guards = self.lock_hosts(&existing.host_ids).await?;
        if self.store.get_reservation(&uid).is_none() {
            return Err(EngineError::NotFound(uid));
        }
        self.persist_and_apply(
            &mut guards,
            Event::ReservationReleased {
                uid,
                host_ids: existing.host_ids,
            },
        )
        .await
    }

    /// Drop holds that ended before `cutoff`. Returns how many were removed.
    pub async fn purge_released_reservations(&self, cutoff: Ms) -> usize {
        let mut purged = 0;
        for reservation in self.store.reservations_released_before(cutoff) {
            match self.release_reservation(reservation.uid).await {
                Ok(()) => purged += 1,
                // Consumed or released concurrently.
                Err(e) => tracing::debug!("sweeper skip {}: {e}", reservation.uid),
            }
        }
        purged
    }
}
