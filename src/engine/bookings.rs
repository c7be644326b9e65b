use ulid::Ulid;

use crate::model::*;

use super::availability::{evaluate_slot, host_slots, SlotRules, Verdict};
use super::conflict::{
    booking_duration, check_interval_room, now_ms, pick_hosts, require_open, validate_instant, validate_span,
};
use super::{Engine, EngineError};

impl Engine {
    /// Full slot check for one locked host: calendar verdict first, then
    /// working hours, notice, period and booking limits.
    #[allow(clippy::too_many_arguments)]
    fn check_bookable(
        &self,
        event_type: &EventType,
        rules: &SlotRules,
        host: &HostState,
        start: Ms,
        now: Ms,
        exclude: &[Ulid],
        booked_starts: &[Ms],
    ) -> Result<Verdict, EngineError> {
        let verdict = require_open(evaluate_slot(host, rules, start, now, exclude), event_type.id, start)?;
        let schedule = self
            .schedule_for(event_type, host.user_id)
            .ok_or(EngineError::SlotUnavailable("host has no schedule"))?;
        let at_start = Span::new(start, start + 1);
        if host_slots(&schedule, host, rules, &at_start, now, exclude, booked_starts).is_empty() {
            return Err(EngineError::SlotUnavailable("start is not a bookable slot"));
        }
        Ok(verdict)
    }

    /// Hosts to lock for a booking on `event_type`. Booking limits count
    /// bookings on every host, so a limited event type locks all of them.
    fn booking_lock_set(event_type: &EventType, hosts: &[Ulid]) -> Vec<Ulid> {
        let mut ids = hosts.to_vec();
        if !event_type.booking_limits.is_empty() {
            ids.extend(event_type.host_ids());
        }
        ids
    }

    pub async fn confirm_booking(&self, input: BookingInput) -> Result<Booking, EngineError> {
        self.confirm_booking_at(input, now_ms()).await
    }

    /// Book a slot, consuming the named reservation if one is given. For seated
    /// event types a booking already at this start gains one attendee instead.
    pub(crate) async fn confirm_booking_at(&self, input: BookingInput, now: Ms) -> Result<Booking, EngineError> {
        let event_type = self
            .store
            .get_event_type(&input.event_type_id)
            .ok_or(EngineError::NotFound(input.event_type_id))?;
        let duration = booking_duration(&event_type, input.duration)?;
        validate_instant(input.start)?;
        let span = Span::new(input.start, input.start + minutes(duration));
        validate_span(&span)?;
        let rules = SlotRules::new(&event_type, duration);
        if span.start < now + rules.notice {
            return Err(EngineError::SlotUnavailable("inside the minimum booking notice"));
        }

        let held = match input.reservation_uid {
            Some(uid) => {
                let reservation = self.get_reservation(uid)?;
                if reservation.event_type_id != event_type.id || reservation.span.start != span.start {
                    return Err(EngineError::InvalidInput(
                        "reservation does not match the requested slot".into(),
                    ));
                }
                Some(reservation)
            }
            None => None,
        };
        let candidates = match &held {
            Some(reservation) => reservation.host_ids.clone(),
            None => event_type.host_ids(),
        };
        if candidates.is_empty() {
            return Err(EngineError::NoHosts(event_type.id));
        }

        let mut guards = self
            .lock_hosts(&Self::booking_lock_set(&event_type, &candidates))
            .await?;
        if let Some(held) = &held {
            // The hold may have moved or lapsed before the locks were taken.
            let current = self.store.get_reservation(&held.uid).ok_or(EngineError::NotFound(held.uid))?;
            if current.host_ids != held.host_ids || current.span != held.span {
                return Err(EngineError::SlotUnavailable("reservation changed while booking"));
            }
            if !current.is_active(now) {
                return Err(EngineError::ReservationExpired(held.uid));
            }
        }
        let exclude: Vec<Ulid> = input.reservation_uid.into_iter().collect();
        let booked_starts = self.store.accepted_starts(event_type.id, &[]);

        let (host_ids, verdict) = pick_hosts(event_type.scheduling_type, &candidates, |id| {
            let host = guards.get(&id).ok_or(EngineError::NotFound(id))?;
            check_interval_room(host)?;
            self.check_bookable(&event_type, &rules, host, span.start, now, &exclude, &booked_starts)
        })?;
        if event_type.booking_limits.is_empty() {
            guards.retain(|id, _| host_ids.contains(id) || (held.is_some() && candidates.contains(id)));
        }

        if let Some(SeatInfo {
            booking_id: Some(booking_id),
            ..
        }) = verdict.seats()
        {
            let existing = self.get_booking(booking_id)?;
            self.persist_and_apply(
                &mut guards,
                Event::SeatAdded {
                    booking_id,
                    attendees: existing.attendees + 1,
                    consumed: input.reservation_uid,
                },
            )
            .await?;
            tracing::debug!(booking = %booking_id, "seat added");
            return self.get_booking(booking_id);
        }

        let (buffer_before, buffer_after) = event_type.buffers_ms();
        let booking = Booking {
            id: Ulid::new(),
            event_type_id: event_type.id,
            host_ids,
            span,
            attendees: 1,
            buffer_before,
            buffer_after,
            status: BookingStatus::Accepted,
            created_at: now,
        };
        self.persist_and_apply(
            &mut guards,
            Event::BookingConfirmed {
                booking: booking.clone(),
                consumed: input.reservation_uid,
            },
        )
        .await?;
        tracing::debug!(booking = %booking.id, event_type = %event_type.id, "booking confirmed");
        Ok(booking)
    }

    pub async fn reschedule_booking(&self, id: Ulid, new_start: Ms) -> Result<Booking, EngineError> {
        self.reschedule_booking_at(id, new_start, now_ms()).await
    }

    /// Move an accepted booking, keeping its length and hosts.
    pub(crate) async fn reschedule_booking_at(
        &self,
        id: Ulid,
        new_start: Ms,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let booking = self.get_booking(id)?;
        if booking.status != BookingStatus::Accepted {
            return Err(EngineError::InvalidInput("booking is cancelled".into()));
        }
        let event_type = self
            .store
            .get_event_type(&booking.event_type_id)
            .ok_or(EngineError::NotFound(booking.event_type_id))?;
        validate_instant(new_start)?;
        let length = booking.span.duration_ms();
        let span = Span::new(new_start, new_start + length);
        validate_span(&span)?;
        let rules = SlotRules::new(&event_type, (length / MINUTE_MS) as u32);
        if span.start < now + rules.notice {
            return Err(EngineError::SlotUnavailable("inside the minimum booking notice"));
        }

        let mut guards = self
            .lock_hosts(&Self::booking_lock_set(&event_type, &booking.host_ids))
            .await?;
        let exclude = [id];
        let booked_starts = self.store.accepted_starts(event_type.id, &exclude);
        for host_id in &booking.host_ids {
            let host = guards.get(host_id).ok_or(EngineError::NotFound(*host_id))?;
            let verdict =
                self.check_bookable(&event_type, &rules, host, span.start, now, &exclude, &booked_starts)?;
            if let Some(other) = verdict.seats().and_then(|s| s.booking_id) {
                return Err(EngineError::SlotAlreadyBooked(other));
            }
        }

        self.persist_and_apply(&mut guards, Event::BookingRescheduled { id, span })
            .await?;
        self.get_booking(id)
    }

    /// Cancelling twice is a no-op.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.get_booking(id)?;
        if booking.status == BookingStatus::Cancelled {
            return Ok(booking);
        }
        let mut guards = self.lock_hosts(&booking.host_ids).await?;
        self.persist_and_apply(&mut guards, Event::BookingCancelled { id })
            .await?;
        self.get_booking(id)
    }
}
