use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::format_instant;

use super::availability::Verdict;
use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_instant(ms: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// The slot length to use, in minutes.
///
/// With `multiple_duration` set the request must be one of its entries.
/// Otherwise only the event type's own length is accepted. Dynamic
/// events take any length.
pub(crate) fn resolve_duration(
    event_type: &EventType,
    requested: Option<u32>,
    dynamic: bool,
) -> Result<u32, EngineError> {
    let Some(requested) = requested else {
        return Ok(event_type.length);
    };
    if requested == 0 || requested > MAX_EVENT_LENGTH_MIN {
        return Err(EngineError::InvalidInput(format!(
            "duration must be between 1 and {MAX_EVENT_LENGTH_MIN} minutes"
        )));
    }
    if dynamic {
        return Ok(requested);
    }
    match &event_type.multiple_duration {
        Some(allowed) if allowed.contains(&requested) => Ok(requested),
        Some(allowed) => Err(EngineError::InvalidDuration {
            requested,
            allowed: allowed.clone(),
        }),
        None if requested == event_type.length => Ok(requested),
        None => Err(EngineError::FixedLength),
    }
}

/// The booked length, in minutes. A booking may only name a length when the
/// event type offers several.
pub(crate) fn booking_duration(event_type: &EventType, requested: Option<u32>) -> Result<u32, EngineError> {
    if requested.is_some() && event_type.multiple_duration.is_none() {
        return Err(EngineError::FixedBookingLength);
    }
    resolve_duration(event_type, requested, false)
}

/// Map a calendar verdict to the error a booker sees.
pub(crate) fn require_open(verdict: Verdict, event_type_id: Ulid, start: Ms) -> Result<Verdict, EngineError> {
    match verdict {
        Verdict::Free | Verdict::Seats(_) => Ok(verdict),
        Verdict::Booked(id) => Err(EngineError::SlotAlreadyBooked(id)),
        Verdict::Reserved(id) => Err(EngineError::SlotReserved(id)),
        Verdict::Full(_) => Err(EngineError::SeatsExhausted {
            event_type_id,
            start: format_instant(chrono_tz::UTC, start),
        }),
    }
}

pub(crate) fn check_interval_room(host: &HostState) -> Result<(), EngineError> {
    if host.intervals.len() >= MAX_INTERVALS_PER_HOST {
        return Err(EngineError::LimitExceeded("too many allocations on host"));
    }
    Ok(())
}

/// Hosts are tried in event-type order. Collective types need every
/// candidate open; round-robin takes the first open host, preferring one
/// that already carries the seated booking at this start.
pub(crate) fn pick_hosts(
    scheduling: SchedulingType,
    candidates: &[Ulid],
    check: impl Fn(Ulid) -> Result<Verdict, EngineError>,
) -> Result<(Vec<Ulid>, Verdict), EngineError> {
    if candidates.is_empty() {
        return Err(EngineError::SlotUnavailable("no hosts to book"));
    }
    match scheduling {
        SchedulingType::Collective => {
            let mut first = None;
            for &id in candidates {
                let verdict = check(id)?;
                first.get_or_insert(verdict);
            }
            Ok((candidates.to_vec(), first.unwrap_or(Verdict::Free)))
        }
        SchedulingType::RoundRobin => {
            let mut chosen = None;
            let mut first_err = None;
            for &id in candidates {
                match check(id) {
                    Ok(verdict) => {
                        if verdict.seats().is_some_and(|s| s.booking_id.is_some()) {
                            return Ok((vec![id], verdict));
                        }
                        chosen.get_or_insert((id, verdict));
                    }
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
            match (chosen, first_err) {
                (Some((id, verdict)), _) => Ok((vec![id], verdict)),
                (None, Some(e)) => Err(e),
                (None, None) => Err(EngineError::SlotUnavailable("no hosts to book")),
            }
        }
    }
}
