use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("not found: {0}")]
    NotFoundKey(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("cycle detected at team: {0}")]
    CycleDetected(Ulid),
    #[error("cannot delete team {0}: has child teams")]
    HasChildren(Ulid),
    #[error("cannot delete {0}: still in use")]
    InUse(String),
    #[error(
        "Provided 'slotDuration' is not one of the possible lengths for the event type. \
         The possible lengths for this variable length event type are: {}",
        join_lengths(.allowed)
    )]
    InvalidDuration { requested: u32, allowed: Vec<u32> },
    #[error(
        "Can't specify a duration because event type does not have multiple possible lengths"
    )]
    FixedLength,
    #[error(
        "Can't specify 'duration' because event type does not have multiple possible lengths. \
         Please, remove the 'duration' field from the request."
    )]
    FixedBookingLength,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("Can't reserve a slot if the event is already booked.")]
    SlotAlreadyBooked(Ulid),
    #[error("slot is held by reservation {0}")]
    SlotReserved(Ulid),
    #[error("Booking for event type {event_type_id} at {start} has no more seats left.")]
    SeatsExhausted { event_type_id: Ulid, start: String },
    #[error("slot is not available: {0}")]
    SlotUnavailable(&'static str),
    #[error("event type {0} has no hosts")]
    NoHosts(Ulid),
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),
    #[error("reservation {0} has expired")]
    ReservationExpired(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

fn join_lengths(lengths: &[u32]) -> String {
    lengths
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl EngineError {
    /// PostgreSQL SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) | EngineError::NotFoundKey(_) => "P0002",
            EngineError::AlreadyExists(_)
            | EngineError::SlotAlreadyBooked(_)
            | EngineError::SlotReserved(_)
            | EngineError::SeatsExhausted { .. }
            | EngineError::SlotUnavailable(_) => "23P01",
            EngineError::PermissionDenied(_) => "42501",
            EngineError::InvalidDuration { .. }
            | EngineError::FixedLength
            | EngineError::FixedBookingLength
            | EngineError::InvalidInput(_)
            | EngineError::ReservationExpired(_)
            | EngineError::NoHosts(_) => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
            EngineError::CycleDetected(_) | EngineError::HasChildren(_) | EngineError::InUse(_) => {
                "P0001"
            }
        }
    }
}
