use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidInput(&'static str),
    InvalidState {
        id: Ulid,
        reason: &'static str,
    },
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        to: &'static str,
    },
    /// Sessions that had no capacity left when a hold was requested.
    InsufficientCapacity(Vec<Ulid>),
    CapacityExceeded {
        session_id: Ulid,
        capacity: u32,
    },
    HoldExpired(Ulid),
    NotOwner(Ulid),
    AuthorizationExhausted {
        po_id: Ulid,
        authorized: u32,
        booked: u32,
        requested: u32,
    },
    NothingToConsume {
        po_id: Ulid,
        booked: u32,
        used: u32,
        requested: u32,
    },
    InvalidBilling(&'static str),
    DuplicateBooking {
        session_id: Ulid,
        swimmer_id: Ulid,
    },
    CancellationWindowClosed {
        booking_id: Ulid,
        minutes_before_start: i64,
    },
    /// A booking kept changing status under a cancel past the retry limit.
    VersionConflict(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short machine-readable kind, used as a metrics label and in wire errors.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InsufficientCapacity(_) => "insufficient_capacity",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::HoldExpired(_) => "hold_expired",
            EngineError::NotOwner(_) => "not_owner",
            EngineError::AuthorizationExhausted { .. } => "authorization_exhausted",
            EngineError::NothingToConsume { .. } => "nothing_to_consume",
            EngineError::InvalidBilling(_) => "invalid_billing",
            EngineError::DuplicateBooking { .. } => "duplicate_booking",
            EngineError::CancellationWindowClosed { .. } => "cancellation_window_closed",
            EngineError::VersionConflict(_) => "version_conflict",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InvalidState { id, reason } => write!(f, "invalid state for {id}: {reason}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "cannot move {id} from {from} to {to}")
            }
            EngineError::InsufficientCapacity(ids) => {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                write!(f, "insufficient capacity on sessions: {}", ids.join(","))
            }
            EngineError::CapacityExceeded {
                session_id,
                capacity,
            } => write!(f, "session {session_id} capacity {capacity} exceeded"),
            EngineError::HoldExpired(id) => write!(f, "hold expired: {id}"),
            EngineError::NotOwner(id) => write!(f, "hold {id} belongs to another owner"),
            EngineError::AuthorizationExhausted {
                po_id,
                authorized,
                booked,
                requested,
            } => write!(
                f,
                "purchase order {po_id} exhausted: {booked}/{authorized} booked, {requested} requested"
            ),
            EngineError::NothingToConsume {
                po_id,
                booked,
                used,
                requested,
            } => write!(
                f,
                "purchase order {po_id} has nothing to consume: {used}/{booked} used, {requested} requested"
            ),
            EngineError::InvalidBilling(msg) => write!(f, "invalid billing: {msg}"),
            EngineError::DuplicateBooking {
                session_id,
                swimmer_id,
            } => write!(f, "swimmer {swimmer_id} already booked on session {session_id}"),
            EngineError::CancellationWindowClosed {
                booking_id,
                minutes_before_start,
            } => write!(
                f,
                "booking {booking_id} starts in {minutes_before_start} minutes; too late to cancel"
            ),
            EngineError::VersionConflict(id) => write!(f, "concurrent update on {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
