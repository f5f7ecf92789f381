//! Persistence boundary. Every mutating call is one atomic conditional
//! update: the condition is checked and the change written as a unit, so no
//! caller ever reads a counter, computes a new value, and writes it back.

mod durable;

pub use durable::DurableStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

/// How an occupancy change interacts with a hold's reservation on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldLink {
    None,
    /// Turn this hold's reservation into the confirmed seat.
    Consume(Ulid),
    /// Give the seat back to the hold it came from (compensation).
    Restore(Reservation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyChange {
    pub delta: i32,
    pub hold: HoldLink,
}

impl OccupancyChange {
    pub fn plain(delta: i32) -> Self {
        Self {
            delta,
            hold: HoldLink::None,
        }
    }
}

/// Outcome of closing a hold. Closing an already-closed hold is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldClose {
    Closed(Hold),
    AlreadyClosed(Hold),
}

impl HoldClose {
    pub fn hold(&self) -> &Hold {
        match self {
            HoldClose::Closed(h) | HoldClose::AlreadyClosed(h) => h,
        }
    }

    pub fn into_hold(self) -> Hold {
        match self {
            HoldClose::Closed(h) | HoldClose::AlreadyClosed(h) => h,
        }
    }
}

/// In-place change to a purchase order, run while its row is locked.
pub type PoMutation<'a> =
    Box<dyn FnOnce(&mut PurchaseOrder) -> Result<(), EngineError> + Send + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    Session(Ulid),
    Swimmer(Ulid),
    Hold(Ulid),
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        match self {
            BookingFilter::Session(id) => booking.session_id == *id,
            BookingFilter::Swimmer(id) => booking.swimmer_id == *id,
            BookingFilter::Hold(id) => booking.hold_id == Some(*id),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // ── Sessions ─────────────────────────────────────────────

    async fn insert_session(&self, session: Session) -> Result<Session, EngineError>;

    async fn session(&self, id: Ulid) -> Result<Option<SessionState>, EngineError>;

    /// Sessions of one instructor starting inside `window`, ordered by start.
    async fn sessions_for_instructor(
        &self,
        instructor_id: Ulid,
        window: Span,
    ) -> Result<Vec<SessionState>, EngineError>;

    /// Change `confirmed_count` by `delta`. An increase succeeds only while
    /// `confirmed + delta + other live reservations <= capacity`.
    async fn adjust_occupancy(
        &self,
        session_id: Ulid,
        change: OccupancyChange,
        now: Ms,
    ) -> Result<Session, EngineError>;

    async fn transition_session(
        &self,
        session_id: Ulid,
        from: &[SessionStatus],
        to: SessionStatus,
        now: Ms,
    ) -> Result<Session, EngineError>;

    // ── Holds ────────────────────────────────────────────────

    /// Reserve one unit on every listed session, or nothing. Fails with
    /// `InsufficientCapacity` naming every session that had none left.
    async fn place_hold(&self, hold: Hold, now: Ms) -> Result<Hold, EngineError>;

    async fn hold(&self, id: Ulid) -> Result<Option<Hold>, EngineError>;

    /// Move the expiry of an active, unexpired hold held by `owner`.
    async fn extend_hold(
        &self,
        id: Ulid,
        owner: &str,
        expires_at: Ms,
        now: Ms,
    ) -> Result<Hold, EngineError>;

    /// `active -> to`, dropping the hold's remaining reservations.
    async fn close_hold(&self, id: Ulid, to: HoldStatus, now: Ms) -> Result<HoldClose, EngineError>;

    /// Active holds whose expiry has passed.
    async fn expired_holds(&self, now: Ms) -> Result<Vec<Ulid>, EngineError>;

    // ── Bookings ─────────────────────────────────────────────

    /// Fails with `DuplicateBooking` if the swimmer already holds a
    /// non-cancelled booking on the session.
    async fn insert_booking(&self, booking: Booking) -> Result<Booking, EngineError>;

    async fn booking(&self, id: Ulid) -> Result<Option<Booking>, EngineError>;

    async fn bookings(&self, filter: BookingFilter) -> Result<Vec<Booking>, EngineError>;

    async fn transition_booking(
        &self,
        id: Ulid,
        from: &[BookingStatus],
        to: BookingStatus,
        cancellation: Option<Cancellation>,
        now: Ms,
    ) -> Result<Booking, EngineError>;

    /// Remove a booking that never became visible to the caller (compensation only).
    async fn discard_booking(&self, id: Ulid, now: Ms) -> Result<(), EngineError>;

    // ── Purchase orders ──────────────────────────────────────

    async fn insert_purchase_order(&self, po: PurchaseOrder) -> Result<PurchaseOrder, EngineError>;

    async fn purchase_order(&self, id: Ulid) -> Result<Option<PurchaseOrder>, EngineError>;

    async fn purchase_orders(&self) -> Result<Vec<PurchaseOrder>, EngineError>;

    /// Run `apply` on the PO under its row lock and store the result with
    /// `version + 1`. Nothing is written when `apply` fails or leaves the
    /// counters out of order. Returns the row before and after.
    async fn update_purchase_order(
        &self,
        id: Ulid,
        apply: PoMutation<'_>,
        now: Ms,
    ) -> Result<(PurchaseOrder, PurchaseOrder), EngineError>;

    // ── Maintenance ──────────────────────────────────────────

    async fn compact(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn appends_since_compact(&self) -> u64 {
        0
    }
}
