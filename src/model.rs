use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const SECOND: Ms = 1_000;
pub const MINUTE: Ms = 60 * SECOND;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Sessions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Available,
    Booked,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Available => "available",
            SessionStatus::Booked => "booked",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Open sessions still take holds and bookings.
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Available | SessionStatus::Booked)
    }
}

/// A bookable time slot with one instructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub span: Span,
    pub location: Option<String>,
    pub capacity: u32,
    pub confirmed_count: u32,
    pub status: SessionStatus,
    pub updated_at: Ms,
    /// Reconciliation key for one-time imports; never interpreted here.
    pub external_id: Option<String>,
}

impl Session {
    pub fn new(id: Ulid, instructor_id: Ulid, span: Span, capacity: u32, location: Option<String>) -> Self {
        Self {
            id,
            instructor_id,
            span,
            location,
            capacity,
            confirmed_count: 0,
            status: SessionStatus::Available,
            updated_at: 0,
            external_id: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.confirmed_count >= self.capacity
    }

    /// Set the confirmed count and re-derive `available`/`booked` from it.
    /// This is the only place the full flag is written.
    pub(crate) fn set_confirmed(&mut self, count: u32) {
        self.confirmed_count = count;
        if self.status.is_open() {
            self.status = if self.is_full() {
                SessionStatus::Booked
            } else {
                SessionStatus::Available
            };
        }
    }
}

/// One unit of provisional capacity taken by an active hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub hold_id: Ulid,
    pub expires_at: Ms,
}

impl Reservation {
    pub fn is_live(&self, now: Ms) -> bool {
        now <= self.expires_at
    }
}

/// A session row plus the hold reservations counted against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session: Session,
    pub reservations: Vec<Reservation>,
}

impl SessionState {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            reservations: Vec::new(),
        }
    }

    /// Reservations that still count at `now`. Expired ones count as zero
    /// whether or not the sweeper has reached them yet.
    pub fn live_reservations(&self, now: Ms) -> u32 {
        self.reservations.iter().filter(|r| r.is_live(now)).count() as u32
    }

    /// `capacity - confirmed - live reservations`; zero once the session is closed.
    pub fn available(&self, now: Ms) -> u32 {
        if !self.session.status.is_open() {
            return 0;
        }
        self.session
            .capacity
            .saturating_sub(self.session.confirmed_count)
            .saturating_sub(self.live_reservations(now))
    }

    pub fn reservation_for(&self, hold_id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.hold_id == hold_id)
    }

    pub fn remove_reservation(&mut self, hold_id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.hold_id == hold_id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn prune_expired(&mut self, now: Ms) {
        self.reservations.retain(|r| r.is_live(now));
    }
}

// ── Holds ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldStatus {
    Active,
    Confirmed,
    Released,
    Expired,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Active => "active",
            HoldStatus::Confirmed => "confirmed",
            HoldStatus::Released => "released",
            HoldStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, HoldStatus::Active)
    }
}

/// A time-bounded soft lease on one unit of capacity per listed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub owner: String,
    pub session_ids: Vec<Ulid>,
    pub created_at: Ms,
    pub expires_at: Ms,
    /// Lease length applied on every renewal.
    pub ttl_ms: Ms,
    pub status: HoldStatus,
    pub updated_at: Ms,
}

impl Hold {
    pub fn is_expired(&self, now: Ms) -> bool {
        now > self.expires_at
    }

    pub fn is_live(&self, now: Ms) -> bool {
        self.status == HoldStatus::Active && !self.is_expired(now)
    }

    pub fn reservation(&self) -> Reservation {
        Reservation {
            hold_id: self.id,
            expires_at: self.expires_at,
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelSource {
    Parent,
    Admin,
    Instructor,
    System,
}

impl CancelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelSource::Parent => "parent",
            CancelSource::Admin => "admin",
            CancelSource::Instructor => "instructor",
            CancelSource::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "parent" => Some(CancelSource::Parent),
            "admin" => Some(CancelSource::Admin),
            "instructor" => Some(CancelSource::Instructor),
            "system" => Some(CancelSource::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub source: CancelSource,
    pub reason: Option<String>,
    pub at: Ms,
}

/// A confirmed reservation of one session by one swimmer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub session_id: Ulid,
    pub swimmer_id: Ulid,
    pub parent_id: Option<Ulid>,
    pub po_id: Option<Ulid>,
    pub hold_id: Option<Ulid>,
    pub status: BookingStatus,
    pub cancellation: Option<Cancellation>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub external_id: Option<String>,
}

// ── Purchase orders ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoType {
    Assessment,
    Lessons,
}

impl PoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoType::Assessment => "assessment",
            PoType::Lessons => "lessons",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "assessment" => Some(PoType::Assessment),
            "lessons" => Some(PoType::Lessons),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoStatus {
    Pending,
    ApprovedPendingAuth,
    Active,
    Completed,
    Expired,
    Cancelled,
}

impl PoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoStatus::Pending => "pending",
            PoStatus::ApprovedPendingAuth => "approved_pending_auth",
            PoStatus::Active => "active",
            PoStatus::Completed => "completed",
            PoStatus::Expired => "expired",
            PoStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PoStatus::Completed | PoStatus::Expired | PoStatus::Cancelled)
    }

    /// Approved and not yet closed. Reserving and consuming both require it,
    /// so anything booked can later be charged.
    pub fn accepts_bookings(&self) -> bool {
        matches!(self, PoStatus::ApprovedPendingAuth | PoStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingStatus {
    Unbilled,
    Billed,
    Paid,
    Partial,
    Overdue,
    Disputed,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Unbilled => "unbilled",
            BillingStatus::Billed => "billed",
            BillingStatus::Paid => "paid",
            BillingStatus::Partial => "partial",
            BillingStatus::Overdue => "overdue",
            BillingStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "unbilled" => Some(BillingStatus::Unbilled),
            "billed" => Some(BillingStatus::Billed),
            "paid" => Some(BillingStatus::Paid),
            "partial" => Some(BillingStatus::Partial),
            "overdue" => Some(BillingStatus::Overdue),
            "disputed" => Some(BillingStatus::Disputed),
            _ => None,
        }
    }
}

/// Billing state. Moves independently of the authorization status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Billing {
    pub status: BillingStatus,
    pub billed_amount_cents: i64,
    pub paid_amount_cents: i64,
    pub invoice_number: Option<String>,
    pub payment_reference: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub billed_at: Option<Ms>,
    pub paid_at: Option<Ms>,
    pub notes: Vec<String>,
}

impl Default for Billing {
    fn default() -> Self {
        Self {
            status: BillingStatus::Unbilled,
            billed_amount_cents: 0,
            paid_amount_cents: 0,
            invoice_number: None,
            payment_reference: None,
            due_date: None,
            billed_at: None,
            paid_at: None,
            notes: Vec::new(),
        }
    }
}

/// A funding source's grant of N sessions over a date window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: Ulid,
    pub swimmer_id: Ulid,
    pub funding_source_id: Ulid,
    pub po_type: PoType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub sessions_authorized: u32,
    pub sessions_booked: u32,
    pub sessions_used: u32,
    pub status: PoStatus,
    pub authorization_number: Option<String>,
    /// Coordinator approved activation without an authorization number.
    pub auth_override: bool,
    pub billing: Billing,
    pub parent_po_id: Option<Ulid>,
    pub cancellation_reason: Option<String>,
    /// Bumped by the store on every write; the compare-and-swap key.
    pub version: u64,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub external_id: Option<String>,
}

impl PurchaseOrder {
    pub fn remaining(&self) -> u32 {
        self.sessions_authorized.saturating_sub(self.sessions_booked)
    }

    pub fn counters_consistent(&self) -> bool {
        self.sessions_used <= self.sessions_booked && self.sessions_booked <= self.sessions_authorized
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            po_id: self.id,
            swimmer_id: self.swimmer_id,
            status: self.status,
            billing_status: self.billing.status,
            sessions_authorized: self.sessions_authorized,
            sessions_booked: self.sessions_booked,
            sessions_used: self.sessions_used,
            remaining: self.remaining(),
            billed_amount_cents: self.billing.billed_amount_cents,
            paid_amount_cents: self.billing.paid_amount_cents,
            version: self.version,
        }
    }
}

/// Read-only view of a PO returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub po_id: Ulid,
    pub swimmer_id: Ulid,
    pub status: PoStatus,
    pub billing_status: BillingStatus,
    pub sessions_authorized: u32,
    pub sessions_booked: u32,
    pub sessions_used: u32,
    pub remaining: u32,
    pub billed_amount_cents: i64,
    pub paid_amount_cents: i64,
    pub version: u64,
}

// ── Signals ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalNeeded {
    pub po_id: Ulid,
    pub swimmer_id: Ulid,
    pub sessions_used: u32,
    pub sessions_authorized: u32,
}

/// Facts for the external notification collaborator. The core never sends
/// email or SMS itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    RenewalNeeded(RenewalNeeded),
    AuthorizationExhausted { po_id: Ulid, swimmer_id: Ulid },
}

// ── WAL records ──────────────────────────────────────────────────

/// A full row image. Replaying images in order rebuilds the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Write {
    Session(SessionState),
    Hold(Hold),
    Booking(Booking),
    BookingDiscarded { id: Ulid },
    PurchaseOrder(PurchaseOrder),
}

impl Write {
    /// Id of the row this write touches.
    pub fn row_id(&self) -> Ulid {
        match self {
            Write::Session(s) => s.session.id,
            Write::Hold(h) => h.id,
            Write::Booking(b) => b.id,
            Write::BookingDiscarded { id } => *id,
            Write::PurchaseOrder(po) => po.id,
        }
    }
}

/// One atomic store operation. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub at: Ms,
    pub writes: Vec<Write>,
}

impl Commit {
    pub fn single(at: Ms, write: Write) -> Self {
        Self {
            at,
            writes: vec![write],
        }
    }
}
