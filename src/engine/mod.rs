pub mod capacity;
pub mod clock;
mod error;
pub mod holds;
pub mod ledger;
pub mod orchestrator;
pub mod recurrence;
#[cfg(test)]
mod tests;

pub use capacity::{CapacityTracker, NewSession};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::EngineError;
pub use holds::{HoldManager, HoldPolicy};
pub use ledger::{
    Approval, BillingUpdate, Consumption, LedgerPolicy, NewPurchaseOrder, QuotaLedger,
    lessons_window_end,
};
pub use orchestrator::{
    BookingOrchestrator, BookingRequest, CancelOutcome, Confirmation, SessionClosure,
    SessionCompletion,
};
pub use recurrence::{
    Alternative, BookingPlan, Conflict, ConflictPolicy, DateWindow, InstructorAvailability,
    Occurrence, RecurrenceRequest, RecurrenceResolver, Resolution, Slot,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::warn;
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::{DurableStore, Store};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub holds_expired: usize,
    pub purchase_orders_expired: Vec<Ulid>,
}

/// One facility's booking core: the five components wired to a shared
/// store, clock and notification hub.
pub struct Engine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    pub notify: Arc<NotifyHub>,
    config: EngineConfig,
    pub capacity: CapacityTracker,
    pub holds: HoldManager,
    pub recurrence: RecurrenceResolver,
    pub ledger: QuotaLedger,
    pub orchestrator: BookingOrchestrator,
}

impl Engine {
    /// Durable engine replayed from `wal_path`, on the system clock.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let store = Arc::new(DurableStore::open(wal_path, notify.clone())?);
        Ok(Self::with_parts(store, Arc::new(SystemClock), notify, config))
    }

    pub fn with_parts(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> Self {
        let capacity = CapacityTracker::new(store.clone(), clock.clone());
        let holds = HoldManager::new(store.clone(), clock.clone(), HoldPolicy::from(&config));
        let recurrence = RecurrenceResolver::new(store.clone(), clock.clone(), config.timezone);
        let ledger = QuotaLedger::new(
            store.clone(),
            clock.clone(),
            notify.clone(),
            LedgerPolicy::from(&config),
        );
        let orchestrator = BookingOrchestrator::new(
            store.clone(),
            clock.clone(),
            capacity.clone(),
            holds.clone(),
            ledger.clone(),
            config.late_cancel_window_ms,
        );
        Self {
            store,
            clock,
            notify,
            config,
            capacity,
            holds,
            recurrence,
            ledger,
            orchestrator,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Current calendar date at the facility.
    pub fn today(&self) -> NaiveDate {
        recurrence::local_date(self.clock.now_ms(), self.config.timezone)
    }

    // ── Booking flow ─────────────────────────────────────────

    pub async fn resolve_recurrence(&self, request: &RecurrenceRequest) -> Result<Resolution, EngineError> {
        self.recurrence.resolve(request).await
    }

    pub async fn plan_recurring(
        &self,
        resolution: &Resolution,
        instructor_id: Ulid,
        policy: &ConflictPolicy,
    ) -> Result<BookingPlan, EngineError> {
        self.recurrence.plan(resolution, instructor_id, policy).await
    }

    pub async fn create_hold(
        &self,
        session_ids: &[Ulid],
        owner: &str,
        ttl_ms: Option<Ms>,
    ) -> Result<Hold, EngineError> {
        self.holds.create_hold(session_ids, owner, ttl_ms).await
    }

    pub async fn renew_hold(&self, hold_id: Ulid, owner: &str) -> Result<Hold, EngineError> {
        self.holds.renew_hold(hold_id, owner).await
    }

    pub async fn release_hold(&self, hold_id: Ulid) -> Result<Hold, EngineError> {
        self.holds.release_hold(hold_id).await
    }

    pub async fn confirm_booking(
        &self,
        hold_id: Ulid,
        owner: &str,
        request: BookingRequest,
    ) -> Result<Confirmation, EngineError> {
        self.orchestrator.confirm_booking(hold_id, owner, request).await
    }

    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        source: CancelSource,
        reason: Option<String>,
    ) -> Result<CancelOutcome, EngineError> {
        self.orchestrator.cancel_booking(booking_id, source, reason).await
    }

    pub async fn get_available_capacity(&self, session_id: Ulid) -> Result<u32, EngineError> {
        self.capacity.get_available_capacity(session_id).await
    }

    pub async fn approve_po(&self, po_id: Ulid, approval: Approval) -> Result<LedgerSnapshot, EngineError> {
        self.ledger.approve(po_id, approval).await
    }

    pub async fn record_billing(
        &self,
        po_id: Ulid,
        update: BillingUpdate,
    ) -> Result<LedgerSnapshot, EngineError> {
        self.ledger.record_billing(po_id, update).await
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Reclaim expired holds and expire lapsed authorizations.
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let holds_expired = self.holds.sweep_expired().await?;
        let purchase_orders_expired = match self.ledger.expire_lapsed(self.today()).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("purchase order expiry sweep failed: {e}");
                Vec::new()
            }
        };
        Ok(SweepReport {
            holds_expired,
            purchase_orders_expired,
        })
    }

    pub async fn compact(&self) -> Result<(), EngineError> {
        self.store.compact().await
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.store.appends_since_compact().await
    }
}
