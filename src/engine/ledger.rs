use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate};
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::clock::Clock;
use super::error::EngineError;
use crate::config::EngineConfig;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct LedgerPolicy {
    pub renewal_lead: u32,
    pub lessons_per_authorization: u32,
}

impl From<&EngineConfig> for LedgerPolicy {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            renewal_lead: cfg.renewal_lead,
            lessons_per_authorization: cfg.lessons_per_authorization,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPurchaseOrder {
    pub id: Ulid,
    pub swimmer_id: Ulid,
    pub funding_source_id: Ulid,
    pub po_type: PoType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub sessions_authorized: u32,
    pub parent_po_id: Option<Ulid>,
    pub external_id: Option<String>,
}

/// Coordinator decision on a pending PO.
#[derive(Debug, Clone, Default)]
pub struct Approval {
    pub authorization_number: Option<String>,
    /// Activate without a number on file.
    pub override_pending_auth: bool,
}

#[derive(Debug, Clone)]
pub struct BillingUpdate {
    pub status: BillingStatus,
    pub billed_amount_cents: Option<i64>,
    pub paid_amount_cents: Option<i64>,
    pub invoice_number: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub note: Option<String>,
}

impl BillingUpdate {
    pub fn status(status: BillingStatus) -> Self {
        Self {
            status,
            billed_amount_cents: None,
            paid_amount_cents: None,
            invoice_number: None,
            due_date: None,
            note: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumption {
    pub snapshot: LedgerSnapshot,
    pub renewal: Option<RenewalNeeded>,
}

/// End of a lessons authorization starting on `start`: three months out,
/// but never past the June 30 fiscal year end.
pub fn lessons_window_end(start: NaiveDate) -> NaiveDate {
    let fiscal_year = if start.month() >= 7 {
        start.year() + 1
    } else {
        start.year()
    };
    let fiscal_end = NaiveDate::from_ymd_opt(fiscal_year, 6, 30).unwrap_or(start);
    start
        .checked_add_months(Months::new(3))
        .unwrap_or(fiscal_end)
        .min(fiscal_end)
}

/// Authorized/booked/used counters per purchase order.
///
/// `used <= booked <= authorized` holds after every call. Each counter move
/// runs under the PO's row lock, so concurrent callers queue instead of
/// racing.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    notify: Arc<NotifyHub>,
    policy: LedgerPolicy,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
        policy: LedgerPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            notify,
            policy,
        }
    }

    // ── Opening ──────────────────────────────────────────────

    pub async fn open(&self, new: NewPurchaseOrder) -> Result<PurchaseOrder, EngineError> {
        if new.sessions_authorized == 0 {
            return Err(EngineError::InvalidInput("purchase order must authorize at least one session"));
        }
        if new.sessions_authorized > MAX_SESSIONS_PER_PO {
            return Err(EngineError::LimitExceeded("too many sessions on one purchase order"));
        }
        if new.start_date > new.end_date {
            return Err(EngineError::InvalidInput("purchase order ends before it starts"));
        }
        if let Some(parent) = new.parent_po_id {
            self.fetch(parent).await?;
        }

        let now = self.clock.now_ms();
        let po = PurchaseOrder {
            id: new.id,
            swimmer_id: new.swimmer_id,
            funding_source_id: new.funding_source_id,
            po_type: new.po_type,
            start_date: new.start_date,
            end_date: new.end_date,
            sessions_authorized: new.sessions_authorized,
            sessions_booked: 0,
            sessions_used: 0,
            status: PoStatus::Pending,
            authorization_number: None,
            auth_override: false,
            billing: Billing::default(),
            parent_po_id: new.parent_po_id,
            cancellation_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
            external_id: new.external_id,
        };
        let po = self.store.insert_purchase_order(po).await?;
        info!(po_id = %po.id, swimmer_id = %po.swimmer_id, po_type = po.po_type.as_str(), authorized = po.sessions_authorized, "purchase order opened");
        Ok(po)
    }

    /// Assessment PO for the evaluation day plus the first lessons PO, which
    /// starts the day after and links back to it.
    pub async fn open_assessment_pair(
        &self,
        swimmer_id: Ulid,
        funding_source_id: Ulid,
        assessment_date: NaiveDate,
    ) -> Result<(PurchaseOrder, PurchaseOrder), EngineError> {
        let next_day = assessment_date
            .succ_opt()
            .ok_or(EngineError::InvalidInput("assessment date out of range"))?;
        let assessment = self
            .open(NewPurchaseOrder {
                id: Ulid::new(),
                swimmer_id,
                funding_source_id,
                po_type: PoType::Assessment,
                start_date: assessment_date,
                end_date: next_day,
                sessions_authorized: 1,
                parent_po_id: None,
                external_id: None,
            })
            .await?;
        let lessons = self
            .open(NewPurchaseOrder {
                id: Ulid::new(),
                swimmer_id,
                funding_source_id,
                po_type: PoType::Lessons,
                start_date: next_day,
                end_date: lessons_window_end(next_day),
                sessions_authorized: self.policy.lessons_per_authorization,
                parent_po_id: Some(assessment.id),
                external_id: None,
            })
            .await?;
        Ok((assessment, lessons))
    }

    /// Follow-on lessons PO starting the day after the last lesson.
    pub async fn open_renewal(
        &self,
        previous_po_id: Ulid,
        last_lesson_date: NaiveDate,
    ) -> Result<PurchaseOrder, EngineError> {
        let previous = self.fetch(previous_po_id).await?;
        if previous.po_type != PoType::Lessons {
            return Err(EngineError::InvalidInput("only lessons purchase orders renew"));
        }
        let start = last_lesson_date
            .succ_opt()
            .ok_or(EngineError::InvalidInput("lesson date out of range"))?;
        self.open(NewPurchaseOrder {
            id: Ulid::new(),
            swimmer_id: previous.swimmer_id,
            funding_source_id: previous.funding_source_id,
            po_type: PoType::Lessons,
            start_date: start,
            end_date: lessons_window_end(start),
            sessions_authorized: self.policy.lessons_per_authorization,
            parent_po_id: Some(previous.id),
            external_id: None,
        })
        .await
    }

    pub async fn snapshot(&self, po_id: Ulid) -> Result<LedgerSnapshot, EngineError> {
        Ok(self.fetch(po_id).await?.snapshot())
    }

    pub async fn purchase_order(&self, po_id: Ulid) -> Result<PurchaseOrder, EngineError> {
        self.fetch(po_id).await
    }

    // ── Authorization status ─────────────────────────────────

    pub async fn approve(&self, po_id: Ulid, approval: Approval) -> Result<LedgerSnapshot, EngineError> {
        let number = approval
            .authorization_number
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        if number.as_ref().is_some_and(|n| n.len() > MAX_LABEL_LEN) {
            return Err(EngineError::LimitExceeded("authorization number too long"));
        }
        let (_, po) = self
            .update(po_id, |po| {
                if po.status != PoStatus::Pending {
                    return Err(EngineError::InvalidTransition {
                        id: po.id,
                        from: po.status.as_str(),
                        to: "approved",
                    });
                }
                if let Some(n) = &number {
                    po.authorization_number = Some(n.clone());
                    po.status = PoStatus::Active;
                } else if approval.override_pending_auth {
                    po.auth_override = true;
                    po.status = PoStatus::Active;
                } else {
                    po.status = PoStatus::ApprovedPendingAuth;
                }
                Ok(())
            })
            .await?;
        info!(%po_id, status = po.status.as_str(), "purchase order approved");
        Ok(po.snapshot())
    }

    pub async fn attach_authorization_number(
        &self,
        po_id: Ulid,
        number: &str,
    ) -> Result<LedgerSnapshot, EngineError> {
        let number = number.trim().to_string();
        if number.is_empty() {
            return Err(EngineError::InvalidInput("authorization number is empty"));
        }
        if number.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("authorization number too long"));
        }
        let (_, po) = self
            .update(po_id, |po| {
                match po.status {
                    PoStatus::ApprovedPendingAuth | PoStatus::Active => po.status = PoStatus::Active,
                    PoStatus::Completed => {}
                    other => {
                        return Err(EngineError::InvalidTransition {
                            id: po.id,
                            from: other.as_str(),
                            to: PoStatus::Active.as_str(),
                        });
                    }
                }
                po.authorization_number = Some(number.clone());
                Ok(())
            })
            .await?;
        info!(%po_id, "authorization number attached");
        Ok(po.snapshot())
    }

    pub async fn cancel(&self, po_id: Ulid, reason: Option<String>) -> Result<LedgerSnapshot, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_LABEL_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let (_, po) = self
            .update(po_id, |po| {
                if po.status.is_terminal() {
                    return Err(EngineError::InvalidTransition {
                        id: po.id,
                        from: po.status.as_str(),
                        to: PoStatus::Cancelled.as_str(),
                    });
                }
                po.status = PoStatus::Cancelled;
                po.cancellation_reason = reason.clone();
                Ok(())
            })
            .await?;
        info!(%po_id, "purchase order cancelled");
        Ok(po.snapshot())
    }

    /// Expire every open PO whose window ended before `today`.
    pub async fn expire_lapsed(&self, today: NaiveDate) -> Result<Vec<Ulid>, EngineError> {
        let mut expired = Vec::new();
        for po in self.store.purchase_orders().await? {
            if po.status.is_terminal() || po.end_date >= today {
                continue;
            }
            let result = self
                .update(po.id, |po| {
                    if po.status.is_terminal() || po.end_date >= today {
                        return Err(EngineError::InvalidState {
                            id: po.id,
                            reason: "no longer lapsed",
                        });
                    }
                    po.status = PoStatus::Expired;
                    Ok(())
                })
                .await;
            match result {
                Ok(_) => {
                    metrics::counter!(observability::PO_EXPIRED_TOTAL).increment(1);
                    info!(po_id = %po.id, end_date = %po.end_date, "purchase order expired");
                    expired.push(po.id);
                }
                Err(EngineError::InvalidState { .. }) => {}
                Err(e) => warn!(po_id = %po.id, "expiry failed: {e}"),
            }
        }
        Ok(expired)
    }

    // ── Counters ─────────────────────────────────────────────

    /// Claim `count` sessions against the authorization.
    pub async fn reserve(&self, po_id: Ulid, count: u32) -> Result<LedgerSnapshot, EngineError> {
        if count == 0 {
            return Err(EngineError::InvalidInput("reserve count must be positive"));
        }
        let mut swimmer_id = None;
        let result = self
            .update(po_id, |po| {
                swimmer_id = Some(po.swimmer_id);
                if !po.status.accepts_bookings() {
                    return Err(EngineError::InvalidState {
                        id: po.id,
                        reason: "purchase order is not open for booking",
                    });
                }
                if po.sessions_booked + count > po.sessions_authorized {
                    return Err(EngineError::AuthorizationExhausted {
                        po_id: po.id,
                        authorized: po.sessions_authorized,
                        booked: po.sessions_booked,
                        requested: count,
                    });
                }
                po.sessions_booked += count;
                Ok(())
            })
            .await;

        match result {
            Ok((_, po)) => {
                debug!(%po_id, count, booked = po.sessions_booked, authorized = po.sessions_authorized, "sessions reserved");
                Ok(po.snapshot())
            }
            Err(e @ EngineError::AuthorizationExhausted { .. }) => {
                metrics::counter!(observability::LEDGER_EXHAUSTED_TOTAL).increment(1);
                warn!(%po_id, "{e}");
                if let Some(swimmer_id) = swimmer_id {
                    self.notify
                        .signal(Signal::AuthorizationExhausted { po_id, swimmer_id });
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Undo a reservation. `sessions_booked` never drops below `sessions_used`.
    pub async fn release(&self, po_id: Ulid, count: u32) -> Result<LedgerSnapshot, EngineError> {
        let (_, po) = self
            .update(po_id, |po| {
                po.sessions_booked = po.sessions_booked.saturating_sub(count).max(po.sessions_used);
                Ok(())
            })
            .await?;
        debug!(%po_id, count, booked = po.sessions_booked, "sessions released");
        Ok(po.snapshot())
    }

    /// Record attended sessions. Completes the PO once every authorized
    /// session is used and raises `RenewalNeeded` as usage reaches the lead.
    pub async fn consume(&self, po_id: Ulid, count: u32) -> Result<Consumption, EngineError> {
        if count == 0 {
            return Err(EngineError::InvalidInput("consume count must be positive"));
        }
        let (before, after) = self
            .update(po_id, |po| {
                if !po.status.accepts_bookings() {
                    return Err(EngineError::InvalidState {
                        id: po.id,
                        reason: "purchase order is not active",
                    });
                }
                if po.sessions_used + count > po.sessions_booked {
                    return Err(EngineError::NothingToConsume {
                        po_id: po.id,
                        booked: po.sessions_booked,
                        used: po.sessions_used,
                        requested: count,
                    });
                }
                po.sessions_used += count;
                if po.sessions_used >= po.sessions_authorized {
                    po.status = PoStatus::Completed;
                }
                Ok(())
            })
            .await?;

        let threshold = after.sessions_authorized.saturating_sub(self.policy.renewal_lead);
        let renewal = (after.po_type == PoType::Lessons
            && before.sessions_used < threshold
            && after.sessions_used >= threshold)
            .then(|| RenewalNeeded {
                po_id,
                swimmer_id: after.swimmer_id,
                sessions_used: after.sessions_used,
                sessions_authorized: after.sessions_authorized,
            });
        if let Some(r) = &renewal {
            metrics::counter!(observability::RENEWAL_SIGNALS_TOTAL).increment(1);
            info!(%po_id, used = r.sessions_used, authorized = r.sessions_authorized, "renewal needed");
            self.notify.signal(Signal::RenewalNeeded(r.clone()));
        }
        if after.status == PoStatus::Completed && before.status != PoStatus::Completed {
            info!(%po_id, "purchase order completed");
        }
        Ok(Consumption {
            snapshot: after.snapshot(),
            renewal,
        })
    }

    /// Undo a consumption (a completed booking was cancelled after the fact).
    pub async fn restore(&self, po_id: Ulid, count: u32) -> Result<LedgerSnapshot, EngineError> {
        let (_, po) = self
            .update(po_id, |po| {
                if count == 0 || count > po.sessions_used {
                    return Err(EngineError::InvalidState {
                        id: po.id,
                        reason: "no used sessions to restore",
                    });
                }
                po.sessions_used -= count;
                po.sessions_booked -= count;
                if po.status == PoStatus::Completed && po.sessions_used < po.sessions_authorized {
                    po.status = if po.authorization_number.is_some() || po.auth_override {
                        PoStatus::Active
                    } else {
                        PoStatus::ApprovedPendingAuth
                    };
                }
                Ok(())
            })
            .await?;
        debug!(%po_id, count, used = po.sessions_used, "sessions restored");
        Ok(po.snapshot())
    }

    // ── Billing ──────────────────────────────────────────────

    /// Billing moves independently of authorization status; amounts are
    /// validated against the status being set.
    pub async fn record_billing(
        &self,
        po_id: Ulid,
        update: BillingUpdate,
    ) -> Result<LedgerSnapshot, EngineError> {
        if update.invoice_number.as_ref().is_some_and(|s| s.len() > MAX_LABEL_LEN)
            || update.note.as_ref().is_some_and(|s| s.len() > MAX_LABEL_LEN)
        {
            return Err(EngineError::LimitExceeded("billing text too long"));
        }
        let now = self.clock.now_ms();
        let (_, po) = self
            .update(po_id, |po| {
                let billed = update.billed_amount_cents.unwrap_or(po.billing.billed_amount_cents);
                let paid = update.paid_amount_cents.unwrap_or(po.billing.paid_amount_cents);
                check_amounts(update.status, billed, paid)?;

                let billing = &mut po.billing;
                billing.status = update.status;
                billing.billed_amount_cents = billed;
                billing.paid_amount_cents = paid;
                if update.invoice_number.is_some() {
                    billing.invoice_number = update.invoice_number.clone();
                }
                if update.due_date.is_some() {
                    billing.due_date = update.due_date;
                }
                if let Some(note) = &update.note {
                    billing.notes.push(note.clone());
                }
                match update.status {
                    BillingStatus::Billed => {
                        billing.billed_at.get_or_insert(now);
                    }
                    BillingStatus::Paid => {
                        billing.billed_at.get_or_insert(now);
                        billing.paid_at = Some(now);
                    }
                    _ => {}
                }
                Ok(())
            })
            .await?;
        info!(%po_id, billing = po.billing.status.as_str(), billed = po.billing.billed_amount_cents, paid = po.billing.paid_amount_cents, "billing recorded");
        Ok(po.snapshot())
    }

    /// Add a payment and derive `paid` or `partial` from the totals.
    pub async fn record_payment(
        &self,
        po_id: Ulid,
        amount_cents: i64,
        reference: Option<String>,
    ) -> Result<LedgerSnapshot, EngineError> {
        if amount_cents <= 0 {
            return Err(EngineError::InvalidBilling("payment must be positive"));
        }
        if reference.as_ref().is_some_and(|r| r.len() > MAX_LABEL_LEN) {
            return Err(EngineError::LimitExceeded("payment reference too long"));
        }
        let now = self.clock.now_ms();
        let (_, po) = self
            .update(po_id, |po| {
                let billing = &mut po.billing;
                if billing.billed_amount_cents <= 0 {
                    return Err(EngineError::InvalidBilling("nothing has been billed"));
                }
                billing.paid_amount_cents = billing
                    .paid_amount_cents
                    .checked_add(amount_cents)
                    .ok_or(EngineError::InvalidBilling("payment total overflows"))?;
                if billing.paid_amount_cents >= billing.billed_amount_cents {
                    billing.status = BillingStatus::Paid;
                    billing.paid_at = Some(now);
                } else {
                    billing.status = BillingStatus::Partial;
                }
                if reference.is_some() {
                    billing.payment_reference = reference.clone();
                }
                Ok(())
            })
            .await?;
        info!(%po_id, amount_cents, billing = po.billing.status.as_str(), "payment recorded");
        Ok(po.snapshot())
    }

    // ── Internals ────────────────────────────────────────────

    async fn fetch(&self, po_id: Ulid) -> Result<PurchaseOrder, EngineError> {
        self.store
            .purchase_order(po_id)
            .await?
            .ok_or(EngineError::NotFound(po_id))
    }

    /// Apply `change` to the PO under its row lock. Returns the row before
    /// and after the change.
    async fn update<'a, F>(
        &self,
        po_id: Ulid,
        change: F,
    ) -> Result<(PurchaseOrder, PurchaseOrder), EngineError>
    where
        F: FnOnce(&mut PurchaseOrder) -> Result<(), EngineError> + Send + 'a,
    {
        self.store
            .update_purchase_order(po_id, Box::new(change), self.clock.now_ms())
            .await
    }
}

fn check_amounts(status: BillingStatus, billed: i64, paid: i64) -> Result<(), EngineError> {
    if billed < 0 || paid < 0 {
        return Err(EngineError::InvalidBilling("amounts must not be negative"));
    }
    match status {
        BillingStatus::Billed if billed == 0 => {
            Err(EngineError::InvalidBilling("billed status needs a billed amount"))
        }
        BillingStatus::Paid if paid < billed => {
            Err(EngineError::InvalidBilling("paid status needs paid >= billed"))
        }
        BillingStatus::Partial if !(0 < paid && paid < billed) => {
            Err(EngineError::InvalidBilling("partial status needs 0 < paid < billed"))
        }
        _ => Ok(()),
    }
}
