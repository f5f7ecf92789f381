use std::sync::Arc;

use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::capacity::CapacityTracker;
use super::clock::Clock;
use super::error::EngineError;
use super::holds::HoldManager;
use super::ledger::QuotaLedger;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::{BookingFilter, Store};

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub swimmer_id: Ulid,
    pub parent_id: Option<Ulid>,
    /// Purchase order charged for every session in the hold.
    pub po_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub hold: Hold,
    pub bookings: Vec<Booking>,
    pub ledger: Option<LedgerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub booking: Booking,
    /// The booking was already cancelled; nothing changed.
    pub already_cancelled: bool,
    pub ledger: Option<LedgerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCompletion {
    pub session: Session,
    pub completed: Vec<Booking>,
    pub renewals: Vec<RenewalNeeded>,
    /// Bookings completed whose PO could not be charged.
    pub ledger_failures: Vec<(Ulid, EngineError)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClosure {
    pub session: Session,
    pub cancelled: Vec<Booking>,
}

#[derive(Default)]
struct Progress {
    occupied: Vec<Ulid>,
    created: Vec<Booking>,
}

/// Turns a hold into bookings across capacity, ledger and hold state.
///
/// Confirmation runs as a sequence of independent atomic steps; any failure
/// undoes the completed ones in reverse so the caller sees all bookings or
/// none.
#[derive(Clone)]
pub struct BookingOrchestrator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    capacity: CapacityTracker,
    holds: HoldManager,
    ledger: QuotaLedger,
    late_cancel_window_ms: Ms,
}

impl BookingOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        capacity: CapacityTracker,
        holds: HoldManager,
        ledger: QuotaLedger,
        late_cancel_window_ms: Ms,
    ) -> Self {
        Self {
            store,
            clock,
            capacity,
            holds,
            ledger,
            late_cancel_window_ms,
        }
    }

    pub async fn confirm_booking(
        &self,
        hold_id: Ulid,
        owner: &str,
        request: BookingRequest,
    ) -> Result<Confirmation, EngineError> {
        let hold = self.holds.validate_hold(hold_id, owner).await?;
        let count = hold.session_ids.len() as u32;
        let ledger = match request.po_id {
            Some(po_id) => Some(self.ledger.reserve(po_id, count).await?),
            None => None,
        };

        let mut progress = Progress::default();
        for &session_id in &hold.session_ids {
            if let Err(e) = self
                .occupy_and_book(&hold, session_id, &request, &mut progress)
                .await
            {
                warn!(%hold_id, %session_id, "booking step failed: {e}");
                self.compensate(&hold, &progress, request.po_id, count).await;
                return Err(e);
            }
        }

        let hold = match self.holds.mark_confirmed(hold_id).await {
            Ok(hold) => hold,
            Err(e) => {
                warn!(%hold_id, "hold lost before confirmation: {e}");
                self.compensate(&hold, &progress, request.po_id, count).await;
                return Err(e);
            }
        };

        metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL).increment(progress.created.len() as u64);
        info!(
            %hold_id,
            swimmer_id = %request.swimmer_id,
            bookings = progress.created.len(),
            po_id = ?request.po_id,
            "booking confirmed"
        );
        Ok(Confirmation {
            hold,
            bookings: progress.created,
            ledger,
        })
    }

    async fn occupy_and_book(
        &self,
        hold: &Hold,
        session_id: Ulid,
        request: &BookingRequest,
        progress: &mut Progress,
    ) -> Result<(), EngineError> {
        self.capacity.occupy_held(session_id, hold.id).await?;
        progress.occupied.push(session_id);

        let now = self.clock.now_ms();
        let booking = self
            .store
            .insert_booking(Booking {
                id: Ulid::new(),
                session_id,
                swimmer_id: request.swimmer_id,
                parent_id: request.parent_id,
                po_id: request.po_id,
                hold_id: Some(hold.id),
                status: BookingStatus::Confirmed,
                cancellation: None,
                created_at: now,
                updated_at: now,
                external_id: None,
            })
            .await?;
        progress.created.push(booking);
        Ok(())
    }

    /// Undo completed confirmation steps in reverse. Failures here are
    /// logged and counted; they never mask the original error.
    async fn compensate(&self, hold: &Hold, progress: &Progress, po_id: Option<Ulid>, reserved: u32) {
        metrics::counter!(observability::BOOKING_ROLLBACKS_TOTAL).increment(1);
        let now = self.clock.now_ms();

        for booking in progress.created.iter().rev() {
            if let Err(e) = self.store.discard_booking(booking.id, now).await {
                compensation_failed("discard booking", booking.id, &e);
            }
        }

        // Seats go back to the hold only while it can still use them.
        let restore = match self.store.hold(hold.id).await {
            Ok(Some(current)) if current.is_live(now) => Some(current.reservation()),
            _ => None,
        };
        for &session_id in progress.occupied.iter().rev() {
            let result = match restore {
                Some(reservation) => self.capacity.vacate_held(session_id, reservation).await,
                None => self.capacity.confirm_occupancy(session_id, -1).await,
            };
            if let Err(e) = result {
                compensation_failed("release seat", session_id, &e);
            }
        }

        if let Some(po_id) = po_id
            && let Err(e) = self.ledger.release(po_id, reserved).await
        {
            compensation_failed("release purchase order", po_id, &e);
        }

        warn!(
            hold_id = %hold.id,
            bookings = progress.created.len(),
            seats = progress.occupied.len(),
            "booking rolled back"
        );
    }

    /// Cancel a booking. Cancelling twice returns the first result unchanged.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        source: CancelSource,
        reason: Option<String>,
    ) -> Result<CancelOutcome, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_LABEL_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let booking = self.fetch_booking(booking_id).await?;
        if booking.status == BookingStatus::Cancelled {
            return Ok(CancelOutcome {
                booking,
                already_cancelled: true,
                ledger: None,
            });
        }

        if source == CancelSource::Parent && booking.status == BookingStatus::Confirmed {
            let session = self.capacity.session(booking.session_id).await?.session;
            let lead = session.span.start - self.clock.now_ms();
            if lead < self.late_cancel_window_ms {
                return Err(EngineError::CancellationWindowClosed {
                    booking_id,
                    minutes_before_start: lead / MINUTE,
                });
            }
        }
        self.cancel_inner(booking, source, reason).await
    }

    async fn cancel_inner(
        &self,
        booking: Booking,
        source: CancelSource,
        reason: Option<String>,
    ) -> Result<CancelOutcome, EngineError> {
        let booking_id = booking.id;
        let mut current = booking;
        let mut won = None;
        for _ in 0..MAX_CANCEL_RETRIES {
            if current.status == BookingStatus::Cancelled {
                return Ok(CancelOutcome {
                    booking: current,
                    already_cancelled: true,
                    ledger: None,
                });
            }
            let now = self.clock.now_ms();
            let cancellation = Cancellation {
                source,
                reason: reason.clone(),
                at: now,
            };
            match self
                .store
                .transition_booking(
                    booking_id,
                    &[current.status],
                    BookingStatus::Cancelled,
                    Some(cancellation),
                    now,
                )
                .await
            {
                Ok(cancelled) => {
                    won = Some((current.status, cancelled));
                    break;
                }
                Err(EngineError::InvalidTransition { .. }) => {
                    current = self.fetch_booking(booking_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        let Some((prior, cancelled)) = won else {
            return Err(EngineError::VersionConflict(booking_id));
        };

        // Only the caller whose transition won reaches this point, so the
        // seat and the ledger move exactly once.
        let session_open = self
            .store
            .session(cancelled.session_id)
            .await?
            .is_some_and(|s| s.session.status != SessionStatus::Cancelled);
        if session_open {
            if let Err(e) = self.capacity.confirm_occupancy(cancelled.session_id, -1).await {
                compensation_failed("release seat on cancel", cancelled.session_id, &e);
            }
        } else {
            debug!(session_id = %cancelled.session_id, "seat count frozen on cancelled session");
        }

        let ledger = match cancelled.po_id {
            Some(po_id) if prior == BookingStatus::Completed => {
                Some(self.ledger.restore(po_id, 1).await.inspect_err(|e| {
                    error!(%booking_id, %po_id, "cancelled booking left its usage on the PO: {e}");
                })?)
            }
            Some(po_id) => Some(self.ledger.release(po_id, 1).await.inspect_err(|e| {
                error!(%booking_id, %po_id, "cancelled booking left its reservation on the PO: {e}");
            })?),
            None => None,
        };

        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL, "source" => source.as_str()).increment(1);
        info!(
            %booking_id,
            session_id = %cancelled.session_id,
            source = source.as_str(),
            prior = prior.as_str(),
            "booking cancelled"
        );
        Ok(CancelOutcome {
            booking: cancelled,
            already_cancelled: false,
            ledger,
        })
    }

    /// Close a session that took place and charge its attendees' POs.
    pub async fn complete_session(&self, session_id: Ulid) -> Result<SessionCompletion, EngineError> {
        let session = self.capacity.mark_completed(session_id).await?;
        let mut completion = SessionCompletion {
            session,
            completed: Vec::new(),
            renewals: Vec::new(),
            ledger_failures: Vec::new(),
        };

        for booking in self.store.bookings(BookingFilter::Session(session_id)).await? {
            if booking.status != BookingStatus::Confirmed {
                continue;
            }
            let done = match self
                .store
                .transition_booking(
                    booking.id,
                    &[BookingStatus::Confirmed],
                    BookingStatus::Completed,
                    None,
                    self.clock.now_ms(),
                )
                .await
            {
                Ok(done) => done,
                Err(EngineError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            };
            if let Some(po_id) = done.po_id {
                match self.ledger.consume(po_id, 1).await {
                    Ok(consumption) => completion.renewals.extend(consumption.renewal),
                    Err(e) => {
                        warn!(booking_id = %done.id, %po_id, "attendance not charged: {e}");
                        completion.ledger_failures.push((done.id, e));
                    }
                }
            }
            completion.completed.push(done);
        }

        info!(
            %session_id,
            attended = completion.completed.len(),
            renewals = completion.renewals.len(),
            "session completed"
        );
        Ok(completion)
    }

    /// Admin close: cancel every live booking, then the session itself.
    pub async fn cancel_session(
        &self,
        session_id: Ulid,
        reason: Option<String>,
    ) -> Result<SessionClosure, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_LABEL_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let state = self.capacity.session(session_id).await?;
        if !state.session.status.is_open() {
            return Err(EngineError::InvalidTransition {
                id: session_id,
                from: state.session.status.as_str(),
                to: SessionStatus::Cancelled.as_str(),
            });
        }

        let mut cancelled = self.cancel_all(session_id, reason.clone()).await?;
        let session = self.capacity.mark_cancelled(session_id).await?;
        // Bookings confirmed while the first pass ran.
        cancelled.extend(self.cancel_all(session_id, reason).await?);

        info!(%session_id, cancelled = cancelled.len(), "session cancelled");
        Ok(SessionClosure { session, cancelled })
    }

    async fn cancel_all(
        &self,
        session_id: Ulid,
        reason: Option<String>,
    ) -> Result<Vec<Booking>, EngineError> {
        let mut out = Vec::new();
        for booking in self.store.bookings(BookingFilter::Session(session_id)).await? {
            if booking.status == BookingStatus::Cancelled {
                continue;
            }
            let booking_id = booking.id;
            match self.cancel_inner(booking, CancelSource::Admin, reason.clone()).await {
                Ok(outcome) if !outcome.already_cancelled => out.push(outcome.booking),
                Ok(_) => {}
                Err(e) => warn!(%booking_id, "cascade cancel failed: {e}"),
            }
        }
        Ok(out)
    }

    /// `confirmed -> no_show`. The PO keeps the session booked but unused.
    pub async fn mark_no_show(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self
            .store
            .transition_booking(
                booking_id,
                &[BookingStatus::Confirmed],
                BookingStatus::NoShow,
                None,
                self.clock.now_ms(),
            )
            .await?;
        info!(%booking_id, "booking marked no-show");
        Ok(booking)
    }

    async fn fetch_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.store
            .booking(booking_id)
            .await?
            .ok_or(EngineError::NotFound(booking_id))
    }
}

fn compensation_failed(step: &'static str, id: Ulid, e: &EngineError) {
    metrics::counter!(observability::COMPENSATION_FAILURES_TOTAL).increment(1);
    error!(step, %id, "compensation step failed: {e}");
}
