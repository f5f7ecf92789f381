use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use super::clock::Clock;
use super::error::EngineError;
use crate::limits::*;
use crate::model::*;
use crate::store::{HoldLink, OccupancyChange, Store};

/// Apply an occupancy change to a locked session row. The store runs this
/// under the row's write lock, so the check and the write are one step.
pub(crate) fn apply_occupancy(
    state: &mut SessionState,
    change: OccupancyChange,
    now: Ms,
) -> Result<(), EngineError> {
    let id = state.session.id;
    let delta = change.delta;
    if delta == 0 {
        return Err(EngineError::InvalidInput("occupancy delta must be non-zero"));
    }
    match state.session.status {
        SessionStatus::Cancelled => {
            return Err(EngineError::InvalidState {
                id,
                reason: "session is cancelled",
            });
        }
        SessionStatus::Completed if delta > 0 => {
            return Err(EngineError::InvalidState {
                id,
                reason: "session is completed",
            });
        }
        _ => {}
    }
    match change.hold {
        HoldLink::Consume(_) if delta != 1 => {
            return Err(EngineError::InvalidInput("a hold claim confirms exactly one seat"));
        }
        HoldLink::Restore(_) if delta != -1 => {
            return Err(EngineError::InvalidInput("a hold restore releases exactly one seat"));
        }
        _ => {}
    }

    state.prune_expired(now);
    if let HoldLink::Consume(hold_id) = change.hold
        && state.remove_reservation(hold_id).is_none()
    {
        return Err(EngineError::InvalidState {
            id,
            reason: "hold has no live reservation on this session",
        });
    }

    let confirmed = state.session.confirmed_count;
    let next = if delta > 0 {
        let next = confirmed.saturating_add(delta as u32);
        if next + state.live_reservations(now) > state.session.capacity {
            return Err(EngineError::CapacityExceeded {
                session_id: id,
                capacity: state.session.capacity,
            });
        }
        next
    } else {
        let release = delta.unsigned_abs();
        if release > confirmed {
            return Err(EngineError::InvalidState {
                id,
                reason: "no confirmed occupancy to release",
            });
        }
        if let HoldLink::Restore(reservation) = change.hold
            && reservation.is_live(now)
            && state.session.status.is_open()
        {
            state.reservations.push(reservation);
        }
        confirmed - release
    };
    state.session.set_confirmed(next);
    Ok(())
}

/// New session as published by an admin.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub span: Span,
    pub capacity: u32,
    pub location: Option<String>,
    pub external_id: Option<String>,
}

/// Per-session occupancy. The confirmed count only ever moves through
/// `Store::adjust_occupancy`.
#[derive(Clone)]
pub struct CapacityTracker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl CapacityTracker {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn publish(&self, new: NewSession) -> Result<Session, EngineError> {
        if new.capacity == 0 {
            return Err(EngineError::InvalidInput("capacity must be at least 1"));
        }
        if new.capacity > MAX_SESSION_CAPACITY {
            return Err(EngineError::LimitExceeded("session capacity too large"));
        }
        if new.span.start >= new.span.end {
            return Err(EngineError::InvalidInput("session must end after it starts"));
        }
        if new.span.start < MIN_VALID_TIMESTAMP_MS || new.span.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if new.span.duration_ms() > MAX_SESSION_DURATION_MS {
            return Err(EngineError::LimitExceeded("session too long"));
        }
        if new.location.as_ref().is_some_and(|l| l.len() > MAX_LABEL_LEN) {
            return Err(EngineError::LimitExceeded("location too long"));
        }

        let mut session = Session::new(new.id, new.instructor_id, new.span, new.capacity, new.location);
        session.external_id = new.external_id;
        session.updated_at = self.clock.now_ms();
        let session = self.store.insert_session(session).await?;
        info!(session_id = %session.id, instructor_id = %session.instructor_id, capacity = session.capacity, "session published");
        Ok(session)
    }

    pub async fn session(&self, session_id: Ulid) -> Result<SessionState, EngineError> {
        self.store
            .session(session_id)
            .await?
            .ok_or(EngineError::NotFound(session_id))
    }

    /// `capacity - confirmed - live holds`; zero for cancelled or completed sessions.
    pub async fn get_available_capacity(&self, session_id: Ulid) -> Result<u32, EngineError> {
        let state = self.session(session_id).await?;
        Ok(state.available(self.clock.now_ms()))
    }

    /// Move the confirmed count by `delta` outside any hold.
    pub async fn confirm_occupancy(&self, session_id: Ulid, delta: i32) -> Result<Session, EngineError> {
        self.adjust(session_id, OccupancyChange::plain(delta)).await
    }

    /// Convert a hold's reservation on the session into a confirmed seat.
    pub(crate) async fn occupy_held(&self, session_id: Ulid, hold_id: Ulid) -> Result<Session, EngineError> {
        self.adjust(
            session_id,
            OccupancyChange {
                delta: 1,
                hold: HoldLink::Consume(hold_id),
            },
        )
        .await
    }

    /// Undo `occupy_held`: drop the seat and give the reservation back.
    pub(crate) async fn vacate_held(
        &self,
        session_id: Ulid,
        reservation: Reservation,
    ) -> Result<Session, EngineError> {
        self.adjust(
            session_id,
            OccupancyChange {
                delta: -1,
                hold: HoldLink::Restore(reservation),
            },
        )
        .await
    }

    async fn adjust(&self, session_id: Ulid, change: OccupancyChange) -> Result<Session, EngineError> {
        let session = self
            .store
            .adjust_occupancy(session_id, change, self.clock.now_ms())
            .await?;
        debug!(
            %session_id,
            delta = change.delta,
            confirmed = session.confirmed_count,
            capacity = session.capacity,
            status = session.status.as_str(),
            "occupancy adjusted"
        );
        Ok(session)
    }

    pub async fn mark_completed(&self, session_id: Ulid) -> Result<Session, EngineError> {
        self.store
            .transition_session(
                session_id,
                &[SessionStatus::Available, SessionStatus::Booked],
                SessionStatus::Completed,
                self.clock.now_ms(),
            )
            .await
    }

    pub async fn mark_cancelled(&self, session_id: Ulid) -> Result<Session, EngineError> {
        self.store
            .transition_session(
                session_id,
                &[SessionStatus::Available, SessionStatus::Booked],
                SessionStatus::Cancelled,
                self.clock.now_ms(),
            )
            .await
    }
}
