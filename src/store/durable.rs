use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use super::{BookingFilter, HoldClose, OccupancyChange, PoMutation, Store};
use crate::engine::EngineError;
use crate::engine::capacity::apply_occupancy;
use crate::limits::MAX_SESSIONS_PER_FACILITY;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

type Shared<T> = Arc<RwLock<T>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Commit, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first append, drains every append already queued
/// behind it, then syncs once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes of a failed batch
    // never ride along with the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &commits).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            let batch = vec![(commit, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

// ── Row helpers ──────────────────────────────────────────

fn row<T>(map: &DashMap<Ulid, Shared<T>>, id: Ulid) -> Result<Shared<T>, EngineError> {
    map.get(&id)
        .map(|e| e.value().clone())
        .ok_or(EngineError::NotFound(id))
}

fn all_rows<T>(map: &DashMap<Ulid, Shared<T>>) -> Vec<Shared<T>> {
    map.iter().map(|e| e.value().clone()).collect()
}

/// Insert a new row already write-locked, so nobody reads it before its
/// commit is durable.
fn claim<T>(
    map: &DashMap<Ulid, Shared<T>>,
    id: Ulid,
    value: T,
) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
    let shared = Arc::new(RwLock::new(value));
    let guard = shared
        .clone()
        .try_write_owned()
        .expect("fresh row lock is uncontended");
    match map.entry(id) {
        Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
        Entry::Vacant(slot) => {
            slot.insert(shared);
            Ok(guard)
        }
    }
}

/// Replay-only upsert; replay is the sole owner of every lock.
fn upsert<T>(map: &DashMap<Ulid, Shared<T>>, id: Ulid, value: T) {
    if let Some(existing) = map.get(&id) {
        *existing.try_write().expect("replay: uncontended write") = value;
        return;
    }
    map.insert(id, Arc::new(RwLock::new(value)));
}

/// In-memory rows backed by the write-ahead log.
///
/// Every mutation builds its new row images, appends them as one `Commit`,
/// and only then swaps them in under the row locks it holds. Locks on
/// several rows are taken hold first, then sessions in id order.
pub struct DurableStore {
    sessions: DashMap<Ulid, Shared<SessionState>>,
    by_instructor: DashMap<Ulid, Vec<Ulid>>,
    holds: DashMap<Ulid, Shared<Hold>>,
    bookings: DashMap<Ulid, Shared<Booking>>,
    /// (session, swimmer) → the single non-cancelled booking for the pair.
    active_pairs: DashMap<(Ulid, Ulid), Ulid>,
    purchase_orders: DashMap<Ulid, Shared<PurchaseOrder>>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations share it; compaction takes it exclusively so its snapshot
    /// matches the log it replaces.
    commit_gate: RwLock<()>,
    notify: Arc<NotifyHub>,
}

impl DurableStore {
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            sessions: DashMap::new(),
            by_instructor: DashMap::new(),
            holds: DashMap::new(),
            bookings: DashMap::new(),
            active_pairs: DashMap::new(),
            purchase_orders: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
        };
        for commit in &commits {
            for write in &commit.writes {
                store.replay_write(write);
            }
        }
        tracing::debug!(commits = commits.len(), "store replayed");
        Ok(store)
    }

    fn replay_write(&self, write: &Write) {
        match write {
            Write::Session(state) => {
                let id = state.session.id;
                if !self.sessions.contains_key(&id) {
                    self.by_instructor
                        .entry(state.session.instructor_id)
                        .or_default()
                        .push(id);
                }
                upsert(&self.sessions, id, state.clone());
            }
            Write::Hold(hold) => upsert(&self.holds, hold.id, hold.clone()),
            Write::Booking(booking) => {
                self.index_booking(booking);
                upsert(&self.bookings, booking.id, booking.clone());
            }
            Write::BookingDiscarded { id } => {
                if let Some((_, shared)) = self.bookings.remove(id) {
                    let booking = shared.try_read().expect("replay: uncontended read");
                    self.active_pairs
                        .remove_if(&(booking.session_id, booking.swimmer_id), |_, b| b == id);
                }
            }
            Write::PurchaseOrder(po) => upsert(&self.purchase_orders, po.id, po.clone()),
        }
    }

    fn index_booking(&self, booking: &Booking) {
        let key = (booking.session_id, booking.swimmer_id);
        if booking.status == BookingStatus::Cancelled {
            self.active_pairs.remove_if(&key, |_, id| *id == booking.id);
        } else {
            self.active_pairs.insert(key, booking.id);
        }
    }

    async fn wal_append(&self, commit: &Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    fn publish(&self, commit: &Commit) {
        for write in &commit.writes {
            self.notify.send(write.row_id(), write);
        }
    }

    /// Write-lock the given sessions in id order. Unknown ids fail with `NotFound`.
    async fn lock_sessions(
        &self,
        ids: &[Ulid],
    ) -> Result<Vec<OwnedRwLockWriteGuard<SessionState>>, EngineError> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            let shared = row(&self.sessions, id)?;
            guards.push(shared.write_owned().await);
        }
        Ok(guards)
    }
}

#[async_trait]
impl Store for DurableStore {
    async fn insert_session(&self, session: Session) -> Result<Session, EngineError> {
        if self.sessions.len() >= MAX_SESSIONS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }
        let _gate = self.commit_gate.read().await;
        let id = session.id;
        let instructor_id = session.instructor_id;
        let state = SessionState::new(session);
        let guard = claim(&self.sessions, id, state.clone())?;

        let commit = Commit::single(state.session.updated_at, Write::Session(state.clone()));
        if let Err(e) = self.wal_append(&commit).await {
            self.sessions.remove(&id);
            drop(guard);
            return Err(e);
        }
        drop(guard);
        self.by_instructor.entry(instructor_id).or_default().push(id);
        self.publish(&commit);
        Ok(state.session)
    }

    async fn session(&self, id: Ulid) -> Result<Option<SessionState>, EngineError> {
        let Some(shared) = self.sessions.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok(Some(guard.clone()))
    }

    async fn sessions_for_instructor(
        &self,
        instructor_id: Ulid,
        window: Span,
    ) -> Result<Vec<SessionState>, EngineError> {
        let ids = self
            .by_instructor
            .get(&instructor_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        for id in ids {
            let Some(shared) = self.sessions.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            let guard = shared.read().await;
            if window.contains_instant(guard.session.span.start) {
                out.push(guard.clone());
            }
        }
        out.sort_by_key(|s| (s.session.span.start, s.session.id));
        Ok(out)
    }

    async fn adjust_occupancy(
        &self,
        session_id: Ulid,
        change: OccupancyChange,
        now: Ms,
    ) -> Result<Session, EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = row(&self.sessions, session_id)?;
        let mut guard = shared.write().await;

        let mut next = guard.clone();
        apply_occupancy(&mut next, change, now)?;
        next.session.updated_at = now;

        let commit = Commit::single(now, Write::Session(next.clone()));
        self.wal_append(&commit).await?;
        *guard = next;
        self.publish(&commit);
        Ok(guard.session.clone())
    }

    async fn transition_session(
        &self,
        session_id: Ulid,
        from: &[SessionStatus],
        to: SessionStatus,
        now: Ms,
    ) -> Result<Session, EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = row(&self.sessions, session_id)?;
        let mut guard = shared.write().await;

        let current = guard.session.status;
        if !from.contains(&current) {
            return Err(EngineError::InvalidTransition {
                id: session_id,
                from: current.as_str(),
                to: to.as_str(),
            });
        }
        let mut next = guard.clone();
        next.session.status = to;
        next.session.updated_at = now;

        let commit = Commit::single(now, Write::Session(next.clone()));
        self.wal_append(&commit).await?;
        *guard = next;
        self.publish(&commit);
        Ok(guard.session.clone())
    }

    async fn place_hold(&self, hold: Hold, now: Ms) -> Result<Hold, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guards = self.lock_sessions(&hold.session_ids).await?;

        let exhausted: Vec<Ulid> = guards
            .iter()
            .filter(|g| g.available(now) == 0)
            .map(|g| g.session.id)
            .collect();
        if !exhausted.is_empty() {
            return Err(EngineError::InsufficientCapacity(exhausted));
        }

        let reservation = hold.reservation();
        let mut nexts = Vec::with_capacity(guards.len());
        let mut writes = Vec::with_capacity(guards.len() + 1);
        for guard in &guards {
            let mut next = (**guard).clone();
            next.prune_expired(now);
            next.reservations.push(reservation);
            next.session.updated_at = now;
            writes.push(Write::Session(next.clone()));
            nexts.push(next);
        }
        writes.push(Write::Hold(hold.clone()));

        let hold_guard = claim(&self.holds, hold.id, hold.clone())?;
        let commit = Commit { at: now, writes };
        if let Err(e) = self.wal_append(&commit).await {
            self.holds.remove(&hold.id);
            drop(hold_guard);
            return Err(e);
        }
        for (guard, next) in guards.iter_mut().zip(nexts) {
            **guard = next;
        }
        drop(hold_guard);
        self.publish(&commit);
        Ok(hold)
    }

    async fn hold(&self, id: Ulid) -> Result<Option<Hold>, EngineError> {
        let Some(shared) = self.holds.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok(Some(guard.clone()))
    }

    async fn extend_hold(
        &self,
        id: Ulid,
        owner: &str,
        expires_at: Ms,
        now: Ms,
    ) -> Result<Hold, EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = row(&self.holds, id)?;
        let mut hold_guard = shared.write().await;

        match hold_guard.status {
            HoldStatus::Active => {}
            HoldStatus::Expired => return Err(EngineError::HoldExpired(id)),
            HoldStatus::Confirmed | HoldStatus::Released => {
                return Err(EngineError::InvalidState {
                    id,
                    reason: "hold is no longer active",
                });
            }
        }
        if hold_guard.is_expired(now) {
            return Err(EngineError::HoldExpired(id));
        }
        if hold_guard.owner != owner {
            return Err(EngineError::NotOwner(id));
        }

        let mut guards = self.lock_sessions(&hold_guard.session_ids).await?;
        let mut next_hold = hold_guard.clone();
        next_hold.expires_at = expires_at;
        next_hold.updated_at = now;

        let mut nexts = Vec::with_capacity(guards.len());
        let mut writes = Vec::with_capacity(guards.len() + 1);
        for guard in &guards {
            let mut next = (**guard).clone();
            next.prune_expired(now);
            // A reservation already turned into a seat stays consumed.
            if let Some(r) = next.reservations.iter_mut().find(|r| r.hold_id == id) {
                r.expires_at = expires_at;
            }
            writes.push(Write::Session(next.clone()));
            nexts.push(next);
        }
        writes.push(Write::Hold(next_hold.clone()));

        let commit = Commit { at: now, writes };
        self.wal_append(&commit).await?;
        for (guard, next) in guards.iter_mut().zip(nexts) {
            **guard = next;
        }
        *hold_guard = next_hold.clone();
        self.publish(&commit);
        Ok(next_hold)
    }

    async fn close_hold(&self, id: Ulid, to: HoldStatus, now: Ms) -> Result<HoldClose, EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = row(&self.holds, id)?;
        let mut hold_guard = shared.write().await;
        if hold_guard.status != HoldStatus::Active {
            return Ok(HoldClose::AlreadyClosed(hold_guard.clone()));
        }

        let mut guards = self.lock_sessions(&hold_guard.session_ids).await?;
        let mut next_hold = hold_guard.clone();
        next_hold.status = to;
        next_hold.updated_at = now;

        let mut nexts = Vec::with_capacity(guards.len());
        let mut writes = Vec::with_capacity(guards.len() + 1);
        for guard in &guards {
            let mut next = (**guard).clone();
            next.remove_reservation(id);
            next.prune_expired(now);
            writes.push(Write::Session(next.clone()));
            nexts.push(next);
        }
        writes.push(Write::Hold(next_hold.clone()));

        let commit = Commit { at: now, writes };
        self.wal_append(&commit).await?;
        for (guard, next) in guards.iter_mut().zip(nexts) {
            **guard = next;
        }
        *hold_guard = next_hold.clone();
        self.publish(&commit);
        Ok(HoldClose::Closed(next_hold))
    }

    async fn expired_holds(&self, now: Ms) -> Result<Vec<Ulid>, EngineError> {
        let mut out = Vec::new();
        for shared in all_rows(&self.holds) {
            let hold = shared.read().await;
            if hold.status == HoldStatus::Active && hold.is_expired(now) {
                out.push(hold.id);
            }
        }
        Ok(out)
    }

    async fn insert_booking(&self, booking: Booking) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let id = booking.id;
        let key = (booking.session_id, booking.swimmer_id);
        let tracked = booking.status != BookingStatus::Cancelled;
        if tracked {
            match self.active_pairs.entry(key) {
                Entry::Occupied(_) => {
                    return Err(EngineError::DuplicateBooking {
                        session_id: booking.session_id,
                        swimmer_id: booking.swimmer_id,
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }
        let untrack = || {
            if tracked {
                self.active_pairs.remove_if(&key, |_, b| *b == id);
            }
        };

        let guard = match claim(&self.bookings, id, booking.clone()) {
            Ok(guard) => guard,
            Err(e) => {
                untrack();
                return Err(e);
            }
        };
        let commit = Commit::single(booking.updated_at, Write::Booking(booking.clone()));
        if let Err(e) = self.wal_append(&commit).await {
            self.bookings.remove(&id);
            untrack();
            drop(guard);
            return Err(e);
        }
        drop(guard);
        self.publish(&commit);
        Ok(booking)
    }

    async fn booking(&self, id: Ulid) -> Result<Option<Booking>, EngineError> {
        let Some(shared) = self.bookings.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok(Some(guard.clone()))
    }

    async fn bookings(&self, filter: BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let mut out = Vec::new();
        for shared in all_rows(&self.bookings) {
            let booking = shared.read().await;
            if filter.matches(&booking) {
                out.push(booking.clone());
            }
        }
        out.sort_by_key(|b| (b.created_at, b.id));
        Ok(out)
    }

    async fn transition_booking(
        &self,
        id: Ulid,
        from: &[BookingStatus],
        to: BookingStatus,
        cancellation: Option<Cancellation>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = row(&self.bookings, id)?;
        let mut guard = shared.write().await;

        let current = guard.status;
        if !from.contains(&current) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.as_str(),
                to: to.as_str(),
            });
        }
        let mut next = guard.clone();
        next.status = to;
        if cancellation.is_some() {
            next.cancellation = cancellation;
        }
        next.updated_at = now;

        let commit = Commit::single(now, Write::Booking(next.clone()));
        self.wal_append(&commit).await?;
        *guard = next;
        self.index_booking(&guard);
        self.publish(&commit);
        Ok(guard.clone())
    }

    async fn discard_booking(&self, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = row(&self.bookings, id)?;
        let guard = shared.write().await;

        let commit = Commit::single(now, Write::BookingDiscarded { id });
        self.wal_append(&commit).await?;
        self.bookings.remove(&id);
        self.active_pairs
            .remove_if(&(guard.session_id, guard.swimmer_id), |_, b| *b == id);
        self.publish(&commit);
        Ok(())
    }

    async fn insert_purchase_order(&self, po: PurchaseOrder) -> Result<PurchaseOrder, EngineError> {
        let _gate = self.commit_gate.read().await;
        let guard = claim(&self.purchase_orders, po.id, po.clone())?;
        let commit = Commit::single(po.updated_at, Write::PurchaseOrder(po.clone()));
        if let Err(e) = self.wal_append(&commit).await {
            self.purchase_orders.remove(&po.id);
            drop(guard);
            return Err(e);
        }
        drop(guard);
        self.publish(&commit);
        Ok(po)
    }

    async fn purchase_order(&self, id: Ulid) -> Result<Option<PurchaseOrder>, EngineError> {
        let Some(shared) = self.purchase_orders.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok(Some(guard.clone()))
    }

    async fn purchase_orders(&self) -> Result<Vec<PurchaseOrder>, EngineError> {
        let mut out = Vec::new();
        for shared in all_rows(&self.purchase_orders) {
            out.push(shared.read().await.clone());
        }
        out.sort_by_key(|po| po.id);
        Ok(out)
    }

    async fn update_purchase_order(
        &self,
        id: Ulid,
        apply: PoMutation<'_>,
        now: Ms,
    ) -> Result<(PurchaseOrder, PurchaseOrder), EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = row(&self.purchase_orders, id)?;
        let mut guard = shared.write().await;

        let mut next = guard.clone();
        apply(&mut next)?;
        if !next.counters_consistent() {
            return Err(EngineError::InvalidState {
                id,
                reason: "ledger counters out of order",
            });
        }
        next.version += 1;
        next.updated_at = now;

        let commit = Commit::single(now, Write::PurchaseOrder(next.clone()));
        self.wal_append(&commit).await?;
        let before = std::mem::replace(&mut *guard, next.clone());
        self.publish(&commit);
        Ok((before, next))
    }

    /// Rewrite the log as one commit per live row.
    async fn compact(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut commits = Vec::new();
        for shared in all_rows(&self.sessions) {
            let state = shared.read().await;
            commits.push(Commit::single(state.session.updated_at, Write::Session(state.clone())));
        }
        for shared in all_rows(&self.holds) {
            let hold = shared.read().await;
            commits.push(Commit::single(hold.updated_at, Write::Hold(hold.clone())));
        }
        for shared in all_rows(&self.bookings) {
            let booking = shared.read().await;
            commits.push(Commit::single(booking.updated_at, Write::Booking(booking.clone())));
        }
        for shared in all_rows(&self.purchase_orders) {
            let po = shared.read().await;
            commits.push(Commit::single(po.updated_at, Write::PurchaseOrder(po.clone())));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                commits,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
