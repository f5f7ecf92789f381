use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::NaiveTime;

use crate::store::{BookingFilter, HoldClose, OccupancyChange, PoMutation};

const M: Ms = 60_000; // 1 minute in ms

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("lanehold_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn four_pm() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap()
}

/// UTC instant of `date` at `hour:00`.
fn at(y: i32, m: u32, d: u32, hour: u32) -> Ms {
    let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap();
    recurrence::local_instant(date(y, m, d), time, chrono_tz::UTC).unwrap()
}

fn test_config() -> EngineConfig {
    EngineConfig {
        timezone: chrono_tz::UTC,
        ..EngineConfig::default()
    }
}

struct Harness {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
}

/// Engine on a fresh WAL with the clock at 2026-03-01T00:00Z (a Sunday).
fn harness(name: &str) -> Harness {
    let notify = Arc::new(NotifyHub::new());
    let store = Arc::new(DurableStore::open(test_wal_path(name), notify.clone()).unwrap());
    harness_on(store, notify)
}

fn harness_on(store: Arc<dyn Store>, notify: Arc<NotifyHub>) -> Harness {
    let clock = Arc::new(ManualClock::new(at(2026, 3, 1, 0)));
    let engine = Engine::with_parts(store, clock.clone(), notify, test_config());
    Harness {
        engine: Arc::new(engine),
        clock,
    }
}

async fn publish(engine: &Engine, instructor_id: Ulid, start: Ms, capacity: u32) -> Session {
    engine
        .capacity
        .publish(NewSession {
            id: Ulid::new(),
            instructor_id,
            span: Span::new(start, start + 30 * M),
            capacity,
            location: Some("Lane 3".into()),
            external_id: None,
        })
        .await
        .unwrap()
}

/// Approved lessons PO covering March through May.
async fn active_po(engine: &Engine, swimmer_id: Ulid, authorized: u32) -> PurchaseOrder {
    let po = engine
        .ledger
        .open(NewPurchaseOrder {
            id: Ulid::new(),
            swimmer_id,
            funding_source_id: Ulid::new(),
            po_type: PoType::Lessons,
            start_date: date(2026, 3, 1),
            end_date: date(2026, 5, 31),
            sessions_authorized: authorized,
            parent_po_id: None,
            external_id: None,
        })
        .await
        .unwrap();
    engine
        .approve_po(
            po.id,
            Approval {
                authorization_number: Some("RC-2026-0001".into()),
                override_pending_auth: false,
            },
        )
        .await
        .unwrap();
    po
}

fn request(swimmer_id: Ulid, po_id: Option<Ulid>) -> BookingRequest {
    BookingRequest {
        swimmer_id,
        parent_id: Some(Ulid::new()),
        po_id,
    }
}

/// Book a single session for `swimmer_id` through a hold.
async fn book_one(engine: &Engine, session_id: Ulid, swimmer_id: Ulid, po_id: Option<Ulid>) -> Booking {
    let hold = engine.create_hold(&[session_id], "tab-1", None).await.unwrap();
    let confirmation = engine
        .confirm_booking(hold.id, "tab-1", request(swimmer_id, po_id))
        .await
        .unwrap();
    confirmation.bookings.into_iter().next().unwrap()
}

/// Delegates to a durable store but fails the Nth seat increase.
struct FaultyStore {
    inner: DurableStore,
    fail_on_increase: usize,
    increases: AtomicUsize,
}

#[async_trait]
impl Store for FaultyStore {
    async fn insert_session(&self, session: Session) -> Result<Session, EngineError> {
        self.inner.insert_session(session).await
    }

    async fn session(&self, id: Ulid) -> Result<Option<SessionState>, EngineError> {
        self.inner.session(id).await
    }

    async fn sessions_for_instructor(
        &self,
        instructor_id: Ulid,
        window: Span,
    ) -> Result<Vec<SessionState>, EngineError> {
        self.inner.sessions_for_instructor(instructor_id, window).await
    }

    async fn adjust_occupancy(
        &self,
        session_id: Ulid,
        change: OccupancyChange,
        now: Ms,
    ) -> Result<Session, EngineError> {
        if change.delta > 0 {
            let n = self.increases.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on_increase {
                return Err(EngineError::WalError("injected fault".into()));
            }
        }
        self.inner.adjust_occupancy(session_id, change, now).await
    }

    async fn transition_session(
        &self,
        session_id: Ulid,
        from: &[SessionStatus],
        to: SessionStatus,
        now: Ms,
    ) -> Result<Session, EngineError> {
        self.inner.transition_session(session_id, from, to, now).await
    }

    async fn place_hold(&self, hold: Hold, now: Ms) -> Result<Hold, EngineError> {
        self.inner.place_hold(hold, now).await
    }

    async fn hold(&self, id: Ulid) -> Result<Option<Hold>, EngineError> {
        self.inner.hold(id).await
    }

    async fn extend_hold(
        &self,
        id: Ulid,
        owner: &str,
        expires_at: Ms,
        now: Ms,
    ) -> Result<Hold, EngineError> {
        self.inner.extend_hold(id, owner, expires_at, now).await
    }

    async fn close_hold(&self, id: Ulid, to: HoldStatus, now: Ms) -> Result<HoldClose, EngineError> {
        self.inner.close_hold(id, to, now).await
    }

    async fn expired_holds(&self, now: Ms) -> Result<Vec<Ulid>, EngineError> {
        self.inner.expired_holds(now).await
    }

    async fn insert_booking(&self, booking: Booking) -> Result<Booking, EngineError> {
        self.inner.insert_booking(booking).await
    }

    async fn booking(&self, id: Ulid) -> Result<Option<Booking>, EngineError> {
        self.inner.booking(id).await
    }

    async fn bookings(&self, filter: BookingFilter) -> Result<Vec<Booking>, EngineError> {
        self.inner.bookings(filter).await
    }

    async fn transition_booking(
        &self,
        id: Ulid,
        from: &[BookingStatus],
        to: BookingStatus,
        cancellation: Option<Cancellation>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        self.inner.transition_booking(id, from, to, cancellation, now).await
    }

    async fn discard_booking(&self, id: Ulid, now: Ms) -> Result<(), EngineError> {
        self.inner.discard_booking(id, now).await
    }

    async fn insert_purchase_order(&self, po: PurchaseOrder) -> Result<PurchaseOrder, EngineError> {
        self.inner.insert_purchase_order(po).await
    }

    async fn purchase_order(&self, id: Ulid) -> Result<Option<PurchaseOrder>, EngineError> {
        self.inner.purchase_order(id).await
    }

    async fn purchase_orders(&self) -> Result<Vec<PurchaseOrder>, EngineError> {
        self.inner.purchase_orders().await
    }

    async fn update_purchase_order(
        &self,
        id: Ulid,
        apply: PoMutation<'_>,
        now: Ms,
    ) -> Result<(PurchaseOrder, PurchaseOrder), EngineError> {
        self.inner.update_purchase_order(id, apply, now).await
    }
}

fn faulty_harness(name: &str, fail_on_increase: usize) -> Harness {
    let notify = Arc::new(NotifyHub::new());
    let inner = DurableStore::open(test_wal_path(name), notify.clone()).unwrap();
    let store = Arc::new(FaultyStore {
        inner,
        fail_on_increase,
        increases: AtomicUsize::new(0),
    });
    harness_on(store, notify)
}

// ── Capacity ─────────────────────────────────────────────

#[tokio::test]
async fn concurrent_holds_never_exceed_capacity() {
    let h = harness("concurrent_holds.wal");
    let session_id = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 3).await.id;

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_hold(&[session_id], &format!("tab-{i}"), None).await
        }));
    }
    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(e) => assert_eq!(e, EngineError::InsufficientCapacity(vec![session_id])),
        }
    }
    assert_eq!(won, 3);
    assert_eq!(h.engine.get_available_capacity(session_id).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_occupancy_stops_at_capacity() {
    let h = harness("concurrent_occupancy.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 5).await;
    let session_id = session.id;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.capacity.confirm_occupancy(session_id, 1).await
        }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(e, EngineError::CapacityExceeded { capacity: 5, .. })),
        }
    }
    assert_eq!(ok, 5);

    let state = h.engine.capacity.session(session.id).await.unwrap();
    assert_eq!(state.session.confirmed_count, 5);
    assert_eq!(state.session.status, SessionStatus::Booked);
    assert!(state.session.is_full());

    h.engine.capacity.confirm_occupancy(session.id, -1).await.unwrap();
    let state = h.engine.capacity.session(session.id).await.unwrap();
    assert_eq!(state.session.status, SessionStatus::Available);
}

#[tokio::test]
async fn occupancy_never_goes_negative() {
    let h = harness("occupancy_negative.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 2).await;
    let err = h.engine.capacity.confirm_occupancy(session.id, -1).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
    assert_eq!(h.engine.get_available_capacity(session.id).await.unwrap(), 2);
}

#[tokio::test]
async fn publish_validates_input() {
    let h = harness("publish_validates.wal");
    let start = at(2026, 3, 3, 16);
    let err = h
        .engine
        .capacity
        .publish(NewSession {
            id: Ulid::new(),
            instructor_id: Ulid::new(),
            span: Span::new(start, start + 30 * M),
            capacity: 0,
            location: None,
            external_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let missing = Ulid::new();
    assert_eq!(
        h.engine.get_available_capacity(missing).await.unwrap_err(),
        EngineError::NotFound(missing)
    );
}

// ── Holds ────────────────────────────────────────────────

#[tokio::test]
async fn expired_hold_returns_capacity() {
    let h = harness("hold_expiry.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 1).await;

    let hold = h
        .engine
        .create_hold(&[session.id], "tab-1", Some(1_000))
        .await
        .unwrap();
    assert_eq!(h.engine.get_available_capacity(session.id).await.unwrap(), 0);
    assert!(h.engine.create_hold(&[session.id], "tab-2", None).await.is_err());

    h.clock.advance(1_001);
    assert_eq!(h.engine.get_available_capacity(session.id).await.unwrap(), 1);
    h.engine
        .create_hold(&[session.id], "tab-2", None)
        .await
        .unwrap();

    let err = h
        .engine
        .confirm_booking(hold.id, "tab-1", request(Ulid::new(), None))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::HoldExpired(hold.id));
    let stored = h.engine.store().hold(hold.id).await.unwrap().unwrap();
    assert_eq!(stored.status, HoldStatus::Expired);
}

#[tokio::test]
async fn sweep_closes_expired_holds_once() {
    let h = harness("hold_sweep.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 2).await;
    let hold = h
        .engine
        .create_hold(&[session.id], "tab-1", Some(1_000))
        .await
        .unwrap();

    assert_eq!(h.engine.sweep().await.unwrap().holds_expired, 0);
    h.clock.advance(2_000);
    assert_eq!(h.engine.sweep().await.unwrap().holds_expired, 1);
    assert_eq!(h.engine.sweep().await.unwrap().holds_expired, 0);

    let stored = h.engine.store().hold(hold.id).await.unwrap().unwrap();
    assert_eq!(stored.status, HoldStatus::Expired);
    let state = h.engine.capacity.session(session.id).await.unwrap();
    assert!(state.reservations.is_empty());
}

#[tokio::test]
async fn hold_belongs_to_its_owner() {
    let h = harness("hold_owner.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 2).await;
    let hold = h.engine.create_hold(&[session.id], "tab-1", None).await.unwrap();

    let err = h
        .engine
        .confirm_booking(hold.id, "tab-2", request(Ulid::new(), None))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NotOwner(hold.id));
    assert_eq!(
        h.engine.renew_hold(hold.id, "tab-2").await.unwrap_err(),
        EngineError::NotOwner(hold.id)
    );
    // Still usable by its owner.
    h.engine
        .confirm_booking(hold.id, "tab-1", request(Ulid::new(), None))
        .await
        .unwrap();
}

#[tokio::test]
async fn renewal_is_capped_at_max_lifetime() {
    let h = harness("hold_renew.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 1).await;
    let hold = h.engine.create_hold(&[session.id], "tab-1", None).await.unwrap();
    let cap = hold.created_at + h.engine.config().max_hold_lifetime_ms;

    let mut renewed = hold.clone();
    for _ in 0..7 {
        h.clock.advance(500_000);
        renewed = h.engine.renew_hold(hold.id, "tab-1").await.unwrap();
        assert!(renewed.expires_at <= cap);
    }
    assert_eq!(renewed.expires_at, cap);

    h.clock.set(cap + 1);
    assert_eq!(
        h.engine.renew_hold(hold.id, "tab-1").await.unwrap_err(),
        EngineError::HoldExpired(hold.id)
    );
    assert_eq!(h.engine.get_available_capacity(session.id).await.unwrap(), 1);
}

#[tokio::test]
async fn release_is_idempotent() {
    let h = harness("hold_release.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 1).await;
    let hold = h.engine.create_hold(&[session.id], "tab-1", None).await.unwrap();

    let released = h.engine.release_hold(hold.id).await.unwrap();
    assert_eq!(released.status, HoldStatus::Released);
    let again = h.engine.release_hold(hold.id).await.unwrap();
    assert_eq!(again.status, HoldStatus::Released);
    assert_eq!(h.engine.get_available_capacity(session.id).await.unwrap(), 1);

    let err = h
        .engine
        .confirm_booking(hold.id, "tab-1", request(Ulid::new(), None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn hold_ttl_limits() {
    let h = harness("hold_ttl_limits.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 1).await;
    let too_long = h.engine.config().max_hold_ttl_ms + 1;
    assert!(matches!(
        h.engine.create_hold(&[session.id], "tab-1", Some(too_long)).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        h.engine.create_hold(&[session.id], "", None).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        h.engine.create_hold(&[], "tab-1", None).await,
        Err(EngineError::InvalidInput(_))
    ));
    // Duplicate ids collapse to one reservation.
    let hold = h
        .engine
        .create_hold(&[session.id, session.id], "tab-1", None)
        .await
        .unwrap();
    assert_eq!(hold.session_ids, vec![session.id]);
}

// ── Booking confirmation ─────────────────────────────────

#[tokio::test]
async fn confirm_turns_hold_into_bookings() {
    let h = harness("confirm_basic.wal");
    let instructor = Ulid::new();
    let a = publish(&h.engine, instructor, at(2026, 3, 3, 16), 4).await;
    let b = publish(&h.engine, instructor, at(2026, 3, 10, 16), 4).await;
    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 12).await;

    let hold = h.engine.create_hold(&[a.id, b.id], "tab-1", None).await.unwrap();
    assert_eq!(h.engine.get_available_capacity(a.id).await.unwrap(), 3);

    let confirmation = h
        .engine
        .confirm_booking(hold.id, "tab-1", request(swimmer, Some(po.id)))
        .await
        .unwrap();
    assert_eq!(confirmation.bookings.len(), 2);
    assert_eq!(confirmation.hold.status, HoldStatus::Confirmed);
    assert_eq!(confirmation.ledger.as_ref().unwrap().sessions_booked, 2);

    for session_id in [a.id, b.id] {
        let state = h.engine.capacity.session(session_id).await.unwrap();
        assert_eq!(state.session.confirmed_count, 1);
        assert!(state.reservations.is_empty());
        assert_eq!(state.available(h.engine.now_ms()), 3);
    }
    let by_hold = h.engine.store().bookings(BookingFilter::Hold(hold.id)).await.unwrap();
    assert_eq!(by_hold.len(), 2);
    assert!(by_hold.iter().all(|b| b.status == BookingStatus::Confirmed && b.po_id == Some(po.id)));
}

#[tokio::test]
async fn failed_step_rolls_back_every_booking() {
    // Third seat increase fails: two sessions are already booked by then.
    let h = faulty_harness("confirm_rollback.wal", 3);
    let instructor = Ulid::new();
    let mut sessions = Vec::new();
    for day in [3, 10, 17, 24] {
        sessions.push(publish(&h.engine, instructor, at(2026, 3, day, 16), 2).await.id);
    }
    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 12).await;
    let hold = h.engine.create_hold(&sessions, "tab-1", None).await.unwrap();

    let err = h
        .engine
        .confirm_booking(hold.id, "tab-1", request(swimmer, Some(po.id)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::WalError("injected fault".into()));

    assert!(h.engine.store().bookings(BookingFilter::Hold(hold.id)).await.unwrap().is_empty());
    assert!(h.engine.store().bookings(BookingFilter::Swimmer(swimmer)).await.unwrap().is_empty());
    for &session_id in &sessions {
        let state = h.engine.capacity.session(session_id).await.unwrap();
        assert_eq!(state.session.confirmed_count, 0);
        // The reservation went back to the hold.
        assert_eq!(state.available(h.engine.now_ms()), 1);
    }
    assert_eq!(h.engine.ledger.snapshot(po.id).await.unwrap().sessions_booked, 0);
    let stored = h.engine.store().hold(hold.id).await.unwrap().unwrap();
    assert_eq!(stored.status, HoldStatus::Active);

    // The same hold confirms cleanly once the fault has passed.
    let confirmation = h
        .engine
        .confirm_booking(hold.id, "tab-1", request(swimmer, Some(po.id)))
        .await
        .unwrap();
    assert_eq!(confirmation.bookings.len(), 4);
    assert_eq!(confirmation.ledger.unwrap().sessions_booked, 4);
}

#[tokio::test]
async fn duplicate_booking_rolls_back() {
    let h = harness("confirm_duplicate.wal");
    let instructor = Ulid::new();
    let x = publish(&h.engine, instructor, at(2026, 3, 3, 16), 3).await;
    let y = publish(&h.engine, instructor, at(2026, 3, 10, 16), 3).await;
    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 12).await;
    book_one(&h.engine, x.id, swimmer, Some(po.id)).await;

    let hold = h.engine.create_hold(&[y.id, x.id], "tab-2", None).await.unwrap();
    let err = h
        .engine
        .confirm_booking(hold.id, "tab-2", request(swimmer, Some(po.id)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::DuplicateBooking {
            session_id: x.id,
            swimmer_id: swimmer
        }
    );

    let y_state = h.engine.capacity.session(y.id).await.unwrap();
    assert_eq!(y_state.session.confirmed_count, 0);
    let x_state = h.engine.capacity.session(x.id).await.unwrap();
    assert_eq!(x_state.session.confirmed_count, 1);
    assert_eq!(h.engine.ledger.snapshot(po.id).await.unwrap().sessions_booked, 1);
}

#[tokio::test]
async fn exhausted_authorization_blocks_confirmation() {
    let h = harness("confirm_exhausted.wal");
    let instructor = Ulid::new();
    let mut sessions = Vec::new();
    for day in [3, 10, 17] {
        sessions.push(publish(&h.engine, instructor, at(2026, 3, day, 16), 2).await.id);
    }
    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 2).await;
    let mut signals = h.engine.notify.subscribe_signals();

    let hold = h.engine.create_hold(&sessions, "tab-1", None).await.unwrap();
    let err = h
        .engine
        .confirm_booking(hold.id, "tab-1", request(swimmer, Some(po.id)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::AuthorizationExhausted {
            authorized: 2,
            booked: 0,
            requested: 3,
            ..
        }
    ));
    assert_eq!(
        signals.recv().await.unwrap(),
        Signal::AuthorizationExhausted {
            po_id: po.id,
            swimmer_id: swimmer
        }
    );
    let stored = h.engine.store().hold(hold.id).await.unwrap().unwrap();
    assert_eq!(stored.status, HoldStatus::Active);
    for &session_id in &sessions {
        assert_eq!(h.engine.capacity.session(session_id).await.unwrap().session.confirmed_count, 0);
    }
}

#[tokio::test]
async fn concurrent_confirmations_share_one_authorization() {
    let h = harness("confirm_concurrent_po.wal");
    let instructor = Ulid::new();
    let swimmer = Ulid::new();
    let po_id = active_po(&h.engine, swimmer, 3).await.id;

    let mut holds = Vec::new();
    for day in [2, 3, 4, 5, 6, 7] {
        let session = publish(&h.engine, instructor, at(2026, 3, day, 16), 5).await;
        let owner = format!("tab-{day}");
        let hold = h.engine.create_hold(&[session.id], &owner, None).await.unwrap();
        holds.push((hold.id, owner));
    }

    let mut handles = Vec::new();
    for (hold_id, owner) in holds {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.confirm_booking(hold_id, &owner, request(swimmer, Some(po_id))).await
        }));
    }
    let mut confirmed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => confirmed += 1,
            Err(e) => assert!(matches!(e, EngineError::AuthorizationExhausted { .. })),
        }
    }
    assert_eq!(confirmed, 3);
    let snapshot = h.engine.ledger.snapshot(po_id).await.unwrap();
    assert_eq!(snapshot.sessions_booked, 3);
    assert_eq!(snapshot.remaining, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_reservations_all_land_while_authorized() {
    let h = harness("reserve_parallel.wal");
    let po_id = active_po(&h.engine, Ulid::new(), 200).await.id;

    let mut handles = Vec::new();
    for _ in 0..150 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move { engine.ledger.reserve(po_id, 1).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    let snapshot = h.engine.ledger.snapshot(po_id).await.unwrap();
    assert_eq!(snapshot.sessions_booked, 150);
    assert_eq!(snapshot.remaining, 50);
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn double_cancel_is_idempotent() {
    let h = harness("cancel_twice.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 10, 16), 2).await;
    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 12).await;
    let booking = book_one(&h.engine, session.id, swimmer, Some(po.id)).await;

    let first = h
        .engine
        .cancel_booking(booking.id, CancelSource::Admin, Some("pool closed".into()))
        .await
        .unwrap();
    assert!(!first.already_cancelled);
    assert_eq!(first.booking.status, BookingStatus::Cancelled);
    assert_eq!(first.ledger.unwrap().sessions_booked, 0);
    let cancellation = first.booking.cancellation.clone().unwrap();
    assert_eq!(cancellation.source, CancelSource::Admin);
    assert_eq!(cancellation.reason.as_deref(), Some("pool closed"));

    let second = h
        .engine
        .cancel_booking(booking.id, CancelSource::Admin, None)
        .await
        .unwrap();
    assert!(second.already_cancelled);
    assert_eq!(second.booking, first.booking);
    assert!(second.ledger.is_none());

    assert_eq!(h.engine.ledger.snapshot(po.id).await.unwrap().sessions_booked, 0);
    let state = h.engine.capacity.session(session.id).await.unwrap();
    assert_eq!(state.session.confirmed_count, 0);
}

#[tokio::test]
async fn concurrent_cancels_release_once() {
    let h = harness("cancel_concurrent.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 10, 16), 2).await;
    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 12).await;
    let booking_id = book_one(&h.engine, session.id, swimmer, Some(po.id)).await.id;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.cancel_booking(booking_id, CancelSource::Admin, None).await
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if !handle.await.unwrap().unwrap().already_cancelled {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(h.engine.capacity.session(session.id).await.unwrap().session.confirmed_count, 0);
    assert_eq!(h.engine.ledger.snapshot(po.id).await.unwrap().sessions_booked, 0);
}

#[tokio::test]
async fn parent_cannot_cancel_inside_window() {
    let h = harness("cancel_window.wal");
    let now = h.engine.now_ms();
    let soon = publish(&h.engine, Ulid::new(), now + 120 * M, 2).await;
    let later = publish(&h.engine, Ulid::new(), now + 48 * 60 * M, 2).await;
    let swimmer = Ulid::new();
    let soon_booking = book_one(&h.engine, soon.id, swimmer, None).await;
    let later_booking = book_one(&h.engine, later.id, swimmer, None).await;

    let err = h
        .engine
        .cancel_booking(soon_booking.id, CancelSource::Parent, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::CancellationWindowClosed {
            booking_id: soon_booking.id,
            minutes_before_start: 120
        }
    );
    h.engine
        .cancel_booking(soon_booking.id, CancelSource::Admin, Some("late request".into()))
        .await
        .unwrap();
    h.engine
        .cancel_booking(later_booking.id, CancelSource::Parent, None)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_cancels_return_every_reservation() {
    let h = harness("cancel_parallel.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 10, 16), 150).await;
    let po_id = active_po(&h.engine, Ulid::new(), 150).await.id;
    let mut bookings = Vec::new();
    for _ in 0..150 {
        bookings.push(book_one(&h.engine, session.id, Ulid::new(), Some(po_id)).await.id);
    }
    assert_eq!(h.engine.ledger.snapshot(po_id).await.unwrap().sessions_booked, 150);

    let mut handles = Vec::new();
    for booking_id in bookings {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.cancel_booking(booking_id, CancelSource::Admin, None).await
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(!outcome.already_cancelled);
    }

    let snapshot = h.engine.ledger.snapshot(po_id).await.unwrap();
    assert_eq!(snapshot.sessions_booked, 0);
    assert_eq!(h.engine.get_available_capacity(session.id).await.unwrap(), 150);
}

// ── Session lifecycle ────────────────────────────────────

#[tokio::test]
async fn renewal_signal_fires_at_eleven_of_twelve() {
    let h = harness("renewal_signal.wal");
    let instructor = Ulid::new();
    let mut sessions = Vec::new();
    for day in 2..14 {
        sessions.push(publish(&h.engine, instructor, at(2026, 3, day, 16), 1).await.id);
    }
    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 12).await;
    let hold = h.engine.create_hold(&sessions, "tab-1", None).await.unwrap();
    h.engine
        .confirm_booking(hold.id, "tab-1", request(swimmer, Some(po.id)))
        .await
        .unwrap();
    let mut signals = h.engine.notify.subscribe_signals();

    for (i, &session_id) in sessions.iter().enumerate() {
        let completion = h.engine.orchestrator.complete_session(session_id).await.unwrap();
        assert_eq!(completion.completed.len(), 1);
        assert!(completion.ledger_failures.is_empty());
        let used = i as u32 + 1;
        if used == 11 {
            assert_eq!(completion.renewals.len(), 1);
            assert_eq!(completion.renewals[0].sessions_used, 11);
            assert_eq!(completion.renewals[0].sessions_authorized, 12);
        } else {
            assert!(completion.renewals.is_empty(), "unexpected renewal at {used}");
        }
    }

    match signals.recv().await.unwrap() {
        Signal::RenewalNeeded(r) => {
            assert_eq!(r.po_id, po.id);
            assert_eq!(r.swimmer_id, swimmer);
        }
        other => panic!("unexpected signal {other:?}"),
    }
    let snapshot = h.engine.ledger.snapshot(po.id).await.unwrap();
    assert_eq!(snapshot.sessions_used, 12);
    assert_eq!(snapshot.status, PoStatus::Completed);
}

#[tokio::test]
async fn cancelling_completed_booking_restores_usage() {
    let h = harness("restore_usage.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 2).await;
    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 1).await;
    let booking = book_one(&h.engine, session.id, swimmer, Some(po.id)).await;

    let completion = h.engine.orchestrator.complete_session(session.id).await.unwrap();
    assert_eq!(completion.session.status, SessionStatus::Completed);
    assert_eq!(h.engine.ledger.snapshot(po.id).await.unwrap().status, PoStatus::Completed);

    let outcome = h
        .engine
        .cancel_booking(booking.id, CancelSource::Admin, Some("billed in error".into()))
        .await
        .unwrap();
    let ledger = outcome.ledger.unwrap();
    assert_eq!(ledger.sessions_used, 0);
    assert_eq!(ledger.sessions_booked, 0);
    assert_eq!(ledger.status, PoStatus::Active);
}

#[tokio::test]
async fn cancel_session_cascades_to_bookings() {
    let h = harness("cancel_session.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 3).await;
    let mut pos = Vec::new();
    for _ in 0..2 {
        let swimmer = Ulid::new();
        let po = active_po(&h.engine, swimmer, 12).await;
        book_one(&h.engine, session.id, swimmer, Some(po.id)).await;
        pos.push(po.id);
    }

    let closure = h
        .engine
        .orchestrator
        .cancel_session(session.id, Some("instructor sick".into()))
        .await
        .unwrap();
    assert_eq!(closure.session.status, SessionStatus::Cancelled);
    assert_eq!(closure.cancelled.len(), 2);
    for booking in &closure.cancelled {
        assert_eq!(booking.status, BookingStatus::Cancelled);
        assert_eq!(booking.cancellation.as_ref().unwrap().source, CancelSource::Admin);
    }
    for po_id in pos {
        assert_eq!(h.engine.ledger.snapshot(po_id).await.unwrap().sessions_booked, 0);
    }
    assert_eq!(h.engine.get_available_capacity(session.id).await.unwrap(), 0);
    assert!(h.engine.create_hold(&[session.id], "tab-9", None).await.is_err());
    assert!(matches!(
        h.engine.orchestrator.cancel_session(session.id, None).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn no_show_keeps_session_booked_on_po() {
    let h = harness("no_show.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 2).await;
    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 12).await;
    let booking = book_one(&h.engine, session.id, swimmer, Some(po.id)).await;

    let no_show = h.engine.orchestrator.mark_no_show(booking.id).await.unwrap();
    assert_eq!(no_show.status, BookingStatus::NoShow);
    let snapshot = h.engine.ledger.snapshot(po.id).await.unwrap();
    assert_eq!(snapshot.sessions_booked, 1);
    assert_eq!(snapshot.sessions_used, 0);
    assert!(matches!(
        h.engine.orchestrator.mark_no_show(booking.id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

// ── Recurrence ───────────────────────────────────────────

struct TuesdayFixture {
    primary: Ulid,
    backup: Ulid,
    primary_sessions: Vec<Ulid>,
    backup_session: Ulid,
}

/// Primary instructor teaches four Tuesdays in March; the third is full.
/// The backup teaches only that third Tuesday.
async fn tuesdays(engine: &Engine) -> TuesdayFixture {
    let primary = Ulid::new();
    let backup = Ulid::new();
    let mut primary_sessions = Vec::new();
    for day in [3, 10, 17, 24] {
        primary_sessions.push(publish(engine, primary, at(2026, 3, day, 16), 1).await.id);
    }
    engine.capacity.confirm_occupancy(primary_sessions[2], 1).await.unwrap();
    let backup_session = publish(engine, backup, at(2026, 3, 17, 16), 2).await.id;
    TuesdayFixture {
        primary,
        backup,
        primary_sessions,
        backup_session,
    }
}

fn march_tuesdays(instructors: Vec<Ulid>) -> RecurrenceRequest {
    RecurrenceRequest {
        weekday: 2,
        time: four_pm(),
        window: DateWindow::new(date(2026, 3, 1), date(2026, 3, 28)).unwrap(),
        instructors,
    }
}

#[tokio::test]
async fn recurrence_reports_conflicted_week() {
    let h = harness("recurrence_resolve.wal");
    let f = tuesdays(&h.engine).await;

    let resolution = h
        .engine
        .resolve_recurrence(&march_tuesdays(vec![f.primary, f.backup]))
        .await
        .unwrap();
    let dates: Vec<NaiveDate> = resolution.occurrences.iter().map(|o| o.date).collect();
    assert_eq!(
        dates,
        vec![date(2026, 3, 3), date(2026, 3, 10), date(2026, 3, 17), date(2026, 3, 24)]
    );

    let primary = resolution.instructor(f.primary).unwrap();
    assert!(!primary.available_for_all);
    assert_eq!(primary.conflict_dates, vec![date(2026, 3, 17)]);
    assert_eq!(primary.slots[2].conflict, Some(Conflict::Full));
    assert_eq!(primary.slots[0].session_id, Some(f.primary_sessions[0]));

    let backup = resolution.instructor(f.backup).unwrap();
    assert_eq!(backup.conflict_dates.len(), 3);
    assert_eq!(backup.slots[2].session_id, Some(f.backup_session));
    assert_eq!(backup.slots[0].conflict, Some(Conflict::NoSession));
}

#[tokio::test]
async fn recurrence_skips_conflicted_week() {
    let h = harness("recurrence_skip.wal");
    let f = tuesdays(&h.engine).await;
    let resolution = h
        .engine
        .resolve_recurrence(&march_tuesdays(vec![f.primary]))
        .await
        .unwrap();

    let plan = h
        .engine
        .plan_recurring(&resolution, f.primary, &ConflictPolicy::SkipConflicted)
        .await
        .unwrap();
    assert_eq!(
        plan.session_ids,
        vec![f.primary_sessions[0], f.primary_sessions[1], f.primary_sessions[3]]
    );
    assert_eq!(plan.skipped_dates, vec![date(2026, 3, 17)]);

    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 12).await;
    let hold = h.engine.create_hold(&plan.session_ids, "tab-1", None).await.unwrap();
    let confirmation = h
        .engine
        .confirm_booking(hold.id, "tab-1", request(swimmer, Some(po.id)))
        .await
        .unwrap();
    assert_eq!(confirmation.bookings.len(), 3);
}

#[tokio::test]
async fn recurrence_fills_conflict_with_alternative() {
    let h = harness("recurrence_alternative.wal");
    let f = tuesdays(&h.engine).await;
    let resolution = h
        .engine
        .resolve_recurrence(&march_tuesdays(vec![f.primary]))
        .await
        .unwrap();

    let plan = h
        .engine
        .plan_recurring(
            &resolution,
            f.primary,
            &ConflictPolicy::FindAlternative {
                candidates: vec![f.backup],
            },
        )
        .await
        .unwrap();
    assert_eq!(
        plan.alternatives,
        vec![Alternative {
            date: date(2026, 3, 17),
            instructor_id: f.backup,
            session_id: f.backup_session,
        }]
    );
    assert!(plan.unresolved_dates.is_empty());
    assert_eq!(plan.session_ids.len(), 4);
    assert_eq!(plan.session_ids[2], f.backup_session);

    let swimmer = Ulid::new();
    let po = active_po(&h.engine, swimmer, 12).await;
    let hold = h.engine.create_hold(&plan.session_ids, "tab-1", None).await.unwrap();
    let confirmation = h
        .engine
        .confirm_booking(hold.id, "tab-1", request(swimmer, Some(po.id)))
        .await
        .unwrap();
    assert_eq!(confirmation.bookings.len(), 4);

    // A candidate with no session that week leaves it unresolved.
    let plan = h
        .engine
        .plan_recurring(
            &resolution,
            f.primary,
            &ConflictPolicy::FindAlternative {
                candidates: vec![Ulid::new()],
            },
        )
        .await
        .unwrap();
    assert_eq!(plan.unresolved_dates, vec![date(2026, 3, 17)]);
    assert_eq!(plan.session_ids.len(), 3);
}

#[tokio::test]
async fn recurrence_ignores_past_occurrences() {
    let h = harness("recurrence_past.wal");
    let f = tuesdays(&h.engine).await;
    h.clock.set(at(2026, 3, 10, 17));

    let resolution = h
        .engine
        .resolve_recurrence(&march_tuesdays(vec![f.primary]))
        .await
        .unwrap();
    let dates: Vec<NaiveDate> = resolution.occurrences.iter().map(|o| o.date).collect();
    assert_eq!(dates, vec![date(2026, 3, 17), date(2026, 3, 24)]);
}

// ── Purchase orders ──────────────────────────────────────

#[tokio::test]
async fn billing_status_follows_amounts() {
    let h = harness("billing.wal");
    let po = active_po(&h.engine, Ulid::new(), 12).await;

    let billed = h
        .engine
        .record_billing(
            po.id,
            BillingUpdate {
                billed_amount_cents: Some(6_500),
                invoice_number: Some("INV-1001".into()),
                ..BillingUpdate::status(BillingStatus::Billed)
            },
        )
        .await
        .unwrap();
    assert_eq!(billed.billing_status, BillingStatus::Billed);

    let partial = h
        .engine
        .record_billing(
            po.id,
            BillingUpdate {
                paid_amount_cents: Some(3_000),
                ..BillingUpdate::status(BillingStatus::Partial)
            },
        )
        .await
        .unwrap();
    assert_eq!(partial.billing_status, BillingStatus::Partial);
    assert_eq!(partial.paid_amount_cents, 3_000);

    let err = h
        .engine
        .record_billing(po.id, BillingUpdate::status(BillingStatus::Paid))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidBilling(_)));

    let paid = h
        .engine
        .record_billing(
            po.id,
            BillingUpdate {
                paid_amount_cents: Some(6_500),
                ..BillingUpdate::status(BillingStatus::Paid)
            },
        )
        .await
        .unwrap();
    assert_eq!(paid.billing_status, BillingStatus::Paid);
    assert_eq!(paid.billed_amount_cents, 6_500);
    // Billing never touches authorization status.
    assert_eq!(paid.status, PoStatus::Active);

    let stored = h.engine.ledger.purchase_order(po.id).await.unwrap();
    assert_eq!(stored.billing.invoice_number.as_deref(), Some("INV-1001"));
    assert!(stored.billing.paid_at.is_some());
}

#[tokio::test]
async fn payments_accumulate() {
    let h = harness("payments.wal");
    let po = active_po(&h.engine, Ulid::new(), 12).await;
    assert!(matches!(
        h.engine.ledger.record_payment(po.id, 3_000, None).await,
        Err(EngineError::InvalidBilling(_))
    ));
    h.engine
        .record_billing(
            po.id,
            BillingUpdate {
                billed_amount_cents: Some(6_500),
                ..BillingUpdate::status(BillingStatus::Billed)
            },
        )
        .await
        .unwrap();

    let first = h.engine.ledger.record_payment(po.id, 3_000, Some("CHK-77".into())).await.unwrap();
    assert_eq!(first.billing_status, BillingStatus::Partial);
    let second = h.engine.ledger.record_payment(po.id, 3_500, None).await.unwrap();
    assert_eq!(second.billing_status, BillingStatus::Paid);
    assert_eq!(second.paid_amount_cents, 6_500);
}

#[tokio::test]
async fn approval_paths() {
    let h = harness("approval.wal");
    let open = |n: u32| NewPurchaseOrder {
        id: Ulid::new(),
        swimmer_id: Ulid::new(),
        funding_source_id: Ulid::new(),
        po_type: PoType::Lessons,
        start_date: date(2026, 3, 1),
        end_date: date(2026, 5, 31),
        sessions_authorized: n,
        parent_po_id: None,
        external_id: None,
    };

    let pending = h.engine.ledger.open(open(12)).await.unwrap();
    let snapshot = h.engine.approve_po(pending.id, Approval::default()).await.unwrap();
    assert_eq!(snapshot.status, PoStatus::ApprovedPendingAuth);
    let snapshot = h
        .engine
        .ledger
        .attach_authorization_number(pending.id, " RC-77 ")
        .await
        .unwrap();
    assert_eq!(snapshot.status, PoStatus::Active);
    assert_eq!(
        h.engine.ledger.purchase_order(pending.id).await.unwrap().authorization_number.as_deref(),
        Some("RC-77")
    );
    assert!(matches!(
        h.engine.approve_po(pending.id, Approval::default()).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    let overridden = h.engine.ledger.open(open(12)).await.unwrap();
    let snapshot = h
        .engine
        .approve_po(
            overridden.id,
            Approval {
                authorization_number: None,
                override_pending_auth: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(snapshot.status, PoStatus::Active);

    let cancelled = h.engine.ledger.open(open(12)).await.unwrap();
    h.engine.ledger.cancel(cancelled.id, Some("family moved".into())).await.unwrap();
    assert!(matches!(
        h.engine.ledger.reserve(cancelled.id, 1).await,
        Err(EngineError::InvalidState { .. })
    ));
    assert!(matches!(
        h.engine.ledger.open(open(0)).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn assessment_pair_links_lessons_to_assessment() {
    let h = harness("assessment_pair.wal");
    let swimmer = Ulid::new();
    let (assessment, lessons) = h
        .engine
        .ledger
        .open_assessment_pair(swimmer, Ulid::new(), date(2026, 3, 2))
        .await
        .unwrap();
    assert_eq!(assessment.po_type, PoType::Assessment);
    assert_eq!(assessment.sessions_authorized, 1);
    assert_eq!(assessment.sessions_booked, 0);
    assert_eq!(assessment.end_date, date(2026, 3, 3));
    assert_eq!(lessons.po_type, PoType::Lessons);
    assert_eq!(lessons.sessions_authorized, 12);
    assert_eq!(lessons.start_date, date(2026, 3, 3));
    assert_eq!(lessons.end_date, date(2026, 6, 3));
    assert_eq!(lessons.parent_po_id, Some(assessment.id));

    let (_, late) = h
        .engine
        .ledger
        .open_assessment_pair(swimmer, Ulid::new(), date(2026, 5, 15))
        .await
        .unwrap();
    assert_eq!(late.end_date, date(2026, 6, 30));

    let renewal = h
        .engine
        .ledger
        .open_renewal(lessons.id, date(2026, 5, 26))
        .await
        .unwrap();
    assert_eq!(renewal.start_date, date(2026, 5, 27));
    assert_eq!(renewal.end_date, date(2026, 6, 30));
    assert_eq!(renewal.parent_po_id, Some(lessons.id));
    assert!(matches!(
        h.engine.ledger.open_renewal(assessment.id, date(2026, 3, 2)).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn sweep_expires_lapsed_purchase_orders() {
    let h = harness("po_expiry.wal");
    let lapsed = h
        .engine
        .ledger
        .open(NewPurchaseOrder {
            id: Ulid::new(),
            swimmer_id: Ulid::new(),
            funding_source_id: Ulid::new(),
            po_type: PoType::Lessons,
            start_date: date(2025, 11, 20),
            end_date: date(2026, 2, 20),
            sessions_authorized: 12,
            parent_po_id: None,
            external_id: None,
        })
        .await
        .unwrap();
    let current = active_po(&h.engine, Ulid::new(), 12).await;

    let report = h.engine.sweep().await.unwrap();
    assert_eq!(report.purchase_orders_expired, vec![lapsed.id]);
    assert_eq!(h.engine.ledger.snapshot(lapsed.id).await.unwrap().status, PoStatus::Expired);
    assert_eq!(h.engine.ledger.snapshot(current.id).await.unwrap().status, PoStatus::Active);
    assert!(h.engine.sweep().await.unwrap().purchase_orders_expired.is_empty());
}

#[tokio::test]
async fn payment_total_overflow_is_rejected() {
    let h = harness("payment_overflow.wal");
    let po = active_po(&h.engine, Ulid::new(), 12).await;
    h.engine
        .record_billing(
            po.id,
            BillingUpdate {
                billed_amount_cents: Some(6_500),
                ..BillingUpdate::status(BillingStatus::Billed)
            },
        )
        .await
        .unwrap();
    h.engine.ledger.record_payment(po.id, i64::MAX, None).await.unwrap();

    assert!(matches!(
        h.engine.ledger.record_payment(po.id, 1, None).await,
        Err(EngineError::InvalidBilling("payment total overflows"))
    ));
    let stored = h.engine.ledger.purchase_order(po.id).await.unwrap();
    assert_eq!(stored.billing.paid_amount_cents, i64::MAX);
    assert_eq!(stored.billing.status, BillingStatus::Paid);
}

#[tokio::test]
async fn pending_po_is_not_bookable_until_approved() {
    let h = harness("pending_po.wal");
    let session = publish(&h.engine, Ulid::new(), at(2026, 3, 3, 16), 2).await;
    let swimmer = Ulid::new();
    let po = h
        .engine
        .ledger
        .open(NewPurchaseOrder {
            id: Ulid::new(),
            swimmer_id: swimmer,
            funding_source_id: Ulid::new(),
            po_type: PoType::Lessons,
            start_date: date(2026, 3, 1),
            end_date: date(2026, 5, 31),
            sessions_authorized: 12,
            parent_po_id: None,
            external_id: None,
        })
        .await
        .unwrap();
    assert_eq!(po.status, PoStatus::Pending);

    let hold = h.engine.create_hold(&[session.id], "tab-1", None).await.unwrap();
    assert!(matches!(
        h.engine
            .confirm_booking(hold.id, "tab-1", request(swimmer, Some(po.id)))
            .await,
        Err(EngineError::InvalidState { .. })
    ));
    assert_eq!(h.engine.ledger.snapshot(po.id).await.unwrap().sessions_booked, 0);

    // The hold survives the refusal and confirms once the PO is approved.
    h.engine.approve_po(po.id, Approval::default()).await.unwrap();
    h.engine
        .confirm_booking(hold.id, "tab-1", request(swimmer, Some(po.id)))
        .await
        .unwrap();

    let completion = h.engine.orchestrator.complete_session(session.id).await.unwrap();
    assert_eq!(completion.completed.len(), 1);
    assert!(completion.ledger_failures.is_empty());
    let snapshot = h.engine.ledger.snapshot(po.id).await.unwrap();
    assert_eq!(snapshot.sessions_booked, 1);
    assert_eq!(snapshot.sessions_used, 1);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_wal_path("replay.wal");
    let notify = Arc::new(NotifyHub::new());
    let (session_id, booking_id, po_id, hold_id) = {
        let engine = Engine::open(path.clone(), notify.clone(), test_config()).unwrap();
        let start = engine.now_ms() + 72 * 60 * M;
        let session = publish(&engine, Ulid::new(), start, 4).await;
        let swimmer = Ulid::new();
        let po = active_po(&engine, swimmer, 12).await;
        let hold = engine.create_hold(&[session.id], "tab-1", None).await.unwrap();
        let confirmation = engine
            .confirm_booking(hold.id, "tab-1", request(swimmer, Some(po.id)))
            .await
            .unwrap();
        let booking = confirmation.bookings[0].clone();
        engine.compact().await.unwrap();
        engine
            .record_billing(
                po.id,
                BillingUpdate {
                    billed_amount_cents: Some(6_500),
                    ..BillingUpdate::status(BillingStatus::Billed)
                },
            )
            .await
            .unwrap();
        (session.id, booking.id, po.id, hold.id)
    };

    let engine = Engine::open(path, Arc::new(NotifyHub::new()), test_config()).unwrap();
    let state = engine.capacity.session(session_id).await.unwrap();
    assert_eq!(state.session.confirmed_count, 1);
    assert!(state.reservations.is_empty());
    let booking = engine.store().booking(booking_id).await.unwrap().unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    let hold = engine.store().hold(hold_id).await.unwrap().unwrap();
    assert_eq!(hold.status, HoldStatus::Confirmed);
    let snapshot = engine.ledger.snapshot(po_id).await.unwrap();
    assert_eq!(snapshot.sessions_booked, 1);
    assert_eq!(snapshot.billing_status, BillingStatus::Billed);
    assert_eq!(snapshot.status, PoStatus::Active);
}
