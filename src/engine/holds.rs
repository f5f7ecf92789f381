use std::sync::Arc;

use tracing::{debug, info, warn};
use ulid::Ulid;

use super::clock::Clock;
use super::error::EngineError;
use crate::config::EngineConfig;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::{HoldClose, Store};

#[derive(Debug, Clone, Copy)]
pub struct HoldPolicy {
    pub default_ttl_ms: Ms,
    pub max_ttl_ms: Ms,
    pub max_lifetime_ms: Ms,
}

impl From<&EngineConfig> for HoldPolicy {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            default_ttl_ms: cfg.hold_ttl_ms,
            max_ttl_ms: cfg.max_hold_ttl_ms,
            max_lifetime_ms: cfg.max_hold_lifetime_ms,
        }
    }
}

/// Short-lived reservations taken while a parent is mid-checkout.
///
/// A hold's capacity comes back the moment it expires: availability ignores
/// expired reservations on read, the sweeper closes them in the background,
/// and any call that trips over one closes it on the spot.
#[derive(Clone)]
pub struct HoldManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    policy: HoldPolicy,
}

impl HoldManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, policy: HoldPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> HoldPolicy {
        self.policy
    }

    pub async fn create_hold(
        &self,
        session_ids: &[Ulid],
        owner: &str,
        ttl_ms: Option<Ms>,
    ) -> Result<Hold, EngineError> {
        self.create_hold_with_id(Ulid::new(), session_ids, owner, ttl_ms)
            .await
    }

    /// Reserve one unit on each session or none at all.
    pub async fn create_hold_with_id(
        &self,
        id: Ulid,
        session_ids: &[Ulid],
        owner: &str,
        ttl_ms: Option<Ms>,
    ) -> Result<Hold, EngineError> {
        if owner.is_empty() {
            return Err(EngineError::InvalidInput("hold owner token is required"));
        }
        if owner.len() > MAX_OWNER_LEN {
            return Err(EngineError::LimitExceeded("owner token too long"));
        }
        let mut ids = Vec::with_capacity(session_ids.len());
        for sid in session_ids {
            if !ids.contains(sid) {
                ids.push(*sid);
            }
        }
        if ids.is_empty() {
            return Err(EngineError::InvalidInput("hold needs at least one session"));
        }
        if ids.len() > MAX_SESSIONS_PER_HOLD {
            return Err(EngineError::LimitExceeded("too many sessions in one hold"));
        }
        let ttl_ms = ttl_ms.unwrap_or(self.policy.default_ttl_ms);
        if ttl_ms <= 0 {
            return Err(EngineError::InvalidInput("hold ttl must be positive"));
        }
        if ttl_ms > self.policy.max_ttl_ms {
            return Err(EngineError::LimitExceeded("hold ttl above configured maximum"));
        }

        let now = self.clock.now_ms();
        let hold = Hold {
            id,
            owner: owner.to_string(),
            session_ids: ids,
            created_at: now,
            expires_at: now + ttl_ms,
            ttl_ms,
            status: HoldStatus::Active,
            updated_at: now,
        };
        match self.store.place_hold(hold, now).await {
            Ok(hold) => {
                metrics::counter!(observability::HOLDS_CREATED_TOTAL).increment(1);
                info!(hold_id = %hold.id, sessions = hold.session_ids.len(), expires_at = hold.expires_at, "hold created");
                Ok(hold)
            }
            Err(EngineError::InsufficientCapacity(full)) => {
                metrics::counter!(observability::HOLD_REJECTIONS_TOTAL).increment(1);
                debug!(hold_id = %id, full = ?full, "hold rejected");
                Err(EngineError::InsufficientCapacity(full))
            }
            Err(e) => Err(e),
        }
    }

    /// Push expiry out by the hold's ttl, capped at its maximum lifetime.
    pub async fn renew_hold(&self, hold_id: Ulid, owner: &str) -> Result<Hold, EngineError> {
        let hold = self.fetch(hold_id).await?;
        let now = self.clock.now_ms();
        let cap = hold.created_at + self.policy.max_lifetime_ms;
        let expires_at = (now + hold.ttl_ms).min(cap).max(hold.expires_at);

        match self.store.extend_hold(hold_id, owner, expires_at, now).await {
            Ok(hold) => {
                metrics::counter!(observability::HOLDS_RENEWED_TOTAL).increment(1);
                debug!(%hold_id, expires_at = hold.expires_at, "hold renewed");
                Ok(hold)
            }
            Err(EngineError::HoldExpired(_)) => {
                self.reclaim(hold_id).await?;
                Err(EngineError::HoldExpired(hold_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Give the capacity back. Releasing a closed hold is a no-op.
    pub async fn release_hold(&self, hold_id: Ulid) -> Result<Hold, EngineError> {
        let now = self.clock.now_ms();
        match self.store.close_hold(hold_id, HoldStatus::Released, now).await? {
            HoldClose::Closed(hold) => {
                metrics::counter!(observability::HOLDS_RELEASED_TOTAL).increment(1);
                info!(%hold_id, "hold released");
                Ok(hold)
            }
            HoldClose::AlreadyClosed(hold) => {
                debug!(%hold_id, status = hold.status.as_str(), "release of closed hold ignored");
                Ok(hold)
            }
        }
    }

    /// Checks expiry before ownership: an expired hold is reclaimed for
    /// whoever asks.
    pub async fn validate_hold(&self, hold_id: Ulid, owner: &str) -> Result<Hold, EngineError> {
        let hold = self.fetch(hold_id).await?;
        match hold.status {
            HoldStatus::Active => {}
            HoldStatus::Expired => return Err(EngineError::HoldExpired(hold_id)),
            HoldStatus::Confirmed => {
                return Err(EngineError::InvalidState {
                    id: hold_id,
                    reason: "hold already confirmed",
                });
            }
            HoldStatus::Released => {
                return Err(EngineError::InvalidState {
                    id: hold_id,
                    reason: "hold already released",
                });
            }
        }
        if hold.is_expired(self.clock.now_ms()) {
            self.reclaim(hold_id).await?;
            return Err(EngineError::HoldExpired(hold_id));
        }
        if hold.owner != owner {
            return Err(EngineError::NotOwner(hold_id));
        }
        Ok(hold)
    }

    /// Final step of a booking: `active -> confirmed`. Loses to expiry.
    pub(crate) async fn mark_confirmed(&self, hold_id: Ulid) -> Result<Hold, EngineError> {
        let now = self.clock.now_ms();
        let hold = self.fetch(hold_id).await?;
        if hold.status == HoldStatus::Active && hold.is_expired(now) {
            self.reclaim(hold_id).await?;
            return Err(EngineError::HoldExpired(hold_id));
        }
        match self.store.close_hold(hold_id, HoldStatus::Confirmed, now).await? {
            HoldClose::Closed(hold) => Ok(hold),
            HoldClose::AlreadyClosed(hold) if hold.status == HoldStatus::Expired => {
                Err(EngineError::HoldExpired(hold_id))
            }
            HoldClose::AlreadyClosed(_) => Err(EngineError::InvalidState {
                id: hold_id,
                reason: "hold is no longer active",
            }),
        }
    }

    /// Close every active hold past its expiry. Returns how many were closed.
    pub async fn sweep_expired(&self) -> Result<usize, EngineError> {
        let now = self.clock.now_ms();
        let mut closed = 0;
        for hold_id in self.store.expired_holds(now).await? {
            match self.store.close_hold(hold_id, HoldStatus::Expired, now).await {
                Ok(HoldClose::Closed(_)) => {
                    closed += 1;
                    metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
                    info!(%hold_id, "hold expired");
                }
                Ok(HoldClose::AlreadyClosed(_)) => {}
                Err(e) => warn!(%hold_id, "hold sweep failed: {e}"),
            }
        }
        Ok(closed)
    }

    async fn reclaim(&self, hold_id: Ulid) -> Result<(), EngineError> {
        let now = self.clock.now_ms();
        if let HoldClose::Closed(_) = self.store.close_hold(hold_id, HoldStatus::Expired, now).await? {
            metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
            info!(%hold_id, "expired hold reclaimed");
        }
        Ok(())
    }

    async fn fetch(&self, hold_id: Ulid) -> Result<Hold, EngineError> {
        self.store
            .hold(hold_id)
            .await?
            .ok_or(EngineError::NotFound(hold_id))
    }
}
