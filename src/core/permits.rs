// src/core/permits.rs

//! The global worker-permit pool.
//!
//! Providers ask the permit manager for worker slots before running their
//! executors; the adaptive controller claws slots back proportionally
//! when the routing substrate shows distress. All operations are
//! non-blocking: a zero grant is a valid answer and drives the caller
//! into WAITING_QUOTA rather than blocking here.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::{debug, info};

/// Schema version for permit grant records in the `permits` namespace.
pub const PERMIT_GRANT_SCHEMA: u32 = 1;

/// A provider's current holdings from the pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PermitGrant {
    pub provider_id: String,
    pub count: u32,
    pub acquired_at: DateTime<Utc>,
}

/// One entry of a proportional revocation pass.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Revocation {
    pub provider_id: String,
    pub revoked: u32,
}

/// A consistent point-in-time view of the pool.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PermitStats {
    pub pool_size: u32,
    pub granted: u32,
    pub available: u32,
    pub per_provider: Vec<PermitGrant>,
}

struct PoolInner {
    pool_size: u32,
    /// BTreeMap keeps holders in lexicographic provider order, which is
    /// what makes revocation deterministic.
    holders: BTreeMap<String, PermitGrant>,
}

impl PoolInner {
    fn granted(&self) -> u32 {
        self.holders.values().map(|g| g.count).sum()
    }

    fn available(&self) -> u32 {
        // After a soft resize the outstanding count may exceed the pool;
        // grants then stay blocked until releases catch up.
        self.pool_size.saturating_sub(self.granted())
    }
}

/// The process-wide permit pool. Writes serialize on the inner lock;
/// `stats` takes a consistent read snapshot.
pub struct PermitManager {
    inner: RwLock<PoolInner>,
    /// Publishes the available count on every release/revoke/resize so
    /// providers in WAITING_QUOTA wake without polling.
    availability_tx: watch::Sender<u32>,
}

impl PermitManager {
    pub fn new(pool_size: u32) -> Self {
        let (availability_tx, _) = watch::channel(pool_size);
        Self {
            inner: RwLock::new(PoolInner {
                pool_size,
                holders: BTreeMap::new(),
            }),
            availability_tx,
        }
    }

    /// Grants `min(count, available)` permits to the provider. Never
    /// blocks; a partial grant (including zero) is a valid result and the
    /// caller is expected to retry or enter WAITING_QUOTA.
    pub fn request(&self, provider_id: &str, count: u32) -> u32 {
        if count == 0 {
            return 0;
        }
        let mut inner = self.inner.write();
        let grant = count.min(inner.available());
        if grant == 0 {
            return 0;
        }
        inner
            .holders
            .entry(provider_id.to_string())
            .and_modify(|g| g.count += grant)
            .or_insert_with(|| PermitGrant {
                provider_id: provider_id.to_string(),
                count: grant,
                acquired_at: Utc::now(),
            });
        let available = inner.available();
        drop(inner);
        self.availability_tx.send_replace(available);
        debug!("Granted {} permit(s) to provider '{}'.", grant, provider_id);
        grant
    }

    /// Returns up to `count` permits from the provider's holdings to the
    /// pool. Releases beyond holdings are clamped, not errors. Returns
    /// the number actually released.
    pub fn release(&self, provider_id: &str, count: u32) -> u32 {
        let mut inner = self.inner.write();
        let Some(grant) = inner.holders.get_mut(provider_id) else {
            return 0;
        };
        let released = count.min(grant.count);
        grant.count -= released;
        if grant.count == 0 {
            inner.holders.remove(provider_id);
        }
        let available = inner.available();
        drop(inner);
        if released > 0 {
            self.availability_tx.send_replace(available);
            debug!(
                "Provider '{}' released {} permit(s).",
                provider_id, released
            );
        }
        released
    }

    /// Removes `ceil(held * fraction)` permits from every holder, in
    /// lexicographic provider order, and returns the per-holder list.
    /// The caller is responsible for delivering quota events to each
    /// affected provider.
    pub fn revoke(&self, fraction: f64) -> Vec<Revocation> {
        let fraction = fraction.clamp(f64::MIN_POSITIVE, 1.0);
        let mut inner = self.inner.write();
        let mut revocations = Vec::new();
        inner.holders.retain(|provider_id, grant| {
            let revoked = ((grant.count as f64 * fraction).ceil() as u32).min(grant.count);
            if revoked > 0 {
                grant.count -= revoked;
                revocations.push(Revocation {
                    provider_id: provider_id.clone(),
                    revoked,
                });
            }
            grant.count > 0
        });
        let available = inner.available();
        drop(inner);
        if !revocations.is_empty() {
            self.availability_tx.send_replace(available);
            info!(
                "Revoked permits from {} provider(s): {:?}",
                revocations.len(),
                revocations
                    .iter()
                    .map(|r| format!("{}:{}", r.provider_id, r.revoked))
                    .collect::<Vec<_>>()
            );
        }
        revocations
    }

    /// Changes the pool size atomically. Shrinking below the outstanding
    /// grant count does not forcibly revoke; future grants simply stay
    /// blocked until releases bring the outstanding count within the new
    /// bound.
    pub fn resize(&self, new_size: u32) {
        let mut inner = self.inner.write();
        let old = inner.pool_size;
        inner.pool_size = new_size;
        let available = inner.available();
        drop(inner);
        self.availability_tx.send_replace(available);
        info!("Permit pool resized from {} to {}.", old, new_size);
    }

    /// A consistent snapshot of the pool.
    pub fn stats(&self) -> PermitStats {
        let inner = self.inner.read();
        PermitStats {
            pool_size: inner.pool_size,
            granted: inner.granted(),
            available: inner.available(),
            per_provider: inner.holders.values().cloned().collect(),
        }
    }

    /// Current holdings of one provider.
    pub fn held_by(&self, provider_id: &str) -> u32 {
        self.inner
            .read()
            .holders
            .get(provider_id)
            .map(|g| g.count)
            .unwrap_or(0)
    }

    /// A receiver that observes the available-permit count. The value
    /// changes on every release, revocation, and resize.
    pub fn subscribe_availability(&self) -> watch::Receiver<u32> {
        self.availability_tx.subscribe()
    }
}
