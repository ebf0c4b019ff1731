use alloy::primitives::Address;
use moka::sync::Cache;
use std::time::Duration;
use tokio::time::Instant;

use crate::model::{wallet_key, SubscriptionSnapshot};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub snapshot: SubscriptionSnapshot,
    pub expires_at: Instant,
}

/// Per-wallet snapshot cache. Unavailable reads are cached too, so a dead
/// endpoint is not hammered by every concurrent request.
///
/// Expiry is decided by `expires_at`; moka only bounds the entry count.
#[derive(Clone)]
pub struct StatusCache {
    inner: Cache<String, CacheEntry>,
    ttl: Duration,
}

impl StatusCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            inner: Cache::builder().max_capacity(max_entries).build(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached snapshot relabelled as `source = cache`, if still fresh.
    pub fn get(&self, wallet: &Address) -> Option<SubscriptionSnapshot> {
        let entry = self.inner.get(&wallet_key(wallet))?;
        (entry.expires_at > Instant::now()).then(|| entry.snapshot.from_cache())
    }

    pub fn put(&self, wallet: &Address, snapshot: SubscriptionSnapshot, ttl: Duration) {
        let entry = CacheEntry {
            snapshot,
            expires_at: Instant::now() + ttl,
        };
        self.inner.insert(wallet_key(wallet), entry);
    }

    pub fn invalidate(&self, wallet: &Address) {
        self.inner.invalidate(&wallet_key(wallet));
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}
