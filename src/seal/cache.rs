use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::Permission;

pub fn key(wallet: &str, signature: &str) -> String {
    format!("{wallet}:{signature}")
}

struct Entry {
    permissions: Vec<Permission>,
    expires_at: Instant,
}

/// TTL cache of validated tokens keyed by `(wallet, signature)`. Backed by
/// `DashMap`'s sharded locking rather than one global mutex, so a read
/// here never contends with another reader for an unrelated key — the
/// read path stays off the single-flight lock below entirely.
pub struct ValidationCache {
    entries: DashMap<String, Entry>,
}

impl ValidationCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<Permission>> {
        self.entries.get(key).and_then(|e| {
            if e.expires_at > Instant::now() {
                Some(e.permissions.clone())
            } else {
                None
            }
        })
    }

    /// Returns a cached entry even if its TTL has lapsed, for the
    /// fail-closed-except-cache `LedgerUnavailable` fallback path.
    pub fn get_stale(&self, key: &str) -> Option<Vec<Permission>> {
        self.entries.get(key).map(|e| e.permissions.clone())
    }

    pub fn put(&self, key: String, permissions: Vec<Permission>, ttl: Duration) {
        self.entries.insert(
            key,
            Entry {
                permissions,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// Per-key single-flight guard: concurrent misses for the same cache key
/// serialize on a per-key lock rather than each firing an independent
/// ledger query (§4.2 "misses take a shared lock to single-flight the
/// ledger query"). Callers must re-check the cache after acquiring the
/// guard — the first holder populates it, the rest then see a hit.
pub struct SingleFlight {
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    pub async fn guard(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drops the per-key lock entry once nothing else references it, so
    /// the table doesn't grow without bound across distinct tokens.
    pub fn release(&self, key: &str) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) <= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_flight_serializes_same_key() {
        let flight = SingleFlight::new();
        let _guard = flight.guard("wallet-1").await;
        // A second waiter on the same key would block behind `_guard`
        // until it is dropped; here we just assert the table holds one
        // live entry for the key while the guard is outstanding.
        assert!(flight.locks.contains_key("wallet-1"));
        drop(_guard);
        flight.release("wallet-1");
        assert!(!flight.locks.contains_key("wallet-1"));
    }
}
