use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config;

/// key: engine-locks -> short-TTL advisory locks

/// Advisory lock table for adjacent flows (webhook handling, subscription
/// updates) that must not race each other into the balance engine. Not a
/// correctness mechanism for deductions; the scripted store already
/// serializes those per customer.
pub struct LockManager {
    locks: DashMap<String, DateTime<Utc>>,
    default_ttl: ChronoDuration,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_default_ttl(ChronoDuration::seconds(*config::ADVISORY_LOCK_TTL_SECS))
    }

    pub fn with_default_ttl(default_ttl: ChronoDuration) -> Self {
        Self {
            locks: DashMap::new(),
            default_ttl,
        }
    }

    /// Conditional set: succeeds only when the key is absent or its holder's
    /// TTL has lapsed. A crashed holder therefore blocks the key for at most
    /// one TTL.
    pub fn acquire(&self, key: &str, ttl: ChronoDuration, now: DateTime<Utc>) -> bool {
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    false
                } else {
                    occupied.insert(now + ttl);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now + ttl);
                true
            }
        }
    }

    pub fn acquire_default(&self, key: &str) -> bool {
        self.acquire(key, self.default_ttl, Utc::now())
    }

    /// Drop the lock. Releasing an unheld key is a no-op.
    pub fn release(&self, key: &str) {
        self.locks.remove(key);
    }

    /// Sweep lapsed entries so an idle table does not grow without bound.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, expires_at| *expires_at > now);
        before - self.locks.len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
