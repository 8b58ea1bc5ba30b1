use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::{sleep, Duration};

use crate::config;
use crate::engine::models::CustomerScope;

/// key: engine-idempotency -> duplicate request markers

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MarkerKey {
    scope: CustomerScope,
    key: String,
}

/// First line of the tracking path. A marker is written the moment a keyed
/// request arrives, before the outcome is known, so a client retrying a
/// request that is still in flight is refused rather than double-charged.
pub struct IdempotencyGuard {
    markers: DashMap<MarkerKey, DateTime<Utc>>,
    ttl: ChronoDuration,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self::with_ttl(ChronoDuration::seconds(*config::IDEMPOTENCY_TTL_SECS))
    }

    pub fn with_ttl(ttl: ChronoDuration) -> Self {
        Self {
            markers: DashMap::new(),
            ttl,
        }
    }

    /// Record the key if it is unseen or expired. Returns false when a live
    /// marker already exists, which the caller must treat as a duplicate.
    pub fn check_and_set(&self, scope: &CustomerScope, key: &str, now: DateTime<Utc>) -> bool {
        let marker = MarkerKey {
            scope: scope.clone(),
            key: key.to_string(),
        };
        match self.markers.entry(marker) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() + self.ttl > now {
                    false
                } else {
                    occupied.insert(now);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    /// Drop markers older than the window.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.markers.len();
        self.markers.retain(|_, seen_at| *seen_at + self.ttl > now);
        before - self.markers.len()
    }

    #[cfg(test)]
    pub fn live_markers(&self) -> usize {
        self.markers.len()
    }
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Background sweep so an idle guard does not hold expired markers forever.
pub fn spawn_pruner(guard: Arc<IdempotencyGuard>, cadence: Duration) {
    tokio::spawn(async move {
        loop {
            sleep(cadence).await;
            let dropped = guard.prune(Utc::now());
            if dropped > 0 {
                tracing::debug!(dropped, "expired idempotency markers pruned");
            }
        }
    });
}
