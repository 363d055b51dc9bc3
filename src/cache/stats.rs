//! Process-local hit/miss counters.
//!
//! Observational only: counters are per [`Cache`](super::Cache) instance, are
//! never persisted, and reset when the process restarts.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic hit/miss counters updated on every lookup.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters into a serializable snapshot.
    ///
    /// The two loads are independent, so a snapshot taken under load may pair
    /// a hit count and a miss count from slightly different instants.
    pub fn snapshot(&self) -> StatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_ratio = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        StatsSnapshot {
            hits,
            misses,
            total,
            hit_ratio,
        }
    }
}

/// Point-in-time view of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub total: u64,
    /// `hits / total`, or `0.0` before the first lookup.
    pub hit_ratio: f64,
}
