//! # Telemetry Snapshot Cache
//!
//! Bounded, time-indexed history of recent snapshots.
//!
//! Two eviction paths keep memory bounded:
//!
//! - **Emergency eviction** on [`TelemetrySnapshotCache::put`]: once the size
//!   exceeds `max_size * emergency_threshold`, the oldest
//!   `emergency_fraction` of entries is dropped before `put` returns.
//! - **Periodic sweep** ([`TelemetrySnapshotCache::spawn_sweeper`]): drops
//!   entries older than `ttl`, then trims the oldest excess down to
//!   `max_size`.
//!
//! Eviction is always oldest-first by insertion time, ties broken by key.
//! Every operation, including [`TelemetrySnapshotCache::stats`], takes the
//! same lock.

use serde::Serialize;
use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::snapshot::Snapshot;
use crate::config::CacheConfig;
use crate::error::{RelayError, Result};

/// One cached snapshot
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: u64,
    pub inserted_at: Instant,
    pub snapshot: Snapshot,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub expired: usize,
    pub trimmed: usize,
    pub remaining: usize,
}

/// Cache statistics for health reporting (ages in seconds)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub oldest_entry_age: f64,
    pub newest_entry_age: f64,
    pub cache_size_mb: f64,
    pub max_cache_size: usize,
    pub cache_ttl: f64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<u64, CacheEntry>,
    next_key: u64,
}

impl CacheState {
    /// Keys of the `count` oldest entries
    fn oldest_keys(&self, count: usize) -> Vec<u64> {
        let mut order: Vec<(Instant, u64)> = self
            .entries
            .values()
            .map(|e| (e.inserted_at, e.key))
            .collect();
        order.sort_unstable();
        order.into_iter().take(count).map(|(_, key)| key).collect()
    }

    fn remove_oldest(&mut self, count: usize) -> usize {
        let keys = self.oldest_keys(count);
        for key in &keys {
            self.entries.remove(key);
        }
        keys.len()
    }
}

/// Bounded snapshot history with background eviction
#[derive(Debug)]
pub struct TelemetrySnapshotCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl TelemetrySnapshotCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| RelayError::LockPoisoned("telemetry cache"))
    }

    /// Size bound `max_size * emergency_threshold`; `put` evicts past it
    pub fn emergency_limit(&self) -> f64 {
        self.config.max_size as f64 * self.config.emergency_threshold
    }

    /// Insert a snapshot stamped now
    ///
    /// # Returns
    ///
    /// Number of entries removed by emergency eviction (usually 0)
    pub fn put(&self, snapshot: Snapshot) -> Result<usize> {
        self.put_at(snapshot, Instant::now())
    }

    /// Insert a snapshot with an explicit insertion time
    pub fn put_at(&self, snapshot: Snapshot, inserted_at: Instant) -> Result<usize> {
        let limit = self.emergency_limit();
        let mut state = self.lock()?;

        let key = state.next_key;
        state.next_key += 1;
        state.entries.insert(key, CacheEntry { key, inserted_at, snapshot });

        let len = state.entries.len();
        if len as f64 <= limit {
            return Ok(0);
        }

        let count = ((len as f64 * self.config.emergency_fraction).floor() as usize).max(1);
        let removed = state.remove_oldest(count);
        warn!("Emergency cache cleanup: removed {} entries", removed);
        Ok(removed)
    }

    /// Drop expired entries, then trim to `max_size`
    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Instant::now())
    }

    /// Sweep as of `now`
    pub fn sweep_at(&self, now: Instant) -> Result<SweepReport> {
        let ttl = self.config.ttl();
        let mut state = self.lock()?;

        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| now.saturating_duration_since(e.inserted_at) <= ttl);
        let expired = before - state.entries.len();

        let excess = state.entries.len().saturating_sub(self.config.max_size);
        let trimmed = if excess > 0 { state.remove_oldest(excess) } else { 0 };

        Ok(SweepReport {
            expired,
            trimmed,
            remaining: state.entries.len(),
        })
    }

    /// Statistics as of now
    pub fn stats(&self) -> Result<CacheStats> {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> Result<CacheStats> {
        let state = self.lock()?;

        let mut stats = CacheStats {
            total_entries: state.entries.len(),
            oldest_entry_age: 0.0,
            newest_entry_age: 0.0,
            cache_size_mb: 0.0,
            max_cache_size: self.config.max_size,
            cache_ttl: self.config.ttl().as_secs_f64(),
        };

        let oldest = state.entries.values().map(|e| e.inserted_at).min();
        let newest = state.entries.values().map(|e| e.inserted_at).max();
        if let (Some(oldest), Some(newest)) = (oldest, newest) {
            stats.oldest_entry_age = now.saturating_duration_since(oldest).as_secs_f64();
            stats.newest_entry_age = now.saturating_duration_since(newest).as_secs_f64();
        }

        let bytes: usize = size_of::<CacheState>()
            + state
                .entries
                .values()
                .map(|e| size_of::<u64>() + size_of::<CacheEntry>() + e.snapshot.approx_size())
                .sum::<usize>();
        stats.cache_size_mb = bytes as f64 / (1024.0 * 1024.0);

        Ok(stats)
    }

    /// Most recently inserted snapshot
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        let state = self.lock()?;
        Ok(state
            .entries
            .values()
            .max_by_key(|e| (e.inserted_at, e.key))
            .map(|e| e.snapshot.clone()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Result<()> {
        self.lock()?.entries.clear();
        Ok(())
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `stop` flips
    ///
    /// A failed sweep is logged and retried after `sweep_error_backoff`.
    pub fn spawn_sweeper(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut wait = cache.config.sweep_interval();
            while !*stop.borrow() {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                match cache.sweep() {
                    Ok(report) => {
                        if report.expired > 0 || report.trimmed > 0 {
                            debug!(
                                "Cache cleanup: removed {} expired and {} excess entries, cache size now: {}",
                                report.expired, report.trimmed, report.remaining
                            );
                        }
                        wait = cache.config.sweep_interval();
                    }
                    Err(e) => {
                        error!("Cache cleanup error: {}", e);
                        wait = cache.config.sweep_error_backoff();
                    }
                }
            }
            debug!("Cache sweeper stopped");
        })
    }
}
