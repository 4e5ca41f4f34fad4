//! Water-mark eviction for the mirror cache.
//!
//! When the mirrors under the cache root grow past `high_water_mark` of
//! `max_bytes`, the least recently accessed mirrors are removed until usage
//! drops to `low_water_mark`.  A mirror is only removed while its repository
//! lock is held and nobody is serving from it, so eviction never races a
//! sync or a clone in flight.  Pinned repositories are never evicted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{MirrorRecord, MirrorStore};
use crate::config::CacheConfig;
use crate::coordination::{LockTimeouts, RepoLock};
use crate::git;
use crate::metrics::Metrics;

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// A mirror with its measured disk usage.
#[derive(Debug, Clone)]
pub struct SizedMirror {
    pub record: MirrorRecord,
    pub bytes: u64,
}

impl SizedMirror {
    fn last_used(&self) -> Option<DateTime<Utc>> {
        self.record.meta.last_access.or(self.record.meta.last_success)
    }
}

/// Indices into `mirrors` in eviction order: mirrors never used first, then
/// oldest use first.
pub fn eviction_order(mirrors: &[SizedMirror]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..mirrors.len()).collect();
    // `None` sorts before `Some`.
    order.sort_by_key(|&i| mirrors[i].last_used());
    order
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub mirrors: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub evicted: usize,
    pub skipped_busy: usize,
}

// ---------------------------------------------------------------------------
// CacheManager
// ---------------------------------------------------------------------------

pub struct CacheManager {
    store: Arc<MirrorStore>,
    max_bytes: u64,
    high_water: f64,
    low_water: f64,
    pinned: HashSet<String>,
    lock_timeouts: LockTimeouts,
    metrics: Arc<Metrics>,
}

impl CacheManager {
    pub fn new(
        store: Arc<MirrorStore>,
        config: &CacheConfig,
        pinned: impl IntoIterator<Item = String>,
        lock_timeouts: LockTimeouts,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            max_bytes: config.max_bytes,
            high_water: config.high_water_mark,
            low_water: config.low_water_mark,
            pinned: pinned.into_iter().collect(),
            lock_timeouts,
            metrics,
        }
    }

    /// Every mirror with its size.  Also refreshes the cache gauges.
    pub async fn measure(&self) -> Result<Vec<SizedMirror>> {
        let records = self.store.list().await?;
        let mut sized = Vec::with_capacity(records.len());
        for record in records {
            let bytes = git::repo_size_bytes(&record.dir).await?;
            sized.push(SizedMirror { record, bytes });
        }

        let total: u64 = sized.iter().map(|m| m.bytes).sum();
        self.metrics.cache_size_bytes.set(total as i64);
        self.metrics.cache_mirrors.set(sized.len() as i64);
        Ok(sized)
    }

    /// One eviction sweep.
    #[instrument(skip(self))]
    pub async fn run_eviction(&self) -> Result<EvictionReport> {
        let mirrors = self.measure().await?;
        let total: u64 = mirrors.iter().map(|m| m.bytes).sum();
        let mut report = EvictionReport {
            mirrors: mirrors.len(),
            bytes_before: total,
            bytes_after: total,
            ..Default::default()
        };

        if self.max_bytes == 0 || (total as f64) <= self.max_bytes as f64 * self.high_water {
            debug!(total, max_bytes = self.max_bytes, "cache below high-water mark");
            return Ok(report);
        }

        let candidates: Vec<SizedMirror> = mirrors
            .into_iter()
            .filter(|m| !self.pinned.contains(m.record.identity.path()))
            .collect();
        let target = (self.max_bytes as f64 * self.low_water) as u64;
        let mut remaining = total;

        for i in eviction_order(&candidates) {
            let victim = &candidates[i];
            if remaining <= target {
                break;
            }

            let lock = RepoLock::new(victim.record.lock_path(), self.lock_timeouts);
            let guard = match lock.try_acquire().await {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    debug!(repo = %victim.record.identity, "mirror busy; not evicting");
                    report.skipped_busy += 1;
                    continue;
                }
                Err(e) => {
                    warn!(repo = %victim.record.identity, error = %e, "failed to lock mirror for eviction");
                    report.skipped_busy += 1;
                    continue;
                }
            };

            match self.store.remove(&victim.record).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(repo = %victim.record.identity, "mirror being served; not evicting");
                    report.skipped_busy += 1;
                    continue;
                }
                Err(e) => {
                    error!(repo = %victim.record.identity, error = %e, "failed to evict mirror");
                    continue;
                }
            }
            drop(guard);

            remaining = remaining.saturating_sub(victim.bytes);
            report.evicted += 1;
            self.metrics.mirrors_evicted.inc();
            info!(repo = %victim.record.identity, bytes = victim.bytes, "evicted mirror");
        }

        report.bytes_after = remaining;
        self.metrics.cache_size_bytes.set(remaining as i64);
        self.metrics
            .cache_mirrors
            .set((report.mirrors - report.evicted) as i64);
        info!(
            evicted = report.evicted,
            skipped_busy = report.skipped_busy,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            "eviction sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `interval` until the task is dropped.
    pub async fn run_eviction_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_eviction().await {
                error!(error = %e, "eviction sweep failed");
            }
        }
    }
}
