//! Consumer counters
//!
//! Lock-free counters shared between the consumer event loop and the
//! per-CPU transport tasks.

use log::info;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::interval};

/// Counters describing consumer health
#[derive(Debug, Default)]
pub struct ConsumerStats {
    batches: AtomicU64,
    events: AtomicU64,
    invalid_batches: AtomicU64,
    kernel_dropped_events: AtomicU64,
    lost_samples: AtomicU64,
    read_errors: AtomicU64,
    syncs: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`]
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Batches that yielded at least one new event
    pub batches: u64,
    /// Events handed to the handler
    pub events: u64,
    /// Records dropped because they could not be parsed into a batch
    pub invalid_batches: u64,
    /// Events the producer reported as dropped in completed batches
    pub kernel_dropped_events: u64,
    /// Samples the perf ring overwrote before we read them
    pub lost_samples: u64,
    /// Failed perf buffer reads
    pub read_errors: u64,
    /// Completed sync passes
    pub syncs: u64,
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch that delivered `events` new events
    pub fn record_batch(&self, events: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn record_invalid_batch(&self) {
        self.invalid_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kernel_drops(&self, dropped: u16) {
        if dropped > 0 {
            self.kernel_dropped_events
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    pub fn record_lost_samples(&self, lost: usize) {
        if lost > 0 {
            self.lost_samples.fetch_add(lost as u64, Ordering::Relaxed);
        }
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of records dropped as malformed
    pub fn invalid_batches(&self) -> u64 {
        self.invalid_batches.load(Ordering::Relaxed)
    }

    /// Copy all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            invalid_batches: self.invalid_batches.load(Ordering::Relaxed),
            kernel_dropped_events: self.kernel_dropped_events.load(Ordering::Relaxed),
            lost_samples: self.lost_samples.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
        }
    }
}

/// Spawn progress reporter
///
/// Creates a task that periodically logs the consumer counters.
///
/// # Arguments
///
/// * `name` - Consumer name used as log prefix
/// * `stats` - Counters to report
/// * `interval_secs` - Reporting interval in seconds
pub fn spawn_progress_reporter(
    name: String,
    stats: Arc<ConsumerStats>,
    interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        // first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let snapshot = stats.snapshot();
            info!(
                "[{}] Progress: {} events in {} batches, {} invalid batches, {} kernel drops, {} lost samples, {} read errors",
                name,
                snapshot.events,
                snapshot.batches,
                snapshot.invalid_batches,
                snapshot.kernel_dropped_events,
                snapshot.lost_samples,
                snapshot.read_errors
            );
        }
    })
}
