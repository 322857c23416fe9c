//! Batch records from eBPF perf buffers
//!
//! Reads completed batches from the per-CPU perf buffers and forwards them
//! to the consumer as raw records.

use crate::{
    config::ConsumerConfig,
    stats::ConsumerStats,
    types::{BatchRecord, RawRecord},
};
use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    util::online_cpus,
};
use bytes::BytesMut;
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};

/// First delay after a failed perf read
const READ_RETRY_MIN: Duration = Duration::from_millis(10);

/// Upper bound on the delay between failed perf reads
const READ_RETRY_MAX: Duration = Duration::from_secs(1);

/// Doubling delay between consecutive failed reads
#[derive(Debug, Default)]
struct ReadBackoff {
    failures: u32,
}

impl ReadBackoff {
    /// Register a failed read and return how long to wait before retrying
    fn failure(&mut self) -> Duration {
        let delay = READ_RETRY_MIN
            .saturating_mul(1 << self.failures.min(16))
            .min(READ_RETRY_MAX);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Perf buffer transport feeding a consumer
pub struct PerfTransport {
    records: mpsc::Sender<RawRecord>,
    stats: Arc<ConsumerStats>,
    perf_buffers: usize,
    page_count: Option<usize>,
}

impl PerfTransport {
    /// Create a new perf transport
    ///
    /// # Arguments
    ///
    /// * `config` - Consumer settings (buffer count and ring size)
    /// * `records` - Channel into the consumer
    /// * `stats` - Consumer counters, for lost samples and read errors
    pub fn new(
        config: &ConsumerConfig,
        records: mpsc::Sender<RawRecord>,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            records,
            stats,
            perf_buffers: config.perf_buffers,
            page_count: config.perf_page_count,
        }
    }

    /// Spawn per-CPU batch readers
    ///
    /// Creates a task for each online CPU reading batches from its perf
    /// buffer. A task exits when the consumer side of the channel is gone.
    ///
    /// # Arguments
    ///
    /// * `perf_array` - Batch events perf array from the eBPF program
    ///
    /// # Returns
    ///
    /// Handles of the spawned reader tasks
    pub fn spawn_cpu_readers(
        &self,
        mut perf_array: AsyncPerfEventArray<MapData>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let cpus = online_cpus().context("Failed to list online CPUs")?;
        info!("Spawning batch readers for {} CPUs", cpus.len());

        let mut tasks = Vec::with_capacity(cpus.len());
        for cpu_id in cpus {
            let mut buf = perf_array
                .open(cpu_id, self.page_count)
                .with_context(|| format!("Failed to open perf buffer for CPU {}", cpu_id))?;
            let records = self.records.clone();
            let stats = Arc::clone(&self.stats);
            let perf_buffers = self.perf_buffers;

            tasks.push(tokio::spawn(async move {
                // Pre-allocate buffers for reading batches
                let mut buffers = (0..perf_buffers)
                    .map(|_| BytesMut::with_capacity(std::mem::size_of::<BatchRecord>()))
                    .collect::<Vec<_>>();
                let mut backoff = ReadBackoff::default();

                loop {
                    let events = match buf.read_events(&mut buffers).await {
                        Ok(events) => {
                            backoff.reset();
                            events
                        }
                        Err(e) => {
                            stats.record_read_error();
                            let delay = backoff.failure();
                            warn!(
                                "Error reading batches from CPU {}, retrying in {:?}: {}",
                                cpu_id, delay, e
                            );
                            sleep(delay).await;
                            continue;
                        }
                    };

                    if events.lost > 0 {
                        warn!("Lost {} batch samples on CPU {}", events.lost, cpu_id);
                        stats.record_lost_samples(events.lost);
                    }

                    for buf in buffers.iter_mut().take(events.read) {
                        let record = RawRecord::new(cpu_id, buf.split().freeze());
                        if records.send(record).await.is_err() {
                            debug!("Consumer gone, stopping batch reader for CPU {}", cpu_id);
                            return;
                        }
                    }
                }
            }));
        }

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_perf_transport_creation() {
        let config = ConsumerConfig::new("test").with_perf_page_count(Some(16));
        let (tx, _rx) = mpsc::channel(1);
        let transport = PerfTransport::new(&config, tx, Arc::new(ConsumerStats::new()));

        assert_eq!(transport.perf_buffers, config.perf_buffers);
        assert_eq!(transport.page_count, Some(16));
    }

    #[test]
    fn test_read_backoff() {
        let mut backoff = ReadBackoff::default();

        assert_eq!(backoff.failure(), Duration::from_millis(10));
        assert_eq!(backoff.failure(), Duration::from_millis(20));
        assert_eq!(backoff.failure(), Duration::from_millis(40));
        for _ in 0..100 {
            assert!(backoff.failure() <= READ_RETRY_MAX);
        }
        assert_eq!(backoff.failure(), READ_RETRY_MAX);

        backoff.reset();
        assert_eq!(backoff.failure(), Duration::from_millis(10));
    }
}
