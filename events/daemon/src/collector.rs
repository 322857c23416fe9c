//! Event collection
//!
//! Counts delivered events per CPU. Decoding the payload is left to the
//! protocol layers; the daemon only needs volumes.

use crate::{stats::StatsSnapshot, types::EventReport};
use std::collections::BTreeMap;

/// Per-CPU event counter
#[derive(Default)]
pub struct EventCollector {
    /// Events seen per CPU
    events_per_cpu: BTreeMap<u32, u64>,
    /// Total payload bytes
    total_bytes: u64,
    /// Total number of events
    total_events: u64,
}

impl EventCollector {
    /// Create a new event collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a delivered event
    ///
    /// # Arguments
    ///
    /// * `cpu` - CPU whose batch carried the event
    /// * `event` - Raw event bytes
    pub fn add_event(&mut self, cpu: u32, event: &[u8]) {
        *self.events_per_cpu.entry(cpu).or_insert(0) += 1;
        self.total_bytes += event.len() as u64;
        self.total_events += 1;
    }

    /// Generate the export report
    ///
    /// # Arguments
    ///
    /// * `consumer` - Consumer name
    /// * `elapsed_secs` - Duration of collection period in seconds
    /// * `stats` - Consumer counters at the end of the period
    pub fn generate_report(
        &self,
        consumer: &str,
        elapsed_secs: u64,
        stats: StatsSnapshot,
    ) -> EventReport {
        EventReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            consumer: consumer.to_string(),
            duration_seconds: elapsed_secs,
            total_events: self.total_events,
            total_bytes: self.total_bytes,
            events_per_cpu: self.events_per_cpu.clone(),
            stats,
        }
    }
}
