//! Userspace type definitions
//!
//! Defines the parsed view of a kernel batch and the raw records handed
//! over by the transport.
//!
//! ## Organization
//!
//! - **Kernel Types**: layout shared with the eBPF producer (from batch_common)
//! - **Userspace Types**: parsed batches and transport records

use crate::stats::StatsSnapshot;
use anyhow::{ensure, Result};
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Kernel Types (from the eBPF producer)
// ============================================================================

pub mod kernel {
    //! Types shared between the kernel producer and userspace
    //!
    //! These are re-exported from the batch-common crate and must
    //! maintain binary compatibility with the eBPF program.

    pub use batch_common::constants;
    pub use batch_common::types::{BatchHeader, BatchKey, BatchRecord};
}

pub use kernel::{BatchHeader, BatchKey, BatchRecord};

use batch_common::constants::BATCH_HEADER_SIZE;

// ============================================================================
// Userspace Types
// ============================================================================

/// A raw sample as delivered by the transport, tagged with its CPU
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// CPU whose perf buffer produced the sample
    pub cpu: u32,
    /// Sample bytes, header followed by the data region
    pub data: Bytes,
}

impl RawRecord {
    /// Create a new raw record
    pub fn new(cpu: u32, data: Bytes) -> Self {
        Self { cpu, data }
    }
}

/// Parsed, immutable snapshot of one kernel batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Per-CPU sequence number
    pub index: u64,
    /// Maximum element count
    pub cap: u16,
    /// Elements written so far
    pub len: u16,
    /// Size of one element in bytes
    pub event_size: u16,
    /// Events dropped by the producer while this batch was current
    pub dropped_events: u16,
    /// Data region
    pub data: Bytes,
}

impl Batch {
    /// Parse a batch from raw record bytes
    ///
    /// Header fields are read one by one in native byte order, the way the
    /// kernel producer lays them out.
    ///
    /// # Errors
    ///
    /// Fails when the record is shorter than the header, when `len > cap`,
    /// or when the declared capacity does not fit in the data region.
    pub fn parse(mut raw: Bytes) -> Result<Self> {
        ensure!(
            raw.len() >= BATCH_HEADER_SIZE,
            "record too short for batch header: {} < {} bytes",
            raw.len(),
            BATCH_HEADER_SIZE
        );

        let index = raw.get_u64_ne();
        let cap = raw.get_u16_ne();
        let len = raw.get_u16_ne();
        let event_size = raw.get_u16_ne();
        let dropped_events = raw.get_u16_ne();

        let batch = Self {
            index,
            cap,
            len,
            event_size,
            dropped_events,
            data: raw,
        };
        batch.validate()?;

        Ok(batch)
    }

    /// Build a batch from a record looked up in the batch map
    pub fn from_record(record: &BatchRecord) -> Result<Self> {
        let batch = Self {
            index: record.header.idx,
            cap: record.header.cap,
            len: record.header.len,
            event_size: record.header.event_size,
            dropped_events: record.header.dropped_events,
            data: Bytes::copy_from_slice(&record.data),
        };
        batch.validate()?;

        Ok(batch)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.len <= self.cap,
            "batch {} length {} exceeds capacity {}",
            self.index,
            self.len,
            self.cap
        );
        ensure!(
            self.cap == 0 || self.event_size > 0,
            "batch {} has capacity {} but zero event size",
            self.index,
            self.cap
        );

        let needed = self.cap as usize * self.event_size as usize;
        ensure!(
            needed <= self.data.len(),
            "batch {} needs {} data bytes, record carries {}",
            self.index,
            needed,
            self.data.len()
        );

        Ok(())
    }

    /// Whether the producer has filled every slot of this batch
    pub fn is_complete(&self) -> bool {
        self.cap > 0 && self.len == self.cap
    }

    /// Iterate the elements in the half-open element range `[begin, end)`
    ///
    /// The range is clamped to the batch length, so an empty or inverted
    /// range yields nothing.
    pub fn events(&self, begin: usize, end: usize) -> impl Iterator<Item = &[u8]> + '_ {
        let size = self.event_size as usize;
        let end = end.min(self.len as usize);
        let begin = begin.min(end);

        self.data[begin * size..end * size].chunks_exact(size.max(1))
    }
}

/// Consumer report for export
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EventReport {
    /// ISO 8601 timestamp when the report was generated
    pub timestamp: String,
    /// Consumer name
    pub consumer: String,
    /// Duration of collection period in seconds
    pub duration_seconds: u64,
    /// Total number of events delivered
    pub total_events: u64,
    /// Total payload bytes delivered
    pub total_bytes: u64,
    /// Events delivered per CPU
    pub events_per_cpu: BTreeMap<u32, u64>,
    /// Consumer counters
    pub stats: StatsSnapshot,
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use batch_common::constants::BATCH_DATA_SIZE;

    #[test]
    fn test_parse_header() {
        let batch = Batch::parse(raw_batch(7, 5, 3, 8, 10)).unwrap();

        assert_eq!(batch.index, 7);
        assert_eq!(batch.cap, 5);
        assert_eq!(batch.len, 3);
        assert_eq!(batch.event_size, 8);
        assert_eq!(batch.data.len(), 40);
        assert!(!batch.is_complete());
    }

    #[test]
    fn test_parse_too_short() {
        assert!(Batch::parse(Bytes::from_static(b"test")).is_err());
    }

    #[test]
    fn test_parse_len_exceeds_cap() {
        let mut raw = raw_batch(1, 2, 2, 4, 0).to_vec();
        raw[10..12].copy_from_slice(&3u16.to_ne_bytes());

        assert!(Batch::parse(Bytes::from(raw)).is_err());
    }

    #[test]
    fn test_parse_truncated_data() {
        let raw = raw_batch(1, 4, 4, 4, 0);
        let truncated = raw.slice(..raw.len() - 1);

        assert!(Batch::parse(truncated).is_err());
    }

    #[test]
    fn test_completion() {
        assert!(batch(0, 5, 5).is_complete());
        assert!(!batch(0, 5, 4).is_complete());
        assert!(!batch(0, 0, 0).is_complete());
    }

    #[test]
    fn test_events_range() {
        let batch = Batch::parse(raw_batch(0, 4, 3, 2, 100)).unwrap();

        let events: Vec<&[u8]> = batch.events(1, 3).collect();
        assert_eq!(events, vec![&[101, 101][..], &[102, 102][..]]);

        // clamped to len, inverted ranges are empty
        assert_eq!(batch.events(0, 4).count(), 3);
        assert_eq!(batch.events(3, 1).count(), 0);
    }

    #[test]
    fn test_from_record() {
        let mut record = BatchRecord::default();
        record.header = BatchHeader {
            idx: 9,
            cap: 2,
            len: 1,
            event_size: 16,
            dropped_events: 3,
        };

        let batch = Batch::from_record(&record).unwrap();
        assert_eq!(batch.index, 9);
        assert_eq!(batch.dropped_events, 3);
        assert_eq!(batch.data.len(), BATCH_DATA_SIZE);
    }
}
