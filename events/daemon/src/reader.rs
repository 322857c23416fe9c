//! In-flight batch lookup
//!
//! Completed batches reach userspace through the perf array. Batches the
//! producer is still filling only live in the batch map, so a sync has to
//! look them up there directly.

use crate::types::{Batch, BatchKey, BatchRecord};
use anyhow::{Context, Result};
use aya::maps::{HashMap, MapData, MapError};
use batch_common::constants::BATCH_PAGES_PER_CPU;

/// Source of the current (possibly incomplete) batch of a CPU
pub trait BatchReader: Send + Sync {
    /// Read the batch with index `batch_id` produced on `cpu`
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the producer has no batch with that index right now,
    /// either because it has not started it or because the slot was reused.
    fn read_batch(&self, cpu: u32, batch_id: u64) -> Result<Option<Batch>>;
}

/// Reads in-flight batches from the `<name>_batches` BPF hash map
pub struct MapBatchReader {
    batches: HashMap<MapData, BatchKey, BatchRecord>,
}

impl MapBatchReader {
    /// Wrap the batch map taken from the loaded eBPF object
    pub fn new(batches: HashMap<MapData, BatchKey, BatchRecord>) -> Self {
        Self { batches }
    }
}

/// Map slot holding batch `batch_id` of `cpu`
pub fn batch_key(cpu: u32, batch_id: u64) -> BatchKey {
    BatchKey {
        cpu,
        num: (batch_id % BATCH_PAGES_PER_CPU as u64) as u32,
    }
}

impl BatchReader for MapBatchReader {
    fn read_batch(&self, cpu: u32, batch_id: u64) -> Result<Option<Batch>> {
        let key = batch_key(cpu, batch_id);

        let record = match self.batches.get(&key, 0) {
            Ok(record) => record,
            Err(MapError::KeyNotFound) => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to look up batch {} for CPU {}", batch_id, cpu))
            }
        };

        // The slot is shared by every BATCH_PAGES_PER_CPU-th batch
        if record.header.idx != batch_id {
            return Ok(None);
        }

        Batch::from_record(&record).map(Some)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_key_wraps_pages() {
        assert_eq!(batch_key(2, 0), BatchKey { cpu: 2, num: 0 });
        assert_eq!(batch_key(2, 4), BatchKey { cpu: 2, num: 1 });
        assert_eq!(
            batch_key(0, BATCH_PAGES_PER_CPU as u64),
            BatchKey { cpu: 0, num: 0 }
        );
    }
}
