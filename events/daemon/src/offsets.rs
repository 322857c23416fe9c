//! Per-CPU batch offset tracking
//!
//! Keeps track of which elements of each kernel batch have already been
//! handed to the consumer, so that every element is delivered exactly once
//! even when incomplete batches are force-read during a sync.

use crate::types::Batch;
use log::trace;
use parking_lot::Mutex;

/// Read cursor for a single CPU
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CpuReadState {
    /// Next batch index we expect for this CPU. Everything below it has been
    /// fully consumed. Also used by sync to locate the in-flight batch.
    next_batch_id: u64,
    /// Batch that was last force-read while incomplete
    partial_batch_id: u64,
    /// Element offset already delivered from `partial_batch_id`
    partial_offset: usize,
}

/// Tracks consumed element ranges of kernel batches, one cursor per CPU
///
/// A single lock guards all cursors. Each call does a handful of
/// comparisons, and updates happen once per batch, not once per element.
#[derive(Debug)]
pub struct OffsetManager {
    state_by_cpu: Mutex<Vec<CpuReadState>>,
}

impl OffsetManager {
    /// Create an offset manager with one cursor per CPU
    ///
    /// # Arguments
    ///
    /// * `num_cpus` - Number of CPU cursors, fixed for the manager's lifetime
    pub fn new(num_cpus: usize) -> Self {
        Self {
            state_by_cpu: Mutex::new(vec![CpuReadState::default(); num_cpus]),
        }
    }

    /// Compute the element range of `batch` that has not been delivered yet
    ///
    /// Returns the half-open range `[begin, end)` in elements. Stale batches
    /// (already fully consumed) yield `(0, 0)` and leave the cursor untouched.
    ///
    /// # Arguments
    ///
    /// * `cpu` - CPU the batch came from; must be below `num_cpus`
    /// * `batch` - Batch snapshot read from the transport
    /// * `syncing` - True when this read is part of a forced drain of
    ///   incomplete batches
    /// * `debug_id` - Consumer name, used in trace output
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range.
    pub fn get(&self, cpu: usize, batch: &Batch, syncing: bool, debug_id: &str) -> (usize, usize) {
        let mut states = self.state_by_cpu.lock();
        let state = &mut states[cpu];

        trace!(
            "[{}] get: cpu={}, batch={}, len={}, syncing={}, state={:?}",
            debug_id,
            cpu,
            batch.index,
            batch.len,
            syncing,
            state
        );

        if batch.index < state.next_batch_id {
            trace!(
                "[{}] skipping batch {} on cpu {}: already consumed up to {}",
                debug_id,
                batch.index,
                cpu,
                state.next_batch_id
            );
            return (0, 0);
        }

        if batch.is_complete() {
            // u64::MAX wraps to 0 instead of overflowing
            state.next_batch_id = batch.index.wrapping_add(1);
        }

        // Start after whatever a previous forced read already delivered
        let begin = if batch.index == state.partial_batch_id {
            state.partial_offset
        } else {
            0
        };

        // Only what is valid right now, not the full capacity
        let end = batch.len as usize;

        if syncing {
            state.partial_batch_id = batch.index;
            state.partial_offset = end;
        }

        (begin, end)
    }

    /// Next batch index expected for a CPU
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range.
    pub fn next_batch_id(&self, cpu: usize) -> u64 {
        self.state_by_cpu.lock()[cpu].next_batch_id
    }
}
