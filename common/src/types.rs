//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) so that their memory layout matches
//! the batches written by the eBPF producer byte for byte.

use crate::constants::{
    BATCH_CAP_OFFSET, BATCH_DATA_SIZE, BATCH_DROPPED_EVENTS_OFFSET, BATCH_EVENT_SIZE_OFFSET,
    BATCH_HEADER_SIZE, BATCH_IDX_OFFSET, BATCH_LEN_OFFSET,
};
use core::mem::{offset_of, size_of};

/// Fixed header at the start of every batch
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchHeader {
    /// Per-CPU sequence number assigned by the producer
    pub idx: u64,
    /// Maximum number of elements this batch can hold
    pub cap: u16,
    /// Number of elements written so far
    pub len: u16,
    /// Size of one element in bytes
    pub event_size: u16,
    /// Events the producer could not fit and dropped while this batch was current
    pub dropped_events: u16,
}

/// A full batch as stored in the batch map and emitted on the perf array
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BatchRecord {
    /// Batch header
    pub header: BatchHeader,
    /// Raw element storage, `header.len * header.event_size` bytes are valid
    pub data: [u8; BATCH_DATA_SIZE],
}

impl Default for BatchRecord {
    fn default() -> Self {
        Self {
            header: BatchHeader::default(),
            data: [0; BATCH_DATA_SIZE],
        }
    }
}

/// Key of the batch map
///
/// `num` is the slot of the batch, i.e. `idx % BATCH_PAGES_PER_CPU`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// CPU that produced the batch
    pub cpu: u32,
    /// Slot number within that CPU's pages
    pub num: u32,
}

// Compile-time layout checks
// These will fail to compile if the layout drifts from the producer's
const _: () = {
    assert!(size_of::<BatchHeader>() == BATCH_HEADER_SIZE);
    assert!(offset_of!(BatchHeader, idx) == BATCH_IDX_OFFSET);
    assert!(offset_of!(BatchHeader, cap) == BATCH_CAP_OFFSET);
    assert!(offset_of!(BatchHeader, len) == BATCH_LEN_OFFSET);
    assert!(offset_of!(BatchHeader, event_size) == BATCH_EVENT_SIZE_OFFSET);
    assert!(offset_of!(BatchHeader, dropped_events) == BATCH_DROPPED_EVENTS_OFFSET);
    assert!(offset_of!(BatchRecord, data) == BATCH_HEADER_SIZE);
    assert!(size_of::<BatchRecord>() == BATCH_HEADER_SIZE + BATCH_DATA_SIZE);
    assert!(size_of::<BatchKey>() == 8);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    // Pod trait implementations for reading from BPF maps in userspace
    unsafe impl aya::Pod for BatchHeader {}
    unsafe impl aya::Pod for BatchRecord {}
    unsafe impl aya::Pod for BatchKey {}
}
