//! Shared constants for the batch layout
//!
//! These constants are used by both the kernel producer and the userspace
//! consumer and must match the producer's compiled values.

// ============================================================================
// Batch Sizing
// ============================================================================

/// Size of the data region of one batch in bytes
pub const BATCH_DATA_SIZE: usize = 4096;

/// Number of batch slots kept per CPU in the batch map
///
/// Batch `n` of a CPU lives in slot `n % BATCH_PAGES_PER_CPU`.
pub const BATCH_PAGES_PER_CPU: u32 = 3;

// ============================================================================
// Header Layout (byte offsets into a raw batch record)
// ============================================================================

/// Offset of the batch index (u64)
pub const BATCH_IDX_OFFSET: usize = 0;

/// Offset of the batch capacity in elements (u16)
pub const BATCH_CAP_OFFSET: usize = 8;

/// Offset of the number of valid elements (u16)
pub const BATCH_LEN_OFFSET: usize = 10;

/// Offset of the element size in bytes (u16)
pub const BATCH_EVENT_SIZE_OFFSET: usize = 12;

/// Offset of the kernel-side dropped events counter (u16)
pub const BATCH_DROPPED_EVENTS_OFFSET: usize = 14;

/// Size of the fixed header preceding the data region
pub const BATCH_HEADER_SIZE: usize = 16;

// ============================================================================
// Map Names
// ============================================================================

/// Suffix of the perf event array carrying completed batches
///
/// The full map name is `<consumer name>_batch_events`.
pub const BATCH_EVENTS_MAP_SUFFIX: &str = "_batch_events";

/// Suffix of the hash map holding in-flight batches
///
/// The full map name is `<consumer name>_batches`.
pub const BATCHES_MAP_SUFFIX: &str = "_batches";
