//! USM Batch Events Userspace Library
//!
//! Consumes the fixed-capacity batches an eBPF program writes per CPU and
//! delivers every element exactly once, including the elements of batches
//! the producer has not finished yet.

pub mod collector;
pub mod config;
pub mod consumer;
pub mod events;
pub mod exporter;
pub mod loader;
pub mod offsets;
pub mod reader;
pub mod stats;
pub mod types;

pub use collector::EventCollector;
pub use config::ConsumerConfig;
pub use consumer::{Consumer, EventHandler};
pub use events::PerfTransport;
pub use exporter::{JsonExporter, ReportExporter};
pub use loader::ProbeLoader;
pub use offsets::OffsetManager;
pub use reader::{BatchReader, MapBatchReader};
pub use stats::{ConsumerStats, StatsSnapshot};
pub use types::*;
