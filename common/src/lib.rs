//! Shared batch layout for the USM event pipeline
//!
//! This crate provides the data structures and constants shared between
//! the eBPF producer (which fills batches in kernel space) and the
//! userspace consumer that reads them back.

#![no_std]

pub mod types;
pub mod constants;

// Re-export commonly used types
pub use types::{BatchHeader, BatchKey, BatchRecord};
pub use constants::*;
