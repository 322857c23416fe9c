//! Consumer configuration
//!
//! Settings for a batch consumer and the attach points the daemon accepts
//! on the command line.

use anyhow::{bail, Context, Result};
use batch_common::constants::{BATCHES_MAP_SUFFIX, BATCH_EVENTS_MAP_SUFFIX};
use std::str::FromStr;

/// Default capacity of the record channel between transport and consumer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default number of buffers each per-CPU perf reader fills per read
pub const DEFAULT_PERF_BUFFERS: usize = 10;

/// Settings for one batch consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Consumer name, also the prefix of its BPF maps
    pub name: String,
    /// Number of CPU cursors, must cover every CPU id the transport reports
    pub num_cpus: usize,
    /// Capacity of the record channel
    pub channel_capacity: usize,
    /// Buffers per perf read
    pub perf_buffers: usize,
    /// Perf ring size in pages, `None` for the kernel default
    pub perf_page_count: Option<usize>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "usm".to_string(),
            num_cpus: 1,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            perf_buffers: DEFAULT_PERF_BUFFERS,
            perf_page_count: None,
        }
    }
}

impl ConsumerConfig {
    /// Create a config for a named consumer with default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Size the CPU cursors from the host's possible CPUs
    pub fn for_host(name: impl Into<String>) -> Result<Self> {
        let num_cpus = aya::util::nr_cpus().context("Failed to read number of possible CPUs")?;
        Ok(Self::new(name).with_num_cpus(num_cpus))
    }

    pub fn with_num_cpus(mut self, num_cpus: usize) -> Self {
        self.num_cpus = num_cpus;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_perf_page_count(mut self, page_count: Option<usize>) -> Self {
        self.perf_page_count = page_count;
        self
    }

    /// Check that the settings can run a consumer
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("Consumer name must not be empty");
        }
        if self.num_cpus == 0 {
            bail!("Consumer needs at least one CPU");
        }
        if self.channel_capacity == 0 {
            bail!("Channel capacity must be >= 1");
        }
        if self.perf_buffers == 0 {
            bail!("Perf buffer count must be >= 1");
        }
        if let Some(pages) = self.perf_page_count {
            if !pages.is_power_of_two() {
                bail!("Perf ring size must be a power of two, got {} pages", pages);
            }
        }
        Ok(())
    }

    /// Name of the perf event array carrying completed batches
    pub fn batch_events_map(&self) -> String {
        format!("{}{}", self.name, BATCH_EVENTS_MAP_SUFFIX)
    }

    /// Name of the hash map holding in-flight batches
    pub fn batches_map(&self) -> String {
        format!("{}{}", self.name, BATCHES_MAP_SUFFIX)
    }
}

/// A tracepoint to attach, written as `[program=]category:name`
///
/// Without an explicit program the program name defaults to
/// `tracepoint__<category>__<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracepointSpec {
    pub program: String,
    pub category: String,
    pub name: String,
}

impl FromStr for TracepointSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (program, point) = match s.split_once('=') {
            Some((program, point)) => (Some(program), point),
            None => (None, s),
        };

        let Some((category, name)) = point.split_once(':') else {
            bail!("Invalid tracepoint '{}', expected [program=]category:name", s);
        };
        if category.is_empty() || name.is_empty() || program.is_some_and(str::is_empty) {
            bail!("Invalid tracepoint '{}', expected [program=]category:name", s);
        }

        Ok(Self {
            program: program
                .map(str::to_string)
                .unwrap_or_else(|| format!("tracepoint__{}__{}", category, name)),
            category: category.to_string(),
            name: name.to_string(),
        })
    }
}

/// A kprobe to attach, written as `[program=]function`
///
/// Without an explicit program the program is named after the function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KprobeSpec {
    pub program: String,
    pub function: String,
}

impl FromStr for KprobeSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (program, function) = match s.split_once('=') {
            Some((program, function)) => (program, function),
            None => (s, s),
        };
        if program.is_empty() || function.is_empty() {
            bail!("Invalid kprobe '{}', expected [program=]function", s);
        }

        Ok(Self {
            program: program.to_string(),
            function: function.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_names() {
        let config = ConsumerConfig::new("http");

        assert_eq!(config.batch_events_map(), "http_batch_events");
        assert_eq!(config.batches_map(), "http_batches");
    }

    #[test]
    fn test_validate() {
        assert!(ConsumerConfig::new("http").validate().is_ok());
        assert!(ConsumerConfig::new("").validate().is_err());
        assert!(ConsumerConfig::new("http").with_num_cpus(0).validate().is_err());
        assert!(ConsumerConfig::new("http")
            .with_channel_capacity(0)
            .validate()
            .is_err());
        assert!(ConsumerConfig::new("http")
            .with_perf_page_count(Some(64))
            .validate()
            .is_ok());
        assert!(ConsumerConfig::new("http")
            .with_perf_page_count(Some(48))
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_tracepoint() {
        let spec: TracepointSpec = "syscalls:sys_enter_write".parse().unwrap();
        assert_eq!(spec.program, "tracepoint__syscalls__sys_enter_write");
        assert_eq!(spec.category, "syscalls");
        assert_eq!(spec.name, "sys_enter_write");

        let spec: TracepointSpec = "on_write=syscalls:sys_enter_write".parse().unwrap();
        assert_eq!(spec.program, "on_write");

        assert!("syscalls".parse::<TracepointSpec>().is_err());
        assert!("=syscalls:sys_enter_write".parse::<TracepointSpec>().is_err());
        assert!("syscalls:".parse::<TracepointSpec>().is_err());
    }

    #[test]
    fn test_parse_kprobe() {
        let spec: KprobeSpec = "tcp_sendmsg".parse().unwrap();
        assert_eq!(spec.program, "tcp_sendmsg");
        assert_eq!(spec.function, "tcp_sendmsg");

        let spec: KprobeSpec = "kprobe__tcp_sendmsg=tcp_sendmsg".parse().unwrap();
        assert_eq!(spec.program, "kprobe__tcp_sendmsg");

        assert!("".parse::<KprobeSpec>().is_err());
        assert!("prog=".parse::<KprobeSpec>().is_err());
    }
}
