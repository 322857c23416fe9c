//! eBPF program loader
//!
//! Handles loading the batch producer program, attaching its tracepoints
//! and kprobes, and taking the maps a consumer reads from.

use crate::{
    config::{ConsumerConfig, KprobeSpec, TracepointSpec},
    reader::MapBatchReader,
    types::{BatchKey, BatchRecord},
};
use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, HashMap, MapData},
    programs::{KProbe, TracePoint},
    Bpf,
};
use log::info;
use std::path::Path;

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load the eBPF object file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the compiled eBPF object
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading eBPF object from: {:?}", path);
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read eBPF object file: {:?}", path))?;
        let ebpf = Bpf::load(&data).context("Failed to load eBPF program")?;

        info!("eBPF program loaded successfully");

        Ok(Self { ebpf })
    }

    /// Attach a program to a kernel tracepoint
    pub fn attach_tracepoint(&mut self, spec: &TracepointSpec) -> Result<()> {
        let program: &mut TracePoint = self
            .ebpf
            .program_mut(&spec.program)
            .with_context(|| format!("{} program not found in eBPF object", spec.program))?
            .try_into()
            .with_context(|| format!("Failed to get {} as TracePoint", spec.program))?;
        program
            .load()
            .with_context(|| format!("Failed to load {}", spec.program))?;
        program
            .attach(&spec.category, &spec.name)
            .with_context(|| {
                format!(
                    "Failed to attach {} to {}:{}",
                    spec.program, spec.category, spec.name
                )
            })?;
        info!("  ✓ Attached {} to {}:{}", spec.program, spec.category, spec.name);

        Ok(())
    }

    /// Attach a program to a kernel function entry
    pub fn attach_kprobe(&mut self, spec: &KprobeSpec) -> Result<()> {
        let program: &mut KProbe = self
            .ebpf
            .program_mut(&spec.program)
            .with_context(|| format!("{} program not found in eBPF object", spec.program))?
            .try_into()
            .with_context(|| format!("Failed to get {} as KProbe", spec.program))?;
        program
            .load()
            .with_context(|| format!("Failed to load {}", spec.program))?;
        program
            .attach(&spec.function, 0)
            .with_context(|| format!("Failed to attach {} kprobe", spec.function))?;
        info!("  ✓ Attached {} to {}", spec.program, spec.function);

        Ok(())
    }

    /// Get the perf event array carrying completed batches
    pub fn take_batch_events(
        &mut self,
        config: &ConsumerConfig,
    ) -> Result<AsyncPerfEventArray<MapData>> {
        let name = config.batch_events_map();
        let map = self
            .ebpf
            .take_map(&name)
            .with_context(|| format!("{} map not found in eBPF object", name))?;

        AsyncPerfEventArray::try_from(map)
            .with_context(|| format!("Failed to create AsyncPerfEventArray from {} map", name))
    }

    /// Get a reader over the map holding in-flight batches
    pub fn take_batch_reader(&mut self, config: &ConsumerConfig) -> Result<MapBatchReader> {
        let name = config.batches_map();
        let map = self
            .ebpf
            .take_map(&name)
            .with_context(|| format!("{} map not found in eBPF object", name))?;

        let batches: HashMap<MapData, BatchKey, BatchRecord> = HashMap::try_from(map)
            .with_context(|| format!("Failed to create HashMap from {} map", name))?;

        Ok(MapBatchReader::new(batches))
    }
}
