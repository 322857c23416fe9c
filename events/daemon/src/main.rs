//! USM Batch Events - Userspace Daemon
//!
//! Loads a batch-producing eBPF program, attaches it, consumes its
//! per-CPU batches and exports delivery statistics.
//!
//! ## Usage
//!
//! ```bash
//! # Consume the "http" batches for 60 seconds
//! sudo ./usm-events --ebpf-object usm.o --name http \
//!     --tracepoint syscalls:sys_enter_write --duration 60
//!
//! # Flush incomplete batches every 5 seconds, run until Ctrl-C
//! sudo ./usm-events --ebpf-object usm.o --kprobe tcp_sendmsg \
//!     --duration 0 --sync-interval 5
//! ```

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use parking_lot::Mutex;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal,
    sync::mpsc,
    time::{interval, sleep_until, Instant},
};
use usm_events::{
    collector::EventCollector,
    config::{ConsumerConfig, KprobeSpec, TracepointSpec},
    consumer::Consumer,
    events::PerfTransport,
    exporter::{JsonExporter, ReportExporter},
    loader::ProbeLoader,
    stats::spawn_progress_reporter,
    types::EventReport,
};

/// Exactly-once consumer for USM eBPF event batches
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the eBPF object file
    #[clap(long)]
    ebpf_object: PathBuf,

    /// Consumer name, prefix of the batch maps
    #[clap(short, long, default_value = "usm")]
    name: String,

    /// Tracepoint to attach, as [program=]category:name (repeatable)
    #[clap(long)]
    tracepoint: Vec<TracepointSpec>,

    /// Kprobe to attach, as [program=]function (repeatable)
    #[clap(long)]
    kprobe: Vec<KprobeSpec>,

    /// Duration to run (in seconds, 0 = infinite)
    #[clap(short, long, default_value_t = 60)]
    duration: u64,

    /// Interval between forced reads of incomplete batches (in seconds, 0 = only at shutdown)
    #[clap(long, default_value_t = 10)]
    sync_interval: u64,

    /// Progress reporting interval in seconds
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,

    /// Capacity of the record channel
    #[clap(long, default_value_t = usm_events::config::DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// Perf ring size per CPU in pages, a power of two (kernel default if unset)
    #[clap(long)]
    perf_pages: Option<usize>,

    /// Output file for the report
    #[clap(short, long, default_value = "usm-events.json")]
    output: PathBuf,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    if args.tracepoint.is_empty() && args.kprobe.is_empty() {
        anyhow::bail!("Nothing to attach. Use --tracepoint or --kprobe");
    }

    let config = ConsumerConfig::for_host(args.name.clone())?
        .with_channel_capacity(args.channel_capacity)
        .with_perf_page_count(args.perf_pages);
    config.validate()?;

    info!("Starting USM batch consumer...");
    info!("   Consumer: {}", config.name);
    info!("   CPUs: {}", config.num_cpus);
    info!(
        "   Duration: {} seconds",
        if args.duration == 0 {
            "infinite".to_string()
        } else {
            args.duration.to_string()
        }
    );
    info!("   Output: {:?}", args.output);

    // Load eBPF program
    let mut loader = ProbeLoader::load(&args.ebpf_object)?;

    info!("Attaching programs...");
    for spec in &args.tracepoint {
        loader.attach_tracepoint(spec)?;
    }
    for spec in &args.kprobe {
        loader.attach_kprobe(spec)?;
    }

    let perf_array = loader.take_batch_events(&config)?;
    let batch_reader = Arc::new(loader.take_batch_reader(&config)?);

    // Create event collector
    let collector = Arc::new(Mutex::new(EventCollector::new()));
    let sink = Arc::clone(&collector);

    let (records_tx, records_rx) = mpsc::channel(config.channel_capacity);
    let mut consumer = Consumer::new(&config, records_rx, batch_reader, move |cpu: u32, event: &[u8]| {
        sink.lock().add_event(cpu, event)
    })?;

    // Spawn per-CPU batch readers
    let transport = PerfTransport::new(&config, records_tx, consumer.stats());
    consumer.attach_transport(transport.spawn_cpu_readers(perf_array)?);
    consumer.start();

    let progress = spawn_progress_reporter(config.name.clone(), consumer.stats(), args.progress_interval);

    info!("Consuming batches...");

    // Run for specified duration or until interrupted, syncing on the way
    let start_time = Instant::now();
    let deadline = (args.duration > 0).then(|| start_time + Duration::from_secs(args.duration));
    let mut sync_ticker = interval(Duration::from_secs(args.sync_interval.max(1)));
    sync_ticker.tick().await;

    loop {
        tokio::select! {
            _ = sync_ticker.tick(), if args.sync_interval > 0 => {
                if let Err(e) = consumer.sync().await {
                    warn!("{:#}", e);
                }
            }
            _ = wait_until(deadline) => {
                info!("Duration reached, shutting down...");
                break;
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
                break;
            }
        }
    }

    consumer.stop().await;
    progress.abort();

    let elapsed = start_time.elapsed().as_secs();

    info!("Generating report...");

    let report = collector
        .lock()
        .generate_report(consumer.name(), elapsed, consumer.stats().snapshot());

    let exporter = JsonExporter::new(args.output.clone(), true);
    exporter.export(&report)?;

    info!("Report written to {:?}", args.output);

    print_summary(&report);

    Ok(())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║          USM Batch Events - Consumer              ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(report: &EventReport) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Consumer:           {}", report.consumer);
    info!("  Total events:       {}", report.total_events);
    info!("  Total bytes:        {}", report.total_bytes);
    info!("  Duration:           {} seconds", report.duration_seconds);
    info!("");
    info!("  Events per CPU:");
    for (cpu, events) in &report.events_per_cpu {
        info!("    cpu {:>3}:      {:>10}", cpu, events);
    }
    info!("");
    info!("  Consumer counters:");
    info!("    batches:          {:>8}", report.stats.batches);
    info!("    invalid batches:  {:>8}", report.stats.invalid_batches);
    info!("    kernel drops:     {:>8}", report.stats.kernel_dropped_events);
    info!("    lost samples:     {:>8}", report.stats.lost_samples);
    info!("    read errors:      {:>8}", report.stats.read_errors);
    info!("    syncs:            {:>8}", report.stats.syncs);
    info!("");
    info!("============================================");
}
