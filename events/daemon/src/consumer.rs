//! Batch consumer
//!
//! Drains raw batch records coming from the transport, works out which
//! elements are new with the [`OffsetManager`], and hands each new element
//! to an [`EventHandler`]. A sync pulls the batches the producer is still
//! filling straight from the batch map so nothing is left behind in kernel
//! space across a flush or shutdown.

use crate::{
    config::ConsumerConfig,
    offsets::OffsetManager,
    reader::BatchReader,
    stats::ConsumerStats,
    types::{Batch, RawRecord},
};
use anyhow::{bail, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

/// Receives every element delivered by a consumer
///
/// Called once per element, in batch order for a given CPU. There is no
/// ordering between CPUs.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, cpu: u32, event: &[u8]);
}

impl<F> EventHandler for F
where
    F: Fn(u32, &[u8]) + Send + Sync + 'static,
{
    fn handle(&self, cpu: u32, event: &[u8]) {
        self(cpu, event)
    }
}

enum Control {
    Sync(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

/// State shared between the consumer handle and its event loop
struct Shared<H> {
    name: String,
    num_cpus: usize,
    offsets: Arc<OffsetManager>,
    reader: Arc<dyn BatchReader>,
    handler: H,
    stats: Arc<ConsumerStats>,
}

impl<H: EventHandler> Shared<H> {
    fn process_record(&self, record: RawRecord) {
        let cpu = record.cpu as usize;

        let batch = match Batch::parse(record.data) {
            Ok(batch) => batch,
            Err(e) => {
                self.stats.record_invalid_batch();
                warn!("[{}] Dropping invalid batch from CPU {}: {}", self.name, cpu, e);
                return;
            }
        };

        if cpu >= self.num_cpus {
            self.stats.record_invalid_batch();
            warn!(
                "[{}] Dropping batch {} from unknown CPU {} (tracking {} CPUs)",
                self.name, batch.index, cpu, self.num_cpus
            );
            return;
        }

        self.process(cpu, &batch, false);
    }

    fn process(&self, cpu: usize, batch: &Batch, syncing: bool) {
        let (begin, end) = self.offsets.get(cpu, batch, syncing, &self.name);
        if begin >= end {
            return;
        }

        self.stats.record_batch(end - begin);
        if batch.is_complete() {
            self.stats.record_kernel_drops(batch.dropped_events);
        }

        for event in batch.events(begin, end) {
            self.handler.handle(cpu as u32, event);
        }
    }

    /// Force-read the in-flight batch of every CPU
    fn sync_all(&self) {
        for cpu in 0..self.num_cpus {
            let batch_id = self.offsets.next_batch_id(cpu);

            match self.reader.read_batch(cpu as u32, batch_id) {
                Ok(Some(batch)) => self.process(cpu, &batch, true),
                Ok(None) => {}
                Err(e) => warn!(
                    "[{}] Failed to read in-flight batch {} for CPU {}: {:#}",
                    self.name, batch_id, cpu, e
                ),
            }
        }

        self.stats.record_sync();
    }
}

/// Consumer of kernel batches for one named pipeline
pub struct Consumer<H> {
    shared: Arc<Shared<H>>,
    records: Option<mpsc::Receiver<RawRecord>>,
    control_tx: mpsc::Sender<Control>,
    control_rx: Option<mpsc::Receiver<Control>>,
    event_loop: Option<JoinHandle<()>>,
    transport: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl<H: EventHandler> Consumer<H> {
    /// Create a new consumer
    ///
    /// # Arguments
    ///
    /// * `config` - Consumer settings, validated here
    /// * `records` - Raw records coming from the transport
    /// * `reader` - Lookup of in-flight batches, used by sync
    /// * `handler` - Receives each delivered element
    pub fn new(
        config: &ConsumerConfig,
        records: mpsc::Receiver<RawRecord>,
        reader: Arc<dyn BatchReader>,
        handler: H,
    ) -> Result<Self> {
        config.validate()?;

        let (control_tx, control_rx) = mpsc::channel(1);
        let shared = Shared {
            name: config.name.clone(),
            num_cpus: config.num_cpus,
            offsets: Arc::new(OffsetManager::new(config.num_cpus)),
            reader,
            handler,
            stats: Arc::new(ConsumerStats::new()),
        };

        Ok(Self {
            shared: Arc::new(shared),
            records: Some(records),
            control_tx,
            control_rx: Some(control_rx),
            event_loop: None,
            transport: Vec::new(),
            stopped: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Counters of this consumer
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Offset manager of this consumer
    pub fn offsets(&self) -> Arc<OffsetManager> {
        Arc::clone(&self.shared.offsets)
    }

    /// Hand over the transport tasks feeding this consumer
    ///
    /// They are aborted when the consumer stops.
    pub fn attach_transport(&mut self, tasks: Vec<JoinHandle<()>>) {
        self.transport.extend(tasks);
    }

    /// Start the event loop
    ///
    /// Calling `start` more than once, or after `stop`, does nothing.
    pub fn start(&mut self) {
        let (Some(records), Some(control)) = (self.records.take(), self.control_rx.take()) else {
            return;
        };

        info!("[{}] Starting batch consumer for {} CPUs", self.shared.name, self.shared.num_cpus);
        let shared = Arc::clone(&self.shared);
        self.event_loop = Some(tokio::spawn(run(shared, records, control)));
    }

    /// Deliver everything the producer has written so far
    ///
    /// Processes queued records, then force-reads the incomplete batch of
    /// every CPU. Returns once the pass is done. Does nothing after `stop`.
    ///
    /// # Errors
    ///
    /// Fails when the event loop has died (for example a panicking
    /// handler), in which case nothing was flushed.
    pub async fn sync(&self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }

        if self.event_loop.is_none() {
            self.shared.sync_all();
            return Ok(());
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control_tx.send(Control::Sync(ack_tx)).await.is_err() {
            bail!("[{}] Sync failed: event loop is gone", self.shared.name);
        }
        if ack_rx.await.is_err() {
            bail!("[{}] Sync failed: event loop ended during sync", self.shared.name);
        }

        Ok(())
    }

    /// Stop the consumer
    ///
    /// Finishes queued records, runs a final sync, then releases the
    /// transport. Safe to call more than once.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }

        match self.event_loop.take() {
            Some(event_loop) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                if self.control_tx.send(Control::Stop(ack_tx)).await.is_ok() {
                    let _ = ack_rx.await;
                }
                if let Err(e) = event_loop.await {
                    warn!("[{}] Event loop ended abnormally: {}", self.shared.name, e);
                }
            }
            None => {
                if let Some(mut records) = self.records.take() {
                    drain(&self.shared, &mut records);
                }
                self.shared.sync_all();
            }
        }

        for task in self.transport.drain(..) {
            task.abort();
        }
        self.records = None;
        self.control_rx = None;
        self.stopped = true;

        info!("[{}] Batch consumer stopped", self.shared.name);
    }
}

fn drain<H: EventHandler>(shared: &Shared<H>, records: &mut mpsc::Receiver<RawRecord>) {
    while let Ok(record) = records.try_recv() {
        shared.process_record(record);
    }
}

async fn run<H: EventHandler>(
    shared: Arc<Shared<H>>,
    mut records: mpsc::Receiver<RawRecord>,
    mut control: mpsc::Receiver<Control>,
) {
    let mut records_open = true;

    loop {
        tokio::select! {
            biased;

            Some(command) = control.recv() => match command {
                Control::Sync(ack) => {
                    drain(&shared, &mut records);
                    shared.sync_all();
                    let _ = ack.send(());
                }
                Control::Stop(ack) => {
                    drain(&shared, &mut records);
                    shared.sync_all();
                    let _ = ack.send(());
                    break;
                }
            },
            record = records.recv(), if records_open => match record {
                Some(record) => shared.process_record(record),
                None => {
                    debug!("[{}] Transport closed, waiting for stop", shared.name);
                    records_open = false;
                }
            },
            else => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reader::test_util::FakeBatchReader,
        types::test_util::{batch, raw_batch},
    };
    use bytes::Bytes;
    use parking_lot::Mutex;

    type Delivered = Arc<Mutex<Vec<(u32, u8)>>>;

    fn recording_handler() -> (Delivered, impl EventHandler) {
        let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let handler = move |cpu: u32, event: &[u8]| sink.lock().push((cpu, event[0]));
        (delivered, handler)
    }

    fn consumer(
        num_cpus: usize,
    ) -> (
        Consumer<impl EventHandler>,
        mpsc::Sender<RawRecord>,
        Arc<FakeBatchReader>,
        Delivered,
    ) {
        let config = ConsumerConfig::new("test").with_num_cpus(num_cpus);
        let (tx, rx) = mpsc::channel(16);
        let reader = Arc::new(FakeBatchReader::default());
        let (delivered, handler) = recording_handler();
        let consumer = Consumer::new(&config, rx, reader.clone(), handler).unwrap();
        (consumer, tx, reader, delivered)
    }

    fn values(delivered: &Delivered) -> Vec<u8> {
        delivered.lock().iter().map(|&(_, value)| value).collect()
    }

    #[tokio::test]
    async fn test_complete_batches_delivered_once() {
        let (mut consumer, tx, _reader, delivered) = consumer(1);
        consumer.start();

        tx.send(RawRecord::new(0, raw_batch(0, 3, 3, 4, 0))).await.unwrap();
        tx.send(RawRecord::new(0, raw_batch(0, 3, 3, 4, 0))).await.unwrap();
        tx.send(RawRecord::new(0, raw_batch(1, 3, 3, 4, 3))).await.unwrap();
        consumer.sync().await.unwrap();

        assert_eq!(values(&delivered), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(consumer.offsets().next_batch_id(0), 2);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_sync_reads_incomplete_batch() {
        let (mut consumer, tx, reader, delivered) = consumer(2);
        consumer.start();

        tx.send(RawRecord::new(1, raw_batch(0, 4, 4, 4, 0))).await.unwrap();
        reader.insert(1, Batch::parse(raw_batch(1, 4, 2, 4, 4)).unwrap());
        consumer.sync().await.unwrap();

        assert_eq!(values(&delivered), vec![0, 1, 2, 3, 4, 5]);
        assert!(delivered.lock().iter().all(|&(cpu, _)| cpu == 1));

        // the producer finishes the batch and ships it on the perf array
        tx.send(RawRecord::new(1, raw_batch(1, 4, 4, 4, 4))).await.unwrap();
        consumer.sync().await.unwrap();

        assert_eq!(values(&delivered), vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(consumer.offsets().next_batch_id(1), 2);
        assert_eq!(consumer.offsets().next_batch_id(0), 0);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_repeated_sync_no_duplicates() {
        let (mut consumer, _tx, reader, delivered) = consumer(1);
        consumer.start();

        reader.insert(0, Batch::parse(raw_batch(0, 8, 3, 4, 0)).unwrap());
        consumer.sync().await.unwrap();
        consumer.sync().await.unwrap();
        reader.insert(0, Batch::parse(raw_batch(0, 8, 5, 4, 0)).unwrap());
        consumer.sync().await.unwrap();

        assert_eq!(values(&delivered), vec![0, 1, 2, 3, 4]);
        assert_eq!(consumer.stats().snapshot().syncs, 3);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_batch_counted() {
        let (mut consumer, tx, _reader, delivered) = consumer(1);
        consumer.start();

        tx.send(RawRecord::new(0, Bytes::from_static(b"test"))).await.unwrap();
        tx.send(RawRecord::new(5, raw_batch(0, 1, 1, 4, 0))).await.unwrap();
        tx.send(RawRecord::new(0, raw_batch(0, 1, 1, 4, 9))).await.unwrap();
        consumer.sync().await.unwrap();

        assert_eq!(consumer.stats().invalid_batches(), 2);
        assert_eq!(values(&delivered), vec![9]);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_and_flushes() {
        let (mut consumer, tx, reader, delivered) = consumer(1);

        tx.send(RawRecord::new(0, raw_batch(0, 2, 2, 4, 0))).await.unwrap();
        reader.insert(0, Batch::parse(raw_batch(1, 2, 1, 4, 2)).unwrap());
        consumer.start();
        consumer.stop().await;

        assert_eq!(values(&delivered), vec![0, 1, 2]);

        // no-op once stopped
        reader.insert(0, Batch::parse(raw_batch(1, 2, 2, 4, 2)).unwrap());
        consumer.sync().await.unwrap();
        consumer.stop().await;
        assert_eq!(values(&delivered), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_stop_aborts_transport() {
        let (mut consumer, _tx, _reader, _delivered) = consumer(1);
        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        let transport = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await
        });

        consumer.attach_transport(vec![transport]);
        consumer.start();
        consumer.stop().await;

        // the sender is dropped once the task is cancelled
        let released = tokio::time::timeout(std::time::Duration::from_secs(1), alive_rx).await;
        assert!(matches!(released, Ok(Err(_))));
    }

    #[tokio::test]
    async fn test_sync_without_start() {
        let (consumer, _tx, reader, delivered) = consumer(1);

        reader.insert(0, batch(0, 4, 2));
        consumer.sync().await.unwrap();

        assert_eq!(delivered.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_kernel_drops_counted_on_completion() {
        let (mut consumer, tx, _reader, _delivered) = consumer(1);
        consumer.start();

        let mut raw = raw_batch(0, 2, 2, 4, 0).to_vec();
        raw[14..16].copy_from_slice(&7u16.to_ne_bytes());
        tx.send(RawRecord::new(0, Bytes::from(raw.clone()))).await.unwrap();
        tx.send(RawRecord::new(0, Bytes::from(raw))).await.unwrap();
        consumer.sync().await.unwrap();

        assert_eq!(consumer.stats().snapshot().kernel_dropped_events, 7);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_max_batch_index_keeps_consumer_alive() {
        let (mut consumer, tx, _reader, delivered) = consumer(1);
        consumer.start();

        tx.send(RawRecord::new(0, raw_batch(u64::MAX, 1, 1, 4, 7))).await.unwrap();
        tx.send(RawRecord::new(0, raw_batch(0, 2, 2, 4, 1))).await.unwrap();
        consumer.sync().await.unwrap();

        assert_eq!(values(&delivered), vec![7, 1, 2]);
        assert_eq!(consumer.offsets().next_batch_id(0), 1);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_sync_reports_dead_event_loop() {
        let config = ConsumerConfig::new("test");
        let (tx, rx) = mpsc::channel(4);
        let reader = Arc::new(FakeBatchReader::default());
        let handler = |_cpu: u32, event: &[u8]| {
            if event[0] == 0 {
                panic!("handler failed");
            }
        };
        let mut consumer = Consumer::new(&config, rx, reader, handler).unwrap();
        consumer.start();

        tx.send(RawRecord::new(0, raw_batch(0, 1, 1, 4, 0))).await.unwrap();

        assert!(consumer.sync().await.is_err());
        assert!(consumer.sync().await.is_err());
        consumer.stop().await;
    }
}
