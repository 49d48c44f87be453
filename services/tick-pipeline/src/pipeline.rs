//! Pipeline wiring
//!
//! ```text
//!  submit ──► Ingester ──► queue[hash(symbol) % N] ──► worker
//!                                                       │
//!                               ┌───────────────────────┼──────────────┐
//!                               ▼                       ▼              ▼
//!                          Aggregator            StorageManager    Monitor
//!                               │
//!                               ▼
//!                          Distributor ──► subscribers / topic sink
//! ```
//!
//! Every tick of a symbol lands on the same worker, so per-symbol order is
//! preserved end to end. Workers are blocking threads: storage appends are
//! plain file IO. Flush, rotation, monitor and compression run as separate
//! tokio tasks stopped through a shared `watch` channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use market_types::errors::RejectReason;
use market_types::ids::Symbol;
use market_types::tick::{RawTick, Tick};
use market_types::time::{day_of, day_start_millis, now_millis};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::candles::{Bar, Timeframe};
use crate::compressor::{Compressor, SweepReport};
use crate::config::PipelineConfig;
use crate::distributor::{Distributor, Subscription, SubscriptionFilter, TopicSink};
use crate::error::PipelineError;
use crate::events::MarketEvent;
use crate::ingestion::Ingester;
use crate::metrics::{MetricsSnapshot, PipelineMetrics, Stage};
use crate::monitor::{HealthReport, Monitor};
use crate::storage::{PartitionMeta, RotationOutcome, StorageError, StorageManager};

struct QueuedTick {
    tick: Tick,
    enqueued_at: Instant,
}

/// Stable shard for a symbol (FNV-1a).
fn shard_for(symbol: &str, shards: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in symbol.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % shards.max(1) as u64) as usize
}

pub struct Pipeline {
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    ingester: Ingester,
    aggregator: Aggregator,
    distributor: Distributor,
    storage: Arc<StorageManager>,
    compressor: Arc<Compressor>,
    monitor: Arc<Monitor>,
    accepting: AtomicBool,
    started: AtomicBool,
    /// Set once the drain deadline passes; workers discard what is left.
    abandon_queued: AtomicBool,
    queues: RwLock<Vec<mpsc::Sender<QueuedTick>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Arc<Self>, PipelineError> {
        Self::build(config, None)
    }

    /// Like [`Pipeline::new`], also forwarding every event to `sink`.
    pub fn with_sink(config: PipelineConfig, sink: Arc<dyn TopicSink>) -> Result<Arc<Self>, PipelineError> {
        Self::build(config, Some(sink))
    }

    fn build(config: PipelineConfig, sink: Option<Arc<dyn TopicSink>>) -> Result<Arc<Self>, PipelineError> {
        config.validate()?;

        let metrics = Arc::new(PipelineMetrics::new());
        let storage = Arc::new(StorageManager::open(config.storage.clone(), Arc::clone(&metrics))?);
        let mut distributor = Distributor::new(config.distribution.clone(), Arc::clone(&metrics));
        if let Some(sink) = sink {
            distributor = distributor.with_sink(sink);
        }
        let compressor = Arc::new(Compressor::new(
            Arc::clone(&storage),
            config.compression.clone(),
            Arc::clone(&metrics),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            ingester: Ingester::new(config.ingestion.clone(), Arc::clone(&metrics)),
            aggregator: Aggregator::new(config.aggregation.clone(), Arc::clone(&metrics)),
            monitor: Arc::new(Monitor::new(config.monitor.clone(), Arc::clone(&metrics))),
            distributor,
            storage,
            compressor,
            metrics,
            config,
            accepting: AtomicBool::new(false),
            started: AtomicBool::new(false),
            abandon_queued: AtomicBool::new(false),
            queues: RwLock::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            shutdown_tx,
        }))
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Spawn workers and background loops. Must run inside a tokio runtime.
    pub async fn start(self: &Arc<Self>) -> Result<(), PipelineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyStarted);
        }

        let worker_count = self.config.ingestion.worker_count;
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = self.workers.lock().await;
        for worker in 0..worker_count {
            let (tx, mut rx) = mpsc::channel::<QueuedTick>(self.config.ingestion.queue_capacity);
            senders.push(tx);
            let pipeline = Arc::clone(self);
            workers.push(tokio::task::spawn_blocking(move || {
                debug!(worker, "Worker started");
                while let Some(item) = rx.blocking_recv() {
                    if pipeline.abandon_queued.load(Ordering::SeqCst) {
                        let mut abandoned = 1u64;
                        while rx.try_recv().is_ok() {
                            abandoned += 1;
                        }
                        pipeline.metrics.ticks_abandoned.fetch_add(abandoned, Ordering::Relaxed);
                        warn!(worker, abandoned, "Worker stopped with ticks still queued");
                        return;
                    }
                    pipeline.process(item);
                }
                debug!(worker, "Worker drained");
            }));
        }
        drop(workers);
        *self.queues.write().unwrap_or_else(PoisonError::into_inner) = senders;

        let mut background = self.background.lock().await;
        background.push(tokio::spawn(Arc::clone(self).flush_loop(self.shutdown_tx.subscribe())));
        background.push(tokio::spawn(Arc::clone(self).rotation_loop(self.shutdown_tx.subscribe())));
        background.push(tokio::spawn(Arc::clone(&self.monitor).run(self.shutdown_tx.subscribe())));
        background.push(tokio::spawn(Arc::clone(&self.compressor).run(self.shutdown_tx.subscribe())));
        drop(background);

        self.accepting.store(true, Ordering::SeqCst);
        info!(
            workers = worker_count,
            queue_capacity = self.config.ingestion.queue_capacity,
            storage_root = %self.config.storage.root.display(),
            "Pipeline started"
        );
        Ok(())
    }

    /// Stop accepting, drain queues, flush storage, stop background loops.
    ///
    /// Queues get `drain_timeout_ms` to empty. Past that, whatever is still
    /// queued is dropped and counted in `ticks_abandoned`.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            debug!("Shutdown requested while not running");
        }
        info!("Pipeline shutting down");

        // Closing the senders ends each worker once its queue is empty.
        self.queues.write().unwrap_or_else(PoisonError::into_inner).clear();

        let drain = Duration::from_millis(self.config.shutdown.drain_timeout_ms);
        let mut workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        let drained = tokio::time::timeout(drain, async {
            while let Some(handle) = workers.last_mut() {
                let joined = handle.await;
                workers.pop();
                if let Err(e) = joined {
                    error!(error = %e, "Worker panicked");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                timeout_ms = drain.as_millis() as u64,
                remaining = workers.len(),
                "Workers did not drain in time; abandoning queued ticks"
            );
            // Workers finish the tick in hand, count the rest and exit, so
            // nothing is appended after the final flush below.
            self.abandon_queued.store(true, Ordering::SeqCst);
            for handle in workers {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker panicked");
                }
            }
        }

        self.shutdown_tx.send_replace(true);
        let storage = Arc::clone(&self.storage);
        let closed = tokio::task::spawn_blocking(move || storage.close()).await?;

        let background: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock().await);
        for handle in background {
            if tokio::time::timeout(drain, handle).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }

        info!(
            processed = self.metrics.ticks_processed.load(Ordering::Relaxed),
            persisted = self.metrics.ticks_persisted.load(Ordering::Relaxed),
            "Pipeline stopped"
        );
        closed.map_err(PipelineError::from)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    // ── Ingestion ───────────────────────────────────────────────────

    /// Validate and enqueue one tick. Never blocks.
    pub fn submit(&self, raw: RawTick) -> Result<(), RejectReason> {
        self.metrics.ticks_received.fetch_add(1, Ordering::Relaxed);
        let result = self.enqueue(raw);
        match &result {
            Ok(()) => {
                self.metrics.ticks_accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(reason) => {
                self.metrics.record_rejection(*reason);
                debug!(reason = reason.label(), "Tick rejected");
            }
        }
        result
    }

    fn enqueue(&self, raw: RawTick) -> Result<(), RejectReason> {
        let received_at = Instant::now();
        if !self.is_accepting() {
            return Err(RejectReason::ShuttingDown);
        }

        let tick = self.ingester.check_fields(raw, now_millis())?;

        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        if queues.is_empty() {
            return Err(RejectReason::ShuttingDown);
        }
        let queue = &queues[shard_for(tick.symbol.as_str(), queues.len())];

        // Reserve before the dedup window sees the tick: a dropped tick must
        // not turn its own retransmit into a duplicate.
        let permit = queue.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => RejectReason::QueueFull,
            TrySendError::Closed(()) => RejectReason::ShuttingDown,
        })?;
        self.ingester.check_sequence(&tick)?;
        permit.send(QueuedTick {
            tick,
            enqueued_at: received_at,
        });
        Ok(())
    }

    // ── Processing ──────────────────────────────────────────────────

    fn process(&self, item: QueuedTick) {
        let QueuedTick { tick, enqueued_at } = item;
        self.metrics.record_latency(Stage::Ingest, enqueued_at.elapsed());

        let started = Instant::now();
        let outcome = self.aggregator.process(&tick);
        self.metrics.record_latency(Stage::Aggregate, started.elapsed());

        let started = Instant::now();
        match self.storage.append(&tick) {
            Ok(_) => {}
            Err(StorageError::PartitionSealed { .. }) => {}
            Err(e) => {
                warn!(symbol = %tick.symbol, timestamp = tick.timestamp, error = %e, "Tick not persisted");
            }
        }
        self.metrics.record_latency(Stage::Storage, started.elapsed());

        let started = Instant::now();
        for bar in &outcome.closed {
            self.distributor.publish(MarketEvent::BarClose(bar.into()));
        }
        self.distributor.publish(MarketEvent::TickUpdate((&tick).into()));
        self.metrics.record_latency(Stage::Distribute, started.elapsed());

        self.monitor.record_tick(&tick.symbol, now_millis());
        self.metrics.ticks_processed.fetch_add(1, Ordering::Relaxed);
    }

    // ── Background Loops ────────────────────────────────────────────

    async fn flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.storage.flush_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let storage = Arc::clone(&self.storage);
                    match tokio::task::spawn_blocking(move || storage.flush_all(false)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "Periodic flush failed"),
                        Err(e) => error!(error = %e, "Flush task failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Rotate every symbol at each day boundary.
    async fn rotation_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let offset = self.config.storage.day_boundary_offset_ms;
        loop {
            let now = now_millis();
            let Some(next_day) = day_of(now, offset).succ_opt() else {
                break;
            };
            let wait_ms = (day_start_millis(next_day, offset) - now).max(0) as u64;
            debug!(next_day = %next_day, wait_ms, "Next scheduled rotation");

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {
                    let storage = Arc::clone(&self.storage);
                    match tokio::task::spawn_blocking(move || storage.rotate_all(next_day)).await {
                        Ok(results) => {
                            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                            info!(day = %next_day, symbols = results.len(), failed, "Scheduled rotation finished");
                        }
                        Err(e) => error!(error = %e, "Rotation task failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    // ── Operations ──────────────────────────────────────────────────

    pub fn health(&self) -> HealthReport {
        self.monitor.health(now_millis())
    }

    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run a compression sweep now.
    pub async fn sweep_now(&self) -> Result<SweepReport, PipelineError> {
        Ok(self.compressor.sweep().await?)
    }

    /// Operator rotation; `None` means the current partition day.
    pub async fn force_rotate(&self, symbol: Symbol, day: Option<NaiveDate>) -> Result<RotationOutcome, PipelineError> {
        let day = day.unwrap_or_else(|| self.storage.partition_day(now_millis()));
        let storage = Arc::clone(&self.storage);
        Ok(tokio::task::spawn_blocking(move || storage.force_rotate(&symbol, day)).await??)
    }

    pub async fn list_partitions(&self, symbol: Symbol) -> Result<Vec<PartitionMeta>, PipelineError> {
        let storage = Arc::clone(&self.storage);
        Ok(tokio::task::spawn_blocking(move || storage.list_partitions(&symbol)).await??)
    }

    pub fn switch_timeframe(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<usize, PipelineError> {
        Ok(self.aggregator.switch_timeframe(symbol, timeframe)?)
    }

    /// Recent closed bars, oldest first, and the forming bar.
    pub fn bars(&self, symbol: &Symbol, timeframe: Timeframe, limit: usize) -> (Vec<Bar>, Option<Bar>) {
        (
            self.aggregator.recent_bars(symbol, timeframe, limit),
            self.aggregator.forming_bar(symbol, timeframe),
        )
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.distributor.subscribe(filter)
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn compressor(&self) -> &Arc<Compressor> {
        &self.compressor
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }
}
