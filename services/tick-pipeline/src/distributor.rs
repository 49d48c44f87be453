//! Event fan-out to subscribers
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: when a
//! subscriber's queue is full the configured [`DropPolicy`] decides whether
//! the event is dropped for that subscriber or the subscriber is cut off.
//! Either way the drop is counted and other subscribers are unaffected.
//!
//! Per symbol, published events carry non-decreasing timestamps. A tick
//! update older than the last event published for its symbol (a late tick
//! accepted within tolerance) is suppressed from fan-out.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use market_types::ids::{SubscriberId, Symbol};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::candles::Timeframe;
use crate::events::MarketEvent;
use crate::metrics::PipelineMetrics;

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Drop the event for this subscriber only.
    #[default]
    DropNewest,
    /// Remove the lagging subscriber.
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Queue capacity per subscriber.
    pub subscriber_queue_capacity: usize,
    pub drop_policy: DropPolicy,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 1_024,
            drop_policy: DropPolicy::DropNewest,
        }
    }
}

#[derive(Error, Debug)]
#[error("topic sink failed: {0}")]
pub struct SinkError(pub String);

/// External message bus receiving every published event as JSON.
pub trait TopicSink: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SinkError>;
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// `None` means every symbol.
    #[serde(default)]
    pub symbols: Option<BTreeSet<Symbol>>,
    /// Bar timeframes of interest; `None` means all.
    #[serde(default)]
    pub timeframes: Option<BTreeSet<Timeframe>>,
    #[serde(default)]
    pub exclude_ticks: bool,
    #[serde(default)]
    pub exclude_bars: bool,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_symbols(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            symbols: Some(symbols.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_timeframes(mut self, timeframes: impl IntoIterator<Item = Timeframe>) -> Self {
        self.timeframes = Some(timeframes.into_iter().collect());
        self
    }

    pub fn bars_only(mut self) -> Self {
        self.exclude_ticks = true;
        self
    }

    pub fn ticks_only(mut self) -> Self {
        self.exclude_bars = true;
        self
    }

    pub fn matches(&self, event: &MarketEvent) -> bool {
        if let Some(symbols) = &self.symbols {
            if !symbols.contains(event.symbol()) {
                return false;
            }
        }
        match event.timeframe() {
            None => !self.exclude_ticks,
            Some(tf) => {
                !self.exclude_bars
                    && self
                        .timeframes
                        .as_ref()
                        .is_none_or(|timeframes| timeframes.contains(&tf))
            }
        }
    }
}

/// Receiving end handed to a subscriber.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<MarketEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event; `None` once disconnected and drained.
    pub async fn recv(&mut self) -> Option<MarketEvent> {
        self.receiver.recv().await
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<MarketEvent> {
        self.receiver.try_recv().ok()
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<MarketEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    sender: mpsc::Sender<MarketEvent>,
    dropped: AtomicU64,
}

/// Per-publish delivery accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub disconnected: usize,
    pub suppressed: bool,
}

pub struct Distributor {
    config: DistributorConfig,
    subscribers: DashMap<SubscriberId, Subscriber>,
    last_published: DashMap<Symbol, i64>,
    sink: Option<Arc<dyn TopicSink>>,
    metrics: Arc<PipelineMetrics>,
}

impl Distributor {
    pub fn new(config: DistributorConfig, metrics: Arc<PipelineMetrics>) -> Self {
        info!(
            queue_capacity = config.subscriber_queue_capacity,
            drop_policy = ?config.drop_policy,
            "Distributor initialized"
        );
        Self {
            config,
            subscribers: DashMap::new(),
            last_published: DashMap::new(),
            sink: None,
            metrics,
        }
    }

    /// Forward every published event to `sink` as well.
    pub fn with_sink(mut self, sink: Arc<dyn TopicSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let id = SubscriberId::new();
        let (sender, receiver) = mpsc::channel(self.config.subscriber_queue_capacity.max(1));
        self.subscribers.insert(
            id,
            Subscriber {
                filter,
                sender,
                dropped: AtomicU64::new(0),
            },
        );
        self.metrics.active_subscribers.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = %id, "Subscriber registered");
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            self.metrics.active_subscribers.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Events dropped so far for one subscriber.
    pub fn dropped_for(&self, id: SubscriberId) -> Option<u64> {
        self.subscribers
            .get(&id)
            .map(|sub| sub.dropped.load(Ordering::Relaxed))
    }

    /// Fan `event` out to every matching subscriber and the sink.
    pub fn publish(&self, event: MarketEvent) -> PublishReport {
        let mut report = PublishReport::default();

        if !self.advance_clock(&event) {
            self.metrics.out_of_order_suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(
                symbol = %event.symbol(),
                timestamp = event.timestamp(),
                "Out-of-order event suppressed"
            );
            report.suppressed = true;
            return report;
        }
        self.metrics.events_published.fetch_add(1, Ordering::Relaxed);

        let mut to_remove = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.filter.matches(&event) {
                continue;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                    self.metrics.subscriber_drops.fetch_add(1, Ordering::Relaxed);
                    report.dropped += 1;
                    if self.config.drop_policy == DropPolicy::Disconnect {
                        to_remove.push(*entry.key());
                    }
                }
                Err(TrySendError::Closed(_)) => to_remove.push(*entry.key()),
            }
        }

        for id in to_remove {
            if self.unsubscribe(id) {
                self.metrics.subscribers_disconnected.fetch_add(1, Ordering::Relaxed);
                report.disconnected += 1;
                warn!(subscriber = %id, "Subscriber disconnected");
            }
        }
        self.metrics
            .events_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);

        if let Some(sink) = &self.sink {
            self.forward_to_sink(sink.as_ref(), &event);
        }
        report
    }

    /// Record `event` as the newest for its symbol; false if it is older.
    fn advance_clock(&self, event: &MarketEvent) -> bool {
        let timestamp = event.timestamp();
        let mut last = self
            .last_published
            .entry(event.symbol().clone())
            .or_insert(i64::MIN);
        if timestamp < *last {
            return false;
        }
        *last = timestamp;
        true
    }

    fn forward_to_sink(&self, sink: &dyn TopicSink, event: &MarketEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.sink_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Event serialization failed");
                return;
            }
        };
        if let Err(e) = sink.publish(&event.topic(), &payload) {
            self.metrics.sink_failures.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %event.topic(), error = %e, "Topic sink publish failed");
        }
    }
}
