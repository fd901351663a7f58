//! Live telemetry aggregation.
//!
//! A single-writer component: three broker subscriptions (producer stats,
//! consumer stats, results) and a queue-size poller feed one mutex-guarded
//! state. Readers get consistent snapshots; exports copy under the lock and
//! serialize outside it. Result history lives in bounded rings that evict
//! oldest, so memory stays flat no matter how long a simulation runs.

pub mod export;
pub mod stats;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{Broker, Queue};
use crate::config::AggregatorConfig;
use crate::error::{MontebusResult, SystemError};
use crate::message::{ConsumerStats, ProducerStats, ResultMsg, now_unix_sec};
use crate::model::PublishedModel;

use self::stats::{Descriptive, NormalityReport, Welford};

/// Fixed-capacity FIFO; appending past capacity evicts the oldest element.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.buf.back()
    }
}

impl<T: Clone> Ring<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.buf.iter().cloned().collect()
    }
}

/// One result record as retained by the aggregator: wire fields plus the
/// receipt timestamp (the wire carries none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(rename = "scenarioID")]
    pub scenario_id: u64,
    #[serde(rename = "consumerID")]
    pub consumer_id: String,
    #[serde(rename = "resultado")]
    pub value: f64,
    #[serde(rename = "tiempo_ejecucion")]
    pub exec_duration_sec: f64,
    #[serde(rename = "receivedAtUnixSec")]
    pub received_at_unix_sec: f64,
}

/// One convergence-history sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergencePoint {
    pub n: u64,
    #[serde(rename = "runningMean")]
    pub running_mean: f64,
    #[serde(rename = "runningVariance")]
    pub running_variance: f64,
    #[serde(rename = "atUnixSec")]
    pub at_unix_sec: f64,
}

struct AggregatorState {
    model_info: Option<PublishedModel>,
    producer_stats: Option<ProducerStats>,
    consumer_stats: HashMap<String, ConsumerStats>,
    results: Ring<f64>,
    results_raw: Ring<ResultRecord>,
    queue_sizes: HashMap<String, u64>,
    convergence: Ring<ConvergencePoint>,
    welford: Welford,
    received_total: u64,
    descriptive_cache: Option<Descriptive>,
    descriptive_dirty: bool,
    normality: Option<NormalityReport>,
    normality_at: u64,
}

/// A consistent copy of everything exports and UI queries read.
#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    pub model_info: Option<PublishedModel>,
    pub producer_stats: Option<ProducerStats>,
    pub consumer_stats: Vec<ConsumerStats>,
    pub results: Vec<f64>,
    pub results_raw: Vec<ResultRecord>,
    pub queue_sizes: HashMap<String, u64>,
    pub convergence: Vec<ConvergencePoint>,
    pub statistics: Option<Descriptive>,
    pub normality: Option<NormalityReport>,
    pub received_total: u64,
}

pub struct Aggregator {
    cfg: AggregatorConfig,
    state: Mutex<AggregatorState>,
}

impl Aggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        let state = AggregatorState {
            model_info: None,
            producer_stats: None,
            consumer_stats: HashMap::new(),
            results: Ring::new(cfg.results_capacity),
            results_raw: Ring::new(cfg.detailed_capacity),
            queue_sizes: HashMap::new(),
            convergence: Ring::new(cfg.convergence_capacity),
            welford: Welford::default(),
            received_total: 0,
            descriptive_cache: None,
            descriptive_dirty: false,
            normality: None,
            normality_at: 0,
        };
        Self {
            cfg,
            state: Mutex::new(state),
        }
    }

    pub fn on_result(&self, result: ResultMsg) {
        let mut state = self.state.lock().expect("aggregator mutex");
        state.received_total += 1;
        state.welford.push(result.value);
        state.results.push(result.value);
        state.results_raw.push(ResultRecord {
            scenario_id: result.scenario_id,
            consumer_id: result.consumer_id,
            value: result.value,
            exec_duration_sec: result.exec_duration_sec,
            received_at_unix_sec: now_unix_sec(),
        });
        state.descriptive_dirty = true;

        if state.received_total % self.cfg.convergence_stride as u64 == 0 {
            let point = ConvergencePoint {
                n: state.welford.count(),
                running_mean: state.welford.mean(),
                running_variance: state.welford.variance(),
                at_unix_sec: now_unix_sec(),
            };
            state.convergence.push(point);
        }
    }

    /// Latest wins; producer stats are never accumulated.
    pub fn on_producer_stats(&self, stats: ProducerStats) {
        self.state.lock().expect("aggregator mutex").producer_stats = Some(stats);
    }

    /// Latest per consumer id wins.
    pub fn on_consumer_stats(&self, stats: ConsumerStats) {
        self.state
            .lock()
            .expect("aggregator mutex")
            .consumer_stats
            .insert(stats.consumer_id.clone(), stats);
    }

    pub fn on_model(&self, model: PublishedModel) {
        self.state.lock().expect("aggregator mutex").model_info = Some(model);
    }

    pub fn set_queue_size(&self, queue: Queue, size: u64) {
        self.state
            .lock()
            .expect("aggregator mutex")
            .queue_sizes
            .insert(queue.to_string(), size);
    }

    /// Descriptive statistics over the current ring, recomputed at most once
    /// per batch of updates.
    pub fn descriptive(&self) -> Option<Descriptive> {
        let mut state = self.state.lock().expect("aggregator mutex");
        if state.descriptive_dirty {
            let window = state.results.to_vec();
            state.descriptive_cache = stats::describe(&window);
            state.descriptive_dirty = false;
        }
        state.descriptive_cache.clone()
    }

    /// Normality is lazily recomputed once the sample has grown by the
    /// configured stride since the last computation.
    pub fn normality(&self) -> Option<NormalityReport> {
        let mut state = self.state.lock().expect("aggregator mutex");
        let n = state.results.len() as u64;
        let stale = state.normality.is_none()
            || n >= state.normality_at + self.cfg.normality_stride as u64;
        if stale && n > 0 {
            let window = state.results.to_vec();
            state.normality = stats::jarque_bera(&window);
            state.normality_at = n;
        }
        state.normality.clone()
    }

    /// Copies the full state under the lock. Serialization and any other
    /// slow work belongs on the caller's side, outside the lock.
    pub fn snapshot(&self) -> AggregateSnapshot {
        let statistics = self.descriptive();
        let normality = self.normality();
        let state = self.state.lock().expect("aggregator mutex");
        let mut consumer_stats: Vec<ConsumerStats> =
            state.consumer_stats.values().cloned().collect();
        consumer_stats.sort_by(|a, b| a.consumer_id.cmp(&b.consumer_id));
        AggregateSnapshot {
            model_info: state.model_info.clone(),
            producer_stats: state.producer_stats.clone(),
            consumer_stats,
            results: state.results.to_vec(),
            results_raw: state.results_raw.to_vec(),
            queue_sizes: state.queue_sizes.clone(),
            convergence: state.convergence.to_vec(),
            statistics,
            normality,
            received_total: state.received_total,
        }
    }

    /// Runs the three subscriptions and the queue-size poller until
    /// cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run<B: Broker>(
        self: Arc<Self>,
        broker: Arc<B>,
        cancel: CancellationToken,
    ) -> MontebusResult<()> {
        broker.declare_topology().await?;

        let results = broker.subscribe(Queue::Results, 200, "aggregator-results").await?;
        let producer = broker
            .subscribe(Queue::ProducerStats, 0, "aggregator-producer-stats")
            .await?;
        let consumers = broker
            .subscribe(Queue::ConsumerStats, 0, "aggregator-consumer-stats")
            .await?;

        let mut poll = tokio::time::interval(self.cfg.queue_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = results.recv() => {
                    let Some(delivery) = delivery else { break };
                    match serde_json::from_slice::<ResultMsg>(&delivery.payload) {
                        Ok(result) => self.on_result(result),
                        Err(e) => warn!(error = %e, "undecodable result payload"),
                    }
                    delivery.ack().await?;
                }
                delivery = producer.recv() => {
                    let Some(delivery) = delivery else { break };
                    match serde_json::from_slice::<ProducerStats>(&delivery.payload) {
                        Ok(stats) => self.on_producer_stats(stats),
                        Err(e) => warn!(error = %e, "undecodable producer stats"),
                    }
                    delivery.ack().await?;
                }
                delivery = consumers.recv() => {
                    let Some(delivery) = delivery else { break };
                    match serde_json::from_slice::<ConsumerStats>(&delivery.payload) {
                        Ok(stats) => self.on_consumer_stats(stats),
                        Err(e) => warn!(error = %e, "undecodable consumer stats"),
                    }
                    delivery.ack().await?;
                }
                _ = poll.tick() => {
                    self.poll_queues(broker.as_ref()).await;
                }
            }
        }

        results.cancel();
        producer.cancel();
        consumers.cancel();
        debug!("aggregator stopped");
        Ok(())
    }

    async fn poll_queues<B: Broker>(&self, broker: &B) {
        use strum::IntoEnumIterator;
        for queue in Queue::iter() {
            match broker.queue_size(queue).await {
                Ok(size) => self.set_queue_size(queue, size),
                Err(e) => warn!(%queue, error = %e, "queue size poll failed"),
            }
        }
        // Peek the resident model without consuming it.
        if let Ok(Some(delivery)) = broker.get(Queue::Model).await {
            match serde_json::from_slice::<PublishedModel>(&delivery.payload) {
                Ok(model) => self.on_model(model),
                Err(e) => warn!(error = %e, "undecodable model payload"),
            }
            if let Err(e) = delivery.nack(true).await {
                warn!(error = %e, "failed to requeue peeked model");
            }
        }
    }
}

impl Aggregator {
    /// Convenience for building against the default configuration.
    pub fn with_defaults() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

/// Serialization helper shared by export paths.
pub(crate) fn to_json_value<T: Serialize>(value: &T) -> MontebusResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| SystemError::Json(e).into())
}
