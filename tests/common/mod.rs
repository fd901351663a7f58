#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use montebus::aggregator::Aggregator;
use montebus::broker::memory::MemoryBroker;
use montebus::broker::{Broker, Queue};
use montebus::config::{AggregatorConfig, ConsumerConfig, ProducerConfig};
use montebus::consumer::ConsumerWorker;
use montebus::message::{ConsumerStats, Headers, ResultMsg, Scenario};
use montebus::{parse_model, producer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn producer_cfg() -> ProducerConfig {
    ProducerConfig {
        stats_interval: Duration::from_millis(100),
        progress_bar: false,
    }
}

pub fn consumer_cfg(id: &str) -> ConsumerConfig {
    ConsumerConfig {
        consumer_id: id.to_string(),
        prefetch: 1,
        max_retries: 3,
        stats_interval: Duration::from_millis(100),
        eval_timeout: Duration::from_secs(5),
        model_grace_attempts: 20,
        model_grace_delay: Duration::from_millis(25),
    }
}

pub fn aggregator_cfg() -> AggregatorConfig {
    AggregatorConfig {
        queue_poll_interval: Duration::from_millis(100),
        convergence_stride: 100,
        ..Default::default()
    }
}

/// Publishes the model and all scenarios onto the broker.
pub async fn produce(broker: &Arc<MemoryBroker>, model_text: &str) -> String {
    let model = parse_model(model_text).expect("model parses");
    let report = producer::run(broker.clone(), model, &producer_cfg())
        .await
        .expect("producer run");
    report.model_id
}

/// Spawns workers, waits for the scenarios queue to drain, cancels them and
/// collects their final stats.
pub async fn drive_workers(
    broker: Arc<MemoryBroker>,
    workers: Vec<ConsumerWorker<MemoryBroker>>,
) -> Vec<ConsumerStats> {
    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    for worker in workers {
        handles.push(tokio::spawn(worker.run(cancel.clone())));
    }
    wait_for_drain(&broker, Duration::from_secs(120)).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();

    let mut stats = Vec::new();
    for handle in handles {
        stats.push(handle.await.expect("join").expect("worker run"));
    }
    stats
}

pub async fn wait_for_drain(broker: &Arc<MemoryBroker>, budget: Duration) {
    let started = std::time::Instant::now();
    while started.elapsed() < budget {
        if broker
            .queue_size(Queue::Scenarios)
            .await
            .expect("queue size")
            == 0
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("scenarios queue did not drain within {budget:?}");
}

pub async fn drain_results(broker: &Arc<MemoryBroker>) -> Vec<ResultMsg> {
    let mut results = Vec::new();
    while let Some(delivery) = broker.get(Queue::Results).await.expect("get result") {
        results.push(serde_json::from_slice(&delivery.payload).expect("result payload"));
        delivery.ack().await.expect("ack");
    }
    results
}

pub async fn drain_dlq(broker: &Arc<MemoryBroker>) -> Vec<(Scenario, Headers)> {
    let mut envelopes = Vec::new();
    while let Some(delivery) = broker
        .get(Queue::ScenariosDlq)
        .await
        .expect("get dlq envelope")
    {
        let scenario = serde_json::from_slice(&delivery.payload).expect("scenario payload");
        envelopes.push((scenario, delivery.headers.clone()));
        delivery.ack().await.expect("ack");
    }
    envelopes
}

/// Runs an aggregator over the current queues until it has consumed
/// `expect_results` result messages, then stops it.
pub async fn aggregate(broker: &Arc<MemoryBroker>, expect_results: u64) -> Arc<Aggregator> {
    let aggregator = Arc::new(Aggregator::new(aggregator_cfg()));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(aggregator.clone().run(broker.clone(), cancel.clone()));

    let started = std::time::Instant::now();
    while started.elapsed() < Duration::from_secs(30) {
        if aggregator.snapshot().received_total >= expect_results {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    task.await.expect("join").expect("aggregator run");
    aggregator
}
