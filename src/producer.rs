//! The producer: single-shot model publication and scenario generation.
//!
//! Publishes the model with replacement semantics (purge, then publish),
//! generates `N` scenarios in strictly ascending id order from one seeded
//! RNG, and emits periodic telemetry. If the producer crashes mid-run, a
//! re-launch re-emits the full `[0, N)` range; deduplication is out of
//! scope.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{Broker, Queue};
use crate::config::ProducerConfig;
use crate::distribution::draw;
use crate::error::{BrokerError, MontebusResult, SystemError};
use crate::message::{Headers, ProducerState, ProducerStats, Scenario, now_unix_sec};
use crate::model::{Model, PublishedModel};

#[derive(Debug)]
pub struct ProducerReport {
    pub model_id: String,
    pub published: u64,
    pub elapsed: Duration,
}

/// Runs a complete production pass: model replacement, scenario generation,
/// telemetry. Returns once every scenario is on the broker.
#[tracing::instrument(skip_all, fields(model = %model.name()))]
pub async fn run<B: Broker>(
    broker: Arc<B>,
    model: Model,
    cfg: &ProducerConfig,
) -> MontebusResult<ProducerReport> {
    broker.declare_topology().await?;

    // Replacement semantics: purge, then publish. The pair is not atomic
    // across consumers; a consumer that read the previous model keeps it.
    let purged = broker.purge(Queue::Model).await?;
    if purged > 0 {
        info!(purged, "replaced previous model on the queue");
    }
    let published_model = PublishedModel::stamp(model, now_unix_sec());
    let model_id = published_model.model_id.clone();
    let total = published_model.simulation.num_scenarios;
    let payload = serde_json::to_vec(&published_model).map_err(SystemError::Json)?;
    broker
        .publish(Queue::Model, &payload, true, &Headers::new())
        .await?;
    info!(%model_id, total, "model published");

    let mut rng = match published_model.simulation.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let started = Instant::now();
    let generated = Arc::new(AtomicU64::new(0));
    let stats_cancel = CancellationToken::new();
    let stats_task = tokio::spawn(stats_loop(
        broker.clone(),
        generated.clone(),
        total,
        started,
        cfg.stats_interval,
        stats_cancel.clone(),
    ));

    let progress = if cfg.progress_bar {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, ETA {eta})",
            )
            .map_err(crate::error::ConfigError::ProgressBar)?,
        );
        bar
    } else {
        ProgressBar::hidden()
    };

    for scenario_id in 0..total {
        let mut values = std::collections::HashMap::with_capacity(
            published_model.variables.len(),
        );
        for variable in &published_model.variables {
            let value = draw(variable.distribution, &variable.params, &mut rng)?;
            values.insert(variable.name.clone(), value);
        }
        let scenario = Scenario {
            scenario_id,
            published_at_unix_sec: now_unix_sec(),
            values,
        };
        let payload = serde_json::to_vec(&scenario).map_err(SystemError::Json)?;
        if let Err(e) = broker
            .publish(Queue::Scenarios, &payload, true, &Headers::new())
            .await
        {
            warn!(scenario_id, error = %e, "scenario publish failed");
            stats_cancel.cancel();
            let _ = stats_task.await;
            return Err(BrokerError::Publish {
                queue: Queue::Scenarios.to_string(),
                msg: format!("scenario {scenario_id}: {e}"),
            }
            .into());
        }
        generated.fetch_add(1, Ordering::Relaxed);
        progress.inc(1);
    }
    progress.finish_and_clear();

    stats_cancel.cancel();
    stats_task
        .await
        .map_err(|e| SystemError::TaskJoin(e.to_string()))?;

    // Final snapshot: completed, progress pinned to 1.0.
    let elapsed = started.elapsed();
    let stats = compose_stats(total, total, elapsed, ProducerState::Completed);
    publish_stats(broker.as_ref(), &stats).await;

    info!(
        %model_id,
        published = total,
        elapsed = %humantime::format_duration(Duration::from_secs(elapsed.as_secs())),
        "scenario generation completed"
    );
    Ok(ProducerReport {
        model_id,
        published: total,
        elapsed,
    })
}

async fn stats_loop<B: Broker>(
    broker: Arc<B>,
    generated: Arc<AtomicU64>,
    total: u64,
    started: Instant,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = compose_stats(
                    generated.load(Ordering::Relaxed),
                    total,
                    started.elapsed(),
                    ProducerState::Active,
                );
                publish_stats(broker.as_ref(), &stats).await;
            }
        }
    }
}

fn compose_stats(
    generated: u64,
    total: u64,
    elapsed: Duration,
    state: ProducerState,
) -> ProducerStats {
    let elapsed_sec = elapsed.as_secs_f64();
    let rate = if elapsed_sec > 0.0 {
        generated as f64 / elapsed_sec
    } else {
        0.0
    };
    let remaining = total.saturating_sub(generated);
    let eta = if rate > 0.0 {
        remaining as f64 / rate
    } else {
        0.0
    };
    ProducerStats {
        generated,
        total,
        progress: if total > 0 {
            generated as f64 / total as f64
        } else {
            1.0
        },
        rate,
        elapsed: elapsed_sec,
        eta,
        state,
        at_unix_sec: now_unix_sec(),
    }
}

/// Telemetry is best effort; a failed stats publish never fails the run.
async fn publish_stats<B: Broker + ?Sized>(broker: &B, stats: &ProducerStats) {
    let Ok(payload) = serde_json::to_vec(stats) else {
        return;
    };
    if let Err(e) = broker
        .publish(Queue::ProducerStats, &payload, false, &Headers::new())
        .await
    {
        warn!(error = %e, "producer stats publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::model::parser::parse_model;

    const MODEL: &str = "\
[METADATA]
name = sum_normal

[VARIABLES]
x, float, normal, media=0, std=1
y, float, normal, media=0, std=1

[FUNCION]
tipo = expression
expression = x + y

[SIMULACION]
numero_escenarios = 50
semilla_aleatoria = 42
";

    fn quiet_cfg() -> ProducerConfig {
        ProducerConfig {
            stats_interval: Duration::from_millis(50),
            progress_bar: false,
        }
    }

    #[tokio::test]
    async fn publishes_model_and_all_scenarios_in_order() {
        let broker = Arc::new(MemoryBroker::new());
        let model = parse_model(MODEL).unwrap();

        let report = run(broker.clone(), model, &quiet_cfg()).await.unwrap();
        assert_eq!(report.published, 50);
        assert!(report.model_id.starts_with("sum_normal_"));

        assert_eq!(broker.queue_size(Queue::Model).await.unwrap(), 1);
        assert_eq!(broker.queue_size(Queue::Scenarios).await.unwrap(), 50);

        for expected_id in 0..50 {
            let delivery = broker.get(Queue::Scenarios).await.unwrap().unwrap();
            let scenario: Scenario = serde_json::from_slice(&delivery.payload).unwrap();
            assert_eq!(scenario.scenario_id, expected_id);
            assert_eq!(scenario.values.len(), 2);
            assert!(scenario.values.contains_key("x"));
            delivery.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn republishing_replaces_the_resident_model() {
        let broker = Arc::new(MemoryBroker::new());
        let model = parse_model(MODEL).unwrap();

        run(broker.clone(), model.clone(), &quiet_cfg()).await.unwrap();
        run(broker.clone(), model, &quiet_cfg()).await.unwrap();

        assert_eq!(broker.queue_size(Queue::Model).await.unwrap(), 1);
        let delivery = broker.get(Queue::Model).await.unwrap().unwrap();
        let published: PublishedModel = serde_json::from_slice(&delivery.payload).unwrap();
        assert!(published.model_id.starts_with("sum_normal_"));
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn seeded_runs_generate_identical_scenarios() {
        let model = parse_model(MODEL).unwrap();
        let mut batches = Vec::new();
        for _ in 0..2 {
            let broker = Arc::new(MemoryBroker::new());
            run(broker.clone(), model.clone(), &quiet_cfg()).await.unwrap();
            let mut values = Vec::new();
            while let Some(delivery) = broker.get(Queue::Scenarios).await.unwrap() {
                let scenario: Scenario = serde_json::from_slice(&delivery.payload).unwrap();
                values.push((scenario.scenario_id, scenario.values["x"]));
                delivery.ack().await.unwrap();
            }
            batches.push(values);
        }
        assert_eq!(batches[0], batches[1]);
    }

    #[tokio::test]
    async fn emits_a_final_completed_stats_message() {
        let broker = Arc::new(MemoryBroker::new());
        let model = parse_model(MODEL).unwrap();
        run(broker.clone(), model, &quiet_cfg()).await.unwrap();

        let mut last = None;
        while let Some(delivery) = broker.get(Queue::ProducerStats).await.unwrap() {
            let stats: ProducerStats = serde_json::from_slice(&delivery.payload).unwrap();
            delivery.ack().await.unwrap();
            last = Some(stats);
        }
        let last = last.expect("at least the final stats message");
        assert_eq!(last.state, ProducerState::Completed);
        assert_eq!(last.progress, 1.0);
        assert_eq!(last.generated, 50);
    }
}
