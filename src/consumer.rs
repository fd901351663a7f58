//! The consumer worker: load the model once, evaluate scenarios one at a
//! time, publish results, and route failures per the retry policy.
//!
//! Lifecycle: `Start → LoadModel → (Ready ⇄ Evaluating) → Draining →
//! Stopped`. Fair dispatch is enforced with a prefetch window of one, so a
//! slow worker never hoards deliveries. Telemetry runs on its own timer and
//! reads lock-free counters; it never blocks scenario handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Delivery, Queue};
use crate::config::ConsumerConfig;
use crate::error::{BrokerError, EvalError, MontebusResult, SystemError};
use crate::eval::CompiledFunction;
use crate::message::{ConsumerState, ConsumerStats, Headers, ResultMsg, Scenario, now_unix_sec};
use crate::model::PublishedModel;

/// Test instrumentation: decides whether a delivery should fail with an
/// injected transient error, given `(scenario_id, retry_count)`.
pub type FaultInjector = Arc<dyn Fn(u64, u32) -> bool + Send + Sync>;

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    errors_total: AtomicU64,
    retries_total: AtomicU64,
    dlq_total: AtomicU64,
    last_exec_us: AtomicU64,
    total_exec_us: AtomicU64,
    errors_by_kind: Mutex<HashMap<String, u64>>,
}

impl Counters {
    fn record_success(&self, exec: std::time::Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let us = exec.as_micros() as u64;
        self.last_exec_us.store(us, Ordering::Relaxed);
        self.total_exec_us.fetch_add(us, Ordering::Relaxed);
    }

    fn record_error(&self, kind: &str) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        let mut by_kind = self.errors_by_kind.lock().expect("counter mutex");
        *by_kind.entry(kind.to_string()).or_insert(0) += 1;
    }

    fn snapshot(&self, consumer_id: &str, started: Instant, state: ConsumerState) -> ConsumerStats {
        let processed = self.processed.load(Ordering::Relaxed);
        let total_us = self.total_exec_us.load(Ordering::Relaxed);
        let elapsed = started.elapsed().as_secs_f64();
        ConsumerStats {
            consumer_id: consumer_id.to_string(),
            processed,
            last_exec_sec: self.last_exec_us.load(Ordering::Relaxed) as f64 / 1e6,
            avg_exec_sec: if processed > 0 {
                total_us as f64 / 1e6 / processed as f64
            } else {
                0.0
            },
            rate: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
            state,
            errors_total: self.errors_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            dlq_total: self.dlq_total.load(Ordering::Relaxed),
            errors_by_kind: self.errors_by_kind.lock().expect("counter mutex").clone(),
            at_unix_sec: now_unix_sec(),
        }
    }
}

pub struct ConsumerWorker<B: Broker> {
    broker: Arc<B>,
    cfg: ConsumerConfig,
    counters: Arc<Counters>,
    fault_injector: Option<FaultInjector>,
}

impl<B: Broker> ConsumerWorker<B> {
    pub fn new(broker: Arc<B>, cfg: ConsumerConfig) -> Self {
        Self {
            broker,
            cfg,
            counters: Arc::new(Counters::default()),
            fault_injector: None,
        }
    }

    /// Injects transient failures for retry-path testing.
    pub fn with_fault_injector(mut self, injector: FaultInjector) -> Self {
        self.fault_injector = Some(injector);
        self
    }

    /// Runs until cancelled. The final telemetry snapshot is returned so the
    /// process wrapper can log it.
    #[tracing::instrument(skip_all, fields(consumer_id = %self.cfg.consumer_id))]
    pub async fn run(self, cancel: CancellationToken) -> MontebusResult<ConsumerStats> {
        self.broker.declare_topology().await?;
        let compiled = self.load_model().await?;
        let started = Instant::now();

        let stats_cancel = CancellationToken::new();
        let stats_task = tokio::spawn(stats_loop(
            self.broker.clone(),
            self.counters.clone(),
            self.cfg.clone(),
            started,
            stats_cancel.clone(),
        ));

        let subscription = self
            .broker
            .subscribe(Queue::Scenarios, self.cfg.prefetch, &self.cfg.consumer_id)
            .await?;
        info!(prefetch = self.cfg.prefetch, "worker ready");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = subscription.recv() => match delivery {
                    Some(delivery) => self.handle(&compiled, delivery).await?,
                    None => break,
                },
            }
        }

        // Draining: stop the flow of deliveries, then shut the timer down.
        subscription.cancel();
        stats_cancel.cancel();
        stats_task
            .await
            .map_err(|e| SystemError::TaskJoin(e.to_string()))?;

        let final_stats =
            self.counters
                .snapshot(&self.cfg.consumer_id, started, ConsumerState::Stopped);
        publish_stats(self.broker.as_ref(), &final_stats).await;
        info!(
            processed = final_stats.processed,
            errors = final_stats.errors_total,
            retries = final_stats.retries_total,
            dlq = final_stats.dlq_total,
            "worker stopped"
        );
        Ok(final_stats)
    }

    /// Reads the model once, compiles the evaluator, and re-publishes the
    /// same payload so sibling workers can load it too. Bounded retries
    /// cover the purge-then-publish window of a model replacement.
    async fn load_model(&self) -> MontebusResult<CompiledFunction> {
        for attempt in 1..=self.cfg.model_grace_attempts {
            match self.broker.get(Queue::Model).await? {
                Some(delivery) => {
                    let published: PublishedModel = serde_json::from_slice(&delivery.payload)
                        .map_err(|e| {
                            BrokerError::ModelUnavailable(format!(
                                "undecodable model payload: {e}"
                            ))
                        })?;
                    let compiled = match CompiledFunction::compile(&published.function) {
                        Ok(compiled) => compiled,
                        Err(e) => {
                            // Leave the model in place for operators to inspect.
                            delivery.nack(true).await?;
                            return Err(BrokerError::ModelUnavailable(format!(
                                "model '{}' failed to compile: {e}",
                                published.model_id
                            ))
                            .into());
                        }
                    };
                    self.broker
                        .publish(Queue::Model, &delivery.payload, true, &Headers::new())
                        .await?;
                    delivery.ack().await?;
                    info!(model_id = %published.model_id, "model loaded and re-published");
                    return Ok(compiled);
                }
                None => {
                    debug!(attempt, "model queue empty, retrying");
                    tokio::time::sleep(self.cfg.model_grace_delay).await;
                }
            }
        }
        Err(BrokerError::ModelUnavailable(Queue::Model.to_string()).into())
    }

    async fn handle(
        &self,
        compiled: &CompiledFunction,
        delivery: Delivery,
    ) -> MontebusResult<()> {
        let scenario: Scenario = match serde_json::from_slice(&delivery.payload) {
            Ok(scenario) => scenario,
            Err(e) => {
                // Undecodable payloads can never succeed; dead-letter them.
                warn!(error = %e, "undecodable scenario payload");
                self.counters.record_error("payload");
                self.dead_letter(&delivery, &format!("payload: {e}")).await?;
                return Ok(());
            }
        };

        let injected = self
            .fault_injector
            .as_ref()
            .is_some_and(|f| f(scenario.scenario_id, delivery.headers.retry_count));
        let started = Instant::now();
        let outcome = if injected {
            Err(EvalError::Evaluation("injected transient failure".into()))
        } else {
            compiled
                .evaluate(&scenario.values, self.cfg.eval_timeout)
                .await
        };
        let exec = started.elapsed();

        match outcome {
            Ok(value) => {
                let result = ResultMsg {
                    scenario_id: scenario.scenario_id,
                    consumer_id: self.cfg.consumer_id.clone(),
                    value,
                    exec_duration_sec: exec.as_secs_f64(),
                };
                let payload = serde_json::to_vec(&result).map_err(SystemError::Json)?;
                match self
                    .broker
                    .publish(Queue::Results, &payload, true, &Headers::new())
                    .await
                {
                    Ok(()) => {
                        delivery.ack().await?;
                        self.counters.record_success(exec);
                    }
                    Err(e) => {
                        // Broker-layer trouble: hand the scenario back for
                        // redelivery and let the connection layer recover.
                        warn!(scenario_id = scenario.scenario_id, error = %e, "result publish failed, requeueing scenario");
                        self.counters.record_error("broker_publish");
                        delivery.nack(true).await?;
                    }
                }
            }
            Err(e) => {
                self.counters.record_error(e.kind_label());
                let description = format!("{}: {e}", e.kind_label());
                if e.is_recoverable() && delivery.headers.retry_count < self.cfg.max_retries {
                    self.retry(&delivery, &description, scenario.scenario_id)
                        .await?;
                } else {
                    debug!(
                        scenario_id = scenario.scenario_id,
                        error = %e,
                        retries = delivery.headers.retry_count,
                        "dead-lettering scenario"
                    );
                    self.dead_letter(&delivery, &description).await?;
                }
            }
        }
        Ok(())
    }

    /// Republishes the scenario with a bumped retry header. Payload bytes
    /// are preserved verbatim; only the envelope changes.
    async fn retry(
        &self,
        delivery: &Delivery,
        description: &str,
        scenario_id: u64,
    ) -> MontebusResult<()> {
        let headers = delivery
            .headers
            .retried(description.to_string(), self.cfg.consumer_id.clone());
        debug!(
            scenario_id,
            retry = headers.retry_count,
            "requeueing scenario after transient failure"
        );
        self.broker
            .publish(Queue::Scenarios, &delivery.payload, true, &headers)
            .await?;
        delivery.ack().await?;
        self.counters.retries_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, description: &str) -> MontebusResult<()> {
        let headers = delivery
            .headers
            .dead_lettered(description.to_string(), self.cfg.consumer_id.clone());
        self.broker
            .publish(Queue::ScenariosDlq, &delivery.payload, true, &headers)
            .await?;
        delivery.ack().await?;
        self.counters.dlq_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

async fn stats_loop<B: Broker>(
    broker: Arc<B>,
    counters: Arc<Counters>,
    cfg: ConsumerConfig,
    started: Instant,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cfg.stats_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = counters.snapshot(&cfg.consumer_id, started, ConsumerState::Active);
                publish_stats(broker.as_ref(), &stats).await;
            }
        }
    }
}

/// Telemetry is best effort and never interferes with scenario handling.
async fn publish_stats<B: Broker + ?Sized>(broker: &B, stats: &ConsumerStats) {
    let Ok(payload) = serde_json::to_vec(stats) else {
        return;
    };
    if let Err(e) = broker
        .publish(Queue::ConsumerStats, &payload, false, &Headers::new())
        .await
    {
        warn!(error = %e, "consumer stats publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::config::ProducerConfig;
    use crate::model::parser::parse_model;
    use crate::producer;
    use std::time::Duration;

    fn worker_cfg(id: &str) -> ConsumerConfig {
        ConsumerConfig {
            consumer_id: id.to_string(),
            prefetch: 1,
            max_retries: 3,
            stats_interval: Duration::from_millis(50),
            eval_timeout: Duration::from_secs(2),
            model_grace_attempts: 5,
            model_grace_delay: Duration::from_millis(20),
        }
    }

    async fn produce(broker: &Arc<MemoryBroker>, model_text: &str) {
        let model = parse_model(model_text).unwrap();
        let cfg = ProducerConfig {
            stats_interval: Duration::from_secs(60),
            progress_bar: false,
        };
        producer::run(broker.clone(), model, &cfg).await.unwrap();
    }

    /// Runs a worker until the scenarios queue drains, then cancels it.
    async fn run_worker(
        broker: Arc<MemoryBroker>,
        worker: ConsumerWorker<MemoryBroker>,
    ) -> ConsumerStats {
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let broker_for_wait = broker.clone();
        let handle = tokio::spawn(worker.run(cancel));
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if broker_for_wait.queue_size(Queue::Scenarios).await.unwrap() == 0 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
        handle.await.unwrap().unwrap()
    }

    const SUM_MODEL: &str = "\
[METADATA]
name = sum_normal

[VARIABLES]
x, float, normal, media=0, std=1
y, float, normal, media=0, std=1

[FUNCION]
tipo = expression
expression = x + y

[SIMULACION]
numero_escenarios = 25
semilla_aleatoria = 42
";

    #[tokio::test]
    async fn evaluates_all_scenarios_and_publishes_results() {
        let broker = Arc::new(MemoryBroker::new());
        produce(&broker, SUM_MODEL).await;

        let worker = ConsumerWorker::new(broker.clone(), worker_cfg("w1"));
        let stats = run_worker(broker.clone(), worker).await;

        assert_eq!(stats.processed, 25);
        assert_eq!(stats.state, ConsumerState::Stopped);
        assert_eq!(broker.queue_size(Queue::Results).await.unwrap(), 25);
        assert_eq!(broker.queue_size(Queue::ScenariosDlq).await.unwrap(), 0);

        let mut seen = std::collections::HashSet::new();
        while let Some(delivery) = broker.get(Queue::Results).await.unwrap() {
            let result: ResultMsg = serde_json::from_slice(&delivery.payload).unwrap();
            assert_eq!(result.consumer_id, "w1");
            assert!(seen.insert(result.scenario_id));
            delivery.ack().await.unwrap();
        }
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn model_remains_available_for_siblings() {
        let broker = Arc::new(MemoryBroker::new());
        produce(&broker, SUM_MODEL).await;

        let worker = ConsumerWorker::new(broker.clone(), worker_cfg("w1"));
        run_worker(broker.clone(), worker).await;

        // The worker re-published the model after loading it.
        assert_eq!(broker.queue_size(Queue::Model).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_model_fails_with_exit_code_three() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = ConsumerWorker::new(broker, worker_cfg("w1"));
        let err = worker.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let broker = Arc::new(MemoryBroker::new());
        produce(&broker, SUM_MODEL).await;

        // Scenario 17 fails on its first delivery only.
        let injector: FaultInjector =
            Arc::new(|scenario_id, retry_count| scenario_id == 17 && retry_count == 0);
        let worker =
            ConsumerWorker::new(broker.clone(), worker_cfg("w1")).with_fault_injector(injector);
        let stats = run_worker(broker.clone(), worker).await;

        assert_eq!(stats.processed, 25);
        assert_eq!(stats.retries_total, 1);
        assert_eq!(stats.errors_total, 1);
        assert_eq!(stats.errors_by_kind.get("evaluation"), Some(&1));
        assert_eq!(broker.queue_size(Queue::ScenariosDlq).await.unwrap(), 0);

        let mut for_17 = 0;
        while let Some(delivery) = broker.get(Queue::Results).await.unwrap() {
            let result: ResultMsg = serde_json::from_slice(&delivery.payload).unwrap();
            if result.scenario_id == 17 {
                for_17 += 1;
            }
            delivery.ack().await.unwrap();
        }
        assert_eq!(for_17, 1);
    }

    #[tokio::test]
    async fn persistent_transient_failure_exhausts_retries_into_dlq() {
        let broker = Arc::new(MemoryBroker::new());
        produce(&broker, SUM_MODEL).await;

        let injector: FaultInjector = Arc::new(|scenario_id, _| scenario_id == 3);
        let worker =
            ConsumerWorker::new(broker.clone(), worker_cfg("w1")).with_fault_injector(injector);
        let stats = run_worker(broker.clone(), worker).await;

        assert_eq!(stats.processed, 24);
        assert_eq!(stats.retries_total, 3);
        assert_eq!(stats.dlq_total, 1);

        let delivery = broker.get(Queue::ScenariosDlq).await.unwrap().unwrap();
        // Retry bound: the envelope never exceeds max_retries.
        assert_eq!(delivery.headers.retry_count, 3);
        assert!(
            delivery
                .headers
                .last_error
                .as_deref()
                .unwrap()
                .contains("injected")
        );
        assert_eq!(delivery.headers.consumer_id.as_deref(), Some("w1"));
        let scenario: Scenario = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(scenario.scenario_id, 3);
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn timeout_dead_letters_without_blocking_the_worker() {
        let broker = Arc::new(MemoryBroker::new());
        let model_text = SUM_MODEL
            .replace(
                "tipo = expression\nexpression = x + y",
                "tipo = code\ncodigo =\n    resultado = 0\n    while x > -1000: resultado = resultado + 0",
            )
            .replace("numero_escenarios = 25", "numero_escenarios = 3");
        produce(&broker, &model_text).await;

        let mut cfg = worker_cfg("w1");
        cfg.eval_timeout = Duration::from_millis(100);
        let worker = ConsumerWorker::new(broker.clone(), cfg);
        let stats = run_worker(broker.clone(), worker).await;

        assert_eq!(stats.processed, 0);
        assert_eq!(stats.dlq_total, 3);
        assert_eq!(stats.errors_by_kind.get("timeout"), Some(&3));
        assert_eq!(broker.queue_size(Queue::Results).await.unwrap(), 0);
        assert_eq!(broker.queue_size(Queue::ScenariosDlq).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn fair_dispatch_spreads_work_across_workers() {
        use crate::model::PublishedModel;

        let broker = Arc::new(MemoryBroker::new());

        // Publish the model alone so every worker is subscribed before the
        // first scenario arrives.
        let model = parse_model(SUM_MODEL).unwrap();
        let published = PublishedModel::stamp(model, now_unix_sec());
        broker
            .publish(
                Queue::Model,
                &serde_json::to_vec(&published).unwrap(),
                true,
                &Headers::new(),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for id in ["w1", "w2", "w3", "w4"] {
            let worker = ConsumerWorker::new(broker.clone(), worker_cfg(id));
            handles.push(tokio::spawn(worker.run(cancel.clone())));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        for scenario_id in 0..40 {
            let scenario = Scenario {
                scenario_id,
                published_at_unix_sec: now_unix_sec(),
                values: [("x".to_string(), 1.0), ("y".to_string(), 2.0)].into(),
            };
            broker
                .publish(
                    Queue::Scenarios,
                    &serde_json::to_vec(&scenario).unwrap(),
                    true,
                    &Headers::new(),
                )
                .await
                .unwrap();
        }
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if broker.queue_size(Queue::Scenarios).await.unwrap() == 0 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let mut processed = Vec::new();
        for handle in handles {
            processed.push(handle.await.unwrap().unwrap().processed);
        }
        assert_eq!(processed.iter().sum::<u64>(), 40);
        // Fair dispatch: max-min spread stays O(K), not O(N/K).
        let max = processed.iter().max().unwrap();
        let min = processed.iter().min().unwrap();
        assert!(max - min <= 8, "unfair spread: {processed:?}");
    }
}
