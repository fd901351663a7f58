//! Failure-path scenarios: retries, dead-lettering, timeouts and security
//! rejections, exercised end to end over the in-memory broker.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use montebus::broker::memory::MemoryBroker;
use montebus::broker::{Broker, Queue};
use montebus::consumer::{ConsumerWorker, FaultInjector};
use montebus::message::Headers;
use montebus::model::PublishedModel;
use montebus::parse_model;
use tokio_util::sync::CancellationToken;

const BASE_MODEL: &str = "\
[METADATA]
name = retry_probe

[VARIABLES]
x, float, normal, media=0, std=1

[FUNCION]
tipo = expression
expression = x * 2

[SIMULACION]
numero_escenarios = 40
semilla_aleatoria = 11
";

/// A transient failure on the first delivery of scenario 17 is retried with
/// a bumped header and succeeds on redelivery; nothing reaches the DLQ.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_then_succeed() {
    common::init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    common::produce(&broker, BASE_MODEL).await;

    let injector: FaultInjector =
        Arc::new(|scenario_id, retry_count| scenario_id == 17 && retry_count == 0);
    let worker = ConsumerWorker::new(broker.clone(), common::consumer_cfg("w1"))
        .with_fault_injector(injector);
    let stats = common::drive_workers(broker.clone(), vec![worker]).await;

    assert_eq!(stats[0].processed, 40);
    assert_eq!(stats[0].retries_total, 1);

    let results = common::drain_results(&broker).await;
    assert_eq!(
        results.iter().filter(|r| r.scenario_id == 17).count(),
        1,
        "exactly one result for the retried scenario"
    );
    assert!(common::drain_dlq(&broker).await.is_empty());
}

/// Retry exhaustion: a scenario that keeps failing transiently is retried
/// `max_retries` times and then dead-lettered with its failure context.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_bound_is_enforced() {
    common::init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    common::produce(&broker, BASE_MODEL).await;

    let injector: FaultInjector = Arc::new(|scenario_id, _| scenario_id % 10 == 3);
    let worker = ConsumerWorker::new(broker.clone(), common::consumer_cfg("w1"))
        .with_fault_injector(injector);
    let stats = common::drive_workers(broker.clone(), vec![worker]).await;

    assert_eq!(stats[0].processed, 36);
    assert_eq!(stats[0].dlq_total, 4);
    assert_eq!(stats[0].retries_total, 12);

    let dlq = common::drain_dlq(&broker).await;
    assert_eq!(dlq.len(), 4);
    for (scenario, headers) in &dlq {
        assert_eq!(scenario.scenario_id % 10, 3);
        assert_eq!(headers.retry_count, 3);
        assert!(headers.last_error.as_deref().unwrap().contains("injected"));
        assert_eq!(headers.consumer_id.as_deref(), Some("w1"));
    }
}

/// Scenario uniqueness and coverage: results plus dead letters partition the
/// full id range without duplicates.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn results_and_dlq_partition_the_id_range() {
    common::init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    common::produce(&broker, BASE_MODEL).await;

    let injector: FaultInjector = Arc::new(|scenario_id, _| scenario_id % 7 == 0);
    let worker = ConsumerWorker::new(broker.clone(), common::consumer_cfg("w1"))
        .with_fault_injector(injector);
    common::drive_workers(broker.clone(), vec![worker]).await;

    let mut ids = HashSet::new();
    for result in common::drain_results(&broker).await {
        assert!(ids.insert(result.scenario_id), "duplicate result id");
    }
    for (scenario, _) in common::drain_dlq(&broker).await {
        assert!(ids.insert(scenario.scenario_id), "id in both streams");
    }
    assert_eq!(ids, (0..40).collect::<HashSet<u64>>());
}

/// An endless code block times out, is dead-lettered, and the worker stays
/// responsive for the following scenarios.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_dead_letters_and_worker_survives() {
    common::init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    let model_text = "\
[METADATA]
name = spin_forever

[VARIABLES]
x, float, normal, media=0, std=1

[FUNCION]
tipo = code
codigo =
    resultado = 0
    while True: pass

[SIMULACION]
numero_escenarios = 3
semilla_aleatoria = 5
";
    common::produce(&broker, model_text).await;

    let mut cfg = common::consumer_cfg("w1");
    cfg.eval_timeout = Duration::from_millis(200);
    let worker = ConsumerWorker::new(broker.clone(), cfg);
    let stats = common::drive_workers(broker.clone(), vec![worker]).await;

    assert_eq!(stats[0].processed, 0);
    assert_eq!(stats[0].dlq_total, 3);
    assert_eq!(stats[0].errors_by_kind.get("timeout"), Some(&3));
    assert!(common::drain_results(&broker).await.is_empty());
    assert_eq!(common::drain_dlq(&broker).await.len(), 3);
}

/// Forbidden code is rejected at compile time: the producer refuses the
/// model before publishing (exit code 1), and a consumer confronted with a
/// hand-published malicious model exits with code 3 without consuming any
/// scenario.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn security_rejection_on_both_sides() {
    common::init_tracing();

    let malicious = "\
[METADATA]
name = escape_attempt

[VARIABLES]
x, float, normal, media=0, std=1

[FUNCION]
tipo = code
codigo =
    import os
    resultado = 1

[SIMULACION]
numero_escenarios = 5
";
    // Producer side: the parser rejects the model outright.
    let err = parse_model(malicious).unwrap_err();
    assert_eq!(err.exit_code(), 1);

    // Consumer side: bypass the parser and publish the payload directly.
    let broker = Arc::new(MemoryBroker::new());
    let published = serde_json::json!({
        "modelID": "escape_attempt_1700000000",
        "version": "1.0",
        "publishedAtUnixSec": 1.7e9,
        "metadata": {
            "name": "escape_attempt",
            "version": "1.0",
            "description": "",
            "author": "",
            "creationDate": ""
        },
        "variables": [],
        "funcion": {"tipo": "code", "codigo": "import os\nresultado = 1\n"},
        "simulacion": {"numero_escenarios": 5}
    });
    let payload = serde_json::to_vec(&published).unwrap();
    serde_json::from_slice::<PublishedModel>(&payload).expect("payload decodes as a model");
    broker
        .publish(Queue::Model, &payload, true, &Headers::new())
        .await
        .unwrap();

    let worker = ConsumerWorker::new(broker.clone(), common::consumer_cfg("w1"));
    let err = worker.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(err.to_string().contains("failed to compile"));
}
