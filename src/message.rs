//! Wire messages exchanged over the broker and their envelope headers.
//!
//! Payloads are JSON; header values travel at the broker envelope level so
//! retry bookkeeping never rewrites payload bytes.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Seconds since the Unix epoch with sub-second precision.
pub fn now_unix_sec() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// One independent draw of all model variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(rename = "scenarioID")]
    pub scenario_id: u64,
    #[serde(rename = "publishedAtUnixSec")]
    pub published_at_unix_sec: f64,
    #[serde(rename = "valores")]
    pub values: HashMap<String, f64>,
}

/// The scalar outcome of one scenario. Deliberately minimal: the aggregator
/// timestamps on receipt, so no publisher timestamp travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMsg {
    #[serde(rename = "scenarioID")]
    pub scenario_id: u64,
    #[serde(rename = "consumerID")]
    pub consumer_id: String,
    #[serde(rename = "resultado")]
    pub value: f64,
    #[serde(rename = "tiempo_ejecucion")]
    pub exec_duration_sec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProducerState {
    Active,
    Completed,
}

/// Periodic producer telemetry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerStats {
    pub generated: u64,
    pub total: u64,
    pub progress: f64,
    /// Scenarios per second since the run started.
    pub rate: f64,
    pub elapsed: f64,
    pub eta: f64,
    pub state: ProducerState,
    #[serde(rename = "atUnixSec")]
    pub at_unix_sec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConsumerState {
    Active,
    Idle,
    Stopped,
}

/// Periodic consumer telemetry snapshot, keyed by `consumerID` in the
/// aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerStats {
    #[serde(rename = "consumerID")]
    pub consumer_id: String,
    pub processed: u64,
    #[serde(rename = "lastExecSec")]
    pub last_exec_sec: f64,
    #[serde(rename = "avgExecSec")]
    pub avg_exec_sec: f64,
    pub rate: f64,
    pub state: ConsumerState,
    #[serde(rename = "errorsTotal")]
    pub errors_total: u64,
    #[serde(rename = "retriesTotal")]
    pub retries_total: u64,
    #[serde(rename = "dlqTotal")]
    pub dlq_total: u64,
    #[serde(rename = "errorsByKind")]
    pub errors_by_kind: HashMap<String, u64>,
    #[serde(rename = "atUnixSec")]
    pub at_unix_sec: f64,
}

// ================================================================================================
// Envelope headers
// ================================================================================================

pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
pub const HEADER_LAST_ERROR: &str = "x-last-error";
pub const HEADER_CONSUMER_ID: &str = "x-consumer-id";

/// Broker-level envelope headers. Retry republication updates only this map;
/// the scenario payload bytes are preserved verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub consumer_id: Option<String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers for a redelivery attempt: bumped retry count plus the error
    /// and worker that caused it.
    pub fn retried(&self, last_error: String, consumer_id: String) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            last_error: Some(last_error),
            consumer_id: Some(consumer_id),
        }
    }

    /// Headers for a dead-lettered envelope: retry count untouched, final
    /// error recorded.
    pub fn dead_lettered(&self, last_error: String, consumer_id: String) -> Self {
        Self {
            retry_count: self.retry_count,
            last_error: Some(last_error),
            consumer_id: Some(consumer_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_wire_shape_uses_spanish_field_names() {
        let scenario = Scenario {
            scenario_id: 7,
            published_at_unix_sec: 1_762_000_000.5,
            values: HashMap::from([("x".to_string(), 1.25)]),
        };
        let json = serde_json::to_string(&scenario).unwrap();
        assert!(json.contains("\"scenarioID\":7"));
        assert!(json.contains("\"valores\""));

        let back: Scenario = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scenario);
    }

    #[test]
    fn result_wire_shape_is_minimal() {
        let result = ResultMsg {
            scenario_id: 3,
            consumer_id: "consumer_1".into(),
            value: 2.5,
            exec_duration_sec: 0.001,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(
            json,
            r#"{"scenarioID":3,"consumerID":"consumer_1","resultado":2.5,"tiempo_ejecucion":0.001}"#
        );
    }

    #[test]
    fn retried_headers_bump_count_and_record_error() {
        let first = Headers::new();
        assert_eq!(first.retry_count, 0);

        let second = first.retried("evaluation: overflow".into(), "consumer_9".into());
        assert_eq!(second.retry_count, 1);
        assert_eq!(second.last_error.as_deref(), Some("evaluation: overflow"));

        let dead = second.dead_lettered("timeout".into(), "consumer_9".into());
        assert_eq!(dead.retry_count, 1);
        assert_eq!(dead.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn states_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProducerState::Completed).unwrap(),
            r#""completed""#
        );
        assert_eq!(
            serde_json::to_string(&ConsumerState::Idle).unwrap(),
            r#""idle""#
        );
    }
}
