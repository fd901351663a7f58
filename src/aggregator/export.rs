//! Export formats for the aggregated result distribution.
//!
//! Every export works off one [`AggregateSnapshot`] copied under the state
//! lock; all string building happens after the lock is released. JSON keeps
//! full float precision; CSV numeric columns are fixed to six decimals.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::aggregator::{AggregateSnapshot, Aggregator, to_json_value};
use crate::error::MontebusResult;
use crate::message::now_unix_sec;

impl Aggregator {
    /// Full JSON export: metadata, statistics, normality, the result rings
    /// and the convergence history.
    pub fn export_json(&self) -> MontebusResult<String> {
        let snapshot = self.snapshot();
        export_json(&snapshot)
    }

    /// CSV of the detailed result ring. `include_metadata` adds the consumer
    /// and execution-time columns.
    pub fn export_csv(&self, include_metadata: bool) -> String {
        export_csv(&self.snapshot(), include_metadata)
    }

    /// Two-column `statisticName,value` table.
    pub fn export_stats_csv(&self) -> String {
        export_stats_csv(&self.snapshot())
    }

    /// Convergence history as `n,mean,variance,atUTC` rows.
    pub fn export_convergence_csv(&self) -> String {
        export_convergence_csv(&self.snapshot())
    }
}

pub fn export_json(snapshot: &AggregateSnapshot) -> MontebusResult<String> {
    let value = json!({
        "metadata": {
            "exportedAt": format_utc(now_unix_sec()),
            "numResults": snapshot.received_total,
            "model": to_json_value(&snapshot.model_info)?,
        },
        "statistics": to_json_value(&snapshot.statistics)?,
        "normalityTests": to_json_value(&snapshot.normality)?,
        "results": to_json_value(&snapshot.results)?,
        "resultsDetailed": to_json_value(&snapshot.results_raw)?,
        "convergence": to_json_value(&snapshot.convergence)?,
    });
    serde_json::to_string_pretty(&value).map_err(|e| crate::error::SystemError::Json(e).into())
}

pub fn export_csv(snapshot: &AggregateSnapshot, include_metadata: bool) -> String {
    let mut out = String::new();
    out.push_str("# montebus results export\n");
    out.push_str(&format!("# exportedAt = {}\n", format_utc(now_unix_sec())));
    if let Some(stats) = &snapshot.statistics {
        for (name, value) in stats.as_rows() {
            out.push_str(&format!("# {name} = {value:.6}\n"));
        }
    }
    if include_metadata {
        out.push_str("scenarioID,result,consumerID,execDurationSec\n");
        for record in &snapshot.results_raw {
            out.push_str(&format!(
                "{},{:.6},{},{:.6}\n",
                record.scenario_id, record.value, record.consumer_id, record.exec_duration_sec
            ));
        }
    } else {
        out.push_str("scenarioID,result\n");
        for record in &snapshot.results_raw {
            out.push_str(&format!("{},{:.6}\n", record.scenario_id, record.value));
        }
    }
    out
}

pub fn export_stats_csv(snapshot: &AggregateSnapshot) -> String {
    let mut out = String::from("statisticName,value\n");
    if let Some(stats) = &snapshot.statistics {
        for (name, value) in stats.as_rows() {
            out.push_str(&format!("{name},{value:.6}\n"));
        }
    }
    out
}

pub fn export_convergence_csv(snapshot: &AggregateSnapshot) -> String {
    let mut out = String::from("n,mean,variance,atUTC\n");
    for point in &snapshot.convergence {
        out.push_str(&format!(
            "{},{:.6},{:.6},{}\n",
            point.n,
            point.running_mean,
            point.running_variance,
            format_utc(point.at_unix_sec)
        ));
    }
    out
}

/// Advisory file name for a results CSV: `resultados_YYYYMMDD_HHMMSS.csv`.
pub fn results_file_name(at: DateTime<Utc>) -> String {
    format!("resultados_{}.csv", at.format("%Y%m%d_%H%M%S"))
}

/// Advisory file name for a JSON export: `simulacion_YYYYMMDD_HHMMSS.json`.
pub fn simulation_file_name(at: DateTime<Utc>) -> String {
    format!("simulacion_{}.json", at.format("%Y%m%d_%H%M%S"))
}

fn format_utc(unix_sec: f64) -> String {
    let secs = unix_sec.floor() as i64;
    let nanos = ((unix_sec - secs as f64) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}
