//! Descriptive statistics, running convergence and normality testing.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Descriptive statistics over the current result window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptive {
    pub n: u64,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub p25: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
    #[serde(rename = "ci95Lower")]
    pub ci95_lower: f64,
    #[serde(rename = "ci95Upper")]
    pub ci95_upper: f64,
}

impl Descriptive {
    /// Name/value pairs in a stable order, for the stats CSV export.
    pub fn as_rows(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("n", self.n as f64),
            ("mean", self.mean),
            ("median", self.median),
            ("stddev", self.stddev),
            ("variance", self.variance),
            ("min", self.min),
            ("max", self.max),
            ("p25", self.p25),
            ("p75", self.p75),
            ("p95", self.p95),
            ("p99", self.p99),
            ("ci95Lower", self.ci95_lower),
            ("ci95Upper", self.ci95_upper),
        ]
    }
}

/// Computes the full descriptive block. `None` on an empty window.
pub fn describe(values: &[f64]) -> Option<Descriptive> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = if n > 1 {
        values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };
    let stddev = variance.sqrt();

    let sorted: Vec<f64> = values
        .iter()
        .copied()
        .sorted_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .collect();
    let half_width = 1.96 * stddev / (n as f64).sqrt();

    Some(Descriptive {
        n: n as u64,
        mean,
        median: percentile(&sorted, 50.0),
        stddev,
        variance,
        min: sorted[0],
        max: sorted[n - 1],
        p25: percentile(&sorted, 25.0),
        p75: percentile(&sorted, 75.0),
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
        ci95_lower: mean - half_width,
        ci95_upper: mean + half_width,
    })
}

/// Linear-interpolated percentile over pre-sorted data.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Welford's online mean/variance accumulator. Unlike the result ring it
/// never evicts, so it is the authoritative record of the full stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct Welford {
    n: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn push(&mut self, value: f64) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (ddof = 1).
    pub fn variance(&self) -> f64 {
        if self.n > 1 {
            self.m2 / (self.n - 1) as f64
        } else {
            0.0
        }
    }
}

/// Jarque–Bera normality test. The 5% verdict compares the statistic to the
/// chi-squared critical value with two degrees of freedom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalityReport {
    pub n: u64,
    pub skewness: f64,
    #[serde(rename = "kurtosisExcess")]
    pub kurtosis_excess: f64,
    #[serde(rename = "jarqueBera")]
    pub jarque_bera: f64,
    #[serde(rename = "normalAt5pct")]
    pub normal_at_5pct: bool,
}

const CHI2_2DOF_95: f64 = 5.991;

pub fn jarque_bera(values: &[f64]) -> Option<NormalityReport> {
    let n = values.len();
    if n < 8 {
        return None;
    }
    let nf = n as f64;
    let mean = values.iter().sum::<f64>() / nf;
    let m2 = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / nf;
    if m2 == 0.0 {
        return None;
    }
    let m3 = values.iter().map(|x| (x - mean).powi(3)).sum::<f64>() / nf;
    let m4 = values.iter().map(|x| (x - mean).powi(4)).sum::<f64>() / nf;

    let skewness = m3 / m2.powf(1.5);
    let kurtosis_excess = m4 / (m2 * m2) - 3.0;
    let statistic = nf / 6.0 * (skewness.powi(2) + kurtosis_excess.powi(2) / 4.0);

    Some(NormalityReport {
        n: n as u64,
        skewness,
        kurtosis_excess,
        jarque_bera: statistic,
        normal_at_5pct: statistic < CHI2_2DOF_95,
    })
}
