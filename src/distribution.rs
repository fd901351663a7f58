//! Random variate generation for the six supported distributions.
//!
//! Draws are pure functions of `(kind, params, rng)`; RNG state is explicit
//! and seeded by the producer, so a run with a fixed seed is reproducible
//! draw for draw.

use std::collections::BTreeMap;

use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Binomial, Distribution, LogNormal, Normal, Triangular};

use crate::error::{ConfigError, MontebusResult};
use crate::model::DistributionKind;

/// Validates the parameter map against the distribution's contract without
/// drawing. The parser calls this so a bad model fails before anything is
/// published.
pub fn validate_params(
    kind: DistributionKind,
    params: &BTreeMap<String, f64>,
) -> MontebusResult<()> {
    match kind {
        DistributionKind::Normal => {
            let _media = param(kind, params, "media")?;
            let std = param(kind, params, "std")?;
            ensure(kind, std > 0.0, "std must be > 0")?;
        }
        DistributionKind::Uniform => {
            let min = param(kind, params, "min")?;
            let max = param(kind, params, "max")?;
            ensure(kind, min < max, "min must be < max")?;
        }
        DistributionKind::Exponential => {
            let lambda = param(kind, params, "lambda")?;
            ensure(kind, lambda > 0.0, "lambda must be > 0")?;
        }
        DistributionKind::Lognormal => {
            let _mu = param(kind, params, "mu")?;
            let sigma = param(kind, params, "sigma")?;
            ensure(kind, sigma > 0.0, "sigma must be > 0")?;
        }
        DistributionKind::Triangular => {
            let left = param(kind, params, "left")?;
            let mode = param(kind, params, "mode")?;
            let right = param(kind, params, "right")?;
            ensure(
                kind,
                left <= mode && mode <= right,
                "left <= mode <= right is required",
            )?;
            ensure(kind, left < right, "left must be < right")?;
        }
        DistributionKind::Binomial => {
            let n = param(kind, params, "n")?;
            let p = param(kind, params, "p")?;
            ensure(kind, n > 0.0 && n.fract() == 0.0, "n must be a positive integer")?;
            ensure(kind, (0.0..=1.0).contains(&p), "p must be in [0, 1]")?;
        }
    }
    Ok(())
}

/// Draws one variate. Parameter violations fail with `ConfigError`.
pub fn draw(
    kind: DistributionKind,
    params: &BTreeMap<String, f64>,
    rng: &mut StdRng,
) -> MontebusResult<f64> {
    validate_params(kind, params)?;
    let value = match kind {
        DistributionKind::Normal => {
            let media = param(kind, params, "media")?;
            let std = param(kind, params, "std")?;
            Normal::new(media, std)
                .map_err(|e| invalid(kind, e.to_string()))?
                .sample(rng)
        }
        DistributionKind::Uniform => {
            let min = param(kind, params, "min")?;
            let max = param(kind, params, "max")?;
            rng.random_range(min..max)
        }
        DistributionKind::Exponential => {
            // Inverse-CDF form: -ln(U)/lambda with U in (0, 1].
            let lambda = param(kind, params, "lambda")?;
            let u: f64 = rng.random();
            -(1.0 - u).ln() / lambda
        }
        DistributionKind::Lognormal => {
            let mu = param(kind, params, "mu")?;
            let sigma = param(kind, params, "sigma")?;
            LogNormal::new(mu, sigma)
                .map_err(|e| invalid(kind, e.to_string()))?
                .sample(rng)
        }
        DistributionKind::Triangular => {
            let left = param(kind, params, "left")?;
            let mode = param(kind, params, "mode")?;
            let right = param(kind, params, "right")?;
            Triangular::new(left, right, mode)
                .map_err(|e| invalid(kind, e.to_string()))?
                .sample(rng)
        }
        DistributionKind::Binomial => {
            let n = param(kind, params, "n")? as u64;
            let p = param(kind, params, "p")?;
            Binomial::new(n, p)
                .map_err(|e| invalid(kind, e.to_string()))?
                .sample(rng) as f64
        }
    };
    Ok(value)
}

/// `size` independent draws, equivalent to calling [`draw`] in a loop.
pub fn draw_batch(
    kind: DistributionKind,
    params: &BTreeMap<String, f64>,
    size: usize,
    rng: &mut StdRng,
) -> MontebusResult<Vec<f64>> {
    let mut out = Vec::with_capacity(size);
    for _ in 0..size {
        out.push(draw(kind, params, rng)?);
    }
    Ok(out)
}

fn param(
    kind: DistributionKind,
    params: &BTreeMap<String, f64>,
    name: &str,
) -> Result<f64, ConfigError> {
    params
        .get(name)
        .copied()
        .ok_or_else(|| ConfigError::MissingParam {
            distribution: kind.to_string(),
            param: name.to_string(),
        })
}

fn ensure(kind: DistributionKind, cond: bool, msg: &str) -> Result<(), ConfigError> {
    if cond {
        Ok(())
    } else {
        Err(invalid(kind, msg.to_string()))
    }
}

fn invalid(kind: DistributionKind, msg: String) -> ConfigError {
    ConfigError::InvalidDistribution {
        distribution: kind.to_string(),
        msg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MontebusError;
    use rand::SeedableRng;

    const M: usize = 100_000;
    const SEED: u64 = 42;

    fn params(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn sample_moments(draws: &[f64]) -> (f64, f64) {
        let n = draws.len() as f64;
        let mean = draws.iter().sum::<f64>() / n;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (mean, var)
    }

    /// Empirical mean and variance must land within three standard errors of
    /// theory. The standard error of the sample variance uses the
    /// distribution's excess kurtosis.
    fn assert_moments(
        kind: DistributionKind,
        p: &BTreeMap<String, f64>,
        mean: f64,
        var: f64,
        excess_kurtosis: f64,
    ) {
        let mut rng = StdRng::seed_from_u64(SEED);
        let draws = draw_batch(kind, p, M, &mut rng).unwrap();
        let (emp_mean, emp_var) = sample_moments(&draws);

        let se_mean = var.sqrt() / (M as f64).sqrt();
        let se_var = var * ((excess_kurtosis + 2.0) / M as f64).sqrt();

        assert!(
            (emp_mean - mean).abs() < 3.0 * se_mean,
            "{kind}: mean {emp_mean} not within 3 SE of {mean}"
        );
        assert!(
            (emp_var - var).abs() < 3.0 * se_var,
            "{kind}: variance {emp_var} not within 3 SE of {var}"
        );
    }

    #[test]
    fn normal_matches_theory() {
        assert_moments(
            DistributionKind::Normal,
            &params(&[("media", 2.0), ("std", 3.0)]),
            2.0,
            9.0,
            0.0,
        );
    }

    #[test]
    fn uniform_matches_theory() {
        assert_moments(
            DistributionKind::Uniform,
            &params(&[("min", -1.0), ("max", 3.0)]),
            1.0,
            16.0 / 12.0,
            -1.2,
        );
    }

    #[test]
    fn exponential_matches_theory() {
        assert_moments(
            DistributionKind::Exponential,
            &params(&[("lambda", 2.0)]),
            0.5,
            0.25,
            6.0,
        );
    }

    #[test]
    fn lognormal_matches_theory() {
        let (mu, sigma): (f64, f64) = (0.0, 0.25);
        let s2 = sigma * sigma;
        let mean = (mu + s2 / 2.0).exp();
        let var = (s2.exp() - 1.0) * (2.0 * mu + s2).exp();
        let kurtosis =
            (4.0 * s2).exp() + 2.0 * (3.0 * s2).exp() + 3.0 * (2.0 * s2).exp() - 6.0;
        assert_moments(
            DistributionKind::Lognormal,
            &params(&[("mu", mu), ("sigma", sigma)]),
            mean,
            var,
            kurtosis,
        );
    }

    #[test]
    fn triangular_matches_theory() {
        let (a, c, b): (f64, f64, f64) = (0.0, 2.0, 10.0);
        let mean = (a + b + c) / 3.0;
        let var = (a * a + b * b + c * c - a * b - a * c - b * c) / 18.0;
        assert_moments(
            DistributionKind::Triangular,
            &params(&[("left", a), ("mode", c), ("right", b)]),
            mean,
            var,
            -0.6,
        );
    }

    #[test]
    fn binomial_matches_theory_and_is_integral() {
        let (n, p): (f64, f64) = (20.0, 0.3);
        let mean = n * p;
        let var = n * p * (1.0 - p);
        let kurtosis = (1.0 - 6.0 * p * (1.0 - p)) / var;
        let spec = params(&[("n", n), ("p", p)]);
        assert_moments(DistributionKind::Binomial, &spec, mean, var, kurtosis);

        let mut rng = StdRng::seed_from_u64(SEED);
        for v in draw_batch(DistributionKind::Binomial, &spec, 1_000, &mut rng).unwrap() {
            assert_eq!(v.fract(), 0.0);
            assert!((0.0..=n).contains(&v));
        }
    }

    #[test]
    fn exponential_draws_are_positive() {
        let mut rng = StdRng::seed_from_u64(SEED);
        let spec = params(&[("lambda", 0.5)]);
        for v in draw_batch(DistributionKind::Exponential, &spec, 1_000, &mut rng).unwrap() {
            assert!(v >= 0.0);
        }
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let spec = params(&[("media", 0.0), ("std", 1.0)]);
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        assert_eq!(
            draw_batch(DistributionKind::Normal, &spec, 32, &mut a).unwrap(),
            draw_batch(DistributionKind::Normal, &spec, 32, &mut b).unwrap()
        );
    }

    #[test]
    fn parameter_violations_fail_with_config_error() {
        let cases = [
            (DistributionKind::Normal, params(&[("media", 0.0), ("std", 0.0)])),
            (DistributionKind::Uniform, params(&[("min", 2.0), ("max", 2.0)])),
            (DistributionKind::Exponential, params(&[("lambda", -1.0)])),
            (DistributionKind::Lognormal, params(&[("mu", 0.0), ("sigma", -0.5)])),
            (
                DistributionKind::Triangular,
                params(&[("left", 0.0), ("mode", 5.0), ("right", 3.0)]),
            ),
            (DistributionKind::Binomial, params(&[("n", 2.5), ("p", 0.5)])),
            (DistributionKind::Binomial, params(&[("n", 10.0), ("p", 1.5)])),
        ];
        let mut rng = StdRng::seed_from_u64(SEED);
        for (kind, p) in cases {
            let err = draw(kind, &p, &mut rng).unwrap_err();
            assert!(matches!(err, MontebusError::Config(_)), "{kind}: {err}");
        }
    }

    #[test]
    fn missing_parameter_is_reported_by_name() {
        let mut rng = StdRng::seed_from_u64(SEED);
        let err = draw(DistributionKind::Normal, &params(&[("media", 0.0)]), &mut rng)
            .unwrap_err();
        assert!(err.to_string().contains("std"));
    }
}
