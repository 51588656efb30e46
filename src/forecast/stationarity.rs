//! Augmented Dickey-Fuller unit-root check.
//!
//! Regression with constant: `Δy_t = α + γ y_{t-1} + Σ β_i Δy_{t-i} + e_t`.
//! The t-statistic of `γ` is compared with the MacKinnon asymptotic critical
//! values for the constant-only case.

use serde::{Deserialize, Serialize};

use crate::linalg;

pub const CRITICAL_1PCT: f64 = -3.43;
pub const CRITICAL_5PCT: f64 = -2.86;
pub const CRITICAL_10PCT: f64 = -2.57;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdfResult {
    pub statistic: f64,
    pub lags: usize,
    pub observations: usize,
    /// Unit root rejected at the 5% level
    pub stationary: bool,
}

/// Run the ADF test with `floor(cbrt(n))` lagged differences (at most 8).
///
/// Returns `None` when the series is too short or the regression is singular
/// (e.g. a constant series).
pub fn adf_test(series: &[f64]) -> Option<AdfResult> {
    let n = series.len();
    let lags = ((n as f64).cbrt() as usize).min(8);
    if n < lags + 8 {
        return None;
    }

    let diff: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();
    let mut design = Vec::new();
    let mut target = Vec::new();
    for t in lags..diff.len() {
        let mut row = Vec::with_capacity(lags + 2);
        row.push(1.0);
        row.push(series[t]);
        for i in 1..=lags {
            row.push(diff[t - i]);
        }
        design.push(row);
        target.push(diff[t]);
    }

    let cols = lags + 2;
    let obs = design.len();
    if obs <= cols {
        return None;
    }

    let beta = linalg::least_squares(&design, &target, 0.0)?;
    let sse: f64 = design
        .iter()
        .zip(&target)
        .map(|(row, y)| (y - linalg::dot(row, &beta)).powi(2))
        .sum();
    let sigma2 = sse / (obs - cols) as f64;

    // Variance of γ is sigma² times the (1,1) entry of (XᵀX)⁻¹
    let mut xtx = vec![vec![0.0; cols]; cols];
    for row in &design {
        for i in 0..cols {
            for j in 0..cols {
                xtx[i][j] += row[i] * row[j];
            }
        }
    }
    let mut unit = vec![0.0; cols];
    unit[1] = 1.0;
    let inv_col = linalg::solve(xtx, unit)?;
    let se = (sigma2 * inv_col[1]).sqrt();
    if !se.is_finite() || se <= 0.0 {
        return None;
    }

    let statistic = beta[1] / se;
    Some(AdfResult {
        statistic,
        lags,
        observations: obs,
        stationary: statistic < CRITICAL_5PCT,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_white_noise_is_stationary() {
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let series: Vec<f64> = (0..300).map(|_| normal.sample(&mut rng)).collect();
        let result = adf_test(&series).unwrap();
        assert!(result.stationary, "statistic {}", result.statistic);
    }

    #[test]
    fn test_random_walk_is_not_stationary() {
        let mut rng = StdRng::seed_from_u64(11);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut level = 0.0;
        let series: Vec<f64> = (0..300)
            .map(|_| {
                level += normal.sample(&mut rng);
                level
            })
            .collect();
        let result = adf_test(&series).unwrap();
        assert!(result.statistic > CRITICAL_1PCT, "statistic {}", result.statistic);
    }

    #[test]
    fn test_constant_series_has_no_result() {
        assert!(adf_test(&[3.0; 50]).is_none());
    }
}
