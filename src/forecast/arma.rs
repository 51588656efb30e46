//! ARIMA(p, d, q) forecasting by conditional sum of squares.
//!
//! Fitting pipeline per candidate order:
//! 1. Difference `d` times and remove the mean
//! 2. Hannan-Rissanen initial estimates (long AR, then OLS on lagged values
//!    and lagged innovation estimates)
//! 3. Levenberg-Marquardt refinement of the CSS objective
//! 4. Convergence check: finite variance, stationary AR, invertible MA
//!
//! Order selection picks the converged candidate with the smallest AIC over
//! the configured grid, falling back to `(1,0,0)`.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

use super::artifacts::{write_forecast_plot, ForecastArtifact};
use super::matrix_profile::matrix_profile;
use super::stationarity::{adf_test, AdfResult};
use super::{default_horizon, finite_samples, mean_absolute_error, ForecastError};
use crate::config::ArmaConfig;
use crate::linalg;

/// Largest root modulus accepted for a stationary / invertible polynomial.
const MAX_ROOT: f64 = 0.999;

/// Variance floor used by the AIC so exact fits stay comparable.
const SIGMA2_FLOOR: f64 = 1e-12;

const LM_MAX_ITER: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArmaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

impl ArmaOrder {
    pub const FALLBACK: ArmaOrder = ArmaOrder { p: 1, d: 0, q: 0 };

    pub fn new(p: usize, d: usize, q: usize) -> Self {
        Self { p, d, q }
    }
}

impl fmt::Display for ArmaOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.p, self.d, self.q)
    }
}

/// Fitted model for one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmaFit {
    pub order: ArmaOrder,
    /// Mean of the differenced series
    pub mean: f64,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    pub sigma2: f64,
    pub aic: f64,
    pub observations: usize,
    pub converged: bool,
    /// Ljung-Box p-value of the residuals
    pub ljung_box_p: Option<f64>,
}

impl ArmaFit {
    fn failed(order: ArmaOrder) -> Self {
        Self {
            order,
            mean: 0.0,
            ar: Vec::new(),
            ma: Vec::new(),
            sigma2: f64::NAN,
            aic: f64::INFINITY,
            observations: 0,
            converged: false,
            ljung_box_p: None,
        }
    }
}

/// Forecast output plus the model that produced it.
#[derive(Debug, Clone)]
pub struct ArmaForecast {
    pub fit: ArmaFit,
    /// Series the model was fitted on (after the optional transform)
    pub input: Vec<f64>,
    pub predicted: Vec<f64>,
    pub stationarity: Option<AdfResult>,
}

// ============================================================================
// Differencing
// ============================================================================

pub fn difference(series: &[f64], d: usize) -> Vec<f64> {
    let mut out = series.to_vec();
    for _ in 0..d {
        out = out.windows(2).map(|w| w[1] - w[0]).collect();
    }
    out
}

/// Undo `d` differences of `series` for values that continue it.
pub fn integrate(series: &[f64], future: &[f64], d: usize) -> Vec<f64> {
    let mut levels = vec![series.to_vec()];
    for _ in 0..d {
        let next = levels.last().map(|l| difference(l, 1)).unwrap_or_default();
        levels.push(next);
    }
    let mut current = future.to_vec();
    for level in levels[..d].iter().rev() {
        let mut acc = level.last().copied().unwrap_or(0.0);
        current = current
            .iter()
            .map(|v| {
                acc += v;
                acc
            })
            .collect();
    }
    current
}

// ============================================================================
// Fitting
// ============================================================================

/// CSS innovations `e_t = x_t - Σ φ_i x_{t-i} - Σ θ_j e_{t-j}`, zero for `t < p`.
fn css_residuals(x: &[f64], ar: &[f64], ma: &[f64]) -> Vec<f64> {
    let p = ar.len();
    let mut e = vec![0.0; x.len()];
    for t in p..x.len() {
        let mut v = x[t];
        for (i, a) in ar.iter().enumerate() {
            v -= a * x[t - 1 - i];
        }
        for (j, b) in ma.iter().enumerate() {
            if t > j {
                v -= b * e[t - 1 - j];
            }
        }
        e[t] = v;
    }
    e
}

fn sum_sq(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum()
}

/// Regress `x_t` on its `p` lags and `q` lags of `innovations`, from `start`.
fn lagged_regression(x: &[f64], innovations: &[f64], p: usize, q: usize, start: usize) -> Option<Vec<f64>> {
    let mut design = Vec::new();
    let mut target = Vec::new();
    for t in start..x.len() {
        let mut row = Vec::with_capacity(p + q);
        row.extend((1..=p).map(|i| x[t - i]));
        row.extend((1..=q).map(|j| innovations[t - j]));
        design.push(row);
        target.push(x[t]);
    }
    if design.len() <= p + q {
        return None;
    }
    linalg::least_squares(&design, &target, 1e-8)
}

fn hannan_rissanen(x: &[f64], p: usize, q: usize) -> Option<Vec<f64>> {
    let n = x.len();
    if p + q == 0 {
        return Some(Vec::new());
    }
    if q == 0 {
        return lagged_regression(x, &[], p, 0, p);
    }

    // Long autoregression for innovation estimates
    let m = (2 * (n as f64).ln().ceil() as usize).max(p + q + 1).min(n / 3);
    if m == 0 {
        return None;
    }
    let long_ar = lagged_regression(x, &[], m, 0, m)?;
    let mut innovations = vec![0.0; n];
    for t in m..n {
        innovations[t] = x[t] - (1..=m).map(|i| long_ar[i - 1] * x[t - i]).sum::<f64>();
    }
    lagged_regression(x, &innovations, p, q, m + q.max(p))
}

/// Levenberg-Marquardt on the CSS objective with a forward-difference Jacobian.
fn refine(x: &[f64], p: usize, mut theta: Vec<f64>) -> Vec<f64> {
    let k = theta.len();
    let residuals = |th: &[f64]| -> Vec<f64> { css_residuals(x, &th[..p], &th[p..])[p..].to_vec() };

    let mut r = residuals(&theta);
    let mut cost = sum_sq(&r);
    if !cost.is_finite() {
        return theta;
    }
    let mut lambda = 1e-3;

    for _ in 0..LM_MAX_ITER {
        if cost < 1e-300 {
            break;
        }
        let mut jac = vec![vec![0.0; k]; r.len()];
        for j in 0..k {
            let h = 1e-6 * theta[j].abs().max(1.0);
            let mut shifted = theta.clone();
            shifted[j] += h;
            let rj = residuals(&shifted);
            for (row, (a, b)) in jac.iter_mut().zip(rj.iter().zip(&r)) {
                row[j] = (a - b) / h;
            }
        }
        let neg_r: Vec<f64> = r.iter().map(|v| -v).collect();

        let mut improved = false;
        while lambda < 1e10 {
            let Some(step) = linalg::least_squares(&jac, &neg_r, lambda) else {
                lambda *= 10.0;
                continue;
            };
            let candidate: Vec<f64> = theta.iter().zip(&step).map(|(t, s)| t + s).collect();
            let rc = residuals(&candidate);
            let cc = sum_sq(&rc);
            if cc.is_finite() && cc < cost {
                let relative = (cost - cc) / cost;
                theta = candidate;
                r = rc;
                cost = cc;
                lambda = (lambda / 10.0).max(1e-12);
                improved = relative > 1e-10;
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            break;
        }
    }
    theta
}

/// Ljung-Box portmanteau p-value for residual autocorrelation.
fn ljung_box(residuals: &[f64], fitted_params: usize) -> Option<f64> {
    let n = residuals.len();
    let lags = (n / 5).min(10);
    if lags <= fitted_params {
        return None;
    }
    let m = linalg::mean(residuals);
    let denom: f64 = residuals.iter().map(|e| (e - m).powi(2)).sum();
    if denom < 1e-300 {
        return None;
    }
    let nf = n as f64;
    let q: f64 = (1..=lags)
        .map(|k| {
            let rho = residuals[k..]
                .iter()
                .zip(residuals)
                .map(|(a, b)| (a - m) * (b - m))
                .sum::<f64>()
                / denom;
            rho * rho / (nf - k as f64)
        })
        .sum::<f64>()
        * nf
        * (nf + 2.0);
    let dist = ChiSquared::new((lags - fitted_params) as f64).ok()?;
    Some(1.0 - dist.cdf(q))
}

/// Fit one order. Never fails; check `converged`.
pub fn fit(series: &[f64], order: ArmaOrder) -> ArmaFit {
    let z = difference(series, order.d);
    let n = z.len();
    let (p, q) = (order.p, order.q);
    if n < p + q + 8 {
        return ArmaFit::failed(order);
    }

    let mean = linalg::mean(&z);
    let x: Vec<f64> = z.iter().map(|v| v - mean).collect();

    let Some(initial) = hannan_rissanen(&x, p, q) else {
        return ArmaFit::failed(order);
    };
    let theta = if p + q > 0 { refine(&x, p, initial) } else { initial };

    let (ar, ma) = theta.split_at(p);
    let residuals = css_residuals(&x, ar, ma);
    let observations = n - p;
    let sigma2 = sum_sq(&residuals[p..]) / observations as f64;

    let neg_ma: Vec<f64> = ma.iter().map(|b| -b).collect();
    let converged = sigma2.is_finite()
        && theta.iter().all(|t| t.is_finite())
        && linalg::companion_radius(ar) < MAX_ROOT
        && linalg::companion_radius(&neg_ma) < MAX_ROOT;

    let aic = if converged {
        observations as f64 * sigma2.max(SIGMA2_FLOOR).ln() + 2.0 * (p + q + 1) as f64
    } else {
        f64::INFINITY
    };

    ArmaFit {
        order,
        mean,
        ar: ar.to_vec(),
        ma: ma.to_vec(),
        sigma2,
        aic,
        observations,
        converged,
        ljung_box_p: ljung_box(&residuals[p..], p + q),
    }
}

/// Grid search over `p ≤ max_p`, `d ≤ max_d`, `q ≤ max_q`; minimum AIC wins.
pub fn select_order(series: &[f64], config: &ArmaConfig) -> ArmaFit {
    let mut best: Option<ArmaFit> = None;
    for d in 0..=config.max_d {
        for p in 0..=config.max_p {
            for q in 0..=config.max_q {
                let candidate = fit(series, ArmaOrder::new(p, d, q));
                if !candidate.converged {
                    continue;
                }
                if best.as_ref().map_or(true, |b| candidate.aic < b.aic) {
                    best = Some(candidate);
                }
            }
        }
    }
    match best {
        Some(b) => b,
        None => {
            debug!("no ARMA candidate converged, using fallback order");
            fit(series, ArmaOrder::FALLBACK)
        }
    }
}

/// Continue the fitted recursion `horizon` steps with zero future innovations.
pub fn predict(fit: &ArmaFit, series: &[f64], horizon: usize) -> Vec<f64> {
    let z = difference(series, fit.order.d);
    let n = z.len();
    let mut hist: Vec<f64> = z.iter().map(|v| v - fit.mean).collect();
    let mut eps = css_residuals(&hist, &fit.ar, &fit.ma);

    for _ in 0..horizon {
        let t = hist.len();
        let mut v = 0.0;
        for (i, a) in fit.ar.iter().enumerate() {
            if t > i {
                v += a * hist[t - 1 - i];
            }
        }
        for (j, b) in fit.ma.iter().enumerate() {
            if t > j {
                v += b * eps[t - 1 - j];
            }
        }
        hist.push(v);
        eps.push(0.0);
    }

    let future: Vec<f64> = hist[n..].iter().map(|v| v + fit.mean).collect();
    integrate(series, &future, fit.order.d)
}

/// Holdout MAE: refit on all but the last `holdout` samples and score the tail.
pub fn holdout_mae(series: &[f64], order: ArmaOrder, holdout: usize, min_samples: usize) -> Option<f64> {
    if holdout == 0 || series.len() < holdout + min_samples {
        return None;
    }
    let (train, test) = series.split_at(series.len() - holdout);
    let fitted = fit(train, order);
    if !fitted.converged {
        return None;
    }
    let predicted = predict(&fitted, train, holdout);
    Some(mean_absolute_error(&predicted, test))
}

// ============================================================================
// Entry points
// ============================================================================

/// Forecast `series`, selecting the order automatically unless one is given.
///
/// Missing samples are dropped. The series must have at least
/// `min_samples` finite values and must not be constant.
pub fn forecast_arma(
    series: &[f64],
    order: Option<ArmaOrder>,
    horizon: Option<usize>,
    config: &ArmaConfig,
) -> Result<ArmaForecast, ForecastError> {
    let samples = finite_samples(series);
    if samples.len() < config.min_samples {
        return Err(ForecastError::InsufficientData {
            reason: format!("{} samples, need at least {}", samples.len(), config.min_samples),
        });
    }
    let (lo, hi) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if hi - lo < 1e-12 {
        return Err(ForecastError::InsufficientData { reason: "series is constant".to_string() });
    }

    let input = match config.matrix_profile_window {
        Some(window) => matrix_profile(&samples, window)?,
        None => samples,
    };
    let horizon = horizon.unwrap_or_else(|| {
        default_horizon(input.len(), config.horizon_fraction, config.min_horizon, config.max_horizon)
    });

    let fitted = match order {
        Some(order) => {
            let f = fit(&input, order);
            if !f.converged {
                return Err(ForecastError::Training(format!("ARMA{} did not converge", order)));
            }
            f
        }
        None => select_order(&input, config),
    };
    if !fitted.sigma2.is_finite() {
        return Err(ForecastError::Training(format!("ARMA{} has no finite fit", fitted.order)));
    }

    let predicted = predict(&fitted, &input, horizon);
    let stationarity = adf_test(&difference(&input, fitted.order.d));
    Ok(ArmaForecast { fit: fitted, input, predicted, stationarity })
}

/// Argument record for one pooled `(object, field)` ARMA job.
#[derive(Debug, Clone)]
pub struct ArmaJob {
    pub object: String,
    pub field: String,
    pub series: Vec<f64>,
    pub config: ArmaConfig,
    pub out_dir: PathBuf,
}

/// Forecast one field, score the holdout tail and write the plot.
pub fn run_arma_job(job: ArmaJob) -> Result<ForecastArtifact, ForecastError> {
    let result = forecast_arma(&job.series, None, None, &job.config)?;
    let order = result.fit.order;
    if let Some(adf) = &result.stationarity {
        debug!(
            object = %job.object,
            field = %job.field,
            statistic = adf.statistic,
            stationary = adf.stationary,
            "ADF check on differenced series"
        );
    }

    let mae = holdout_mae(&result.input, order, job.config.holdout, job.config.min_samples);
    let model = format!("ARMA{}", order);
    let path = write_forecast_plot(&job.out_dir, &job.object, &job.field, &model, &result.input, &result.predicted)?;

    info!(
        object = %job.object,
        field = %job.field,
        order = %order,
        aic = result.fit.aic,
        mae = ?mae,
        "ARMA forecast complete"
    );

    Ok(ForecastArtifact {
        object: job.object,
        field: job.field,
        model,
        predicted: result.predicted,
        predicted_labels: Vec::new(),
        mae,
        path: Some(path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn ar1(phi: f64, n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut x = 0.0;
        (0..n)
            .map(|_| {
                x = phi * x + noise.sample(&mut rng);
                x + 10.0
            })
            .collect()
    }

    #[test]
    fn test_difference_integrate_inverse() {
        let series = vec![1.0, 4.0, 9.0, 16.0, 25.0];
        let d2 = difference(&series, 2);
        assert_eq!(d2, vec![2.0, 2.0, 2.0]);
        assert_eq!(integrate(&series, &[2.0, 2.0], 2), vec![36.0, 49.0]);
    }

    #[test]
    fn test_constant_series_rejected() {
        let err = forecast_arma(&[5.0; 40], None, None, &ArmaConfig::default()).unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientData { .. }));
    }

    #[test]
    fn test_short_series_rejected() {
        let series: Vec<f64> = (0..19).map(f64::from).collect();
        let err = forecast_arma(&series, None, None, &ArmaConfig::default()).unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientData { .. }));
    }

    #[test]
    fn test_linear_series_forecast_increases() {
        let series: Vec<f64> = (0..100).map(|i| 2.0 * i as f64 + 1.0).collect();
        let result = forecast_arma(&series, None, None, &ArmaConfig::default()).unwrap();
        assert_eq!(result.predicted.len(), 10);
        assert!(result.predicted[0] > series[99]);
        assert!(result.predicted.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_ar1_coefficient_recovered() {
        let series = ar1(0.6, 400, 3);
        let fitted = fit(&series, ArmaOrder::new(1, 0, 0));
        assert!(fitted.converged);
        assert!((fitted.ar[0] - 0.6).abs() < 0.1, "phi = {}", fitted.ar[0]);
        assert!((fitted.mean - 10.0).abs() < 0.5);
    }

    #[test]
    fn test_arma11_converges() {
        let mut rng = StdRng::seed_from_u64(5);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let (mut x, mut e_prev) = (0.0, 0.0);
        let series: Vec<f64> = (0..500)
            .map(|_| {
                let e = noise.sample(&mut rng);
                x = 0.5 * x + e + 0.4 * e_prev;
                e_prev = e;
                x
            })
            .collect();
        let fitted = fit(&series, ArmaOrder::new(1, 0, 1));
        assert!(fitted.converged);
        assert!((fitted.ar[0] - 0.5).abs() < 0.15, "phi = {}", fitted.ar[0]);
        assert!((fitted.ma[0] - 0.4).abs() < 0.15, "theta = {}", fitted.ma[0]);
        assert!((fitted.sigma2 - 1.0).abs() < 0.2);
    }

    #[test]
    fn test_explicit_order_and_horizon() {
        let series = ar1(0.5, 120, 9);
        let result = forecast_arma(&series, Some(ArmaOrder::new(1, 0, 0)), Some(7), &ArmaConfig::default()).unwrap();
        assert_eq!(result.fit.order, ArmaOrder::new(1, 0, 0));
        assert_eq!(result.predicted.len(), 7);
        // Forecast decays toward the mean
        let last_gap = (result.predicted[6] - result.fit.mean).abs();
        let first_gap = (result.predicted[0] - result.fit.mean).abs();
        assert!(last_gap <= first_gap + 1e-9);
    }

    #[test]
    fn test_matrix_profile_mode_window_checked() {
        let series = ar1(0.5, 60, 1);
        let config = ArmaConfig { matrix_profile_window: Some(25), ..ArmaConfig::default() };
        let err = forecast_arma(&series, None, None, &config).unwrap_err();
        assert!(matches!(err, ForecastError::InvalidWindow { .. }));

        let config = ArmaConfig { matrix_profile_window: Some(8), max_p: 2, max_q: 1, ..ArmaConfig::default() };
        let result = forecast_arma(&series, None, None, &config).unwrap();
        assert_eq!(result.input.len(), 53);
    }

    #[test]
    fn test_holdout_mae_for_ar1() {
        let series = ar1(0.5, 200, 21);
        let mae = holdout_mae(&series, ArmaOrder::new(1, 0, 0), 10, 20).unwrap();
        assert!(mae.is_finite() && mae < 3.0);
    }
}
