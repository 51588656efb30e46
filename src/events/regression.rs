//! Width regressor: new-event count as a linear function of elapsed time.
//!
//! Penalized fits minimize
//! `1/(2n) ||y - Xw - b||² + α ρ ||w||₁ + α (1 - ρ)/2 ||w||²`
//! by cyclic coordinate descent on centered data (`ρ = 1` lasso,
//! `ρ = 0.5` elastic net). Ridge uses the closed form. The penalty is
//! chosen by k-fold cross-validation on mean squared error.

use serde::{Deserialize, Serialize};

use crate::config::WidthModel;
use crate::linalg::{dot, least_squares, mean};

const CV_FOLDS: usize = 5;
const RIDGE_ALPHAS: [f64; 4] = [1e-3, 1e-2, 1e-1, 1.0];
const PATH_LEN: usize = 20;
/// Smallest alpha on the path relative to the largest
const PATH_EPS: f64 = 1e-3;
const CD_MAX_ITER: usize = 1000;
const CD_TOL: f64 = 1e-8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidthRegressor {
    pub model: WidthModel,
    pub alpha: f64,
    pub coef: Vec<f64>,
    pub intercept: f64,
    /// Training R² (1.0 for a perfect fit, NaN when `y` is constant)
    pub r2: f64,
}

impl WidthRegressor {
    /// Fit on rows `x` and targets `y`. An empty training set predicts zero.
    pub fn fit(model: WidthModel, x: &[Vec<f64>], y: &[f64]) -> Self {
        let n = x.len().min(y.len());
        let x = &x[..n];
        let y = &y[..n];
        let cols = x.first().map_or(0, Vec::len);
        if n == 0 {
            return Self { model, alpha: 0.0, coef: vec![0.0; cols], intercept: 0.0, r2: f64::NAN };
        }

        let alpha = match model {
            WidthModel::Default => 0.0,
            WidthModel::Ridge => cross_validate(x, y, &RIDGE_ALPHAS, |xs, ys, a| fit_ridge(xs, ys, a)),
            WidthModel::Lasso => {
                let path = alpha_path(x, y, 1.0);
                cross_validate(x, y, &path, |xs, ys, a| fit_elastic(xs, ys, a, 1.0))
            }
            WidthModel::Elastic => {
                let path = alpha_path(x, y, 0.5);
                cross_validate(x, y, &path, |xs, ys, a| fit_elastic(xs, ys, a, 0.5))
            }
        };

        let (coef, intercept) = match model {
            WidthModel::Default => fit_ridge(x, y, 0.0),
            WidthModel::Ridge => fit_ridge(x, y, alpha),
            WidthModel::Lasso => fit_elastic(x, y, alpha, 1.0),
            WidthModel::Elastic => fit_elastic(x, y, alpha, 0.5),
        };

        let mut fitted = Self { model, alpha, coef, intercept, r2: f64::NAN };
        fitted.r2 = fitted.score(x, y);
        fitted
    }

    pub fn predict(&self, x: &[f64]) -> f64 {
        self.intercept + dot(&self.coef, x)
    }

    /// Predicted event count, rounded and clamped at zero.
    pub fn predict_count(&self, x: &[f64]) -> usize {
        let raw = self.predict(x);
        if raw.is_finite() && raw > 0.0 {
            raw.round() as usize
        } else {
            0
        }
    }

    /// Coefficient of determination on `(x, y)`.
    pub fn score(&self, x: &[Vec<f64>], y: &[f64]) -> f64 {
        let m = mean(y);
        let ss_tot: f64 = y.iter().map(|v| (v - m).powi(2)).sum();
        let ss_res: f64 = x.iter().zip(y).map(|(row, v)| (v - self.predict(row)).powi(2)).sum();
        if ss_tot <= 0.0 {
            f64::NAN
        } else {
            1.0 - ss_res / ss_tot
        }
    }
}

fn column_means(x: &[Vec<f64>]) -> Vec<f64> {
    let cols = x.first().map_or(0, Vec::len);
    (0..cols).map(|j| mean(&x.iter().map(|r| r[j]).collect::<Vec<_>>())).collect()
}

fn center(x: &[Vec<f64>], y: &[f64]) -> (Vec<Vec<f64>>, Vec<f64>, Vec<f64>, f64) {
    let xm = column_means(x);
    let ym = mean(y);
    let xc = x.iter().map(|r| r.iter().zip(&xm).map(|(v, m)| v - m).collect()).collect();
    let yc = y.iter().map(|v| v - ym).collect();
    (xc, yc, xm, ym)
}

/// `(XᵀX + αI) w = Xᵀy` on centered data; singular designs get zero slopes.
fn fit_ridge(x: &[Vec<f64>], y: &[f64], alpha: f64) -> (Vec<f64>, f64) {
    let (xc, yc, xm, ym) = center(x, y);
    let cols = xm.len();
    let coef = least_squares(&xc, &yc, alpha).unwrap_or_else(|| vec![0.0; cols]);
    let intercept = ym - dot(&coef, &xm);
    (coef, intercept)
}

fn soft_threshold(z: f64, gamma: f64) -> f64 {
    if z > gamma {
        z - gamma
    } else if z < -gamma {
        z + gamma
    } else {
        0.0
    }
}

fn fit_elastic(x: &[Vec<f64>], y: &[f64], alpha: f64, l1_ratio: f64) -> (Vec<f64>, f64) {
    let (xc, yc, xm, ym) = center(x, y);
    let n = xc.len() as f64;
    let cols = xm.len();
    let col_sq: Vec<f64> = (0..cols).map(|j| xc.iter().map(|r| r[j] * r[j]).sum::<f64>() / n).collect();

    let mut w = vec![0.0; cols];
    let mut residual = yc.clone();
    for _ in 0..CD_MAX_ITER {
        let mut max_change: f64 = 0.0;
        for j in 0..cols {
            if col_sq[j] == 0.0 {
                continue;
            }
            let rho: f64 = xc.iter().zip(&residual).map(|(r, e)| r[j] * e).sum::<f64>() / n + col_sq[j] * w[j];
            let next = soft_threshold(rho, alpha * l1_ratio) / (col_sq[j] + alpha * (1.0 - l1_ratio));
            let delta = next - w[j];
            if delta != 0.0 {
                for (e, r) in residual.iter_mut().zip(&xc) {
                    *e -= delta * r[j];
                }
                w[j] = next;
            }
            max_change = max_change.max(delta.abs());
        }
        if max_change < CD_TOL {
            break;
        }
    }
    let intercept = ym - dot(&w, &xm);
    (w, intercept)
}

/// Log-spaced alphas from the smallest one that zeroes every coefficient.
fn alpha_path(x: &[Vec<f64>], y: &[f64], l1_ratio: f64) -> Vec<f64> {
    let (xc, yc, xm, _) = center(x, y);
    let n = xc.len().max(1) as f64;
    let alpha_max = (0..xm.len())
        .map(|j| xc.iter().zip(&yc).map(|(r, v)| r[j] * v).sum::<f64>().abs() / (n * l1_ratio))
        .fold(0.0, f64::max);
    if alpha_max <= 0.0 {
        return vec![1.0];
    }
    (0..PATH_LEN)
        .map(|i| alpha_max * PATH_EPS.powf(i as f64 / (PATH_LEN - 1) as f64))
        .collect()
}

/// Alpha with the lowest mean held-out MSE; ties keep the larger alpha.
fn cross_validate<F>(x: &[Vec<f64>], y: &[f64], alphas: &[f64], fit: F) -> f64
where
    F: Fn(&[Vec<f64>], &[f64], f64) -> (Vec<f64>, f64),
{
    let n = x.len();
    let folds = CV_FOLDS.min(n);
    let fallback = alphas.first().copied().unwrap_or(0.0);
    if folds < 2 {
        return fallback;
    }

    let mut best = (f64::INFINITY, fallback);
    for &alpha in alphas {
        let mut total = 0.0;
        for fold in 0..folds {
            let held: Vec<usize> = (0..n).filter(|i| i % folds == fold).collect();
            let (train_x, train_y): (Vec<Vec<f64>>, Vec<f64>) = (0..n)
                .filter(|i| i % folds != fold)
                .map(|i| (x[i].clone(), y[i]))
                .unzip();
            let (coef, intercept) = fit(&train_x, &train_y, alpha);
            total += held
                .iter()
                .map(|&i| (y[i] - intercept - dot(&coef, &x[i])).powi(2))
                .sum::<f64>();
        }
        let mse = total / n as f64;
        if mse < best.0 {
            best = (mse, alpha);
        }
    }
    best.1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64 * 60.0]).collect();
        let y: Vec<f64> = x.iter().map(|r| 3.0 + r[0] / 30.0).collect();
        (x, y)
    }

    #[test]
    fn test_ols_recovers_line() {
        let (x, y) = linear_data();
        let m = WidthRegressor::fit(WidthModel::Default, &x, &y);
        assert!((m.coef[0] - 1.0 / 30.0).abs() < 1e-9);
        assert!((m.intercept - 3.0).abs() < 1e-6);
        assert!((m.r2 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_penalized_models_track_the_trend() {
        let (x, y) = linear_data();
        for model in [WidthModel::Ridge, WidthModel::Lasso, WidthModel::Elastic] {
            let m = WidthRegressor::fit(model, &x, &y);
            assert!(m.coef[0] > 0.0, "{:?}", model);
            assert!(m.r2 > 0.9, "{:?} r2={}", model, m.r2);
        }
    }

    #[test]
    fn test_count_clamped_at_zero() {
        let x = vec![vec![0.0], vec![10.0], vec![20.0]];
        let y = vec![10.0, 5.0, 0.0];
        let m = WidthRegressor::fit(WidthModel::Default, &x, &y);
        assert_eq!(m.predict_count(&[100.0]), 0);
        assert_eq!(m.predict_count(&[0.0]), 10);
    }

    #[test]
    fn test_empty_and_constant_inputs() {
        let empty = WidthRegressor::fit(WidthModel::Elastic, &[], &[]);
        assert_eq!(empty.predict_count(&[]), 0);
        let flat = WidthRegressor::fit(WidthModel::Lasso, &[vec![1.0], vec![1.0]], &[4.0, 4.0]);
        assert_eq!(flat.predict_count(&[1.0]), 4);
    }
}
