//! Diagonal-covariance Gaussian mixture fitted by EM.
//!
//! Means are seeded by k-means++ and the best of several restarts (highest
//! mean log-likelihood) is kept.

use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::TicketError;
use crate::linalg::sq_dist;

const MAX_ITER: usize = 200;
const TOLERANCE: f64 = 1e-4;
/// Added to every variance
const REG_COVAR: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianMixture {
    weights: Vec<f64>,
    means: Vec<Vec<f64>>,
    variances: Vec<Vec<f64>>,
    pub converged: bool,
    /// Mean per-sample log-likelihood at the end of training
    pub lower_bound: f64,
}

pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// k-means++ seeding: each next center drawn with probability proportional
/// to the squared distance to the nearest chosen one.
pub(crate) fn kmeans_pp(data: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centers: Vec<Vec<f64>> = Vec::with_capacity(k);
    if data.is_empty() {
        return centers;
    }
    centers.push(data[rng.gen_range(0..data.len())].clone());
    while centers.len() < k {
        let d2: Vec<f64> = data
            .iter()
            .map(|x| centers.iter().map(|c| sq_dist(x, c)).fold(f64::INFINITY, f64::min))
            .collect();
        let next = match WeightedIndex::new(&d2) {
            Ok(dist) => dist.sample(rng),
            // Every point coincides with a center
            Err(_) => rng.gen_range(0..data.len()),
        };
        centers.push(data[next].clone());
    }
    centers
}

pub(crate) fn nearest_center(x: &[f64], centers: &[Vec<f64>]) -> usize {
    centers
        .iter()
        .enumerate()
        .map(|(j, c)| (j, sq_dist(x, c)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(j, _)| j)
}

impl GaussianMixture {
    /// Fit `k` components, keeping the best of `restarts` initializations.
    pub fn fit(data: &[Vec<f64>], k: usize, seed: u64, restarts: usize) -> Result<Self, TicketError> {
        if k == 0 || data.len() < k {
            return Err(TicketError::InsufficientTickets { needed: k.max(1), available: data.len() });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut best: Option<Self> = None;
        for _ in 0..restarts.max(1) {
            let model = Self::fit_once(data, k, &mut rng);
            if best.as_ref().map_or(true, |b| model.lower_bound > b.lower_bound) {
                best = Some(model);
            }
        }
        best.ok_or(TicketError::InsufficientTickets { needed: k, available: data.len() })
    }

    fn fit_once(data: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Self {
        let centers = kmeans_pp(data, k, rng);
        let resp: Vec<Vec<f64>> = data
            .iter()
            .map(|x| {
                let mut r = vec![0.0; k];
                r[nearest_center(x, &centers)] = 1.0;
                r
            })
            .collect();

        let mut model = Self::m_step(data, &resp, k);
        let mut prev = f64::NEG_INFINITY;
        for _ in 0..MAX_ITER {
            let (resp, lower_bound) = model.e_step(data);
            model.lower_bound = lower_bound;
            if (lower_bound - prev).abs() < TOLERANCE {
                model.converged = true;
                break;
            }
            prev = lower_bound;
            let next = Self::m_step(data, &resp, k);
            model.weights = next.weights;
            model.means = next.means;
            model.variances = next.variances;
        }
        model
    }

    fn m_step(data: &[Vec<f64>], resp: &[Vec<f64>], k: usize) -> Self {
        let n = data.len();
        let d = data.first().map_or(0, Vec::len);
        let mut weights = vec![0.0; k];
        let mut means = vec![vec![0.0; d]; k];
        let mut variances = vec![vec![0.0; d]; k];

        for (x, r) in data.iter().zip(resp) {
            for j in 0..k {
                weights[j] += r[j];
                for (m, v) in means[j].iter_mut().zip(x) {
                    *m += r[j] * v;
                }
            }
        }
        let nk: Vec<f64> = weights.iter().map(|w| w + 10.0 * f64::EPSILON).collect();
        for (mean, n_j) in means.iter_mut().zip(&nk) {
            for m in mean.iter_mut() {
                *m /= n_j;
            }
        }
        for (x, r) in data.iter().zip(resp) {
            for j in 0..k {
                for ((var, v), m) in variances[j].iter_mut().zip(x).zip(&means[j]) {
                    *var += r[j] * (v - m).powi(2);
                }
            }
        }
        for (var, n_j) in variances.iter_mut().zip(&nk) {
            for v in var.iter_mut() {
                *v = *v / n_j + REG_COVAR;
            }
        }
        for w in weights.iter_mut() {
            *w = (*w + 10.0 * f64::EPSILON) / n as f64;
        }
        Self { weights, means, variances, converged: false, lower_bound: f64::NEG_INFINITY }
    }

    fn e_step(&self, data: &[Vec<f64>]) -> (Vec<Vec<f64>>, f64) {
        let mut total = 0.0;
        let resp = data
            .iter()
            .map(|x| {
                let lp = self.component_log_probs(x);
                let norm = log_sum_exp(&lp);
                total += norm;
                lp.iter().map(|l| (l - norm).exp()).collect()
            })
            .collect();
        (resp, total / data.len().max(1) as f64)
    }

    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn means(&self) -> &[Vec<f64>] {
        &self.means
    }

    /// `log w_j + log N(x | μ_j, σ²_j)` per component.
    pub fn component_log_probs(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(self.means.iter().zip(&self.variances))
            .map(|(w, (mean, var))| {
                let quad: f64 = x.iter().zip(mean).zip(var).map(|((v, m), s)| (v - m).powi(2) / s).sum();
                let log_det: f64 = var.iter().map(|s| s.ln()).sum();
                w.ln() - 0.5 * (mean.len() as f64 * (2.0 * PI).ln() + log_det + quad)
            })
            .collect()
    }

    /// Log-likelihood of each sample under the mixture.
    pub fn score_samples(&self, data: &[Vec<f64>]) -> Vec<f64> {
        data.iter().map(|x| log_sum_exp(&self.component_log_probs(x))).collect()
    }

    pub fn predict(&self, x: &[f64]) -> usize {
        self.component_log_probs(x)
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(&a.0)))
            .map_or(0, |(j, _)| j)
    }

    /// Bayesian information criterion on `data`; lower is better.
    pub fn bic(&self, data: &[Vec<f64>]) -> f64 {
        let k = self.n_components();
        let d = self.means.first().map_or(0, Vec::len);
        let params = (2 * k * d + k - 1) as f64;
        let ll: f64 = self.score_samples(data).iter().sum();
        -2.0 * ll + params * (data.len().max(1) as f64).ln()
    }

    /// Draw `n` points from the mixture.
    pub fn sample(&self, n: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
        let Ok(pick) = WeightedIndex::new(&self.weights) else { return Vec::new() };
        (0..n)
            .map(|_| {
                let j = pick.sample(rng);
                self.means[j]
                    .iter()
                    .zip(&self.variances[j])
                    .map(|(m, s)| Normal::new(*m, s.sqrt()).map_or(*m, |dist| dist.sample(rng)))
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs(seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 0.3).unwrap();
        let mut out = Vec::new();
        for center in [[0.0, 0.0], [6.0, 6.0], [-6.0, 5.0]] {
            for _ in 0..30 {
                out.push(vec![center[0] + noise.sample(&mut rng), center[1] + noise.sample(&mut rng)]);
            }
        }
        out
    }

    #[test]
    fn test_separates_blobs() {
        let data = blobs(1);
        let gmm = GaussianMixture::fit(&data, 3, 7, 3).unwrap();
        let labels: Vec<usize> = data.iter().map(|x| gmm.predict(x)).collect();
        for chunk in labels.chunks(30) {
            assert!(chunk.iter().all(|l| *l == chunk[0]));
        }
        assert_ne!(labels[0], labels[30]);
        assert_ne!(labels[30], labels[60]);
        assert!((gmm.weights().iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bic_prefers_true_count() {
        let data = blobs(2);
        let one = GaussianMixture::fit(&data, 1, 3, 1).unwrap();
        let three = GaussianMixture::fit(&data, 3, 3, 3).unwrap();
        assert!(three.bic(&data) < one.bic(&data));
    }

    #[test]
    fn test_samples_score_high_under_own_model() {
        let data = blobs(3);
        let gmm = GaussianMixture::fit(&data, 3, 5, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let drawn = gmm.sample(200, &mut rng);
        assert_eq!(drawn.len(), 200);
        let mean_ll = crate::linalg::mean(&gmm.score_samples(&drawn));
        assert!(mean_ll > -5.0, "mean log-likelihood {}", mean_ll);
    }

    #[test]
    fn test_too_few_points() {
        assert!(GaussianMixture::fit(&[vec![1.0]], 2, 0, 1).is_err());
        assert_eq!(log_sum_exp(&[0.0, 0.0]), 2f64.ln());
    }
}
