//! Exact t-SNE for small point sets (a few hundred points).
//!
//! Gaussian input affinities calibrated per point to the target perplexity,
//! Student-t output affinities, gradient descent with momentum, per-parameter
//! gains and early exaggeration.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::linalg::sq_dist;

const LEARNING_RATE: f64 = 200.0;
const EXAGGERATION: f64 = 12.0;
const EXAGGERATION_ITERS: usize = 100;
const MOMENTUM_SWITCH: usize = 250;
const MIN_GAIN: f64 = 0.01;
const BETA_SEARCH_STEPS: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct TsneParams {
    pub perplexity: f64,
    pub iterations: usize,
    pub seed: u64,
}

impl Default for TsneParams {
    fn default() -> Self {
        Self { perplexity: 30.0, iterations: 500, seed: 0 }
    }
}

/// Row-conditional affinities `p(j|i)` with entropy `ln(perplexity)`.
fn conditional_affinities(dist: &[Vec<f64>], perplexity: f64) -> Vec<Vec<f64>> {
    let target = perplexity.ln();
    dist.iter()
        .enumerate()
        .map(|(i, row)| {
            let (mut lo, mut hi, mut beta) = (0.0_f64, f64::INFINITY, 1.0_f64);
            let mut p = vec![0.0; row.len()];
            for _ in 0..BETA_SEARCH_STEPS {
                let mut sum = 0.0;
                for (j, d) in row.iter().enumerate() {
                    p[j] = if j == i { 0.0 } else { (-d * beta).exp() };
                    sum += p[j];
                }
                if sum <= 0.0 {
                    // Too sharp: widen
                    hi = beta;
                    beta = (lo + hi) / 2.0;
                    continue;
                }
                let mut entropy = 0.0;
                for (j, d) in row.iter().enumerate() {
                    p[j] /= sum;
                    if j != i {
                        entropy += beta * d * p[j];
                    }
                }
                entropy += sum.ln();
                let diff = entropy - target;
                if diff.abs() < 1e-5 {
                    break;
                }
                if diff > 0.0 {
                    lo = beta;
                    beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
                } else {
                    hi = beta;
                    beta = (beta + lo) / 2.0;
                }
            }
            p
        })
        .collect()
}

/// Embed `data` into two dimensions.
pub fn tsne(data: &[Vec<f64>], params: TsneParams) -> Vec<[f64; 2]> {
    let n = data.len();
    if n < 3 {
        return (0..n).map(|i| [i as f64, 0.0]).collect();
    }
    let perplexity = params.perplexity.min((n - 1) as f64 / 3.0).max(1.0);

    let dist: Vec<Vec<f64>> = data.iter().map(|a| data.iter().map(|b| sq_dist(a, b)).collect()).collect();
    let cond = conditional_affinities(&dist, perplexity);
    let mut p = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            p[i][j] = ((cond[i][j] + cond[j][i]) / (2.0 * n as f64)).max(1e-12);
        }
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let init: Vec<[f64; 2]> = Normal::new(0.0, 1e-4).map_or_else(|_| vec![[0.0; 2]; n], |d| {
        (0..n).map(|_| [d.sample(&mut rng), d.sample(&mut rng)]).collect()
    });
    let mut y = init;
    let mut update = vec![[0.0; 2]; n];
    let mut gains = vec![[1.0_f64; 2]; n];

    for iter in 0..params.iterations {
        let exaggeration = if iter < EXAGGERATION_ITERS { EXAGGERATION } else { 1.0 };
        let momentum = if iter < MOMENTUM_SWITCH { 0.5 } else { 0.8 };

        let mut num = vec![vec![0.0; n]; n];
        let mut z = 0.0_f64;
        for i in 0..n {
            for j in (i + 1)..n {
                let d = (y[i][0] - y[j][0]).powi(2) + (y[i][1] - y[j][1]).powi(2);
                let q = 1.0 / (1.0 + d);
                num[i][j] = q;
                num[j][i] = q;
                z += 2.0 * q;
            }
        }
        let z = z.max(1e-12);

        for i in 0..n {
            let mut grad = [0.0; 2];
            for j in 0..n {
                if i == j {
                    continue;
                }
                let w = (exaggeration * p[i][j] - num[i][j] / z) * num[i][j];
                grad[0] += 4.0 * w * (y[i][0] - y[j][0]);
                grad[1] += 4.0 * w * (y[i][1] - y[j][1]);
            }
            for d in 0..2 {
                gains[i][d] = if (grad[d] > 0.0) != (update[i][d] > 0.0) {
                    gains[i][d] + 0.2
                } else {
                    (gains[i][d] * 0.8).max(MIN_GAIN)
                };
                update[i][d] = momentum * update[i][d] - LEARNING_RATE * gains[i][d] * grad[d];
            }
        }
        for (pt, u) in y.iter_mut().zip(&update) {
            pt[0] += u[0];
            pt[1] += u[1];
        }
        let cx = y.iter().map(|p| p[0]).sum::<f64>() / n as f64;
        let cy = y.iter().map(|p| p[1]).sum::<f64>() / n as f64;
        for pt in y.iter_mut() {
            pt[0] -= cx;
            pt[1] -= cy;
        }
    }
    y
}
