//! PCA and truncated SVD by power iteration with deflation.
//!
//! Components are found on whichever of the Gram matrix (`X Xᵀ`, when there
//! are fewer samples than dimensions) or the scatter matrix (`Xᵀ X`) is
//! smaller. Extraction stops early once the remaining spectrum is numerically
//! zero, so the component count is capped by the data rank.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::linalg::{dot, norm};

const MAX_ITER: usize = 300;
const TOLERANCE: f64 = 1e-10;
/// Relative eigenvalue below which the spectrum is treated as exhausted.
const RANK_EPS: f64 = 1e-9;

/// Linear projection onto principal directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    /// Subtracted before projecting; zeros for truncated SVD
    mean: Vec<f64>,
    components: Vec<Vec<f64>>,
    explained_variance: Vec<f64>,
}

impl Projection {
    /// PCA: center, then project onto the top `k` directions.
    pub fn fit_pca(data: &[Vec<f64>], k: usize, seed: u64) -> Self {
        Self::fit(data, k, seed, true)
    }

    /// Truncated SVD: like PCA but without centering.
    pub fn fit_svd(data: &[Vec<f64>], k: usize, seed: u64) -> Self {
        Self::fit(data, k, seed, false)
    }

    fn fit(data: &[Vec<f64>], k: usize, seed: u64, center: bool) -> Self {
        let n = data.len();
        let d = data.first().map_or(0, Vec::len);
        let mut mean = vec![0.0; d];
        if center && n > 0 {
            for row in data {
                for (m, v) in mean.iter_mut().zip(row) {
                    *m += v / n as f64;
                }
            }
        }
        let x: Vec<Vec<f64>> = data
            .iter()
            .map(|row| row.iter().zip(&mean).map(|(v, m)| v - m).collect())
            .collect();

        let k = k.min(n).min(d);
        let mut rng = StdRng::seed_from_u64(seed);
        let use_gram = n < d;
        let m = if use_gram { n } else { d };

        // Symmetric operator M (m x m), applied implicitly for the scatter case
        let gram: Vec<Vec<f64>> = if use_gram {
            x.iter().map(|a| x.iter().map(|b| dot(a, b)).collect()).collect()
        } else {
            let mut s = vec![vec![0.0; d]; d];
            for row in &x {
                for i in 0..d {
                    if row[i] == 0.0 {
                        continue;
                    }
                    for j in i..d {
                        s[i][j] += row[i] * row[j];
                    }
                }
            }
            for i in 0..d {
                for j in 0..i {
                    s[i][j] = s[j][i];
                }
            }
            s
        };

        let mut vectors: Vec<Vec<f64>> = Vec::with_capacity(k);
        let mut values: Vec<f64> = Vec::with_capacity(k);
        for _ in 0..k {
            let mut v: Vec<f64> = (0..m).map(|_| rng.gen::<f64>() - 0.5).collect();
            orthogonalize(&mut v, &vectors);
            if !normalize(&mut v) {
                break;
            }
            let mut lambda = 0.0;
            for _ in 0..MAX_ITER {
                let mut next: Vec<f64> = gram.iter().map(|row| dot(row, &v)).collect();
                orthogonalize(&mut next, &vectors);
                lambda = norm(&next);
                if !normalize(&mut next) {
                    break;
                }
                let delta: f64 = next.iter().zip(&v).map(|(a, b)| (a - b).abs()).sum();
                v = next;
                if delta < TOLERANCE {
                    break;
                }
            }
            if lambda <= RANK_EPS * values.first().copied().unwrap_or(lambda).max(1e-300) || lambda < 1e-12 {
                break;
            }
            vectors.push(v);
            values.push(lambda);
        }

        let mut components: Vec<Vec<f64>> = if use_gram {
            // v = Xᵀ u / |Xᵀ u|
            vectors
                .iter()
                .map(|u| {
                    let mut comp = vec![0.0; d];
                    for (row, w) in x.iter().zip(u) {
                        for (c, r) in comp.iter_mut().zip(row) {
                            *c += w * r;
                        }
                    }
                    normalize(&mut comp);
                    comp
                })
                .collect()
        } else {
            vectors
        };

        // Deterministic sign: largest-magnitude entry positive
        for comp in components.iter_mut() {
            let pivot = comp.iter().copied().fold(0.0, |acc: f64, v| if v.abs() > acc.abs() { v } else { acc });
            if pivot < 0.0 {
                for c in comp.iter_mut() {
                    *c = -*c;
                }
            }
        }

        let denom = n.saturating_sub(usize::from(center)).max(1) as f64;
        let explained_variance = values.iter().map(|l| l / denom).collect();
        Self { mean, components, explained_variance }
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn explained_variance(&self) -> &[f64] {
        &self.explained_variance
    }

    pub fn transform(&self, x: &[f64]) -> Vec<f64> {
        let centered: Vec<f64> = x.iter().zip(&self.mean).map(|(v, m)| v - m).collect();
        self.components.iter().map(|c| dot(c, &centered)).collect()
    }

    /// Project every row; output width is `n_components()`, padded with
    /// zeros up to `width` when given.
    pub fn transform_all(&self, data: &[Vec<f64>], width: Option<usize>) -> Vec<Vec<f64>> {
        data.iter()
            .map(|row| {
                let mut out = self.transform(row);
                if let Some(w) = width {
                    out.resize(w, 0.0);
                }
                out
            })
            .collect()
    }
}

fn orthogonalize(v: &mut [f64], basis: &[Vec<f64>]) {
    for b in basis {
        let proj = dot(v, b);
        for (x, y) in v.iter_mut().zip(b) {
            *x -= proj * y;
        }
    }
}

fn normalize(v: &mut [f64]) -> bool {
    let n = norm(v);
    if n < 1e-300 || !n.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= n;
    }
    true
}
