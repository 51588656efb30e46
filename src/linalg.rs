//! Small dense linear-algebra helpers shared by the statistical models.
//!
//! Matrices are row-major `Vec<Vec<f64>>`; sizes here are tiny (tens of
//! columns) so clarity wins over blocking or SIMD.

use serde::{Deserialize, Deserializer};

/// Solve `a x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` when the system is singular to working precision.
pub fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    if a.len() != n || a.iter().any(|row| row.len() != n) {
        return None;
    }

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in row + 1..n {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}

/// Least squares `min ||X b - y||² + ridge ||b||²` via the normal equations.
///
/// A small ridge keeps rank-deficient designs solvable.
pub fn least_squares(x: &[Vec<f64>], y: &[f64], ridge: f64) -> Option<Vec<f64>> {
    let cols = x.first().map_or(0, Vec::len);
    if cols == 0 {
        return Some(Vec::new());
    }
    let mut xtx = vec![vec![0.0; cols]; cols];
    let mut xty = vec![0.0; cols];
    for (row, &target) in x.iter().zip(y) {
        for i in 0..cols {
            xty[i] += row[i] * target;
            for j in i..cols {
                xtx[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 0..cols {
        for j in 0..i {
            xtx[i][j] = xtx[j][i];
        }
        xtx[i][i] += ridge;
    }
    solve(xtx, xty)
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Cosine similarity; zero vectors have similarity 0 with everything.
pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let denom = norm(a) * norm(b);
    if denom < 1e-12 {
        0.0
    } else {
        dot(a, b) / denom
    }
}

pub fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

pub fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        0.0
    } else {
        v.iter().sum::<f64>() / v.len() as f64
    }
}

/// Population standard deviation.
pub fn std_dev(v: &[f64]) -> f64 {
    if v.len() < 2 {
        return 0.0;
    }
    let m = mean(v);
    (v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / v.len() as f64).sqrt()
}

/// Spectral radius of the companion matrix of `x_t = Σ c_i x_{t-i}`.
///
/// Estimated from the growth rate of repeated application, which converges
/// for complex eigenvalues as well. Values below 1 mean a stable recursion.
pub fn companion_radius(coeffs: &[f64]) -> f64 {
    let p = coeffs.len();
    if p == 0 {
        return 0.0;
    }
    const STEPS: usize = 400;
    let mut state: Vec<f64> = (0..p).map(|i| 1.0 / (i as f64 + 1.0)).collect();
    let mut log_growth = 0.0;
    let mut counted = 0usize;
    for step in 0..STEPS {
        let next = dot(coeffs, &state);
        state.rotate_right(1);
        state[0] = next;
        let n = norm(&state);
        if n < 1e-300 {
            return 0.0;
        }
        for v in state.iter_mut() {
            *v /= n;
        }
        // Discard the transient before averaging
        if step >= STEPS / 4 {
            log_growth += n.ln();
            counted += 1;
        }
    }
    (log_growth / counted as f64).exp()
}

// ============================================================================
// Serde helpers
// ============================================================================

// serde_json writes non-finite floats as `null`; these read them back as NaN.

pub fn f64_or_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

pub fn vec_f64_or_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
    let values = Vec::<Option<f64>>::deserialize(deserializer)?;
    Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}
