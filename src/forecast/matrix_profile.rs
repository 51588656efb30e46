//! Self-join matrix profile (z-normalized Euclidean distance).
//!
//! Walks each diagonal of the distance matrix once, updating the sliding dot
//! product in O(1) per cell, so the whole profile costs O(n²) time and O(n)
//! memory.

use super::ForecastError;

/// Matrix profile of `series` with subsequence length `window`.
///
/// The output has `len - window + 1` entries: the distance from each
/// subsequence to its nearest non-trivial match. Matches closer than
/// `ceil(window / 4)` positions are excluded.
pub fn matrix_profile(series: &[f64], window: usize) -> Result<Vec<f64>, ForecastError> {
    let n = series.len();
    let max = n / 3;
    if window < 2 || window > max {
        return Err(ForecastError::InvalidWindow { window, len: n, max });
    }

    let count = n - window + 1;
    let (means, stds) = rolling_stats(series, window);
    let exclusion = window.div_ceil(4).max(1);
    let w = window as f64;
    let mut profile = vec![f64::INFINITY; count];

    for k in exclusion..count {
        let mut qt: f64 = (0..window).map(|t| series[t] * series[k + t]).sum();
        for i in 0..count - k {
            let j = i + k;
            if i > 0 {
                qt += series[i + window - 1] * series[j + window - 1] - series[i - 1] * series[j - 1];
            }
            let d = z_distance(qt, w, means[i], stds[i], means[j], stds[j]);
            if d < profile[i] {
                profile[i] = d;
            }
            if d < profile[j] {
                profile[j] = d;
            }
        }
    }

    let worst = profile.iter().copied().filter(|d| d.is_finite()).fold(0.0, f64::max);
    for d in profile.iter_mut() {
        if !d.is_finite() {
            *d = worst;
        }
    }
    Ok(profile)
}

fn rolling_stats(series: &[f64], window: usize) -> (Vec<f64>, Vec<f64>) {
    let count = series.len() - window + 1;
    let mut means = Vec::with_capacity(count);
    let mut stds = Vec::with_capacity(count);
    for i in 0..count {
        let slice = &series[i..i + window];
        let m = slice.iter().sum::<f64>() / window as f64;
        let var = slice.iter().map(|x| (x - m).powi(2)).sum::<f64>() / window as f64;
        means.push(m);
        stds.push(var.sqrt());
    }
    (means, stds)
}

/// Z-normalized distance from a dot product.
///
/// Two flat subsequences match exactly; a flat one against a varying one is
/// `sqrt(w)` apart.
fn z_distance(qt: f64, w: f64, mi: f64, si: f64, mj: f64, sj: f64) -> f64 {
    const FLAT: f64 = 1e-10;
    match (si < FLAT, sj < FLAT) {
        (true, true) => 0.0,
        (true, false) | (false, true) => w.sqrt(),
        (false, false) => {
            let corr = (qt - w * mi * mj) / (w * si * sj);
            (2.0 * w * (1.0 - corr)).max(0.0).sqrt()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force(series: &[f64], window: usize) -> Vec<f64> {
        let count = series.len() - window + 1;
        let (means, stds) = rolling_stats(series, window);
        let exclusion = window.div_ceil(4).max(1);
        (0..count)
            .map(|i| {
                (0..count)
                    .filter(|&j| i.abs_diff(j) >= exclusion)
                    .map(|j| {
                        let qt: f64 = (0..window).map(|t| series[i + t] * series[j + t]).sum();
                        z_distance(qt, window as f64, means[i], stds[i], means[j], stds[j])
                    })
                    .fold(f64::INFINITY, f64::min)
            })
            .collect()
    }

    #[test]
    fn test_matches_brute_force() {
        let series: Vec<f64> = (0..60).map(|i| ((i * 7919) % 101) as f64 / 10.0).collect();
        let fast = matrix_profile(&series, 8).unwrap();
        let slow = brute_force(&series, 8);
        assert_eq!(fast.len(), 53);
        for (a, b) in fast.iter().zip(&slow) {
            assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_periodic_signal_has_near_zero_profile() {
        let series: Vec<f64> = (0..90).map(|i| (i as f64 * std::f64::consts::PI / 5.0).sin()).collect();
        let profile = matrix_profile(&series, 10).unwrap();
        assert!(profile.iter().all(|d| *d < 1e-4));
    }

    #[test]
    fn test_window_too_large() {
        let series = vec![1.0; 30];
        assert!(matches!(
            matrix_profile(&series, 11),
            Err(ForecastError::InvalidWindow { window: 11, len: 30, max: 10 })
        ));
        assert!(matrix_profile(&series, 10).is_ok());
    }
}
