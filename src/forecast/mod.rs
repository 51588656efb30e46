//! Per-field time-series forecasting.
//!
//! - `arma`: CSS-fitted ARIMA with AIC order selection and holdout MAE
//! - `matrix_profile`: optional input transform for ARMA
//! - `stationarity`: ADF check on the differenced series (informational)
//! - `artifacts`: forecast result record, plot naming and PDF output
//!
//! The LSTM forecaster lives in `crate::lstm` and shares the error type and
//! artifact record defined here.

pub mod arma;
pub mod artifacts;
pub mod matrix_profile;
pub mod stationarity;

pub use arma::{forecast_arma, run_arma_job, ArmaFit, ArmaForecast, ArmaJob, ArmaOrder};
pub use artifacts::{artifact_file_name, object_file_name, sanitize_filename, utc_stamp, ForecastArtifact, TIMESTAMP_FORMAT};
pub use matrix_profile::matrix_profile;
pub use stationarity::{adf_test, AdfResult};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("insufficient data: {reason}")]
    InsufficientData { reason: String },

    #[error("invalid matrix-profile window {window} for series of length {len} (maximum {max})")]
    InvalidWindow { window: usize, len: usize, max: usize },

    #[error("no training examples: windows need {needed} samples, series has {available}")]
    NoExamples { needed: usize, available: usize },

    #[error("model training failed: {0}")]
    Training(String),

    #[error("training cancelled")]
    Cancelled,

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Default forecast horizon: `fraction` of the input length, clamped.
pub fn default_horizon(len: usize, fraction: f64, min: usize, max: usize) -> usize {
    let raw = (len as f64 * fraction).round() as usize;
    raw.clamp(min, max.max(min))
}

/// Finite samples of a numeric field; missing (`NaN`) samples are dropped.
pub fn finite_samples(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

/// Mean absolute error over the common prefix of two slices.
pub fn mean_absolute_error(predicted: &[f64], actual: &[f64]) -> f64 {
    let n = predicted.len().min(actual.len());
    if n == 0 {
        return f64::NAN;
    }
    predicted.iter().zip(actual).map(|(p, a)| (p - a).abs()).sum::<f64>() / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_horizon_clamped() {
        assert_eq!(default_horizon(30, 0.1, 5, 200), 5);
        assert_eq!(default_horizon(500, 0.1, 5, 200), 50);
        assert_eq!(default_horizon(10_000, 0.1, 5, 200), 200);
    }

    #[test]
    fn test_mae() {
        assert!((mean_absolute_error(&[1.0, 2.0], &[2.0, 4.0]) - 1.5).abs() < 1e-12);
        assert!(mean_absolute_error(&[], &[1.0]).is_nan());
    }
}
