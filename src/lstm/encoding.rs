//! Feature encoding: z-score normalization and integer category codes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Per-feature z-score normalizer fitted on a training split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl Normalizer {
    /// Fit on time-major rows. Constant features get unit scale.
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let features = rows.first().map_or(0, Vec::len);
        let n = rows.len().max(1) as f64;
        let mut mean = vec![0.0; features];
        for row in rows {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut std = vec![0.0; features];
        for row in rows {
            for (s, (v, m)) in std.iter_mut().zip(row.iter().zip(&mean)) {
                *s += (v - m).powi(2) / n;
            }
        }
        for s in std.iter_mut() {
            *s = s.sqrt();
            if *s < 1e-8 {
                *s = 1.0;
            }
        }
        Self { mean, std }
    }

    /// Pass-through scaling for `features` columns.
    pub fn identity(features: usize) -> Self {
        Self { mean: vec![0.0; features], std: vec![1.0; features] }
    }

    pub fn features(&self) -> usize {
        self.mean.len()
    }

    pub fn normalize(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }

    pub fn denormalize(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(v, (m, s))| v * s + m)
            .collect()
    }

    /// Denormalize a flattened `steps x features` block.
    pub fn denormalize_flat(&self, flat: &[f64]) -> Vec<Vec<f64>> {
        let features = self.mean.len().max(1);
        flat.chunks(features).map(|row| self.denormalize(row)).collect()
    }
}

/// Integer codes for a categorical column, in sorted label order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalEncoder {
    labels: Vec<String>,
}

impl CategoricalEncoder {
    pub fn fit<S: AsRef<str>>(values: &[S]) -> Self {
        let labels: BTreeSet<&str> = values.iter().map(AsRef::as_ref).collect();
        Self { labels: labels.into_iter().map(str::to_string).collect() }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn encode(&self, value: &str) -> Option<f64> {
        self.labels.binary_search_by(|l| l.as_str().cmp(value)).ok().map(|i| i as f64)
    }

    /// Nearest valid code for a continuous prediction.
    pub fn nearest_code(&self, value: f64) -> usize {
        if self.labels.is_empty() || !value.is_finite() {
            return 0;
        }
        (value.round().max(0.0) as usize).min(self.labels.len() - 1)
    }

    pub fn decode(&self, value: f64) -> Option<&str> {
        self.labels.get(self.nearest_code(value)).map(String::as_str)
    }
}
