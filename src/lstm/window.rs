//! Sliding-window example generation.
//!
//! For start index `t` (stride 1):
//!
//! ```text
//! input  = rows[t .. t + input_width]
//! target = rows[t + input_width + shift .. t + input_width + shift + label_width]
//! ```
//!
//! Targets are flattened row-major into `label_width * num_features` values.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub input_width: usize,
    pub label_width: usize,
    pub shift: usize,
}

impl WindowSpec {
    pub fn new(input_width: usize, label_width: usize, shift: usize) -> Self {
        Self { input_width, label_width, shift }
    }

    /// Samples spanned by one example.
    pub fn total_width(&self) -> usize {
        self.input_width + self.shift + self.label_width
    }

    /// Number of examples a series of `len` samples yields.
    pub fn example_count(&self, len: usize) -> usize {
        len.checked_sub(self.total_width()).map_or(0, |r| r + 1)
    }

    fn label_start(&self) -> usize {
        self.input_width + self.shift
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// `input_width` rows of features
    pub input: Vec<Vec<f64>>,
    /// Flattened `label_width x num_features`
    pub target: Vec<f64>,
}

/// All windows over `rows` (time-major), in time order.
pub fn make_windows(rows: &[Vec<f64>], spec: &WindowSpec) -> Vec<Example> {
    let count = spec.example_count(rows.len());
    (0..count)
        .map(|t| {
            let input = rows[t..t + spec.input_width].to_vec();
            let start = t + spec.label_start();
            let target = rows[start..start + spec.label_width].iter().flatten().copied().collect();
            Example { input, target }
        })
        .collect()
}
