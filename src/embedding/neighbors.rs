//! Exact k-nearest-neighbor search.
//!
//! Brute force over all points: catalogs and ticket sets are small enough
//! that an index structure would not pay for itself. Ties are broken by the
//! point id so results are deterministic.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::linalg::{cosine, sq_dist};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Higher is closer
    Cosine,
    /// Lower is closer
    Euclidean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub index: usize,
    pub id: String,
    /// Cosine similarity or Euclidean distance, depending on the metric
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct NeighborIndex {
    metric: Metric,
    ids: Vec<String>,
    points: Vec<Vec<f64>>,
}

impl NeighborIndex {
    pub fn new(metric: Metric, ids: Vec<String>, points: Vec<Vec<f64>>) -> Self {
        Self { metric, ids, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, index: usize) -> Option<&[f64]> {
        self.points.get(index).map(Vec::as_slice)
    }

    fn score(&self, a: &[f64], b: &[f64]) -> f64 {
        match self.metric {
            Metric::Cosine => cosine(a, b),
            Metric::Euclidean => sq_dist(a, b).sqrt(),
        }
    }

    fn closer(&self, a: &Neighbor, b: &Neighbor) -> Ordering {
        let by_score = match self.metric {
            Metric::Cosine => b.score.total_cmp(&a.score),
            Metric::Euclidean => a.score.total_cmp(&b.score),
        };
        by_score.then_with(|| a.id.cmp(&b.id))
    }

    /// `k` nearest points to `query`, skipping index `exclude`.
    pub fn nearest(&self, query: &[f64], k: usize, exclude: Option<usize>) -> Vec<Neighbor> {
        let mut all: Vec<Neighbor> = self
            .points
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != exclude)
            .map(|(i, p)| Neighbor { index: i, id: self.ids[i].clone(), score: self.score(query, p) })
            .collect();
        all.sort_by(|a, b| self.closer(a, b));
        all.truncate(k);
        all
    }

    /// `k` nearest neighbors of the stored point `index`, excluding itself.
    pub fn neighbors_of(&self, index: usize, k: usize) -> Vec<Neighbor> {
        match self.points.get(index) {
            Some(p) => self.nearest(p, k, Some(index)),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("T-{}", i)).collect()
    }

    #[test]
    fn test_cosine_neighbors_exclude_self() {
        let points = vec![vec![1.0, 0.0], vec![0.9, 0.1], vec![0.0, 1.0], vec![0.7, 0.7]];
        let index = NeighborIndex::new(Metric::Cosine, ids(4), points);
        let nn = index.neighbors_of(0, 2);
        assert_eq!(nn.iter().map(|n| n.index).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let points = vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]];
        let index = NeighborIndex::new(Metric::Cosine, vec!["B".into(), "C".into(), "A".into()], points);
        let nn = index.neighbors_of(0, 2);
        assert_eq!(nn[0].id, "A");
        assert_eq!(nn[1].id, "C");
    }

    #[test]
    fn test_euclidean_nearest() {
        let points = vec![vec![0.0], vec![5.0], vec![10.0]];
        let index = NeighborIndex::new(Metric::Euclidean, ids(3), points);
        let nn = index.nearest(&[6.0], 1, None);
        assert_eq!(nn[0].index, 1);
        assert!((nn[0].score - 1.0).abs() < 1e-12);
    }
}
