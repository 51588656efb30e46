//! Sentence embeddings, projections (PCA, truncated SVD, t-SNE) and
//! nearest-neighbor search.
//!
//! The pipeline depends only on the `SentenceEmbedder` trait. The bundled
//! `HashingEmbedder` maps word unigrams and bigrams into a fixed number of
//! signed buckets (feature hashing over MD5 digests), which is deterministic
//! across runs and hosts and needs no model download.

pub mod neighbors;
pub mod pca;
pub mod tsne;

pub use neighbors::{Metric, Neighbor, NeighborIndex};
pub use pca::Projection;
pub use tsne::{tsne, TsneParams};

/// Dimension of the bundled embedder, matching common sentence encoders.
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

pub trait SentenceEmbedder: Send + Sync {
    fn dim(&self) -> usize;

    fn embed(&self, text: &str) -> Vec<f64>;

    fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f64>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn add_feature(&self, out: &mut [f64], feature: &str, weight: f64) {
        let digest = md5::compute(feature.as_bytes());
        let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % self.dim;
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        out[bucket] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

/// Lowercased alphanumeric words (`_` counts as a word character).
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl SentenceEmbedder for HashingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    /// L2-normalized hashed bag of unigrams and bigrams; empty text maps to zeros.
    fn embed(&self, text: &str) -> Vec<f64> {
        let mut out = vec![0.0; self.dim];
        let words = tokenize(text);
        for w in &words {
            self.add_feature(&mut out, w, 1.0);
        }
        for pair in words.windows(2) {
            self.add_feature(&mut out, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        let norm = crate::linalg::norm(&out);
        if norm > 0.0 {
            for v in out.iter_mut() {
                *v /= norm;
            }
        }
        out
    }
}
