//! Per-field ticket embeddings and known-cause label ranking.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use super::record::{NoiseSet, TicketRecord, TEXT_FIELDS};
use crate::embedding::SentenceEmbedder;
use crate::linalg::cosine;

/// Embeddings of one ticket: one row per schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketEmbedding {
    pub id: String,
    /// `(num_fields, dim)`; fields without text are zero rows
    pub matrix: Vec<Vec<f64>>,
    /// Indices into the known causes, best match first
    pub ranked_labels: Vec<usize>,
}

impl TicketEmbedding {
    /// Row-major flattening fed to the clusterer.
    pub fn flatten(&self) -> Vec<f64> {
        self.matrix.iter().flatten().copied().collect()
    }

    pub fn top_label(&self) -> Option<usize> {
        self.ranked_labels.first().copied()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingSet {
    /// Field schema shared by every ticket, sorted
    pub fields: Vec<String>,
    pub dim: usize,
    pub known_causes: Vec<String>,
    pub tickets: Vec<TicketEmbedding>,
}

impl EmbeddingSet {
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.tickets.iter().map(|t| t.id.clone()).collect()
    }

    pub fn flattened(&self) -> Vec<Vec<f64>> {
        self.tickets.iter().map(TicketEmbedding::flatten).collect()
    }

    /// Ranked label lists, one per ticket.
    pub fn rankings(&self) -> Vec<Vec<usize>> {
        self.tickets.iter().map(|t| t.ranked_labels.clone()).collect()
    }
}

pub struct TicketEmbedder<'a> {
    embedder: &'a dyn SentenceEmbedder,
    noise: &'a NoiseSet,
}

impl<'a> TicketEmbedder<'a> {
    pub fn new(embedder: &'a dyn SentenceEmbedder, noise: &'a NoiseSet) -> Self {
        Self { embedder, noise }
    }

    /// Embed every ticket over the union of their non-noise text fields and
    /// rank the known causes for each.
    pub fn embed_all(&self, records: &[TicketRecord], known_causes: &[String]) -> EmbeddingSet {
        let fields: Vec<String> = records
            .iter()
            .flat_map(|r| r.text_fields(self.noise))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let labels: Vec<Vec<f64>> = known_causes.iter().map(|c| self.embedder.embed(&c.to_lowercase())).collect();
        let dim = self.embedder.dim();

        let tickets = records
            .iter()
            .map(|record| {
                let matrix: Vec<Vec<f64>> = fields
                    .iter()
                    .map(|f| match record.field_text(f, self.noise) {
                        Some(text) => self.embedder.embed(&text),
                        None => vec![0.0; dim],
                    })
                    .collect();
                let ranked_labels = self.rank_labels(record, &labels);
                TicketEmbedding { id: record.id.clone(), matrix, ranked_labels }
            })
            .collect();

        debug!(tickets = records.len(), fields = fields.len(), "Embedded tickets");
        EmbeddingSet { fields, dim, known_causes: known_causes.to_vec(), tickets }
    }

    /// Causes ordered by cumulative cosine similarity over the text fields;
    /// equal scores keep cause order.
    fn rank_labels(&self, record: &TicketRecord, labels: &[Vec<f64>]) -> Vec<usize> {
        let texts: Vec<Vec<f64>> = TEXT_FIELDS
            .iter()
            .filter_map(|f| record.field_text(f, self.noise))
            .map(|t| self.embedder.embed(&t))
            .collect();
        let scores: Vec<f64> = labels
            .iter()
            .map(|label| texts.iter().map(|t| cosine(t, label)).sum())
            .collect();
        let mut order: Vec<usize> = (0..labels.len()).collect();
        order.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn causes() -> Vec<String> {
        vec!["Thermal throttle timeout".into(), "Read retry exhausted".into(), "Power loss during flush".into()]
    }

    #[test]
    fn test_ranked_labels_are_permutations() {
        let embedder = HashingEmbedder::default();
        let noise = NoiseSet::from_keys(["id"]);
        let records = vec![
            TicketRecord::new("FW-1").with_text("summary", "read retry exhausted on die 3"),
            TicketRecord::new("FW-2")
                .with_text("description", "power loss during flush of the write cache")
                .with_text("id", "2"),
            TicketRecord::new("FW-3"),
        ];
        let set = TicketEmbedder::new(&embedder, &noise).embed_all(&records, &causes());

        assert_eq!(set.fields, vec!["description", "summary"]);
        for t in &set.tickets {
            let mut sorted = t.ranked_labels.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2]);
            assert_eq!(t.matrix.len(), 2);
            assert_eq!(t.flatten().len(), 2 * 384);
        }
        assert_eq!(set.tickets[0].top_label(), Some(1));
        assert_eq!(set.tickets[1].top_label(), Some(2));
        // No text at all: scores tie and cause order is kept
        assert_eq!(set.tickets[2].ranked_labels, vec![0, 1, 2]);
        assert!(set.tickets[2].flatten().iter().all(|v| *v == 0.0));
    }
}
