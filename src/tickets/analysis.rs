//! Mined tickets to cluster tables, neighbor CSV and diagnostic plots.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use super::clusterer::{write_neighbors_csv, ClusterReport, TicketClusterer};
use super::diagnostics::{run_diagnostics, Diagnostics};
use super::embedder::TicketEmbedder;
use super::miner::MiningStatus;
use super::record::{NoiseSet, TicketRecord};
use super::TicketError;
use crate::config::TicketConfig;
use crate::embedding::SentenceEmbedder;

pub const NEIGHBORS_CSV: &str = "neighbors.csv";

/// Everything the ticket phase contributes to the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketAnalysis {
    pub signature: Option<String>,
    pub query: Option<String>,
    pub status: MiningStatus,
    pub status_detail: Option<String>,
    pub ticket_count: usize,
    pub known_causes: Vec<String>,
    pub clusters: Option<ClusterReport>,
    pub diagnostics: Option<Diagnostics>,
    pub artifacts: Vec<PathBuf>,
}

impl TicketAnalysis {
    /// Placeholder recorded when no tickets could be obtained.
    pub fn placeholder(signature: Option<String>, status: MiningStatus, detail: impl Into<String>) -> Self {
        Self {
            query: signature.as_deref().map(super::assert_tag::search_query),
            signature,
            status,
            status_detail: Some(detail.into()),
            ticket_count: 0,
            known_causes: Vec::new(),
            clusters: None,
            diagnostics: None,
            artifacts: Vec::new(),
        }
    }
}

/// Embed, cluster and write the ticket artifacts into `out_dir`.
pub fn analyze_tickets(
    records: &[TicketRecord],
    known_causes: &[String],
    embedder: &dyn SentenceEmbedder,
    noise: &NoiseSet,
    config: &TicketConfig,
    seed: u64,
    out_dir: &Path,
) -> Result<(ClusterReport, Diagnostics, Vec<PathBuf>), TicketError> {
    let set = TicketEmbedder::new(embedder, noise).embed_all(records, known_causes);
    let report = TicketClusterer::from_config(config, seed).cluster(&set)?;

    let csv_path = out_dir.join(NEIGHBORS_CSV);
    write_neighbors_csv(&report, config.neighbors, &csv_path)?;
    let diagnostics = run_diagnostics(&report, config.max_k, config.restarts, seed, out_dir)?;

    let mut artifacts = vec![csv_path];
    artifacts.extend(diagnostics.plots.iter().cloned());
    info!(tickets = records.len(), clusters = report.tables.len(), "Ticket analysis complete");
    Ok((report, diagnostics, artifacts))
}
