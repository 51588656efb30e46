//! Defect-ticket similarity and clustering.
//!
//! Mining (`miner`) searches the ticket system for the drive's fault
//! signature, falling back to a local cache. Known causes come from the
//! signature's wiki page (`wiki`). Tickets are embedded per field
//! (`embedder`), projected by truncated SVD, clustered with a Gaussian
//! mixture whose components are matched to known causes (`clusterer`), and
//! the cluster count is sanity-checked (`diagnostics`).

pub mod analysis;
pub mod assert_tag;
pub mod clusterer;
pub mod credentials;
pub mod diagnostics;
pub mod embedder;
pub mod gmm;
pub mod miner;
pub mod record;
pub mod wiki;

pub use analysis::{analyze_tickets, TicketAnalysis, NEIGHBORS_CSV};
pub use assert_tag::{extract_assert_tag, search_query};
pub use clusterer::{
    align_labels, neighbors_csv, write_neighbors_csv, Alignment, ClusterReport, ClusterTable, NeighborRow, TicketClusterer,
};
pub use credentials::{CredentialError, Credentials};
pub use diagnostics::{run_diagnostics, CurveStats, Diagnostics};
pub use embedder::{EmbeddingSet, TicketEmbedder, TicketEmbedding};
pub use gmm::GaussianMixture;
pub use miner::{JiraClient, MiningOutcome, MiningStatus, SearchPage, TicketCache, TicketMiner, TicketSource};
pub use record::{NoiseSet, TicketRecord, TEXT_FIELDS};
pub use wiki::{parse_known_causes, KnownCauseResolver, KnownCauseSource, KnownCauses, WikiClient};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("no wiki page for {0}")]
    PageNotFound(String),

    #[error("no known causes for {0}")]
    NoKnownCauses(String),

    #[error("need at least {needed} tickets, found {available}")]
    InsufficientTickets { needed: usize, available: usize },

    #[error(transparent)]
    Credential(#[from] CredentialError),
}
