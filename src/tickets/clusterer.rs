//! Ticket clustering aligned to known causes, and the neighbor tables.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info};

use super::embedder::EmbeddingSet;
use super::gmm::GaussianMixture;
use super::TicketError;
use crate::config::TicketConfig;
use crate::embedding::{Metric, NeighborIndex, Projection};

/// Label of a component left without a cause.
pub const UNASSIGNED: &str = "unassigned";

// ============================================================================
// Label alignment
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentStep {
    /// Label rank the pair was matched at; `None` for leftover pairing
    pub rank: Option<usize>,
    pub component: usize,
    pub cause: usize,
    /// Tickets of `component` whose rank-`rank` label is `cause`
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alignment {
    /// Cause index per component
    pub mapping: Vec<Option<usize>>,
    /// Rank passes visited
    pub passes: usize,
    /// Assignments in the order they were made
    pub steps: Vec<AlignmentStep>,
}

/// Greedy component-to-cause matching.
///
/// At rank `r`, every remaining (cause, component) pair is scored by the
/// number of the component's tickets whose rank-`r` label is the cause. The
/// best pair with a positive count is assigned and both are removed; ties go
/// to the lower component id, then the earlier cause. When no positive pair
/// remains the rank advances. Leftovers are paired in order after the last
/// rank, so at most `n_causes` passes are made.
pub fn align_labels(assignments: &[usize], rankings: &[Vec<usize>], n_components: usize, n_causes: usize) -> Alignment {
    let mut components: Vec<usize> = (0..n_components).collect();
    let mut causes: Vec<usize> = (0..n_causes).collect();
    let mut alignment = Alignment { mapping: vec![None; n_components], passes: 0, steps: Vec::new() };

    for rank in 0..n_causes {
        if components.is_empty() || causes.is_empty() {
            break;
        }
        alignment.passes += 1;
        loop {
            let mut best: Option<AlignmentStep> = None;
            for &cause in &causes {
                for &component in &components {
                    let count = assignments
                        .iter()
                        .zip(rankings)
                        .filter(|(a, r)| **a == component && r.get(rank) == Some(&cause))
                        .count();
                    if count == 0 {
                        continue;
                    }
                    let better = match &best {
                        None => true,
                        Some(b) => (count, std::cmp::Reverse(component), std::cmp::Reverse(cause))
                            > (b.count, std::cmp::Reverse(b.component), std::cmp::Reverse(b.cause)),
                    };
                    if better {
                        best = Some(AlignmentStep { rank: Some(rank), component, cause, count });
                    }
                }
            }
            let Some(step) = best else { break };
            components.retain(|c| *c != step.component);
            causes.retain(|c| *c != step.cause);
            alignment.mapping[step.component] = Some(step.cause);
            debug!(rank, component = step.component, cause = step.cause, count = step.count, "Aligned component");
            alignment.steps.push(step);
        }
    }

    for (component, cause) in components.into_iter().zip(causes) {
        alignment.mapping[component] = Some(cause);
        alignment.steps.push(AlignmentStep { rank: None, component, cause, count: 0 });
    }
    alignment
}

// ============================================================================
// Clustering
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketAssignment {
    pub ticket_id: String,
    pub component: usize,
    pub log_likelihood: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborRow {
    pub ticket_id: String,
    pub neighbors: Vec<String>,
    #[serde(deserialize_with = "crate::linalg::f64_or_nan")]
    pub log_likelihood: f64,
}

/// Tickets of one component, most likely first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTable {
    pub component: usize,
    pub cause: String,
    /// Tickets across all components
    pub total_tickets: usize,
    pub rows: Vec<NeighborRow>,
}

impl ClusterTable {
    pub fn share(&self) -> f64 {
        if self.total_tickets == 0 {
            0.0
        } else {
            100.0 * self.rows.len() as f64 / self.total_tickets as f64
        }
    }

    pub fn header(&self) -> String {
        format!(
            "Speculated Known Cause: {}, {:.1}% of {} mined tickets",
            self.cause,
            self.share(),
            self.total_tickets
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterReport {
    pub known_causes: Vec<String>,
    pub svd_components: usize,
    pub assignments: Vec<TicketAssignment>,
    pub alignment: Alignment,
    /// Non-empty components, largest first
    pub tables: Vec<ClusterTable>,
    /// Top fraction of each table by log-likelihood
    pub top_rows: Vec<NeighborRow>,
    /// SVD coordinates per ticket, reused by the diagnostics
    #[serde(skip)]
    pub projected: Vec<Vec<f64>>,
}

impl ClusterReport {
    pub fn component_of(&self, ticket_id: &str) -> Option<usize> {
        self.assignments.iter().find(|a| a.ticket_id == ticket_id).map(|a| a.component)
    }
}

#[derive(Debug, Clone)]
pub struct TicketClusterer {
    pub svd_components: usize,
    pub neighbors: usize,
    pub top_fraction: f64,
    pub restarts: usize,
    pub seed: u64,
}

impl TicketClusterer {
    pub fn from_config(config: &TicketConfig, seed: u64) -> Self {
        Self {
            svd_components: config.svd_components,
            neighbors: config.neighbors,
            top_fraction: config.top_fraction,
            restarts: config.restarts,
            seed,
        }
    }

    pub fn cluster(&self, set: &EmbeddingSet) -> Result<ClusterReport, TicketError> {
        let n = set.len();
        if set.known_causes.is_empty() {
            return Err(TicketError::NoKnownCauses("ticket set".to_string()));
        }
        if n < 2 {
            return Err(TicketError::InsufficientTickets { needed: 2, available: n });
        }
        let k = set.known_causes.len().min(n);

        let data = set.flattened();
        let projection = Projection::fit_svd(&data, self.svd_components, self.seed);
        let projected = projection.transform_all(&data, None);
        info!(tickets = n, components = projection.n_components(), k, "Clustering tickets");

        let gmm = GaussianMixture::fit(&projected, k, self.seed, self.restarts)?;
        let components: Vec<usize> = projected.iter().map(|x| gmm.predict(x)).collect();
        let scores = gmm.score_samples(&projected);
        let ids = set.ids();

        let alignment = align_labels(&components, &set.rankings(), k, set.known_causes.len());
        let index = NeighborIndex::new(Metric::Cosine, ids.clone(), projected.clone());

        let row = |i: usize| NeighborRow {
            ticket_id: ids[i].clone(),
            neighbors: index.neighbors_of(i, self.neighbors).into_iter().map(|nb| nb.id).collect(),
            log_likelihood: scores[i],
        };

        let mut tables: Vec<ClusterTable> = (0..k)
            .filter_map(|component| {
                let mut members: Vec<usize> = (0..n).filter(|i| components[*i] == component).collect();
                if members.is_empty() {
                    return None;
                }
                members.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]).then_with(|| ids[*a].cmp(&ids[*b])));
                let cause = alignment.mapping[component]
                    .and_then(|c| set.known_causes.get(c))
                    .map_or_else(|| UNASSIGNED.to_string(), Clone::clone);
                Some(ClusterTable { component, cause, total_tickets: n, rows: members.into_iter().map(row).collect() })
            })
            .collect();
        tables.sort_by(|a, b| b.rows.len().cmp(&a.rows.len()).then_with(|| a.component.cmp(&b.component)));

        let top_rows = tables
            .iter()
            .flat_map(|t| {
                let keep = ((t.rows.len() as f64 * self.top_fraction) as usize).max(1);
                t.rows.iter().take(keep).cloned()
            })
            .collect();

        let assignments = (0..n)
            .map(|i| TicketAssignment { ticket_id: ids[i].clone(), component: components[i], log_likelihood: scores[i] })
            .collect();

        Ok(ClusterReport {
            known_causes: set.known_causes.clone(),
            svd_components: projection.n_components(),
            assignments,
            alignment,
            tables,
            top_rows,
            projected,
        })
    }
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// `jira-id,nn1..nnk,log-likelihood` over the top rows.
pub fn neighbors_csv(report: &ClusterReport, k: usize) -> String {
    let mut out = String::from("jira-id");
    for i in 1..=k {
        let _ = write!(out, ",nn{}", i);
    }
    out.push_str(",log-likelihood\n");
    for row in &report.top_rows {
        out.push_str(&csv_field(&row.ticket_id));
        for i in 0..k {
            out.push(',');
            out.push_str(&csv_field(row.neighbors.get(i).map_or("", String::as_str)));
        }
        let _ = writeln!(out, ",{}", row.log_likelihood);
    }
    out
}

pub fn write_neighbors_csv(report: &ClusterReport, k: usize, path: &Path) -> Result<(), TicketError> {
    std::fs::write(path, neighbors_csv(report, k)).map_err(|source| TicketError::Io { path: path.to_path_buf(), source })
}
