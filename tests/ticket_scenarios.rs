//! Ticket scenarios: label alignment, cache fallback when the ticket system
//! is down, and the full embed/cluster/diagnose path.

use std::sync::Arc;

use async_trait::async_trait;

use ssd_postmortem::config::TicketConfig;
use ssd_postmortem::embedding::HashingEmbedder;
use ssd_postmortem::tickets::{
    align_labels, analyze_tickets, search_query, write_neighbors_csv, MiningStatus, NoiseSet, SearchPage, TicketCache,
    TicketClusterer, TicketEmbedder, TicketError, TicketMiner, TicketRecord, TicketSource, NEIGHBORS_CSV,
};

// ============================================================================
// Alignment
// ============================================================================

#[test]
fn forty_tickets_align_largest_component_first() {
    // Components of 15/12/8/5 tickets; each component's top label points at
    // a different cause so the greedy match is unambiguous.
    let sizes = [(0usize, 15usize, 2usize), (1, 12, 0), (2, 8, 3), (3, 5, 1)];
    let mut assignments = Vec::new();
    let mut rankings = Vec::new();
    for (component, count, cause) in sizes {
        for _ in 0..count {
            assignments.push(component);
            let mut ranking = vec![cause];
            ranking.extend((0..4).filter(|c| *c != cause));
            rankings.push(ranking);
        }
    }
    assert_eq!(assignments.len(), 40);

    let alignment = align_labels(&assignments, &rankings, 4, 4);
    assert_eq!(alignment.mapping, vec![Some(2), Some(0), Some(3), Some(1)]);
    assert_eq!(alignment.passes, 1);
    let counts: Vec<usize> = alignment.steps.iter().map(|s| s.count).collect();
    assert_eq!(counts, vec![15, 12, 8, 5]);
    assert_eq!(counts.iter().sum::<usize>(), 40);
}

#[test]
fn conflicting_top_labels_fall_through_to_the_next_rank() {
    // Both components prefer cause 0; the smaller one settles for its
    // second choice on the next pass.
    let assignments = vec![0, 0, 0, 1, 1];
    let rankings = vec![vec![0, 1], vec![0, 1], vec![0, 1], vec![0, 1], vec![0, 1]];
    let alignment = align_labels(&assignments, &rankings, 2, 2);
    assert_eq!(alignment.mapping, vec![Some(0), Some(1)]);
    assert_eq!(alignment.passes, 2);
    assert_eq!(alignment.steps[1].rank, Some(1));
}

// ============================================================================
// Mining
// ============================================================================

struct NetworkDown;

#[async_trait]
impl TicketSource for NetworkDown {
    async fn search(&self, _query: &str, _start_at: usize, _max_results: usize) -> Result<SearchPage, TicketError> {
        Err(TicketError::Status { url: "https://tickets.invalid/rest/api/2/search".into(), status: 502 })
    }
}

#[tokio::test]
async fn network_failure_falls_back_to_cached_tickets() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("ticket_cache.json");
    let query = search_query("ASSERT_DF049");

    let mut cache = TicketCache::default();
    cache.queries.insert(
        query.clone(),
        (0..25).map(|i| TicketRecord::new(format!("FW-{}", i)).with_text("summary", "assert on read")).collect(),
    );
    cache.save(&cache_path).unwrap();

    let miner = TicketMiner::new(Some(Arc::new(NetworkDown)), &cache_path, 50);
    let outcome = miner.mine(&query).await;
    assert_eq!(outcome.status, MiningStatus::CacheFallback);
    assert_eq!(outcome.tickets.len(), 25);
    assert!(outcome.error.unwrap().contains("502"));

    // The cache is left untouched by a failed search
    assert_eq!(TicketCache::load(&cache_path).unwrap().get(&query).unwrap().len(), 25);
}

// ============================================================================
// Analysis
// ============================================================================

const THEMES: [(&str, &str, usize); 4] = [
    ("thermal throttle timeout", "temperature sensor exceeded limit during sustained write", 15),
    ("read retry exhausted", "uncorrectable read after maximum retry attempts on nand page", 12),
    ("power loss during flush", "unexpected power cycle interrupted the cache flush", 8),
    ("firmware watchdog reset", "watchdog expired while the scheduler was blocked", 5),
];

fn themed_tickets() -> (Vec<TicketRecord>, Vec<String>) {
    let mut records = Vec::new();
    for (cause, detail, count) in THEMES {
        for i in 0..count {
            records.push(
                TicketRecord::new(format!("FW-{}-{}", cause.split(' ').next().unwrap_or("x"), i))
                    .with_text("summary", format!("ASSERT_DF049 {} seen on unit {}", cause, i))
                    .with_text("description", format!("{} (run {})", detail, i % 3))
                    .with_text("assignee", "triage bot"),
            );
        }
    }
    let causes = THEMES.iter().map(|(c, _, _)| (*c).to_string()).collect();
    (records, causes)
}

#[test]
fn analysis_partitions_every_ticket_and_writes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (records, causes) = themed_tickets();
    assert_eq!(records.len(), 40);

    let config = TicketConfig { svd_components: 10, max_k: 6, restarts: 2, ..TicketConfig::default() };
    let noise = NoiseSet::from_keys(["assignee"]);
    let (report, diagnostics, artifacts) =
        analyze_tickets(&records, &causes, &HashingEmbedder::new(64), &noise, &config, 5, dir.path()).unwrap();

    let total: usize = report.tables.iter().map(|t| t.rows.len()).sum();
    assert_eq!(total, 40);
    assert!(report.tables.len() <= 4);
    assert!(report.tables.windows(2).all(|w| w[0].rows.len() >= w[1].rows.len()));
    for table in &report.tables {
        assert_eq!(table.total_tickets, 40);
        assert!(causes.contains(&table.cause), "unexpected cause {}", table.cause);
        assert!(table.header().starts_with("Speculated Known Cause: "));
        assert!(table.rows.iter().all(|r| r.neighbors.len() == 3));
    }

    let csv = std::fs::read_to_string(dir.path().join(NEIGHBORS_CSV)).unwrap();
    assert_eq!(csv.lines().count(), report.top_rows.len() + 1);
    assert_eq!(diagnostics.plots.len(), 6);
    assert!(artifacts.iter().all(|p| p.exists()));
}

#[test]
fn four_causes_split_forty_tickets_into_four_tables() {
    let dir = tempfile::tempdir().unwrap();
    // Every ticket of a cause carries the same text, so each cause is one point
    let mut records = Vec::new();
    for (cause, detail, count) in THEMES {
        for i in 0..count {
            records.push(
                TicketRecord::new(format!("FW-{}-{:02}", cause.replace(' ', "-"), i))
                    .with_text("summary", format!("ASSERT_DF049 {}", cause))
                    .with_text("description", detail),
            );
        }
    }
    let causes: Vec<String> = THEMES.iter().map(|(c, _, _)| (*c).to_string()).collect();
    assert_eq!(records.len(), 40);

    let embedder = HashingEmbedder::new(64);
    let noise = NoiseSet::default();
    let set = TicketEmbedder::new(&embedder, &noise).embed_all(&records, &causes);
    let config = TicketConfig { svd_components: 10, restarts: 2, ..TicketConfig::default() };
    let report = TicketClusterer::from_config(&config, 11).cluster(&set).unwrap();

    assert_eq!(report.tables.len(), 4);
    let sizes: Vec<usize> = report.tables.iter().map(|t| t.rows.len()).collect();
    assert_eq!(sizes, vec![15, 12, 8, 5]);
    assert_eq!(sizes.iter().sum::<usize>(), 40);
    let labels: Vec<&str> = report.tables.iter().map(|t| t.cause.as_str()).collect();
    assert_eq!(labels, causes.iter().map(String::as_str).collect::<Vec<_>>());
    let steps: Vec<usize> = report.alignment.steps.iter().map(|s| s.count).collect();
    assert_eq!(steps, vec![15, 12, 8, 5]);

    // Each table holds only its own cause's tickets
    for (table, cause) in report.tables.iter().zip(&causes) {
        let prefix = format!("FW-{}-", cause.replace(' ', "-"));
        assert!(table.rows.iter().all(|r| r.ticket_id.starts_with(&prefix)), "mixed table for {}", cause);
    }

    let csv_path = dir.path().join(NEIGHBORS_CSV);
    write_neighbors_csv(&report, config.neighbors, &csv_path).unwrap();
    let csv = std::fs::read_to_string(&csv_path).unwrap();
    assert!(csv.starts_with("jira-id,nn1"));
    assert_eq!(csv.lines().count(), report.top_rows.len() + 1);
}
