//! Ticket mining: paginated search with a local cache fallback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::credentials::Credentials;
use super::record::TicketRecord;
use super::TicketError;

/// Hard stop on pagination in case a server never reports a last page.
const MAX_PAGES: usize = 1000;

/// One page of search results.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub issues: Vec<Value>,
    #[serde(rename = "startAt", default)]
    pub start_at: usize,
    #[serde(default)]
    pub total: Option<usize>,
    #[serde(rename = "isLastPage", default)]
    pub is_last_page: Option<bool>,
}

impl SearchPage {
    /// Explicit `isLastPage`, else derived from `total`; an empty page always ends.
    pub fn is_last(&self) -> bool {
        if self.issues.is_empty() {
            return true;
        }
        match (self.is_last_page, self.total) {
            (Some(last), _) => last,
            (None, Some(total)) => self.start_at + self.issues.len() >= total,
            (None, None) => false,
        }
    }
}

#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn search(&self, query: &str, start_at: usize, max_results: usize) -> Result<SearchPage, TicketError>;
}

// ============================================================================
// HTTP client
// ============================================================================

/// Read-only client for the ticket system's search endpoint.
#[derive(Debug, Clone)]
pub struct JiraClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<Arc<Credentials>>,
}

impl JiraClient {
    pub fn new(base_url: &str, timeout: Duration, credentials: Option<Arc<Credentials>>) -> Result<Self, TicketError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string(), credentials })
    }
}

#[async_trait]
impl TicketSource for JiraClient {
    async fn search(&self, query: &str, start_at: usize, max_results: usize) -> Result<SearchPage, TicketError> {
        let url = format!("{}/rest/api/2/search", self.base_url);
        let mut request = self.http.get(&url).query(&[
            ("jql", query.to_string()),
            ("startAt", start_at.to_string()),
            ("maxResults", max_results.to_string()),
        ]);
        if let Some(creds) = &self.credentials {
            request = creds.with_plaintext(|user, pass| request.basic_auth(user, Some(pass)))?;
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TicketError::Status { url, status: status.as_u16() });
        }
        Ok(resp.json::<SearchPage>().await?)
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Tickets from earlier successful searches, keyed by query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketCache {
    #[serde(default)]
    pub queries: BTreeMap<String, Vec<TicketRecord>>,
}

impl TicketCache {
    /// A missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self, TicketError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|source| TicketError::Io { path: path.to_path_buf(), source })?;
        serde_json::from_str(&text).map_err(|e| TicketError::Format { path: path.to_path_buf(), reason: e.to_string() })
    }

    /// Write through a temporary file so readers never see a partial cache.
    pub fn save(&self, path: &Path) -> Result<(), TicketError> {
        let io_err = |source| TicketError::Io { path: path.to_path_buf(), source };
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }

    pub fn get(&self, query: &str) -> Option<&[TicketRecord]> {
        self.queries.get(query).map(Vec::as_slice)
    }
}

// ============================================================================
// Miner
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MiningStatus {
    Live,
    CacheFallback,
    Unavailable,
}

impl fmt::Display for MiningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiningStatus::Live => write!(f, "live"),
            MiningStatus::CacheFallback => write!(f, "cache-fallback"),
            MiningStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningOutcome {
    pub query: String,
    pub status: MiningStatus,
    pub tickets: Vec<TicketRecord>,
    /// Why the live search was not used
    pub error: Option<String>,
}

pub struct TicketMiner {
    source: Option<Arc<dyn TicketSource>>,
    cache_path: PathBuf,
    page_size: usize,
}

impl TicketMiner {
    /// `source` is `None` when no credentials or endpoint are configured;
    /// mining is then cache-only.
    pub fn new(source: Option<Arc<dyn TicketSource>>, cache_path: impl Into<PathBuf>, page_size: usize) -> Self {
        Self { source, cache_path: cache_path.into(), page_size: page_size.max(1) }
    }

    async fn fetch_all(&self, source: &dyn TicketSource, query: &str) -> Result<Vec<TicketRecord>, TicketError> {
        let mut tickets = Vec::new();
        let mut start_at = 0;
        for page_no in 0..MAX_PAGES {
            let page = source.search(query, start_at, self.page_size).await?;
            let n = page.issues.len();
            tickets.extend(page.issues.iter().filter_map(TicketRecord::from_issue));
            debug!(page = page_no, issues = n, "Fetched search page");
            if page.is_last() {
                return Ok(tickets);
            }
            start_at += n;
        }
        warn!(query, pages = MAX_PAGES, "Pagination limit reached");
        Ok(tickets)
    }

    /// Search for `query`. A successful search replaces the cached entry and
    /// writes the cache once; a failed one falls back to the cached entry.
    pub async fn mine(&self, query: &str) -> MiningOutcome {
        let mut cache = match TicketCache::load(&self.cache_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Ticket cache unreadable, ignoring it");
                TicketCache::default()
            }
        };

        let error = match &self.source {
            Some(source) => match self.fetch_all(source.as_ref(), query).await {
                Ok(tickets) => {
                    info!(query, tickets = tickets.len(), "Mined tickets");
                    cache.queries.insert(query.to_string(), tickets.clone());
                    if let Err(e) = cache.save(&self.cache_path) {
                        warn!(error = %e, "Failed to write ticket cache");
                    }
                    return MiningOutcome { query: query.to_string(), status: MiningStatus::Live, tickets, error: None };
                }
                Err(e) => {
                    warn!(query, error = %e, "Ticket search failed");
                    e.to_string()
                }
            },
            None => "no ticket source configured".to_string(),
        };

        match cache.get(query) {
            Some(tickets) => {
                info!(query, tickets = tickets.len(), "Using cached tickets");
                MiningOutcome {
                    query: query.to_string(),
                    status: MiningStatus::CacheFallback,
                    tickets: tickets.to_vec(),
                    error: Some(error),
                }
            }
            None => MiningOutcome {
                query: query.to_string(),
                status: MiningStatus::Unavailable,
                tickets: Vec::new(),
                error: Some(error),
            },
        }
    }
}
