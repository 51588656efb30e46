//! Known-cause lookup from the fault-signature wiki, with a TOML cache.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::TicketError;

const KNOWN_CAUSES: &str = "Known Causes</h3>";
const FIRMWARE_DATA: &str = "Firmware Data Necessary for Analysis</h3>";
const TICKETS: &str = "Jiras</h3>";
/// Headings that end any section.
const SECTION_ENDS: [&str; 5] = [
    KNOWN_CAUSES,
    FIRMWARE_DATA,
    "Firmware Software Prevention</h3>",
    "ASIC - Hardware Components</h3>",
    TICKETS,
];

/// Telemetry object a wiki page asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareDatum {
    /// `0` when the page lists only a name
    pub uid: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownCauses {
    #[serde(default)]
    pub causes: Vec<String>,
    #[serde(default)]
    pub firmware_data: Vec<FirmwareDatum>,
}

/// Text after `start` up to the nearest section heading.
fn section<'a>(html: &'a str, start: &str) -> &'a str {
    let Some((_, rest)) = html.split_once(start) else { return "" };
    SECTION_ENDS
        .iter()
        .filter_map(|end| rest.find(end))
        .min()
        .map_or(rest, |i| &rest[..i])
}

/// Non-empty text runs between HTML tags.
fn text_runs(fragment: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_tag = false;
    for c in fragment.chars() {
        match c {
            '<' => {
                in_tag = true;
                push_run(&mut out, &mut current);
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => current.push(c),
            _ => {}
        }
    }
    push_run(&mut out, &mut current);
    out
}

fn push_run(out: &mut Vec<String>, current: &mut String) {
    let run = current.trim();
    if !run.is_empty() {
        out.push(run.to_string());
    }
    current.clear();
}

/// Extract known causes and requested firmware data from a wiki page.
/// A page whose title starts with "page not found" is an error.
pub fn parse_known_causes(signature: &str, html: &str) -> Result<KnownCauses, TicketError> {
    let title = html
        .split_once("<title>")
        .and_then(|(_, rest)| rest.split_once("</title>"))
        .map_or("", |(t, _)| t);
    if title.trim().to_lowercase().starts_with("page not found") {
        return Err(TicketError::PageNotFound(signature.to_string()));
    }

    let causes = text_runs(section(html, KNOWN_CAUSES));
    let firmware_data = text_runs(section(html, FIRMWARE_DATA))
        .into_iter()
        .map(|item| {
            let parts: Vec<&str> = item.split(',').map(str::trim).collect();
            let name = parts.last().copied().unwrap_or_default().to_string();
            let uid = if parts.len() < 2 { "0".to_string() } else { parts[0].to_string() };
            FirmwareDatum { uid, name }
        })
        .collect();
    Ok(KnownCauses { causes, firmware_data })
}

// ============================================================================
// Sources
// ============================================================================

#[async_trait]
pub trait KnownCauseSource: Send + Sync {
    /// Raw HTML of the page for `signature`.
    async fn fetch_page(&self, signature: &str) -> Result<String, TicketError>;
}

#[derive(Debug, Clone)]
pub struct WikiClient {
    http: reqwest::Client,
    base_url: String,
}

impl WikiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TicketError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl KnownCauseSource for WikiClient {
    async fn fetch_page(&self, signature: &str) -> Result<String, TicketError> {
        let url = format!("{}/{}", self.base_url, signature);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TicketError::Status { url, status: status.as_u16() });
        }
        Ok(resp.text().await?)
    }
}

/// Known causes already resolved, keyed by fault signature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnownCauseCache {
    #[serde(default)]
    pub signatures: BTreeMap<String, KnownCauses>,
}

impl KnownCauseCache {
    pub fn load(path: &Path) -> Result<Self, TicketError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|source| TicketError::Io { path: path.to_path_buf(), source })?;
        toml::from_str(&text).map_err(|e| TicketError::Format { path: path.to_path_buf(), reason: e.to_string() })
    }

    pub fn save(&self, path: &Path) -> Result<(), TicketError> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| TicketError::Format { path: path.to_path_buf(), reason: e.to_string() })?;
        std::fs::write(path, text).map_err(|source| TicketError::Io { path: path.to_path_buf(), source })
    }
}

/// Cache first, then the wiki; fresh results are written back.
pub struct KnownCauseResolver {
    source: Option<Arc<dyn KnownCauseSource>>,
    cache_path: PathBuf,
}

impl KnownCauseResolver {
    pub fn new(source: Option<Arc<dyn KnownCauseSource>>, cache_path: impl Into<PathBuf>) -> Self {
        Self { source, cache_path: cache_path.into() }
    }

    pub async fn resolve(&self, signature: &str) -> Result<KnownCauses, TicketError> {
        let mut cache = KnownCauseCache::load(&self.cache_path).unwrap_or_else(|e| {
            warn!(error = %e, "Known-cause cache unreadable, ignoring it");
            KnownCauseCache::default()
        });
        if let Some(hit) = cache.signatures.get(signature).filter(|k| !k.causes.is_empty()) {
            return Ok(hit.clone());
        }

        let source = self.source.as_ref().ok_or_else(|| TicketError::NoKnownCauses(signature.to_string()))?;
        let html = source.fetch_page(signature).await?;
        let found = parse_known_causes(signature, &html)?;
        if found.causes.is_empty() {
            return Err(TicketError::NoKnownCauses(signature.to_string()));
        }
        info!(signature, causes = found.causes.len(), "Resolved known causes");
        cache.signatures.insert(signature.to_string(), found.clone());
        if let Err(e) = cache.save(&self.cache_path) {
            warn!(error = %e, "Failed to write known-cause cache");
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "<html><head><title>ASSERT_DF049 - Wiki</title></head><body>\
        <h3>Known Causes</h3><ul><li>Thermal throttle timeout</li><li>Read retry exhausted</li>\
        <li> </li></ul><h3>Firmware Data Necessary for Analysis</h3><p>44, ThermalLog</p>\
        <p>EventTrace</p><h3>Jiras</h3><p>FW-1</p></body></html>";

    struct StaticPage(&'static str);

    #[async_trait]
    impl KnownCauseSource for StaticPage {
        async fn fetch_page(&self, _signature: &str) -> Result<String, TicketError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_sections_between_markers() {
        let k = parse_known_causes("ASSERT_DF049", PAGE).unwrap();
        assert_eq!(k.causes, vec!["Thermal throttle timeout", "Read retry exhausted"]);
        assert_eq!(
            k.firmware_data,
            vec![
                FirmwareDatum { uid: "44".into(), name: "ThermalLog".into() },
                FirmwareDatum { uid: "0".into(), name: "EventTrace".into() },
            ]
        );
    }

    #[test]
    fn test_page_not_found() {
        let page = "<title>Page Not Found</title><h3>Known Causes</h3>x";
        assert!(matches!(parse_known_causes("X", page), Err(TicketError::PageNotFound(_))));
    }

    #[tokio::test]
    async fn test_resolver_caches_by_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known.toml");
        let live = KnownCauseResolver::new(Some(Arc::new(StaticPage(PAGE))), &path);
        assert_eq!(live.resolve("ASSERT_DF049").await.unwrap().causes.len(), 2);

        let offline = KnownCauseResolver::new(None, &path);
        assert_eq!(offline.resolve("ASSERT_DF049").await.unwrap().causes.len(), 2);
        assert!(matches!(offline.resolve("ASSERT_XX1").await, Err(TicketError::NoKnownCauses(_))));
    }
}
