//! Per-run context handed to every phase.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::run_log::RunLog;
use super::{Phase, PipelineError};
use crate::config::PipelineConfig;
use crate::embedding::{HashingEmbedder, SentenceEmbedder};
use crate::pool::WorkerPool;

/// A record already uploaded to the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLink {
    pub record_id: String,
    pub url: String,
}

/// File-shaped inputs of one run. Every input is optional; a phase whose
/// inputs are absent is skipped.
#[derive(Clone, Default)]
pub struct RunInputs {
    /// Directory of binary telemetry payloads
    pub binary_dir: Option<PathBuf>,
    /// Directory of `<family>.toml` layout catalogs
    pub format_dir: Option<PathBuf>,
    /// Previously decoded store, used when there is nothing to decode
    pub ini_path: Option<PathBuf>,
    /// Directory of dated nlog captures
    pub nlog_dir: Option<PathBuf>,
    /// Event format catalog (literal file)
    pub event_catalog: Option<PathBuf>,
    /// Drive status string carrying the assert tag
    pub drive_status: Option<String>,
    /// Fault signature, overriding the one extracted from `drive_status`
    pub fault_signature: Option<String>,
    /// Encrypted ticket-system credentials
    pub credentials: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub artifact_links: Vec<ArtifactLink>,
}

impl RunInputs {
    /// Explicit signature, else the assert tag found in the drive status.
    pub fn signature(&self) -> Option<String> {
        self.fault_signature
            .clone()
            .or_else(|| self.drive_status.as_deref().and_then(crate::tickets::extract_assert_tag))
    }
}

impl fmt::Debug for RunInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunInputs")
            .field("binary_dir", &self.binary_dir)
            .field("format_dir", &self.format_dir)
            .field("ini_path", &self.ini_path)
            .field("nlog_dir", &self.nlog_dir)
            .field("event_catalog", &self.event_catalog)
            .field("drive_status", &self.drive_status)
            .field("fault_signature", &self.fault_signature)
            .field("credentials", &self.credentials)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("artifact_links", &self.artifact_links)
            .finish()
    }
}

pub struct RunContext {
    pub config: PipelineConfig,
    pub inputs: RunInputs,
    pub output_dir: PathBuf,
    pub pool: WorkerPool,
    pub log: RunLog,
    pub embedder: Arc<dyn SentenceEmbedder>,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Create the output directory, the run log and the worker pool.
    pub fn new(config: PipelineConfig, inputs: RunInputs) -> Result<Self, PipelineError> {
        let output_dir = config.run.output_dir.clone();
        std::fs::create_dir_all(&output_dir)
            .map_err(|source| PipelineError::Io { path: output_dir.clone(), source })?;
        let pool = WorkerPool::from_config(&config.pool)?;
        let log = RunLog::create(&output_dir)?;
        let embedder: Arc<dyn SentenceEmbedder> = Arc::new(HashingEmbedder::new(config.tickets.embedding_dim));
        Ok(Self { config, inputs, output_dir, pool, log, embedder, cancel: CancellationToken::new() })
    }

    pub fn is_skipped(&self, phase: Phase) -> bool {
        self.config.run.skip.iter().any(|s| s == phase.name())
    }

    pub fn seed(&self) -> u64 {
        self.config.run.seed
    }

    /// `<output_dir>/<name>`, created on demand.
    pub fn subdir(&self, name: &str) -> Result<PathBuf, PipelineError> {
        let dir = self.output_dir.join(name);
        std::fs::create_dir_all(&dir).map_err(|source| PipelineError::Io { path: dir.clone(), source })?;
        Ok(dir)
    }

    pub fn output_path(&self, file: impl AsRef<Path>) -> PathBuf {
        self.output_dir.join(file)
    }
}
