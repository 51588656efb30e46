//! Pipeline Configuration - every analysis tunable as a TOML value
//!
//! Each struct implements `Default` so that a run with no config file present
//! behaves exactly like the stock pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "POSTMORTEM_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "postmortem.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one post-mortem run.
///
/// Load with `PipelineConfig::load()` which searches:
/// 1. `$POSTMORTEM_CONFIG` env var
/// 2. `./postmortem.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Run-wide settings (output directory, seed, skip set)
    #[serde(default)]
    pub run: RunConfig,

    /// Telemetry decoding
    #[serde(default)]
    pub decoder: DecoderConfig,

    /// ARMA forecaster
    #[serde(default)]
    pub arma: ArmaConfig,

    /// LSTM forecaster
    #[serde(default)]
    pub lstm: LstmConfig,

    /// Event tokenizer and predictor
    #[serde(default)]
    pub events: EventConfig,

    /// Ticket mining and clustering
    #[serde(default)]
    pub tickets: TicketConfig,

    /// Worker pool
    #[serde(default)]
    pub pool: PoolConfig,
}

impl PipelineConfig {
    /// Load configuration using the standard search order:
    /// 1. `$POSTMORTEM_CONFIG` environment variable
    /// 2. `./postmortem.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded pipeline config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. Check ./postmortem.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded pipeline config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        for warning in super::validation::validate_unknown_keys(&contents) {
            warn!(path = %path.display(), "{}", warning);
        }
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate value ranges and cross-field consistency.
    ///
    /// All problems are collected so a user sees every mistake at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        // Run
        for name in &self.run.skip {
            if crate::pipeline::Phase::from_name(name).is_none() {
                errors.push(format!("run.skip: unknown phase '{}'", name));
            }
        }

        // ARMA
        let a = &self.arma;
        if a.min_samples < 3 {
            errors.push(format!("arma.min_samples ({}) must be at least 3", a.min_samples));
        }
        if !(a.horizon_fraction > 0.0 && a.horizon_fraction < 1.0) {
            errors.push(format!(
                "arma.horizon_fraction ({}) must be in (0, 1)",
                a.horizon_fraction
            ));
        }
        if a.min_horizon > a.max_horizon {
            errors.push(format!(
                "arma.min_horizon ({}) must not exceed arma.max_horizon ({})",
                a.min_horizon, a.max_horizon
            ));
        }
        if let Some(w) = a.matrix_profile_window {
            if w < 2 {
                errors.push(format!("arma.matrix_profile_window ({}) must be at least 2", w));
            }
        }

        // LSTM
        let l = &self.lstm;
        if l.input_width == 0 || l.label_width == 0 {
            errors.push("lstm.input_width and lstm.label_width must be positive".to_string());
        }
        if l.hidden_units == 0 {
            errors.push("lstm.hidden_units must be positive".to_string());
        }
        if l.num_layers == 0 {
            errors.push("lstm.num_layers must be positive".to_string());
        }
        if !(0.0..1.0).contains(&l.dropout) {
            errors.push(format!("lstm.dropout ({}) must be in [0, 1)", l.dropout));
        }
        if l.batch_size == 0 {
            errors.push("lstm.batch_size must be positive".to_string());
        }
        if !(l.test_fraction > 0.0 && l.test_fraction < 1.0) {
            errors.push(format!("lstm.test_fraction ({}) must be in (0, 1)", l.test_fraction));
        }
        if l.learning_rate <= 0.0 {
            errors.push(format!("lstm.learning_rate ({}) must be positive", l.learning_rate));
        }
        if l.embedded_encoding && l.embedding_rank == 0 {
            errors.push("lstm.embedding_rank must be positive when embedded_encoding is on".to_string());
        }

        // Events
        let e = &self.events;
        if e.signature_dim == 0 {
            errors.push("events.signature_dim must be positive".to_string());
        }
        if e.input_size == 0 || e.max_output_size == 0 {
            errors.push("events.input_size and events.max_output_size must be positive".to_string());
        }

        // Tickets
        let t = &self.tickets;
        if t.neighbors == 0 {
            errors.push("tickets.neighbors must be positive".to_string());
        }
        if !(t.top_fraction > 0.0 && t.top_fraction <= 1.0) {
            errors.push(format!("tickets.top_fraction ({}) must be in (0, 1]", t.top_fraction));
        }
        if t.max_k < 2 {
            errors.push(format!("tickets.max_k ({}) must be at least 2", t.max_k));
        }
        if t.restarts == 0 {
            errors.push("tickets.restarts must be positive".to_string());
        }

        // Pool
        if self.pool.job_timeout_secs == 0 {
            errors.push("pool.job_timeout_secs must be positive".to_string());
        }
        if self.pool.max_workers == Some(0) {
            errors.push("pool.max_workers must be positive when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Run
// ============================================================================

/// Run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory every artifact of the run is written under
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Seed shared by every stochastic step (init, shuffling, restarts)
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Phase names to skip (e.g. `["lstm", "tickets"]`)
    #[serde(default)]
    pub skip: Vec<String>,
}

fn default_output_dir() -> PathBuf { PathBuf::from("postmortem-out") }
fn default_seed() -> u64 { 42 }

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            seed: default_seed(),
            skip: Vec::new(),
        }
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Telemetry decoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// File name of the decoded store inside the output directory
    #[serde(default = "default_ini_name")]
    pub ini_name: String,

    /// Objects the forecasting phases operate on (empty = every decoded object)
    #[serde(default = "default_objects_of_interest")]
    pub objects_of_interest: Vec<String>,
}

fn default_ini_name() -> String { "decoded.ini".to_string() }
fn default_objects_of_interest() -> Vec<String> {
    [44, 45, 46, 47, 48, 49, 58, 181, 182, 191, 198, 205]
        .iter()
        .map(|n| format!("uid-{}", n))
        .collect()
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            ini_name: default_ini_name(),
            objects_of_interest: default_objects_of_interest(),
        }
    }
}

// ============================================================================
// ARMA
// ============================================================================

/// ARMA forecaster settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmaConfig {
    /// Largest AR order searched
    #[serde(default = "default_max_pq")]
    pub max_p: usize,

    /// Largest differencing order searched
    #[serde(default = "default_max_d")]
    pub max_d: usize,

    /// Largest MA order searched
    #[serde(default = "default_max_pq")]
    pub max_q: usize,

    /// Minimum series length accepted
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Default horizon as a fraction of the input length
    #[serde(default = "default_horizon_fraction")]
    pub horizon_fraction: f64,

    #[serde(default = "default_min_horizon")]
    pub min_horizon: usize,

    #[serde(default = "default_max_horizon")]
    pub max_horizon: usize,

    /// Replace the series by its matrix profile with this window before fitting
    #[serde(default)]
    pub matrix_profile_window: Option<usize>,

    /// Tail samples held out when scoring a fit
    #[serde(default = "default_holdout")]
    pub holdout: usize,
}

fn default_max_pq() -> usize { 5 }
fn default_max_d() -> usize { 2 }
fn default_min_samples() -> usize { 20 }
fn default_horizon_fraction() -> f64 { 0.1 }
fn default_min_horizon() -> usize { 5 }
fn default_max_horizon() -> usize { 200 }
fn default_holdout() -> usize { 10 }

impl Default for ArmaConfig {
    fn default() -> Self {
        Self {
            max_p: default_max_pq(),
            max_d: default_max_d(),
            max_q: default_max_pq(),
            min_samples: default_min_samples(),
            horizon_fraction: default_horizon_fraction(),
            min_horizon: default_min_horizon(),
            max_horizon: default_max_horizon(),
            matrix_profile_window: None,
            holdout: default_holdout(),
        }
    }
}

// ============================================================================
// LSTM
// ============================================================================

/// Gradient optimizer used by the sequence models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
    Rmsprop,
}

/// LSTM forecaster settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmConfig {
    #[serde(default = "default_input_width")]
    pub input_width: usize,

    #[serde(default = "default_label_width")]
    pub label_width: usize,

    #[serde(default = "default_shift")]
    pub shift: usize,

    #[serde(default = "default_hidden_units")]
    pub hidden_units: usize,

    /// Stacked recurrent layers
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Inverted dropout rate between recurrent layers (0 disables)
    #[serde(default)]
    pub dropout: f64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,

    /// Epochs without training-loss improvement before stopping
    #[serde(default = "default_patience")]
    pub patience: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_optimizer")]
    pub optimizer: OptimizerKind,

    /// Insert a low-rank bottleneck before the output projection
    #[serde(default)]
    pub embedded_encoding: bool,

    #[serde(default = "default_embedding_rank")]
    pub embedding_rank: usize,

    /// Integer-encode categorical columns before windowing
    #[serde(default = "default_true")]
    pub categorical_encoding: bool,

    /// Held-out tail fraction used for evaluation
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
}

fn default_input_width() -> usize { 70 }
fn default_label_width() -> usize { 20 }
fn default_shift() -> usize { 2 }
fn default_hidden_units() -> usize { 128 }
fn default_num_layers() -> usize { 2 }
fn default_batch_size() -> usize { 32 }
fn default_max_epochs() -> usize { 2096 }
fn default_patience() -> usize { 20 }
fn default_learning_rate() -> f64 { 0.001 }
fn default_optimizer() -> OptimizerKind { OptimizerKind::Adam }
fn default_embedding_rank() -> usize { 8 }
fn default_true() -> bool { true }
fn default_test_fraction() -> f64 { 0.1 }

impl Default for LstmConfig {
    fn default() -> Self {
        Self {
            input_width: default_input_width(),
            label_width: default_label_width(),
            shift: default_shift(),
            hidden_units: default_hidden_units(),
            num_layers: default_num_layers(),
            dropout: 0.0,
            batch_size: default_batch_size(),
            max_epochs: default_max_epochs(),
            patience: default_patience(),
            learning_rate: default_learning_rate(),
            optimizer: default_optimizer(),
            embedded_encoding: false,
            embedding_rank: default_embedding_rank(),
            categorical_encoding: default_true(),
            test_fraction: default_test_fraction(),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Linear model family used by the event-count width regressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidthModel {
    /// Ordinary least squares
    Default,
    Ridge,
    Lasso,
    Elastic,
}

/// Event tokenizer and predictor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Dimension of the dense catalog signatures
    #[serde(default = "default_signature_dim")]
    pub signature_dim: usize,

    /// Parameter slots per event (the catalog index takes one more)
    #[serde(default = "default_max_params")]
    pub max_params: usize,

    /// Padded input sequence length of the sequence models
    #[serde(default = "default_input_size")]
    pub input_size: usize,

    /// Padded output sequence length of the sequence models
    #[serde(default = "default_max_output_size")]
    pub max_output_size: usize,

    #[serde(default = "default_width_model")]
    pub width_model: WidthModel,

    /// Hidden units of each sequence model
    #[serde(default = "default_event_hidden")]
    pub hidden_units: usize,

    #[serde(default = "default_event_epochs")]
    pub max_epochs: usize,

    /// Header lines skipped at the top of every log capture
    #[serde(default = "default_header_lines")]
    pub header_lines: usize,
}

fn default_signature_dim() -> usize { 50 }
fn default_max_params() -> usize { 8 }
fn default_input_size() -> usize { 4000 }
fn default_max_output_size() -> usize { 1000 }
fn default_width_model() -> WidthModel { WidthModel::Elastic }
fn default_event_hidden() -> usize { 32 }
fn default_event_epochs() -> usize { 200 }
fn default_header_lines() -> usize { 5 }

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            signature_dim: default_signature_dim(),
            max_params: default_max_params(),
            input_size: default_input_size(),
            max_output_size: default_max_output_size(),
            width_model: default_width_model(),
            hidden_units: default_event_hidden(),
            max_epochs: default_event_epochs(),
            header_lines: default_header_lines(),
        }
    }
}

// ============================================================================
// Tickets
// ============================================================================

/// Ticket mining and clustering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketConfig {
    /// Ticket system base URL (search endpoint is appended)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Known-cause wiki page URL
    #[serde(default)]
    pub wiki_url: Option<String>,

    /// Local ticket cache, keyed by query
    #[serde(default = "default_ticket_cache")]
    pub cache_path: PathBuf,

    /// Local known-cause cache, keyed by fault signature
    #[serde(default = "default_known_cause_cache")]
    pub known_cause_cache: PathBuf,

    /// Document with a `noiseKeys` list
    #[serde(default)]
    pub noise_path: Option<PathBuf>,

    /// Dimension of the sentence embeddings
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Truncated SVD components before clustering
    #[serde(default = "default_svd_components")]
    pub svd_components: usize,

    /// Neighbors emitted per ticket
    #[serde(default = "default_neighbors")]
    pub neighbors: usize,

    /// Fraction of each cluster (by log-likelihood) kept in the neighbor table
    #[serde(default = "default_top_fraction")]
    pub top_fraction: f64,

    /// Largest component count evaluated by the diagnostics
    #[serde(default = "default_max_k")]
    pub max_k: usize,

    /// Restarts per k in the diagnostics
    #[serde(default = "default_restarts")]
    pub restarts: usize,

    /// Search results requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// HTTP request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_ticket_cache() -> PathBuf { PathBuf::from("ticket_cache.json") }
fn default_known_cause_cache() -> PathBuf { PathBuf::from("known_causes.toml") }
fn default_embedding_dim() -> usize { 384 }
fn default_svd_components() -> usize { 100 }
fn default_neighbors() -> usize { 3 }
fn default_top_fraction() -> f64 { 0.25 }
fn default_max_k() -> usize { 20 }
fn default_restarts() -> usize { 5 }
fn default_page_size() -> usize { 50 }
fn default_request_timeout() -> u64 { 30 }

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            wiki_url: None,
            cache_path: default_ticket_cache(),
            known_cause_cache: default_known_cause_cache(),
            noise_path: None,
            embedding_dim: default_embedding_dim(),
            svd_components: default_svd_components(),
            neighbors: default_neighbors(),
            top_fraction: default_top_fraction(),
            max_k: default_max_k(),
            restarts: default_restarts(),
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

/// Worker pool backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolBackend {
    /// Blocking threads on the async runtime
    Thread,
    /// Dedicated CPU pool for compute-bound jobs
    Process,
    /// One job at a time, still under the per-job timeout
    Sequential,
}

impl std::fmt::Display for PoolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolBackend::Thread => write!(f, "thread"),
            PoolBackend::Process => write!(f, "process"),
            PoolBackend::Sequential => write!(f, "sequential"),
        }
    }
}

impl std::str::FromStr for PoolBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thread" => Ok(PoolBackend::Thread),
            "process" => Ok(PoolBackend::Process),
            "sequential" => Ok(PoolBackend::Sequential),
            other => Err(format!("unknown pool backend '{}' (thread, process, sequential)", other)),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_backend")]
    pub backend: PoolBackend,

    /// Upper bound on the pool size (defaults to the CPU count)
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// Per-job timeout
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
}

fn default_backend() -> PoolBackend { PoolBackend::Process }
fn default_job_timeout() -> u64 { 3600 }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_workers: None,
            job_timeout_secs: default_job_timeout(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
