//! ssd-postmortem - SSD telemetry post-mortem pipeline
//!
//! # Usage
//!
//! ```bash
//! # Full run over a telemetry pull
//! ssd-postmortem --binary-dir pull/bin --format-dir layouts --nlog-dir pull/nlog \
//!     --event-catalog formats.py --drive-status "$(cat pull/status.txt)"
//!
//! # Re-run forecasting on an already decoded store
//! ssd-postmortem --ini out/decoded.ini --skip tickets,event-predict
//!
//! # Encrypt a two-line (username, password) ticket credential file
//! ssd-postmortem seal-credentials --from creds.txt --to creds.bin
//! ```
//!
//! # Environment Variables
//!
//! - `POSTMORTEM_CONFIG`: Path to the TOML config (default: ./postmortem.toml)
//! - `POSTMORTEM_PASSPHRASE`: Passphrase of the encrypted credential file
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use ssd_postmortem::config::{PipelineConfig, PoolBackend};
use ssd_postmortem::pipeline::{ArtifactLink, PipelineCoordinator, RunInputs};
use ssd_postmortem::tickets::Credentials;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "ssd-postmortem")]
#[command(about = "Post-mortem analysis of SSD telemetry pulls")]
#[command(version)]
struct CliArgs {
    /// Config file (overrides POSTMORTEM_CONFIG and ./postmortem.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory for every artifact of the run
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Directory of binary telemetry payloads
    #[arg(long)]
    binary_dir: Option<PathBuf>,

    /// Directory of <family>.toml layout catalogs
    #[arg(long)]
    format_dir: Option<PathBuf>,

    /// Previously decoded store to analyze instead of decoding
    #[arg(long)]
    ini: Option<PathBuf>,

    /// Directory of dated nlog captures
    #[arg(long)]
    nlog_dir: Option<PathBuf>,

    /// Event format catalog (literal file with a `formats` dict)
    #[arg(long)]
    event_catalog: Option<PathBuf>,

    /// Drive status string; the assert tag in it is the fault signature
    #[arg(long)]
    drive_status: Option<String>,

    /// Fault signature, overriding the one found in --drive-status
    #[arg(long)]
    signature: Option<String>,

    /// Encrypted ticket-system credential file
    #[arg(long)]
    credentials: Option<PathBuf>,

    #[arg(long, env = "POSTMORTEM_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Phases to skip (comma separated, e.g. lstm,tickets)
    #[arg(long, value_delimiter = ',')]
    skip: Vec<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Worker pool backend: thread, process or sequential
    #[arg(long)]
    backend: Option<PoolBackend>,

    #[arg(long)]
    max_workers: Option<usize>,

    /// Artifact-store record, as RECORD_ID=URL (repeatable)
    #[arg(long = "artifact-link", value_parser = parse_link)]
    artifact_links: Vec<ArtifactLink>,

    /// Also write the run summary JSON here
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Encrypt a two-line (username, password) credential file
    SealCredentials {
        /// Plain-text credential file
        #[arg(long = "from")]
        from: PathBuf,
        /// Encrypted output file
        #[arg(long = "to")]
        to: PathBuf,
    },
}

fn parse_link(s: &str) -> Result<ArtifactLink, String> {
    let (record_id, url) = s
        .split_once('=')
        .ok_or_else(|| format!("expected RECORD_ID=URL, got '{}'", s))?;
    Ok(ArtifactLink { record_id: record_id.to_string(), url: url.to_string() })
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

// ============================================================================
// Commands
// ============================================================================

fn seal_credentials(from: &Path, to: &Path, passphrase: Option<&str>) -> Result<()> {
    let Some(passphrase) = passphrase else {
        bail!("a passphrase is required (--passphrase or POSTMORTEM_PASSPHRASE)");
    };
    let text = std::fs::read_to_string(from).with_context(|| format!("reading {}", from.display()))?;
    let mut lines = text.lines().map(str::trim);
    let (Some(user), Some(pass)) = (lines.next(), lines.next()) else {
        bail!("{} must hold a username line and a password line", from.display());
    };
    let sealed = Credentials::seal(user, pass, passphrase).context("encrypting credentials")?;
    sealed.save(to).with_context(|| format!("writing {}", to.display()))?;
    info!(path = %to.display(), "Credentials sealed");
    Ok(())
}

fn build_config(args: &CliArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::load(),
    };

    if let Some(dir) = &args.output_dir {
        config.run.output_dir.clone_from(dir);
    }
    if let Some(seed) = args.seed {
        config.run.seed = seed;
    }
    config.run.skip.extend(args.skip.iter().map(|s| s.trim().to_string()));
    if let Some(backend) = args.backend {
        config.pool.backend = backend;
    }
    if args.max_workers.is_some() {
        config.pool.max_workers = args.max_workers;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.json_logs);

    if let Some(SubCommand::SealCredentials { from, to }) = &args.command {
        return seal_credentials(from, to, args.passphrase.as_deref());
    }

    let config = build_config(&args)?;
    let inputs = RunInputs {
        binary_dir: args.binary_dir.clone(),
        format_dir: args.format_dir.clone(),
        ini_path: args.ini.clone(),
        nlog_dir: args.nlog_dir.clone(),
        event_catalog: args.event_catalog.clone(),
        drive_status: args.drive_status.clone(),
        fault_signature: args.signature.clone(),
        credentials: args.credentials.clone(),
        passphrase: args.passphrase.clone(),
        artifact_links: args.artifact_links.clone(),
    };

    let coordinator = PipelineCoordinator::new(config, inputs).context("preparing run")?;

    // Ctrl+C stops training at the next epoch boundary
    let cancel = coordinator.context().cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling training jobs");
            cancel.cancel();
        }
    });

    let summary = match coordinator.run().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Run aborted");
            return Err(e).context("post-mortem run aborted");
        }
    };

    let json = serde_json::to_string_pretty(&summary).context("serializing run summary")?;
    if let Some(path) = &args.summary {
        std::fs::write(path, &json).with_context(|| format!("writing {}", path.display()))?;
    }
    println!("{}", json);
    Ok(())
}
