//! Pipeline Coordinator - drives the nine phases of one post-mortem run.
//!
//! Every phase is entered, completed, skipped or failed exactly once and the
//! outcome goes to `run.log` and to the returned `RunSummary`. Per-job
//! failures inside a phase are exceptions of that phase; only
//! `PipelineError::Fatal` stops the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};

use super::context::{RunContext, RunInputs};
use super::phases::{self, PhaseError, PhaseOutput, RunState};
use super::{Phase, PipelineError};
use crate::config::PipelineConfig;
use crate::events::CaptureDuration;
use crate::pool::PoolStats;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PhaseStatus {
    Completed,
    /// Completed on cached inputs after an external service failed
    CacheFallback,
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    #[serde(flatten)]
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<String>,
    pub elapsed_secs: f64,
}

/// What one run attempted and produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub phases: Vec<PhaseRecord>,
    pub artifacts: Vec<PathBuf>,
    pub exceptions: Vec<String>,
    /// Duration of the most recent nlog capture
    pub capture_duration: Option<CaptureDuration>,
    pub pool: PoolStats,
}

impl RunSummary {
    pub fn status(&self, phase: Phase) -> Option<&PhaseStatus> {
        self.phases.iter().find(|r| r.phase == phase).map(|r| &r.status)
    }

    pub fn completed(&self, phase: Phase) -> bool {
        self.status(phase) == Some(&PhaseStatus::Completed)
    }

    /// Completed, possibly on cached inputs.
    pub fn produced(&self, phase: Phase) -> bool {
        matches!(self.status(phase), Some(PhaseStatus::Completed | PhaseStatus::CacheFallback))
    }
}

/// Pipeline Coordinator owns the run context for the lifetime of a run.
pub struct PipelineCoordinator {
    ctx: RunContext,
}

impl PipelineCoordinator {
    pub fn new(config: PipelineConfig, inputs: RunInputs) -> Result<Self, PipelineError> {
        Ok(Self { ctx: RunContext::new(config, inputs)? })
    }

    pub fn from_context(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run every phase in order.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        let mut state = RunState::default();
        let mut records: Vec<PhaseRecord> = Vec::with_capacity(Phase::ALL.len());

        info!(
            output_dir = %self.ctx.output_dir.display(),
            backend = %self.ctx.pool.backend(),
            workers = self.ctx.pool.size(),
            "Post-mortem run starting"
        );

        for phase in Phase::ALL {
            let record = self.run_phase(phase, &mut state, &records).await?;
            records.push(record);
        }

        let mut exceptions = Vec::new();
        for record in &records {
            exceptions.extend(record.exceptions.iter().map(|e| format!("{}: {}", record.phase, e)));
            if let PhaseStatus::Failed { error } = &record.status {
                exceptions.push(format!("{}: {}", record.phase, error));
            }
        }
        let mut artifacts: Vec<PathBuf> = records.iter().flat_map(|r| r.artifacts.iter().cloned()).collect();
        artifacts.push(self.ctx.log.path().to_path_buf());

        let summary = RunSummary {
            started_at,
            finished_at: Utc::now(),
            output_dir: self.ctx.output_dir.clone(),
            capture_duration: state.event_summary.as_ref().map(|s| s.duration.clone()),
            pool: self.ctx.pool.stats(),
            phases: records,
            artifacts,
            exceptions,
        };
        info!(
            artifacts = summary.artifacts.len(),
            exceptions = summary.exceptions.len(),
            "Post-mortem run finished"
        );
        Ok(summary)
    }

    async fn run_phase(
        &self,
        phase: Phase,
        state: &mut RunState,
        records: &[PhaseRecord],
    ) -> Result<PhaseRecord, PipelineError> {
        let log = &self.ctx.log;
        let record = |status, output: PhaseOutput, t0: Instant| PhaseRecord {
            phase,
            status,
            artifacts: output.artifacts,
            exceptions: output.exceptions,
            elapsed_secs: t0.elapsed().as_secs_f64(),
        };

        let t0 = Instant::now();
        if self.ctx.is_skipped(phase) {
            let reason = "skipped by configuration".to_string();
            log.skip(phase, &reason);
            info!(phase = %phase, "Phase skipped by configuration");
            return Ok(record(PhaseStatus::Skipped { reason }, PhaseOutput::default(), t0));
        }

        log.enter(phase);
        info!(phase = %phase, "Phase started");
        let ctx = &self.ctx;
        let result = match phase {
            Phase::Decode => phases::decode(ctx, state).await,
            Phase::ObjectStore => phases::object_store(ctx, state),
            Phase::Graph => phases::graph(ctx, state).await,
            Phase::Arma => phases::arma(ctx, state).await,
            Phase::Lstm => phases::lstm(ctx, state).await,
            Phase::EventSummarize => phases::event_summarize(ctx, state),
            Phase::EventPredict => phases::event_predict(ctx, state).await,
            Phase::Tickets => phases::tickets(ctx, state).await,
            Phase::Report => phases::report(ctx, state, records),
        };

        match result {
            Ok(output) => {
                for e in &output.exceptions {
                    log.exception(phase, e);
                }
                log.complete(phase, output.detail.clone());
                info!(
                    phase = %phase,
                    artifacts = output.artifacts.len(),
                    exceptions = output.exceptions.len(),
                    elapsed_s = t0.elapsed().as_secs_f64(),
                    cache_fallback = output.cache_fallback,
                    "Phase complete"
                );
                let status = if output.cache_fallback { PhaseStatus::CacheFallback } else { PhaseStatus::Completed };
                Ok(record(status, output, t0))
            }
            Err(PhaseError::Skip(reason)) => {
                log.skip(phase, &reason);
                info!(phase = %phase, reason = %reason, "Phase skipped");
                Ok(record(PhaseStatus::Skipped { reason }, PhaseOutput::default(), t0))
            }
            Err(PhaseError::Failed(e)) => {
                log.exception(phase, &e);
                warn!(phase = %phase, error = %e, "Phase failed");
                Ok(record(PhaseStatus::Failed { error: e }, PhaseOutput::default(), t0))
            }
            Err(PhaseError::Fatal(e)) => {
                log.exception(phase, &e.to_string());
                error!(phase = %phase, error = %e, "Fatal error, aborting run");
                Err(e)
            }
        }
    }
}
