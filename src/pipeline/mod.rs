//! Post-Mortem Pipeline
//!
//! ## Phase Sequence
//!
//! ```text
//! PHASE 1: decode          binary payloads + layout catalog -> decoded.ini
//! PHASE 2: object-store    publish the store (or load an existing INI)
//! PHASE 3: graph           one time-series plot per object of interest
//! PHASE 4: arma            per-(object, field) ARMA forecasts   [worker pool]
//! PHASE 5: lstm            per-(object, field) LSTM forecasts   [worker pool]
//! PHASE 6: event-summarize nlog captures -> ERR summary
//! PHASE 7: event-predict   format catalog + captures -> next capture [worker pool]
//! PHASE 8: tickets         mine -> embed -> cluster -> diagnostics
//! PHASE 9: report          ReportData -> report.json
//! ```
//!
//! Phases 3-5 only read the object store. Phase 7 needs the captures loaded
//! by phase 6. Phase 8 is independent of 3-7. A phase failure is recorded in
//! `run.log` and the summary; only a `PipelineError::Fatal` aborts the run.

mod context;
mod coordinator;
mod phases;
mod run_log;

pub use context::{ArtifactLink, RunContext, RunInputs};
pub use coordinator::{PipelineCoordinator, PhaseRecord, PhaseStatus, RunSummary};
pub use run_log::{read_entries, RunLog, RunLogEntry, RunLogEvent, RUN_LOG_FILE};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::pool::PoolError;

/// The nine phases, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Decode,
    ObjectStore,
    Graph,
    Arma,
    Lstm,
    EventSummarize,
    EventPredict,
    Tickets,
    Report,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Decode,
        Phase::ObjectStore,
        Phase::Graph,
        Phase::Arma,
        Phase::Lstm,
        Phase::EventSummarize,
        Phase::EventPredict,
        Phase::Tickets,
        Phase::Report,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Decode => "decode",
            Phase::ObjectStore => "object-store",
            Phase::Graph => "graph",
            Phase::Arma => "arma",
            Phase::Lstm => "lstm",
            Phase::EventSummarize => "event-summarize",
            Phase::EventPredict => "event-predict",
            Phase::Tickets => "tickets",
            Phase::Report => "report",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// An input the run cannot do without is unusable.
    #[error("fatal error in {phase} phase ({input}): {source}")]
    Fatal {
        phase: Phase,
        input: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_name(phase.name()), Some(phase));
        }
        assert_eq!(Phase::from_name("graphs"), None);
    }

    #[test]
    fn test_phase_serializes_kebab_case() {
        let json = serde_json::to_string(&Phase::EventSummarize).unwrap();
        assert_eq!(json, "\"event-summarize\"");
    }
}
