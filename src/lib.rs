//! ssd-postmortem: automated post-mortem analysis of SSD telemetry
//!
//! Turns a telemetry pull from a failed drive into one evidence record.
//!
//! ## Architecture
//!
//! - **Telemetry**: binary payloads decoded into an object store of named
//!   time series, persisted as an INI file
//! - **Forecasting**: per-field ARMA (optionally on the matrix profile) and
//!   a stacked-LSTM encoder-decoder over sliding windows
//! - **Events**: firmware log tokenization against a format catalog and
//!   prediction of the next capture
//! - **Tickets**: defect-ticket mining, embedding, GMM clustering aligned to
//!   known causes, nearest neighbors and cluster-count diagnostics
//! - **Pipeline**: phase driver dispatching jobs through a bounded worker pool
//! - **Report**: every artifact composed into `report.json`

pub mod config;
pub mod embedding;
pub mod events;
pub mod forecast;
pub mod linalg;
pub mod literal;
pub mod lstm;
pub mod pipeline;
pub mod plot;
pub mod pool;
pub mod report;
pub mod telemetry;
pub mod tickets;

pub use config::PipelineConfig;
pub use pipeline::{PipelineCoordinator, PipelineError, RunInputs, RunSummary};
pub use report::ReportData;
pub use telemetry::{FieldValue, Object, ObjectStore};
