//! Firmware event-log analysis.
//!
//! - `nlog`: capture parsing, ERR summary, capture duration
//! - `catalog`: format catalog with matcher regexes and dense signatures
//! - `tokenizer`: description -> (signature, parameters, index), and back
//! - `regression`: event-count width regressor
//! - `predictor`: three sequence models predicting the next capture

pub mod catalog;
pub mod nlog;
pub mod predictor;
pub mod regression;
pub mod tokenizer;

pub use catalog::{CatalogEntry, CatalogError, FormatCatalog, FormatSpec, ParamType};
pub use nlog::{
    capture_duration, load_captures, new_lines, parse_line, summarize, write_summary, Capture, CaptureDuration,
    ErrorSummary, EventLevel, LogEvent, LogTime,
};
pub use predictor::{
    build_dataset, write_predictions, EventDataset, EventPrediction, EventPredictor, SequenceKind, SequenceModel,
};
pub use regression::WidthRegressor;
pub use tokenizer::{render, Param, Token};

use std::path::PathBuf;
use thiserror::Error;

use crate::forecast::ForecastError;

#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("need at least {needed} dated captures, found {available}")]
    InsufficientCaptures { needed: usize, available: usize },

    #[error("{kind} sequence model: {source}")]
    Model {
        kind: SequenceKind,
        #[source]
        source: ForecastError,
    },

    #[error("missing {0} sequence model")]
    MissingModel(SequenceKind),
}
