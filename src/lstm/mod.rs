//! LSTM encoder-decoder forecasting over sliding windows.
//!
//! - `cell`: LSTM layer and dense layer with manual backpropagation
//! - `network`: stacked layers, optional bottleneck, multi-step head
//! - `training`: mini-batch optimizers, clipping, early stopping
//! - `window`: example generation
//! - `encoding`: z-score normalizer and categorical codes
//! - `checkpoint`: per-job JSON snapshots
//! - `forecaster`: the per-object multivariate job

pub mod cell;
pub mod checkpoint;
pub mod encoding;
pub mod forecaster;
pub mod network;
pub mod training;
pub mod window;

pub use checkpoint::{checkpoint_path, LstmCheckpoint};
pub use encoding::{CategoricalEncoder, Normalizer};
pub use forecaster::{prepare_field, prepare_fields, run_lstm_job, FeatureColumn, LstmForecaster, LstmJob, LstmOutcome};
pub use network::{NetworkConfig, Seq2SeqNetwork};
pub use training::{train, Optimizer, TrainingOptions, TrainingReport};
pub use window::{make_windows, Example, WindowSpec};
