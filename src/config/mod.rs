//! Pipeline Configuration Module
//!
//! Provides per-run configuration loaded from TOML files. Every tunable of the
//! analysis phases (decoder selection, forecaster hyperparameters, event model
//! sizes, ticket clustering, worker pool) lives here with a built-in default.
//!
//! ## Loading Order
//!
//! 1. `POSTMORTEM_CONFIG` environment variable (path to TOML file)
//! 2. `postmortem.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! The configuration is not global. Load it once and move it into the
//! run context that every phase receives:
//!
//! ```ignore
//! let config = PipelineConfig::load();
//! let ctx = RunContext::new(config, inputs)?;
//! ```

mod pipeline_config;
pub mod validation;

pub use pipeline_config::*;
