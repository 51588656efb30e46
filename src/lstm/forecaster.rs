//! Windowed LSTM forecaster over the fields of one object.
//!
//! Every usable field of the object becomes one feature column, so a job
//! trains a single multivariate model. The last `test_fraction` of the
//! windows (in time order) is held out for MAE; the normalizer is fitted on
//! the samples the training windows cover. The final forecast starts
//! `shift` samples past the end of the series, matching the label offset
//! used in training.

use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::checkpoint::{checkpoint_path, save_to_disk, LstmCheckpoint, CHECKPOINT_VERSION};
use super::encoding::{CategoricalEncoder, Normalizer};
use super::network::{NetworkConfig, Seq2SeqNetwork};
use super::training::{train, TrainingOptions, TrainingReport};
use super::window::{make_windows, WindowSpec};
use crate::config::LstmConfig;
use crate::forecast::artifacts::{write_object_plot, PlotColumn};
use crate::forecast::{ForecastArtifact, ForecastError};
use crate::telemetry::FieldValue;

/// Checkpoint job name; one model per object.
pub const CHECKPOINT_JOB: &str = "lstm";

pub struct LstmOutcome {
    pub examples: usize,
    pub train_examples: usize,
    pub test_examples: usize,
    pub mae: Option<f64>,
    /// Holdout MAE per feature column
    pub feature_mae: Vec<Option<f64>>,
    /// Denormalized predictions for each held-out window
    pub holdout_predictions: Vec<Vec<Vec<f64>>>,
    /// `label_width` rows of features, in original units
    pub forecast: Vec<Vec<f64>>,
    pub report: TrainingReport,
    pub network: Seq2SeqNetwork,
    pub normalizer: Normalizer,
}

pub struct LstmForecaster {
    config: LstmConfig,
    seed: u64,
}

impl LstmForecaster {
    pub fn new(config: LstmConfig, seed: u64) -> Self {
        Self { config, seed }
    }

    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec::new(self.config.input_width, self.config.label_width, self.config.shift)
    }

    pub fn network_config(&self, features: usize) -> NetworkConfig {
        NetworkConfig {
            input_features: features,
            hidden_units: self.config.hidden_units,
            num_layers: self.config.num_layers,
            dropout: self.config.dropout,
            bottleneck: self.config.embedded_encoding.then_some(self.config.embedding_rank),
            output_steps: self.config.label_width,
            output_features: features,
        }
    }

    pub fn model_name(&self) -> String {
        format!("LSTM({}x{})", self.config.hidden_units, self.config.num_layers)
    }

    /// Train on `rows` (time-major) and forecast the next window.
    pub fn fit_forecast(&self, rows: &[Vec<f64>], cancel: Option<&CancellationToken>) -> Result<LstmOutcome, ForecastError> {
        let spec = self.window_spec();
        let count = spec.example_count(rows.len());
        if count == 0 {
            return Err(ForecastError::NoExamples { needed: spec.total_width(), available: rows.len() });
        }
        let features = rows[0].len();

        let test_count = ((count as f64 * self.config.test_fraction).floor() as usize).min(count - 1);
        let train_count = count - test_count;
        let covered = (train_count - 1 + spec.total_width()).min(rows.len());
        let normalizer = Normalizer::fit(&rows[..covered]);
        let normalized: Vec<Vec<f64>> = rows.iter().map(|r| normalizer.normalize(r)).collect();

        let examples = make_windows(&normalized, &spec);
        let (train_set, test_set) = examples.split_at(train_count);

        let mut network = Seq2SeqNetwork::new(self.network_config(features), self.seed);
        let options = TrainingOptions {
            batch_size: self.config.batch_size,
            max_epochs: self.config.max_epochs,
            patience: self.config.patience,
            learning_rate: self.config.learning_rate,
            optimizer: self.config.optimizer,
            seed: self.seed,
        };
        let report = train(&mut network, train_set, &options, cancel)?;

        let mut abs_err = vec![0.0; features];
        let mut n = 0usize;
        let mut holdout_predictions = Vec::with_capacity(test_set.len());
        for ex in test_set {
            let predicted = normalizer.denormalize_flat(&network.predict(&ex.input));
            let actual = normalizer.denormalize_flat(&ex.target);
            for (p_row, a_row) in predicted.iter().zip(&actual) {
                for (err, (p, a)) in abs_err.iter_mut().zip(p_row.iter().zip(a_row)) {
                    *err += (p - a).abs();
                }
                n += 1;
            }
            holdout_predictions.push(predicted);
        }
        let feature_mae: Vec<Option<f64>> = abs_err.iter().map(|e| (n > 0).then(|| e / n as f64)).collect();
        let mae = (n > 0).then(|| abs_err.iter().sum::<f64>() / (n * features) as f64);

        let last_input = normalized[rows.len() - spec.input_width..].to_vec();
        let forecast = normalizer.denormalize_flat(&network.predict(&last_input));

        Ok(LstmOutcome {
            examples: count,
            train_examples: train_count,
            test_examples: test_set.len(),
            mae,
            feature_mae,
            holdout_predictions,
            forecast,
            report,
            network,
            normalizer,
        })
    }
}

/// Turn a field into one feature column, integer-encoding categories.
///
/// Missing numeric samples are forward-filled (leading gaps take the first
/// finite value).
pub fn prepare_field(
    value: &FieldValue,
    categorical_encoding: bool,
) -> Result<(Vec<f64>, Option<CategoricalEncoder>), ForecastError> {
    match value {
        FieldValue::Numeric(values) => {
            let first = values.iter().copied().find(|v| v.is_finite()).ok_or_else(|| {
                ForecastError::InsufficientData { reason: "no finite samples".to_string() }
            })?;
            let mut last = first;
            let column = values
                .iter()
                .map(|v| {
                    if v.is_finite() {
                        last = *v;
                    }
                    last
                })
                .collect();
            Ok((column, None))
        }
        FieldValue::Categorical(labels) if categorical_encoding => {
            let encoder = CategoricalEncoder::fit(labels);
            let column = labels.iter().map(|l| encoder.encode(l).unwrap_or(0.0)).collect();
            Ok((column, Some(encoder)))
        }
        FieldValue::Categorical(_) => Err(ForecastError::InsufficientData {
            reason: "categorical field with categorical encoding disabled".to_string(),
        }),
        _ => Err(ForecastError::InsufficientData { reason: "field is not a series".to_string() }),
    }
}

/// One model feature: the field it came from and its category codes.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureColumn {
    pub field: String,
    pub encoder: Option<CategoricalEncoder>,
}

/// Time-major rows over every usable field of an object.
///
/// Fields that cannot be encoded are left out; rows are cut to the shortest
/// column. Fails only when no field is usable.
pub fn prepare_fields(
    fields: &[(String, FieldValue)],
    categorical_encoding: bool,
) -> Result<(Vec<Vec<f64>>, Vec<FeatureColumn>), ForecastError> {
    let mut columns = Vec::new();
    let mut features = Vec::new();
    for (field, value) in fields {
        match prepare_field(value, categorical_encoding) {
            Ok((column, encoder)) => {
                columns.push(column);
                features.push(FeatureColumn { field: field.clone(), encoder });
            }
            Err(e) => debug!(field = %field, error = %e, "Field left out of the LSTM features"),
        }
    }
    let len = columns.iter().map(Vec::len).min().ok_or_else(|| ForecastError::InsufficientData {
        reason: "no numeric or categorical fields".to_string(),
    })?;
    let rows = (0..len).map(|t| columns.iter().map(|c| c[t]).collect()).collect();
    Ok((rows, features))
}

/// Argument record for one pooled per-object LSTM job.
#[derive(Debug, Clone)]
pub struct LstmJob {
    pub object: String,
    /// Candidate fields in column order
    pub fields: Vec<(String, FieldValue)>,
    pub config: LstmConfig,
    pub seed: u64,
    pub out_dir: PathBuf,
    pub cancel: CancellationToken,
}

/// Train, checkpoint, forecast and plot one object.
///
/// Returns one artifact per feature field; all share the object's PDF.
pub fn run_lstm_job(job: LstmJob) -> Result<Vec<ForecastArtifact>, ForecastError> {
    let (rows, columns) = prepare_fields(&job.fields, job.config.categorical_encoding)?;
    let forecaster = LstmForecaster::new(job.config.clone(), job.seed);
    let outcome = forecaster.fit_forecast(&rows, Some(&job.cancel))?;
    debug!(
        object = %job.object,
        features = columns.len(),
        examples = outcome.examples,
        epochs = outcome.report.epochs_run,
        best_loss = outcome.report.best_loss,
        "LSTM training finished"
    );

    let checkpoint = LstmCheckpoint {
        version: CHECKPOINT_VERSION,
        object: job.object.clone(),
        job: CHECKPOINT_JOB.to_string(),
        fields: columns.iter().map(|c| c.field.clone()).collect(),
        config: outcome.network.config().clone(),
        weights: outcome.network.flatten(),
        normalizer: outcome.normalizer.clone(),
        encoders: columns.iter().map(|c| c.encoder.clone()).collect(),
        report: outcome.report.clone(),
    };
    let cp_path = checkpoint_path(&job.out_dir, &job.object, CHECKPOINT_JOB);
    save_to_disk(&checkpoint, &cp_path).map_err(|source| ForecastError::Io { path: cp_path.clone(), source })?;

    let mut observed: Vec<Vec<f64>> = Vec::with_capacity(columns.len());
    let mut predicted: Vec<Vec<f64>> = Vec::with_capacity(columns.len());
    let mut predicted_labels: Vec<Vec<String>> = Vec::with_capacity(columns.len());
    for (j, column) in columns.iter().enumerate() {
        observed.push(rows.iter().map(|r| r[j]).collect());
        let mut values: Vec<f64> = outcome.forecast.iter().filter_map(|row| row.get(j).copied()).collect();
        let mut labels = Vec::new();
        if let Some(enc) = &column.encoder {
            for v in values.iter_mut() {
                let code = enc.nearest_code(*v);
                *v = code as f64;
                if let Some(label) = enc.labels().get(code) {
                    labels.push(label.clone());
                }
            }
        }
        predicted.push(values);
        predicted_labels.push(labels);
    }

    let model = forecaster.model_name();
    let plot_columns: Vec<PlotColumn<'_>> = columns
        .iter()
        .zip(observed.iter().zip(&predicted))
        .map(|(c, (o, p))| PlotColumn { field: &c.field, observed: o, predicted: p })
        .collect();
    let path = write_object_plot(&job.out_dir, &job.object, &model, &plot_columns)?;

    info!(
        object = %job.object,
        features = columns.len(),
        examples = outcome.examples,
        mae = ?outcome.mae,
        "LSTM forecast complete"
    );

    Ok(columns
        .into_iter()
        .zip(predicted.into_iter().zip(predicted_labels))
        .zip(&outcome.feature_mae)
        .map(|((column, (predicted, predicted_labels)), mae)| ForecastArtifact {
            object: job.object.clone(),
            field: column.field,
            model: model.clone(),
            predicted,
            predicted_labels,
            mae: *mae,
            path: Some(path.clone()),
        })
        .collect())
}
