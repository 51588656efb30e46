//! Next-capture prediction.
//!
//! Training pairs are built from each capture `i` and the lines that are new
//! in capture `i + 1` and in capture `i + 2`. A linear width regressor maps
//! elapsed seconds to the new-line count; three LSTM sequence models of the
//! same topology map the input capture to the new lines' timestamps,
//! signatures and parameter vectors. Inputs keep the most recent
//! `input_size` events, outputs the first `max_output_size` new events; both
//! are zero padded after normalization.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::catalog::FormatCatalog;
use super::nlog::{new_lines, parse_line, seconds_between, Capture, LogTime};
use super::regression::WidthRegressor;
use super::tokenizer::render;
use super::EventError;
use crate::config::{EventConfig, OptimizerKind};
use crate::forecast::ForecastError;
use crate::lstm::{train, Example, NetworkConfig, Normalizer, Seq2SeqNetwork, TrainingOptions, TrainingReport};

const LEARNING_RATE: f64 = 0.01;
const PATIENCE: usize = 20;
const FULL_BATCH_THRESHOLD: usize = 32;

// ============================================================================
// Sequence data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceKind {
    Time,
    Signature,
    Params,
}

impl SequenceKind {
    pub const ALL: [SequenceKind; 3] = [SequenceKind::Time, SequenceKind::Signature, SequenceKind::Params];

    /// Features per event row.
    pub fn features(self, signature_dim: usize, max_params: usize) -> usize {
        match self {
            SequenceKind::Time => 3,
            SequenceKind::Signature => signature_dim,
            SequenceKind::Params => max_params + 1,
        }
    }
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceKind::Time => write!(f, "time"),
            SequenceKind::Signature => write!(f, "signature"),
            SequenceKind::Params => write!(f, "params"),
        }
    }
}

/// Per-event rows of one capture (or one set of new lines).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventRows {
    pub time: Vec<Vec<f64>>,
    pub signature: Vec<Vec<f64>>,
    pub params: Vec<Vec<f64>>,
}

impl EventRows {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn rows(&self, kind: SequenceKind) -> &[Vec<f64>] {
        match kind {
            SequenceKind::Time => &self.time,
            SequenceKind::Signature => &self.signature,
            SequenceKind::Params => &self.params,
        }
    }
}

/// Tokenize event lines; unparsable lines are skipped.
pub fn encode_lines<S: AsRef<str>>(catalog: &FormatCatalog, lines: &[S], max_params: usize) -> EventRows {
    let mut rows = EventRows::default();
    for line in lines {
        let Some(event) = parse_line(line.as_ref()) else { continue };
        let token = catalog.tokenize_or_blank(&event.description);
        rows.time.push(event.time.as_vec());
        rows.params.push(token.param_vector(max_params));
        rows.signature.push(token.signature);
    }
    rows
}

/// One training pair: a capture and the lines new in a later capture.
#[derive(Debug, Clone)]
pub struct EventPair {
    pub delta_seconds: f64,
    pub input: EventRows,
    pub output: EventRows,
    pub new_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EventDataset {
    pub pairs: Vec<EventPair>,
    pub signature_dim: usize,
    pub max_params: usize,
}

impl EventDataset {
    pub fn deltas(&self) -> Vec<Vec<f64>> {
        self.pairs.iter().map(|p| vec![p.delta_seconds]).collect()
    }

    pub fn counts(&self) -> Vec<f64> {
        self.pairs.iter().map(|p| p.new_count as f64).collect()
    }
}

/// Build training pairs from dated captures in time order.
pub fn build_dataset(
    catalog: &FormatCatalog,
    captures: &[Capture],
    config: &EventConfig,
) -> Result<EventDataset, EventError> {
    if captures.len() < 2 {
        return Err(EventError::InsufficientCaptures { needed: 2, available: captures.len() });
    }
    let encoded: Vec<EventRows> = captures
        .iter()
        .map(|c| encode_lines(catalog, &c.lines, config.max_params))
        .collect();

    let mut pairs = Vec::new();
    for i in 0..captures.len() - 1 {
        for j in [i + 1, i + 2] {
            let Some(later) = captures.get(j) else { continue };
            let Some(delta) = seconds_between(&captures[i], later) else {
                warn!(capture = %later.name, "Capture has no timestamp, pair skipped");
                continue;
            };
            let fresh = new_lines(&captures[i], later);
            pairs.push(EventPair {
                delta_seconds: delta,
                input: encoded[i].clone(),
                output: encode_lines(catalog, &fresh, config.max_params),
                new_count: fresh.len(),
            });
        }
    }
    debug!(pairs = pairs.len(), captures = captures.len(), "Event dataset built");
    Ok(EventDataset { pairs, signature_dim: catalog.signature_dim(), max_params: config.max_params })
}

/// Keep `len` rows from the head or tail, then zero pad to `len`.
fn fit_length(rows: &[Vec<f64>], len: usize, width: usize, keep_tail: bool) -> Vec<Vec<f64>> {
    let kept = if rows.len() > len {
        if keep_tail {
            &rows[rows.len() - len..]
        } else {
            &rows[..len]
        }
    } else {
        rows
    };
    let mut out = kept.to_vec();
    out.resize(len, vec![0.0; width]);
    out
}

// ============================================================================
// Sequence model
// ============================================================================

#[derive(Debug, Clone)]
pub struct SequenceModel {
    pub kind: SequenceKind,
    pub network: Seq2SeqNetwork,
    pub normalizer: Normalizer,
    pub report: TrainingReport,
    input_size: usize,
    output_size: usize,
}

impl SequenceModel {
    /// Train the `kind` model on every pair of the dataset.
    pub fn train(
        kind: SequenceKind,
        dataset: &EventDataset,
        config: &EventConfig,
        seed: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self, ForecastError> {
        if dataset.pairs.is_empty() {
            return Err(ForecastError::NoExamples { needed: 1, available: 0 });
        }
        let features = kind.features(dataset.signature_dim, dataset.max_params);

        let observed: Vec<Vec<f64>> = dataset
            .pairs
            .iter()
            .flat_map(|p| p.input.rows(kind).iter().chain(p.output.rows(kind)).cloned())
            .collect();
        let normalizer = if observed.is_empty() { Normalizer::identity(features) } else { Normalizer::fit(&observed) };

        let examples: Vec<Example> = dataset
            .pairs
            .iter()
            .map(|p| {
                let input = normalized_block(&normalizer, p.input.rows(kind), config.input_size, features, true);
                let target = normalized_block(&normalizer, p.output.rows(kind), config.max_output_size, features, false)
                    .into_iter()
                    .flatten()
                    .collect();
                Example { input, target }
            })
            .collect();

        let mut network = Seq2SeqNetwork::new(
            NetworkConfig {
                input_features: features,
                hidden_units: config.hidden_units,
                num_layers: 2,
                dropout: 0.0,
                bottleneck: None,
                output_steps: config.max_output_size,
                output_features: features,
            },
            seed,
        );
        let options = TrainingOptions {
            batch_size: if examples.len() < FULL_BATCH_THRESHOLD { 1 } else { FULL_BATCH_THRESHOLD },
            max_epochs: config.max_epochs,
            patience: PATIENCE,
            learning_rate: LEARNING_RATE,
            optimizer: OptimizerKind::Adam,
            seed,
        };
        let report = train(&mut network, &examples, &options, cancel)?;
        info!(model = %kind, examples = examples.len(), epochs = report.epochs_run, loss = report.best_loss, "Event sequence model trained");

        Ok(Self {
            kind,
            network,
            normalizer,
            report,
            input_size: config.input_size,
            output_size: config.max_output_size,
        })
    }

    /// Predicted rows (original units) for an input capture.
    pub fn predict(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let features = self.normalizer.features();
        let input = normalized_block(&self.normalizer, rows, self.input_size, features, true);
        let flat = self.network.predict(&input);
        let mut out = self.normalizer.denormalize_flat(&flat);
        out.truncate(self.output_size);
        out
    }
}

fn normalized_block(
    normalizer: &Normalizer,
    rows: &[Vec<f64>],
    len: usize,
    features: usize,
    keep_tail: bool,
) -> Vec<Vec<f64>> {
    let normalized: Vec<Vec<f64>> = rows.iter().map(|r| normalizer.normalize(r)).collect();
    fit_length(&normalized, len, features, keep_tail)
}

// ============================================================================
// Predictor
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPrediction {
    pub input_capture: String,
    pub delta_seconds: f64,
    pub predicted_count: usize,
    #[serde(deserialize_with = "crate::linalg::f64_or_nan")]
    pub width_r2: f64,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EventPredictor {
    pub width: WidthRegressor,
    pub time: SequenceModel,
    pub signature: SequenceModel,
    pub params: SequenceModel,
    max_params: usize,
    max_output_size: usize,
}

impl EventPredictor {
    /// Fit the width regressor and train the three sequence models in turn.
    pub fn train(
        dataset: &EventDataset,
        config: &EventConfig,
        seed: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self, EventError> {
        let models = SequenceKind::ALL
            .iter()
            .map(|&kind| {
                SequenceModel::train(kind, dataset, config, seed, cancel)
                    .map_err(|source| EventError::Model { kind, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_parts(fit_width(dataset, config), models, config)
    }

    /// Assemble from models trained elsewhere (e.g. on the worker pool).
    pub fn from_parts(width: WidthRegressor, models: Vec<SequenceModel>, config: &EventConfig) -> Result<Self, EventError> {
        let take = |kind: SequenceKind| {
            models
                .iter()
                .find(|m| m.kind == kind)
                .cloned()
                .ok_or(EventError::MissingModel(kind))
        };
        Ok(Self {
            time: take(SequenceKind::Time)?,
            signature: take(SequenceKind::Signature)?,
            params: take(SequenceKind::Params)?,
            width,
            max_params: config.max_params,
            max_output_size: config.max_output_size,
        })
    }

    /// Predict the lines of the capture following the last one, assuming the
    /// same interval as between the last two.
    pub fn predict_next(&self, catalog: &FormatCatalog, captures: &[Capture]) -> Result<EventPrediction, EventError> {
        let (prev, last) = match captures {
            [.., prev, last] => (prev, last),
            _ => return Err(EventError::InsufficientCaptures { needed: 2, available: captures.len() }),
        };
        let delta = seconds_between(prev, last).unwrap_or(0.0);
        let input = encode_lines(catalog, &last.lines, self.max_params);
        let lines = self.render(catalog, &input, delta);
        Ok(EventPrediction {
            input_capture: last.name.clone(),
            delta_seconds: delta,
            predicted_count: self.width.predict_count(&[delta]).min(self.max_output_size),
            width_r2: self.width.r2,
            lines,
        })
    }

    fn render(&self, catalog: &FormatCatalog, input: &EventRows, delta: f64) -> Vec<String> {
        let count = self.width.predict_count(&[delta]).min(self.max_output_size);
        if count == 0 {
            return Vec::new();
        }
        let times = self.time.predict(&input.time);
        let signatures = self.signature.predict(&input.signature);
        let params = self.params.predict(&input.params);

        (0..count)
            .filter_map(|slot| {
                let entry = catalog.nearest_signature(signatures.get(slot)?)?;
                let values: Vec<f64> = params.get(slot).map(|p| p.iter().take(entry.arity).copied().collect())?;
                let time = LogTime::from_prediction(times.get(slot)?);
                Some(format!("{}\t{}", time, render(entry, &values)))
            })
            .collect()
    }
}

pub fn fit_width(dataset: &EventDataset, config: &EventConfig) -> WidthRegressor {
    WidthRegressor::fit(config.width_model, &dataset.deltas(), &dataset.counts())
}

pub fn write_predictions(prediction: &EventPrediction, path: &Path) -> std::io::Result<()> {
    let mut out = format!(
        "# input={} delta_s={:.3} predicted_count={}\n",
        prediction.input_capture, prediction.delta_seconds, prediction.predicted_count
    );
    for line in &prediction.lines {
        out.push_str(line);
        out.push('\n');
    }
    std::fs::write(path, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::events::catalog::FormatSpec;

    fn catalog() -> FormatCatalog {
        let specs = vec![
            FormatSpec::new("a", "ThermalSensor temp=%d core=%d"),
            FormatSpec::new("b", "Media error on die %u"),
            FormatSpec::new("c", "Boot complete"),
        ];
        FormatCatalog::build(specs, &HashingEmbedder::default(), 3, 5).unwrap()
    }

    fn small_config() -> EventConfig {
        EventConfig {
            signature_dim: 3,
            max_params: 2,
            input_size: 6,
            max_output_size: 3,
            hidden_units: 4,
            max_epochs: 5,
            ..EventConfig::default()
        }
    }

    fn capture(minute: u32, lines: &[&str]) -> Capture {
        let mut text = String::from("h\nh\nh\nh\nh\n");
        for l in lines {
            text.push_str(l);
            text.push('\n');
        }
        Capture::parse(format!("ssd_2024-01-01-00-{:02}-00-000000_NLOG.txt", minute), &text, 5)
    }

    fn captures() -> Vec<Capture> {
        vec![
            capture(0, &["00:00:01 0 (INFO) Boot complete"]),
            capture(10, &["00:00:01 0 (INFO) Boot complete", "00:05:00 1 (INFO) ThermalSensor temp=40 core=1"]),
            capture(
                20,
                &[
                    "00:00:01 0 (INFO) Boot complete",
                    "00:05:00 1 (INFO) ThermalSensor temp=40 core=1",
                    "00:15:00 0 ( ERR) Media error on die 3",
                ],
            ),
        ]
    }

    #[test]
    fn test_dataset_pairs_and_counts() {
        let c = catalog();
        let ds = build_dataset(&c, &captures(), &small_config()).unwrap();
        // (0,1), (0,2), (1,2)
        assert_eq!(ds.pairs.len(), 3);
        assert_eq!(ds.counts(), vec![1.0, 2.0, 1.0]);
        assert_eq!(ds.deltas(), vec![vec![600.0], vec![1200.0], vec![600.0]]);
        let out = &ds.pairs[0].output;
        assert_eq!(out.params[0], vec![40.0, 1.0, 0.0]);
        assert_eq!(out.time[0], vec![0.0, 5.0, 0.0]);
    }

    #[test]
    fn test_fit_length_keeps_tail_or_head() {
        let rows: Vec<Vec<f64>> = (0..5).map(|i| vec![i as f64]).collect();
        assert_eq!(fit_length(&rows, 2, 1, true), vec![vec![3.0], vec![4.0]]);
        assert_eq!(fit_length(&rows, 2, 1, false), vec![vec![0.0], vec![1.0]]);
        assert_eq!(fit_length(&rows[..1], 3, 1, true), vec![vec![0.0], vec![0.0], vec![0.0]]);
    }

    #[test]
    fn test_single_capture_is_rejected() {
        let c = catalog();
        let err = build_dataset(&c, &captures()[..1], &small_config()).unwrap_err();
        assert!(matches!(err, EventError::InsufficientCaptures { needed: 2, available: 1 }));
    }

    #[test]
    fn test_train_and_predict_renders_catalog_lines() {
        let c = catalog();
        let config = small_config();
        let caps = captures();
        let ds = build_dataset(&c, &caps, &config).unwrap();
        let predictor = EventPredictor::train(&ds, &config, 9, None).unwrap();
        let prediction = predictor.predict_next(&c, &caps).unwrap();
        assert_eq!(prediction.delta_seconds, 600.0);
        assert!(prediction.predicted_count <= config.max_output_size);
        assert_eq!(prediction.lines.len(), prediction.predicted_count);
        for line in &prediction.lines {
            let (_, body) = line.split_once('\t').unwrap();
            assert!(c.tokenize(body).is_some(), "{}", body);
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predicted_events.txt");
        write_predictions(&prediction, &path).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().starts_with("# input="));
    }
}
