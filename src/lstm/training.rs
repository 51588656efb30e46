//! Mini-batch training with early stopping.
//!
//! Loss is MSE between the flattened head output and the target window.
//! Per batch the gradients are averaged, clipped to a global norm of
//! `MAX_GRAD_NORM`, and applied by the configured optimizer. At each epoch
//! end the trainer records the epoch loss, updates the early-stopping state
//! and checks the cancellation token.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::network::Seq2SeqNetwork;
use super::window::Example;
use crate::config::OptimizerKind;
use crate::forecast::ForecastError;

/// Max gradient norm for global gradient clipping.
const MAX_GRAD_NORM: f64 = 5.0;

/// Smallest loss decrease that counts as an improvement.
const MIN_DELTA: f64 = 1e-12;

/// First-order optimizer state over the flat parameter vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Optimizer {
    Sgd {
        lr: f64,
    },
    RmsProp {
        lr: f64,
        rho: f64,
        eps: f64,
        cache: Vec<f64>,
    },
    Adam {
        lr: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
        steps: u64,
        m: Vec<f64>,
        v: Vec<f64>,
    },
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, lr: f64, num_params: usize) -> Self {
        match kind {
            OptimizerKind::Sgd => Optimizer::Sgd { lr },
            OptimizerKind::Rmsprop => Optimizer::RmsProp { lr, rho: 0.9, eps: 1e-7, cache: vec![0.0; num_params] },
            OptimizerKind::Adam => Optimizer::Adam {
                lr,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                steps: 0,
                m: vec![0.0; num_params],
                v: vec![0.0; num_params],
            },
        }
    }

    pub fn apply(&mut self, weights: &mut [f64], grads: &[f64]) {
        match self {
            Optimizer::Sgd { lr } => {
                for (w, g) in weights.iter_mut().zip(grads) {
                    *w -= *lr * g;
                }
            }
            Optimizer::RmsProp { lr, rho, eps, cache } => {
                for i in 0..weights.len() {
                    let g = grads[i];
                    cache[i] = *rho * cache[i] + (1.0 - *rho) * g * g;
                    weights[i] -= *lr * g / (cache[i].sqrt() + *eps);
                }
            }
            Optimizer::Adam { lr, beta1, beta2, eps, steps, m, v } => {
                *steps += 1;
                let t = *steps as f64;
                // Bias-corrected LR
                let lr_t = *lr * (1.0 - beta2.powf(t)).sqrt() / (1.0 - beta1.powf(t));
                for i in 0..weights.len() {
                    let g = grads[i];
                    m[i] = *beta1 * m[i] + (1.0 - *beta1) * g;
                    v[i] = *beta2 * v[i] + (1.0 - *beta2) * g * g;
                    weights[i] -= lr_t * m[i] / (v[i].sqrt() + *eps);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub batch_size: usize,
    pub max_epochs: usize,
    pub patience: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_loss: f64,
    pub stopped_early: bool,
    pub history: Vec<f64>,
}

fn clip(grads: &mut [f64]) {
    let norm = grads.iter().map(|g| g * g).sum::<f64>().sqrt();
    if norm > MAX_GRAD_NORM {
        let scale = MAX_GRAD_NORM / norm;
        for g in grads.iter_mut() {
            *g *= scale;
        }
    }
}

/// Mean squared error of the network over `examples`.
pub fn evaluate(network: &Seq2SeqNetwork, examples: &[Example]) -> f64 {
    if examples.is_empty() {
        return f64::NAN;
    }
    let total: f64 = examples
        .iter()
        .map(|ex| {
            let out = network.predict(&ex.input);
            out.iter().zip(&ex.target).map(|(p, t)| (p - t).powi(2)).sum::<f64>() / out.len().max(1) as f64
        })
        .sum();
    total / examples.len() as f64
}

/// Train until `max_epochs` or `patience` epochs without improvement of the
/// training loss; the best weights are restored before returning.
pub fn train(
    network: &mut Seq2SeqNetwork,
    examples: &[Example],
    options: &TrainingOptions,
    cancel: Option<&CancellationToken>,
) -> Result<TrainingReport, ForecastError> {
    if examples.is_empty() {
        return Err(ForecastError::NoExamples { needed: 1, available: 0 });
    }

    let num_params = network.num_params();
    let out_len = network.config().output_len().max(1) as f64;
    let mut optimizer = Optimizer::new(options.optimizer, options.learning_rate, num_params);
    let mut rng = StdRng::seed_from_u64(options.seed);
    let batch_size = options.batch_size.clamp(1, examples.len());

    let mut order: Vec<usize> = (0..examples.len()).collect();
    let mut best_loss = f64::INFINITY;
    let mut best_weights = network.flatten();
    let mut best_epoch = 0;
    let mut wait = 0;
    let mut history = Vec::new();
    let mut stopped_early = false;

    for epoch in 0..options.max_epochs {
        order.shuffle(&mut rng);
        let mut epoch_loss = 0.0;

        for batch in order.chunks(batch_size) {
            let mut grads = vec![0.0; num_params];
            for &idx in batch {
                let ex = &examples[idx];
                let trace = network.forward(&ex.input, Some(&mut rng));
                let mut d_out = Vec::with_capacity(trace.output.len());
                for (p, t) in trace.output.iter().zip(&ex.target) {
                    let err = p - t;
                    epoch_loss += err * err / out_len;
                    d_out.push(2.0 * err / out_len);
                }
                network.backward(&trace, &d_out, &mut grads);
            }
            let scale = 1.0 / batch.len() as f64;
            for g in grads.iter_mut() {
                *g *= scale;
            }
            clip(&mut grads);

            let mut flat = network.flatten();
            optimizer.apply(&mut flat, &grads);
            network.unflatten(&flat).map_err(ForecastError::Training)?;
        }

        epoch_loss /= examples.len() as f64;
        if !epoch_loss.is_finite() {
            return Err(ForecastError::Training(format!("loss diverged at epoch {}", epoch)));
        }
        history.push(epoch_loss);

        if epoch_loss < best_loss - MIN_DELTA {
            best_loss = epoch_loss;
            best_weights = network.flatten();
            best_epoch = epoch;
            wait = 0;
        } else {
            wait += 1;
        }

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(ForecastError::Cancelled);
        }
        if wait >= options.patience {
            debug!(epoch, best_epoch, best_loss, "early stopping");
            stopped_early = true;
            break;
        }
    }

    network.unflatten(&best_weights).map_err(ForecastError::Training)?;
    Ok(TrainingReport {
        epochs_run: history.len(),
        best_epoch,
        best_loss,
        stopped_early,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lstm::network::NetworkConfig;

    fn toy_examples() -> Vec<Example> {
        (0..12)
            .map(|k| {
                let base = k as f64 * 0.1;
                Example {
                    input: (0..4).map(|t| vec![base + t as f64 * 0.05]).collect(),
                    target: vec![base + 0.2, base + 0.25],
                }
            })
            .collect()
    }

    fn small_network() -> Seq2SeqNetwork {
        Seq2SeqNetwork::new(
            NetworkConfig {
                input_features: 1,
                hidden_units: 6,
                num_layers: 2,
                dropout: 0.0,
                bottleneck: None,
                output_steps: 2,
                output_features: 1,
            },
            3,
        )
    }

    fn options(optimizer: OptimizerKind, max_epochs: usize) -> TrainingOptions {
        TrainingOptions { batch_size: 4, max_epochs, patience: 20, learning_rate: 0.01, optimizer, seed: 1 }
    }

    #[test]
    fn test_training_reduces_loss() {
        let examples = toy_examples();
        for kind in [OptimizerKind::Adam, OptimizerKind::Rmsprop, OptimizerKind::Sgd] {
            let mut net = small_network();
            let before = evaluate(&net, &examples);
            let report = train(&mut net, &examples, &options(kind, 60), None).unwrap();
            let after = evaluate(&net, &examples);
            assert!(after < before, "{:?}: {} -> {}", kind, before, after);
            assert!(report.best_loss.is_finite());
        }
    }

    #[test]
    fn test_early_stopping_with_zero_patience_window() {
        let examples = toy_examples();
        let mut net = small_network();
        let mut opts = options(OptimizerKind::Adam, 500);
        opts.learning_rate = 0.0;
        opts.patience = 3;
        let report = train(&mut net, &examples, &opts, None).unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.epochs_run, 4);
        assert_eq!(report.best_epoch, 0);
    }

    #[test]
    fn test_cancellation_at_epoch_end() {
        let token = CancellationToken::new();
        token.cancel();
        let mut net = small_network();
        let err = train(&mut net, &toy_examples(), &options(OptimizerKind::Adam, 10), Some(&token)).unwrap_err();
        assert!(matches!(err, ForecastError::Cancelled));
    }

    #[test]
    fn test_gradient_norm_clipping() {
        let mut grads = vec![100.0; 10];
        clip(&mut grads);
        let norm = grads.iter().map(|g| g * g).sum::<f64>().sqrt();
        assert!((norm - MAX_GRAD_NORM).abs() < 1e-9);
    }
}
