//! Stacked LSTM encoder with a dense multi-step head.
//!
//! ```text
//! input (T x F) -> LSTM(h, seq) -> [dropout] -> ... -> LSTM(h, last)
//!               -> [bottleneck dense (rank)] -> dense (label_width * F)
//! ```
//!
//! All trainable parameters can be flattened into one vector (layers in
//! order, then bottleneck, then head; each as weights followed by biases),
//! which is the layout the optimizers and checkpoints use.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::cell::{Dense, LstmLayer, StepCache};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub input_features: usize,
    pub hidden_units: usize,
    pub num_layers: usize,
    /// Inverted dropout between LSTM layers (training only)
    pub dropout: f64,
    /// Low-rank projection before the head
    pub bottleneck: Option<usize>,
    pub output_steps: usize,
    pub output_features: usize,
}

impl NetworkConfig {
    pub fn output_len(&self) -> usize {
        self.output_steps * self.output_features
    }
}

/// Everything the backward pass needs from one forward pass.
pub struct ForwardTrace {
    caches: Vec<Vec<StepCache>>,
    masks: Vec<Option<Vec<Vec<f64>>>>,
    last_hidden: Vec<f64>,
    bottleneck_out: Option<Vec<f64>>,
    pub output: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seq2SeqNetwork {
    config: NetworkConfig,
    layers: Vec<LstmLayer>,
    bottleneck: Option<Dense>,
    head: Dense,
}

impl Seq2SeqNetwork {
    pub fn new(config: NetworkConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let num_layers = config.num_layers.max(1);
        let mut layers = Vec::with_capacity(num_layers);
        for l in 0..num_layers {
            let input = if l == 0 { config.input_features } else { config.hidden_units };
            layers.push(LstmLayer::new(input, config.hidden_units, &mut rng));
        }
        let bottleneck = config
            .bottleneck
            .map(|rank| Dense::new(config.hidden_units, rank.max(1), &mut rng));
        let head_inputs = bottleneck.as_ref().map_or(config.hidden_units, |b| b.outputs);
        let head = Dense::new(head_inputs, config.output_len(), &mut rng);
        Self { config, layers, bottleneck, head }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(LstmLayer::num_params).sum::<usize>()
            + self.bottleneck.as_ref().map_or(0, Dense::num_params)
            + self.head.num_params()
    }

    /// Inference pass (no dropout).
    pub fn predict(&self, input: &[Vec<f64>]) -> Vec<f64> {
        self.forward(input, None).output
    }

    /// Forward pass; dropout masks are drawn from `rng` when given.
    pub fn forward(&self, input: &[Vec<f64>], mut rng: Option<&mut StdRng>) -> ForwardTrace {
        let mut seq = input.to_vec();
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut masks = Vec::with_capacity(self.layers.len());
        let keep = 1.0 - self.config.dropout;

        for (l, layer) in self.layers.iter().enumerate() {
            let steps = layer.forward(&seq);
            seq = steps.iter().map(|c| c.h.clone()).collect();

            let between = l + 1 < self.layers.len();
            let mask = match rng.as_deref_mut() {
                Some(r) if between && self.config.dropout > 0.0 && keep > 0.0 => {
                    let m: Vec<Vec<f64>> = seq
                        .iter()
                        .map(|h| h.iter().map(|_| if r.gen::<f64>() < keep { 1.0 / keep } else { 0.0 }).collect())
                        .collect();
                    for (h, mrow) in seq.iter_mut().zip(&m) {
                        for (v, s) in h.iter_mut().zip(mrow) {
                            *v *= s;
                        }
                    }
                    Some(m)
                }
                _ => None,
            };
            masks.push(mask);
            caches.push(steps);
        }

        let last_hidden = seq.last().cloned().unwrap_or_else(|| vec![0.0; self.config.hidden_units]);
        let bottleneck_out = self.bottleneck.as_ref().map(|b| b.forward(&last_hidden));
        let output = self.head.forward(bottleneck_out.as_deref().unwrap_or(&last_hidden));

        ForwardTrace { caches, masks, last_hidden, bottleneck_out, output }
    }

    /// Backpropagate dL/doutput; gradients are accumulated into `grads`
    /// using the flat parameter layout.
    pub fn backward(&self, trace: &ForwardTrace, d_output: &[f64], grads: &mut [f64]) {
        let layer_sizes: Vec<usize> = self.layers.iter().map(LstmLayer::num_params).collect();
        let layers_total: usize = layer_sizes.iter().sum();
        let bottleneck_total = self.bottleneck.as_ref().map_or(0, Dense::num_params);
        let (layer_grads, rest) = grads.split_at_mut(layers_total);
        let (bottleneck_grads, head_grads) = rest.split_at_mut(bottleneck_total);

        let head_input = trace.bottleneck_out.as_deref().unwrap_or(&trace.last_hidden);
        let mut d_last = self.head.backward(head_input, d_output, head_grads);
        if let Some(b) = &self.bottleneck {
            d_last = b.backward(&trace.last_hidden, &d_last, bottleneck_grads);
        }

        let steps = trace.caches.last().map_or(0, Vec::len);
        let mut d_seq = vec![vec![0.0; self.config.hidden_units]; steps];
        if let Some(last) = d_seq.last_mut() {
            *last = d_last;
        }

        let mut offsets = Vec::with_capacity(layer_sizes.len());
        let mut acc = 0;
        for size in &layer_sizes {
            offsets.push(acc);
            acc += size;
        }

        for l in (0..self.layers.len()).rev() {
            if let Some(mask) = &trace.masks[l] {
                for (d, m) in d_seq.iter_mut().zip(mask) {
                    for (v, s) in d.iter_mut().zip(m) {
                        *v *= s;
                    }
                }
            }
            let slot = &mut layer_grads[offsets[l]..offsets[l] + layer_sizes[l]];
            d_seq = self.layers[l].backward(&trace.caches[l], &d_seq, slot);
        }
    }

    pub fn flatten(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.num_params());
        for layer in &self.layers {
            flat.extend_from_slice(&layer.w);
            flat.extend_from_slice(&layer.b);
        }
        if let Some(b) = &self.bottleneck {
            flat.extend_from_slice(&b.w);
            flat.extend_from_slice(&b.b);
        }
        flat.extend_from_slice(&self.head.w);
        flat.extend_from_slice(&self.head.b);
        flat
    }

    pub fn unflatten(&mut self, flat: &[f64]) -> Result<(), String> {
        if flat.len() != self.num_params() {
            return Err(format!(
                "weight dimension mismatch: got {} params, network has {}",
                flat.len(),
                self.num_params()
            ));
        }
        let mut offset = 0;
        let mut take = |dst: &mut Vec<f64>| {
            let n = dst.len();
            dst.copy_from_slice(&flat[offset..offset + n]);
            offset += n;
        };
        for layer in &mut self.layers {
            take(&mut layer.w);
            take(&mut layer.b);
        }
        if let Some(b) = &mut self.bottleneck {
            take(&mut b.w);
            take(&mut b.b);
        }
        take(&mut self.head.w);
        take(&mut self.head.b);
        Ok(())
    }
}
