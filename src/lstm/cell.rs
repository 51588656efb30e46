//! LSTM layer and dense projection with manual backpropagation.
//!
//! ```text
//! z = W * [x; h_prev] + b          (4 gate blocks: i, f, g, o)
//! i = sigmoid(z_i)  f = sigmoid(z_f)  g = tanh(z_g)  o = sigmoid(z_o)
//! c = f * c_prev + i * g
//! h = o * tanh(c)
//! ```
//!
//! Weights are row-major `[4 * hidden x (input + hidden)]`.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Xavier/Glorot uniform initialization.
fn xavier(rows: usize, cols: usize, rng: &mut StdRng) -> Vec<f64> {
    let limit = (6.0 / (rows + cols) as f64).sqrt();
    (0..rows * cols).map(|_| rng.gen::<f64>() * 2.0 * limit - limit).collect()
}

/// Values saved during the forward pass of one timestep.
#[derive(Debug, Clone)]
pub struct StepCache {
    xh: Vec<f64>,
    i: Vec<f64>,
    f: Vec<f64>,
    g: Vec<f64>,
    o: Vec<f64>,
    c_prev: Vec<f64>,
    tanh_c: Vec<f64>,
    pub c: Vec<f64>,
    pub h: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmLayer {
    pub input_size: usize,
    pub hidden: usize,
    pub w: Vec<f64>,
    pub b: Vec<f64>,
}

impl LstmLayer {
    pub fn new(input_size: usize, hidden: usize, rng: &mut StdRng) -> Self {
        let w = xavier(4 * hidden, input_size + hidden, rng);
        let mut b = vec![0.0; 4 * hidden];
        // Forget-gate bias starts at 1 so early gradients flow through the cell
        for v in &mut b[hidden..2 * hidden] {
            *v = 1.0;
        }
        Self { input_size, hidden, w, b }
    }

    pub fn num_params(&self) -> usize {
        self.w.len() + self.b.len()
    }

    fn step(&self, x: &[f64], h_prev: &[f64], c_prev: &[f64]) -> StepCache {
        let h = self.hidden;
        let cols = self.input_size + h;
        let mut xh = Vec::with_capacity(cols);
        xh.extend_from_slice(x);
        xh.extend_from_slice(h_prev);

        let mut z = self.b.clone();
        for (row, zr) in z.iter_mut().enumerate() {
            let w_row = &self.w[row * cols..(row + 1) * cols];
            *zr += w_row.iter().zip(&xh).map(|(a, b)| a * b).sum::<f64>();
        }

        let i: Vec<f64> = z[..h].iter().map(|v| sigmoid(*v)).collect();
        let f: Vec<f64> = z[h..2 * h].iter().map(|v| sigmoid(*v)).collect();
        let g: Vec<f64> = z[2 * h..3 * h].iter().map(|v| v.tanh()).collect();
        let o: Vec<f64> = z[3 * h..].iter().map(|v| sigmoid(*v)).collect();

        let c: Vec<f64> = (0..h).map(|k| f[k] * c_prev[k] + i[k] * g[k]).collect();
        let tanh_c: Vec<f64> = c.iter().map(|v| v.tanh()).collect();
        let h_new: Vec<f64> = (0..h).map(|k| o[k] * tanh_c[k]).collect();

        StepCache { xh, i, f, g, o, c_prev: c_prev.to_vec(), tanh_c, c, h: h_new }
    }

    /// Run the layer over a sequence from a zero state.
    pub fn forward(&self, inputs: &[Vec<f64>]) -> Vec<StepCache> {
        let mut h = vec![0.0; self.hidden];
        let mut c = vec![0.0; self.hidden];
        let mut caches = Vec::with_capacity(inputs.len());
        for x in inputs {
            let cache = self.step(x, &h, &c);
            h.clone_from(&cache.h);
            c.clone_from(&cache.c);
            caches.push(cache);
        }
        caches
    }

    /// Full BPTT. `d_h` holds dL/dh_t from the layer above for every step.
    ///
    /// Accumulates into `grads` (same layout as `w` followed by `b`) and
    /// returns dL/dx_t for every step.
    pub fn backward(&self, caches: &[StepCache], d_h: &[Vec<f64>], grads: &mut [f64]) -> Vec<Vec<f64>> {
        let h = self.hidden;
        let cols = self.input_size + h;
        let (d_w, d_b) = grads.split_at_mut(self.w.len());

        let mut d_inputs = vec![vec![0.0; self.input_size]; caches.len()];
        let mut dh_next = vec![0.0; h];
        let mut dc_next = vec![0.0; h];
        let mut dz = vec![0.0; 4 * h];

        for t in (0..caches.len()).rev() {
            let cache = &caches[t];
            for k in 0..h {
                let dh = d_h[t][k] + dh_next[k];
                let d_o = dh * cache.tanh_c[k];
                let dc = dh * cache.o[k] * (1.0 - cache.tanh_c[k] * cache.tanh_c[k]) + dc_next[k];
                let d_i = dc * cache.g[k];
                let d_g = dc * cache.i[k];
                let d_f = dc * cache.c_prev[k];
                dc_next[k] = dc * cache.f[k];

                dz[k] = d_i * cache.i[k] * (1.0 - cache.i[k]);
                dz[h + k] = d_f * cache.f[k] * (1.0 - cache.f[k]);
                dz[2 * h + k] = d_g * (1.0 - cache.g[k] * cache.g[k]);
                dz[3 * h + k] = d_o * cache.o[k] * (1.0 - cache.o[k]);
            }

            let mut d_xh = vec![0.0; cols];
            for (row, &dzr) in dz.iter().enumerate() {
                if dzr == 0.0 {
                    continue;
                }
                d_b[row] += dzr;
                let base = row * cols;
                for col in 0..cols {
                    d_w[base + col] += dzr * cache.xh[col];
                    d_xh[col] += dzr * self.w[base + col];
                }
            }
            d_inputs[t].copy_from_slice(&d_xh[..self.input_size]);
            dh_next.copy_from_slice(&d_xh[self.input_size..]);
        }
        d_inputs
    }
}

/// Fully connected layer `y = W x + b`, `W` row-major `[outputs x inputs]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub inputs: usize,
    pub outputs: usize,
    pub w: Vec<f64>,
    pub b: Vec<f64>,
}

impl Dense {
    pub fn new(inputs: usize, outputs: usize, rng: &mut StdRng) -> Self {
        Self { inputs, outputs, w: xavier(outputs, inputs, rng), b: vec![0.0; outputs] }
    }

    pub fn num_params(&self) -> usize {
        self.w.len() + self.b.len()
    }

    pub fn forward(&self, x: &[f64]) -> Vec<f64> {
        (0..self.outputs)
            .map(|o| {
                let row = &self.w[o * self.inputs..(o + 1) * self.inputs];
                self.b[o] + row.iter().zip(x).map(|(a, b)| a * b).sum::<f64>()
            })
            .collect()
    }

    /// Accumulate gradients into `grads` (`w` then `b`) and return dL/dx.
    pub fn backward(&self, x: &[f64], d_y: &[f64], grads: &mut [f64]) -> Vec<f64> {
        let (d_w, d_b) = grads.split_at_mut(self.w.len());
        let mut d_x = vec![0.0; self.inputs];
        for (o, &dy) in d_y.iter().enumerate() {
            d_b[o] += dy;
            let base = o * self.inputs;
            for (k, dx) in d_x.iter_mut().enumerate() {
                d_w[base + k] += dy * x[k];
                *dx += dy * self.w[base + k];
            }
        }
        d_x
    }
}
