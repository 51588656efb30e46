//! Per-job LSTM checkpoints.
//!
//! Each `(object, job)` pair owns `checkpoints/<object>-<job>.json` under the
//! run output directory, so concurrent jobs never share a file.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

use super::encoding::{CategoricalEncoder, Normalizer};
use super::network::{NetworkConfig, Seq2SeqNetwork};
use super::training::TrainingReport;
use crate::forecast::sanitize_filename;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Snapshot of a trained forecaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmCheckpoint {
    pub version: u32,
    pub object: String,
    pub job: String,
    /// Field behind each feature column
    pub fields: Vec<String>,
    pub config: NetworkConfig,
    pub weights: Vec<f64>,
    pub normalizer: Normalizer,
    /// Category codes per feature column, `None` for numeric fields
    pub encoders: Vec<Option<CategoricalEncoder>>,
    pub report: TrainingReport,
}

impl LstmCheckpoint {
    /// Rebuild the network with the stored weights.
    pub fn restore(&self) -> Result<Seq2SeqNetwork, String> {
        if self.version != CHECKPOINT_VERSION {
            return Err(format!("unsupported checkpoint version {}", self.version));
        }
        let mut network = Seq2SeqNetwork::new(self.config.clone(), 0);
        network.unflatten(&self.weights)?;
        Ok(network)
    }
}

pub fn checkpoint_path(output_dir: &Path, object: &str, job: &str) -> PathBuf {
    output_dir
        .join("checkpoints")
        .join(sanitize_filename(&format!("{}-{}.json", object, job)))
}

/// Save a checkpoint to disk atomically (write temp file, then rename).
pub fn save_to_disk(cp: &LstmCheckpoint, path: &Path) -> io::Result<()> {
    let json = serde_json::to_vec(cp).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    // Write to temp file alongside the target
    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&tmp_path, &json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn load_from_disk(path: &Path) -> io::Result<LstmCheckpoint> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_restores_predictions() {
        let config = NetworkConfig {
            input_features: 1,
            hidden_units: 3,
            num_layers: 2,
            dropout: 0.0,
            bottleneck: Some(2),
            output_steps: 2,
            output_features: 1,
        };
        let network = Seq2SeqNetwork::new(config.clone(), 9);
        let cp = LstmCheckpoint {
            version: CHECKPOINT_VERSION,
            object: "uid-44".into(),
            job: "lstm".into(),
            fields: vec!["temp".into()],
            config,
            weights: network.flatten(),
            normalizer: Normalizer::fit(&[vec![1.0], vec![2.0]]),
            encoders: vec![None],
            report: TrainingReport { epochs_run: 1, best_epoch: 0, best_loss: 0.5, stopped_early: false, history: vec![0.5] },
        };

        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "uid-44", "lstm");
        assert!(path.ends_with("checkpoints/uid-44-lstm.json"));
        save_to_disk(&cp, &path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = load_from_disk(&path).unwrap();
        let restored = loaded.restore().unwrap();
        let input = vec![vec![0.3]; 4];
        for (a, b) in restored.predict(&input).iter().zip(network.predict(&input)) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
