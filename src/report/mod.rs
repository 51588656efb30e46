//! Post-mortem report data: every artifact of a run in one record.
//!
//! Rendering is someone else's job; this module only composes the record,
//! derives a short list of headline findings and persists `report.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::events::{ErrorSummary, EventPrediction};
use crate::forecast::ForecastArtifact;
use crate::pipeline::{ArtifactLink, PhaseRecord};
use crate::telemetry::Object;
use crate::tickets::TicketAnalysis;

pub const REPORT_FILE: &str = "report.json";
pub const REPORT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("report JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub uid: String,
    pub name: String,
    pub capture_depth: usize,
    pub fields: Vec<String>,
}

impl From<&Object> for ObjectSummary {
    fn from(object: &Object) -> Self {
        Self {
            uid: object.uid.clone(),
            name: object.name.clone(),
            capture_depth: object.capture_depth(),
            fields: object.fields.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForecastSection {
    pub arma: Vec<ForecastArtifact>,
    pub lstm: Vec<ForecastArtifact>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventSection {
    pub summary: Option<ErrorSummary>,
    pub prediction: Option<EventPrediction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportData {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub fault_signature: Option<String>,
    /// Serialized object store
    pub decoded_store: Option<PathBuf>,
    pub objects: Vec<ObjectSummary>,
    pub graphs: Vec<PathBuf>,
    pub forecasts: ForecastSection,
    pub events: EventSection,
    pub tickets: Option<TicketAnalysis>,
    /// Records already in the artifact store
    pub artifact_links: Vec<ArtifactLink>,
    pub phases: Vec<PhaseRecord>,
    pub highlights: Vec<String>,
}

impl ReportData {
    pub fn new(generated_at: DateTime<Utc>) -> Self {
        Self {
            version: REPORT_VERSION,
            generated_at,
            fault_signature: None,
            decoded_store: None,
            objects: Vec::new(),
            graphs: Vec::new(),
            forecasts: ForecastSection::default(),
            events: EventSection::default(),
            tickets: None,
            artifact_links: Vec::new(),
            phases: Vec::new(),
            highlights: Vec::new(),
        }
    }

    pub fn add_objects<'a>(&mut self, objects: impl IntoIterator<Item = &'a Object>) {
        self.objects.extend(objects.into_iter().map(ObjectSummary::from));
    }

    /// Files referenced anywhere in the record.
    pub fn artifact_count(&self) -> usize {
        let forecasts = self
            .forecasts
            .arma
            .iter()
            .chain(&self.forecasts.lstm)
            .filter_map(|a| a.path.as_ref())
            .collect::<BTreeSet<_>>()
            .len();
        let tickets = self.tickets.as_ref().map_or(0, |t| t.artifacts.len());
        usize::from(self.decoded_store.is_some()) + self.graphs.len() + forecasts + tickets
    }

    /// One line per notable finding, most specific first.
    pub fn build_highlights(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if let Some(tickets) = &self.tickets {
            match tickets.clusters.as_ref().and_then(|c| c.tables.first()) {
                Some(top) => lines.push(top.header()),
                None => lines.push(format!(
                    "Ticket analysis {}: {}",
                    tickets.status,
                    tickets.status_detail.as_deref().unwrap_or("no clusters")
                )),
            }
        }

        if let Some(summary) = &self.events.summary {
            lines.push(format!(
                "{} ERR events across {} captures; last capture spans {:.1} s",
                summary.errors.len(),
                summary.captures,
                summary.duration.seconds
            ));
        }
        if let Some(prediction) = &self.events.prediction {
            lines.push(format!(
                "{} new events expected {:.0} s after {}",
                prediction.predicted_count, prediction.delta_seconds, prediction.input_capture
            ));
        }

        let worst = self
            .forecasts
            .arma
            .iter()
            .chain(&self.forecasts.lstm)
            .filter_map(|a| a.mae.map(|m| (a, m)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((artifact, mae)) = worst {
            lines.push(format!(
                "Least predictable series: {}/{} ({}, MAE {:.3})",
                artifact.object, artifact.field, artifact.model, mae
            ));
        }
        lines
    }

    /// Fill `highlights` and write the record atomically.
    pub fn write(&mut self, path: &Path) -> Result<(), ReportError> {
        self.highlights = self.build_highlights();
        let json = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        let io_err = |source| ReportError::Io { path: path.to_path_buf(), source };
        std::fs::write(&tmp_path, json).map_err(io_err)?;
        std::fs::rename(&tmp_path, path).map_err(io_err)
    }

    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let text = std::fs::read_to_string(path).map_err(|source| ReportError::Io { path: path.to_path_buf(), source })?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::FieldValue;

    fn artifact(field: &str, mae: Option<f64>) -> ForecastArtifact {
        ForecastArtifact {
            object: "uid-44".to_string(),
            field: field.to_string(),
            model: "ARMA(1,0,0)".to_string(),
            predicted: vec![1.0, 2.0],
            predicted_labels: Vec::new(),
            mae,
            path: Some(PathBuf::from(format!("{}.pdf", field))),
        }
    }

    #[test]
    fn test_object_summary_lists_fields() {
        let mut object = Object::new("uid-44", "ThermalLog");
        object.fields.insert("temp".to_string(), FieldValue::Numeric(vec![40.0, 41.0, f64::NAN]));
        object.fields.insert("state".to_string(), FieldValue::Categorical(vec!["IDLE".to_string(); 3]));
        let summary = ObjectSummary::from(&object);
        assert_eq!(summary.capture_depth, 3);
        assert_eq!(summary.fields, vec!["state".to_string(), "temp".to_string()]);
    }

    #[test]
    fn test_highlights_name_worst_forecast() {
        let mut report = ReportData::new(Utc::now());
        report.forecasts.arma = vec![artifact("temp", Some(0.5)), artifact("wear", Some(4.0)), artifact("ecc", None)];
        let lines = report.build_highlights();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("uid-44/wear"));
        assert_eq!(report.artifact_count(), 3);

        // Per-field LSTM artifacts share their object's plot
        let shared = Some(PathBuf::from("uid-44_lstm.pdf"));
        report.forecasts.lstm = vec![
            ForecastArtifact { path: shared.clone(), ..artifact("temp", Some(0.2)) },
            ForecastArtifact { path: shared, ..artifact("state", None) },
        ];
        assert_eq!(report.artifact_count(), 4);
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REPORT_FILE);
        let mut report = ReportData::new(Utc::now());
        report.fault_signature = Some("ASSERT_DF049".to_string());
        report.artifact_links.push(ArtifactLink { record_id: "r-1".to_string(), url: "https://store/r-1".to_string() });
        report.forecasts.lstm.push(artifact("temp", Some(1.25)));
        report.write(&path).unwrap();

        let loaded = ReportData::load(&path).unwrap();
        assert_eq!(loaded.version, REPORT_VERSION);
        assert_eq!(loaded.fault_signature.as_deref(), Some("ASSERT_DF049"));
        assert_eq!(loaded.artifact_links, report.artifact_links);
        assert_eq!(loaded.highlights.len(), 1);
        assert!(!dir.path().join("report.json.tmp").exists());
    }
}
