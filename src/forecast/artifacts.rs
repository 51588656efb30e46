//! Forecast artifact records and plot output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::ForecastError;
use crate::plot::{Chart, Series};

/// UTC stamp used in artifact names, e.g. `2024-03-05-14-07-09-123456`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S-%6f";

/// Result of one `(object, field)` forecasting job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastArtifact {
    pub object: String,
    pub field: String,
    /// Model description, e.g. `ARMA(2,1,0)` or `LSTM(128x2)`
    pub model: String,
    #[serde(deserialize_with = "crate::linalg::vec_f64_or_nan")]
    pub predicted: Vec<f64>,
    /// Decoded labels when the field is categorical
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predicted_labels: Vec<String>,
    /// Holdout MAE when enough samples were available
    pub mae: Option<f64>,
    pub path: Option<PathBuf>,
}

pub fn utc_stamp(now: DateTime<Utc>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Replace characters that are invalid in file names on common platforms.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// `<object>_<field>_<UTC>.pdf`, sanitized.
pub fn artifact_file_name(object: &str, field: &str, now: DateTime<Utc>) -> String {
    sanitize_filename(&format!("{}_{}_{}.pdf", object, field, utc_stamp(now)))
}

/// `<object>_<UTC>.pdf`, sanitized. Multi-field forecasts are per object.
pub fn object_file_name(object: &str, now: DateTime<Utc>) -> String {
    sanitize_filename(&format!("{}_{}.pdf", object, utc_stamp(now)))
}

/// Observed values of one field and the forecast that continues them.
#[derive(Debug, Clone, Copy)]
pub struct PlotColumn<'a> {
    pub field: &'a str,
    pub observed: &'a [f64],
    pub predicted: &'a [f64],
}

fn write_chart(chart: &Chart, path: PathBuf) -> Result<PathBuf, ForecastError> {
    chart
        .write_pdf(&path)
        .map_err(|source| ForecastError::Io { path: path.clone(), source })?;
    Ok(path)
}

/// Plot the observed series followed by the forecast and write it under `dir`.
pub fn write_forecast_plot(
    dir: &Path,
    object: &str,
    field: &str,
    model: &str,
    observed: &[f64],
    predicted: &[f64],
) -> Result<PathBuf, ForecastError> {
    let mut chart = Chart::new(format!("{} {} ({})", object, field, model), "sample", field);
    chart.push(Series::indexed("observed", 0, observed));
    chart.push(Series::indexed("forecast", observed.len(), predicted));
    write_chart(&chart, dir.join(artifact_file_name(object, field, Utc::now())))
}

/// One chart for every field of an object, written as `<object>_<UTC>.pdf`.
pub fn write_object_plot(
    dir: &Path,
    object: &str,
    model: &str,
    columns: &[PlotColumn<'_>],
) -> Result<PathBuf, ForecastError> {
    let mut chart = Chart::new(format!("{} ({})", object, model), "sample", "value");
    for column in columns {
        chart.push(Series::indexed(column.field, 0, column.observed));
        chart.push(Series::indexed(
            format!("{} forecast", column.field),
            column.observed.len(),
            column.predicted,
        ));
    }
    write_chart(&chart, dir.join(object_file_name(object, Utc::now())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stamp_format() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(utc_stamp(t), "2024-03-05-14-07-09-123456");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_filename("a/b:c*d?.pdf"), "a_b_c_d_.pdf");
        assert_eq!(sanitize_filename("media errors"), "media_errors");
    }

    #[test]
    fn test_write_plot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_forecast_plot(dir.path(), "uid-44", "temp/max", "ARMA(1,0,0)", &[1.0, 2.0], &[3.0]).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("uid-44_temp_max_"));
        assert!(name.ends_with(".pdf"));
        assert!(path.exists());
    }

    #[test]
    fn test_object_plot_name_has_no_field() {
        let dir = tempfile::tempdir().unwrap();
        let columns = [
            PlotColumn { field: "temp", observed: &[1.0, 2.0], predicted: &[3.0] },
            PlotColumn { field: "wear", observed: &[5.0, 4.0], predicted: &[3.5] },
        ];
        let path = write_object_plot(dir.path(), "uid-44", "LSTM(8x2)", &columns).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        let stamp = name.strip_prefix("uid-44_").unwrap().strip_suffix(".pdf").unwrap();
        let widths: Vec<usize> = stamp.split('-').map(str::len).collect();
        assert_eq!(widths, vec![4, 2, 2, 2, 2, 2, 6]);
        assert!(path.exists());
    }
}
