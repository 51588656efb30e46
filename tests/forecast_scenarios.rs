//! Forecasting scenarios: ARMA and LSTM jobs run directly and through the
//! worker pool.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ssd_postmortem::config::{ArmaConfig, LstmConfig, PoolBackend};
use ssd_postmortem::forecast::{forecast_arma, run_arma_job, ArmaJob, ForecastError};
use ssd_postmortem::lstm::{make_windows, run_lstm_job, LstmForecaster, LstmJob, WindowSpec};
use ssd_postmortem::pool::{Job, WorkerPool};
use ssd_postmortem::FieldValue;

fn ramp(n: usize) -> Vec<f64> {
    (0..n).map(|i| 5.0 + 0.5 * i as f64).collect()
}

#[test]
fn monotone_series_forecasts_keep_increasing() {
    let series = ramp(100);
    let result = forecast_arma(&series, None, None, &ArmaConfig::default()).unwrap();
    // 10% of 100 samples
    assert_eq!(result.predicted.len(), 10);
    assert!(result.predicted.iter().all(|v| v.is_finite()));
    assert!(result.predicted.windows(2).all(|w| w[1] > w[0]), "{:?}", result.predicted);
    assert!(result.predicted[0] > *series.last().unwrap() - 1.0);
}

#[test]
fn counting_series_scores_a_small_holdout_error() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = run_arma_job(ArmaJob {
        object: "uid-44".into(),
        field: "count".into(),
        series: (0..100).map(f64::from).collect(),
        config: ArmaConfig::default(),
        out_dir: dir.path().to_path_buf(),
    })
    .unwrap();
    assert_eq!(artifact.predicted.len(), 10);
    assert!(artifact.predicted.windows(2).all(|w| w[1] > w[0]), "{:?}", artifact.predicted);
    let mae = artifact.mae.unwrap();
    assert!(mae < 1.0, "holdout MAE {}", mae);
}

#[test]
fn constant_series_is_rejected() {
    let err = forecast_arma(&[7.0; 80], None, None, &ArmaConfig::default()).unwrap_err();
    assert!(matches!(err, ForecastError::InsufficientData { .. }));
}

#[test]
fn missing_samples_are_dropped_before_fitting() {
    let mut series = ramp(60);
    for i in (0..60).step_by(4) {
        series[i] = f64::NAN;
    }
    let result = forecast_arma(&series, None, None, &ArmaConfig::default()).unwrap();
    assert_eq!(result.input.len(), 45);
    assert!(result.input.iter().all(|v| v.is_finite()));
}

#[test]
fn default_windows_over_200_samples() {
    let spec = WindowSpec::new(70, 20, 2);
    assert_eq!(spec.example_count(200), 109);

    let rows: Vec<Vec<f64>> = (0..200).map(|i| vec![i as f64]).collect();
    let windows = make_windows(&rows, &spec);
    assert_eq!(windows.len(), 109);
    assert_eq!(spec.example_count(91), 0);
}

fn windowing_config() -> LstmConfig {
    LstmConfig {
        input_width: 70,
        label_width: 20,
        shift: 2,
        hidden_units: 8,
        max_epochs: 3,
        learning_rate: 0.01,
        ..LstmConfig::default()
    }
}

fn wave(n: usize) -> Vec<f64> {
    (0..n).map(|i| 50.0 + 10.0 * (i as f64 * 0.15).sin()).collect()
}

#[test]
fn lstm_over_200_samples_reports_holdout_error() {
    let rows: Vec<Vec<f64>> = wave(200).into_iter().map(|v| vec![v]).collect();
    let outcome = LstmForecaster::new(windowing_config(), 3).fit_forecast(&rows, None).unwrap();
    assert_eq!(outcome.examples, 109);
    assert_eq!(outcome.test_examples, 10);
    assert_eq!(outcome.forecast.len(), 20);
    assert!(outcome.mae.unwrap().is_finite());
    assert!(outcome.report.history.iter().all(|l| l.is_finite()));
}

#[test]
fn lstm_plot_is_named_after_the_object() {
    let dir = tempfile::tempdir().unwrap();
    let job = LstmJob {
        object: "uid-44".into(),
        fields: vec![("temp".to_string(), FieldValue::Numeric(wave(200)))],
        config: windowing_config(),
        seed: 3,
        out_dir: dir.path().to_path_buf(),
        cancel: CancellationToken::new(),
    };
    let artifacts = run_lstm_job(job).unwrap();
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].mae.is_some());

    let path = artifacts[0].path.clone().unwrap();
    assert!(path.exists());
    let name = path.file_name().unwrap().to_string_lossy().to_string();
    let stamp = name.strip_prefix("uid-44_").unwrap().strip_suffix(".pdf").unwrap();
    assert!(!name.contains("temp"));
    let widths: Vec<usize> = stamp.split('-').map(str::len).collect();
    assert_eq!(widths, vec![4, 2, 2, 2, 2, 2, 6]);
    assert!(stamp.chars().all(|c| c == '-' || c.is_ascii_digit()));
}

#[test]
fn short_field_yields_no_lstm_examples() {
    let dir = tempfile::tempdir().unwrap();
    let job = LstmJob {
        object: "uid-44".into(),
        fields: vec![("temp".to_string(), FieldValue::Numeric(ramp(91)))],
        config: LstmConfig::default(),
        seed: 7,
        out_dir: dir.path().to_path_buf(),
        cancel: CancellationToken::new(),
    };
    let err = run_lstm_job(job).unwrap_err();
    assert!(matches!(err, ForecastError::NoExamples { needed: 92, available: 91 }));
    assert!(!dir.path().join("checkpoints").join("uid-44-lstm.json").exists());
}

#[tokio::test]
async fn pooled_arma_jobs_keep_order_and_record_failures() {
    let dir = tempfile::tempdir().unwrap();
    let pool = WorkerPool::new(PoolBackend::Thread, Some(2), Duration::from_secs(120)).unwrap();

    let job = |field: &str, series: Vec<f64>| {
        Job::new(
            format!("arma:uid-44/{}", field),
            ArmaJob {
                object: "uid-44".into(),
                field: field.into(),
                series,
                config: ArmaConfig::default(),
                out_dir: dir.path().to_path_buf(),
            },
        )
    };
    let jobs = vec![job("temp", ramp(100)), job("flat", vec![3.0; 100]), job("wear", ramp(50))];

    let results = pool.map_ordered(run_arma_job, jobs).await;
    let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["arma:uid-44/temp", "arma:uid-44/flat", "arma:uid-44/wear"]);

    assert!(results[0].outcome.is_ok());
    assert!(results[1].outcome.is_err());
    let wear = results[2].outcome.as_ref().unwrap();
    assert_eq!(wear.field, "wear");
    assert!(wear.model.starts_with("ARMA("));
    assert!(wear.path.as_ref().unwrap().exists());

    let stats = pool.stats();
    assert_eq!(stats.jobs, 3);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.failed[0].job, "arma:uid-44/flat");
}
