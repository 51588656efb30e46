//! Event-log scenarios: catalog tokenization and next-capture prediction
//! over capture files on disk.

use std::path::Path;

use ssd_postmortem::config::EventConfig;
use ssd_postmortem::embedding::HashingEmbedder;
use ssd_postmortem::events::{
    build_dataset, load_captures, render, summarize, write_summary, EventLevel, EventPredictor, FormatCatalog, Param,
};

const CATALOG: &str = r#"
formats = {
    0x101: ("ThermalSensor temp=%d core=%d", "thermal.c", 88, ["temp", "core"]),
    0x102: ("Media error on die %u", "media.c", 40, ["die"]),
    0x103: ("Boot complete", "boot.c", 5, []),
}
"#;

fn small_config() -> EventConfig {
    EventConfig {
        signature_dim: 3,
        max_params: 2,
        input_size: 8,
        max_output_size: 4,
        hidden_units: 4,
        max_epochs: 5,
        ..EventConfig::default()
    }
}

fn load_catalog(dir: &Path) -> FormatCatalog {
    let path = dir.join("formats.py");
    std::fs::write(&path, CATALOG).unwrap();
    FormatCatalog::load(&path, &HashingEmbedder::default(), 3, 11).unwrap()
}

fn write_capture(dir: &Path, stamp: &str, lines: &[&str]) {
    let mut text = String::from("NLOG dump\nserial: S1\nfw: 1.0\n----\n\n");
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    std::fs::write(dir.join(format!("drive_{}_NLOG.txt", stamp)), text).unwrap();
}

fn write_captures(dir: &Path) {
    let boot = "00:00:01 0 (INFO) Boot complete";
    let hot = "00:05:00 1 (INFO) ThermalSensor temp=40 core=1";
    let media = "00:15:00 0 ( ERR) Media error on die 3";
    let hotter = "00:25:00 1 (INFO) ThermalSensor temp=55 core=1";
    write_capture(dir, "2024-03-01-10-00-00-000000", &[boot]);
    write_capture(dir, "2024-03-01-10-10-00-000000", &[boot, hot]);
    write_capture(dir, "2024-03-01-10-20-00-000000", &[boot, hot, media]);
    write_capture(dir, "2024-03-01-10-30-00-000000", &[boot, hot, media, hotter]);
    // Undated files are ignored
    std::fs::write(dir.join("notes.txt"), "not a capture").unwrap();
}

#[test]
fn tokenizes_a_catalog_line_and_renders_it_back() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = load_catalog(dir.path());
    assert_eq!(catalog.len(), 3);

    let token = catalog.tokenize("ThermalSensor temp=40 core=1").unwrap();
    assert_eq!(token.index, 0);
    assert_eq!(token.params, vec![Param::Int(40), Param::Int(1)]);
    assert_eq!(token.signature.len(), 3);
    assert_eq!(token.param_vector(3), vec![40.0, 1.0, 0.0, 0.0]);

    let entry = catalog.entry(token.index).unwrap();
    assert_eq!(render(entry, &[40.0, 1.0]), "ThermalSensor temp=40 core=1");

    assert!(catalog.tokenize("Something the firmware never prints").is_none());
}

#[test]
fn error_summary_over_dated_captures() {
    let dir = tempfile::tempdir().unwrap();
    write_captures(dir.path());

    let captures = load_captures(dir.path(), 5).unwrap();
    assert_eq!(captures.len(), 4);
    assert!(captures.windows(2).all(|w| w[0].taken_at < w[1].taken_at));

    let summary = summarize(&captures);
    assert_eq!(summary.captures, 4);
    // The ERR line repeats in the last two captures
    assert_eq!(summary.errors.len(), 2);
    assert!(summary.errors.iter().all(|e| e.level == EventLevel::Err));
    assert_eq!(summary.duration.seconds, 25.0 * 60.0 - 1.0);
    assert_eq!(summary.duration.day_wraps, 0);

    let path = dir.path().join("event_summary.txt");
    write_summary(&summary, &path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 3);
    assert!(text.lines().nth(1).unwrap().contains("Media error on die 3"));
}

#[test]
fn predictor_renders_catalog_lines_for_the_next_capture() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = load_catalog(dir.path());
    let nlog = dir.path().join("nlog");
    std::fs::create_dir_all(&nlog).unwrap();
    write_captures(&nlog);

    let config = small_config();
    let captures = load_captures(&nlog, config.header_lines).unwrap();
    let dataset = build_dataset(&catalog, &captures, &config).unwrap();
    // (0,1) (0,2) (1,2) (1,3) (2,3)
    assert_eq!(dataset.pairs.len(), 5);
    assert_eq!(dataset.counts(), vec![1.0, 2.0, 1.0, 2.0, 1.0]);

    let predictor = EventPredictor::train(&dataset, &config, 3, None).unwrap();
    let prediction = predictor.predict_next(&catalog, &captures).unwrap();
    assert_eq!(prediction.delta_seconds, 600.0);
    assert!(prediction.input_capture.contains("2024-03-01-10-30-00"));
    assert!(prediction.predicted_count <= config.max_output_size);
    for line in &prediction.lines {
        let (_, body) = line.split_once('\t').unwrap();
        assert!(catalog.tokenize(body).is_some(), "unrenderable line {}", body);
    }
}
