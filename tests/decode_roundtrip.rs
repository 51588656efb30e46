//! Telemetry decode integration tests
//!
//! Builds payload files with `encode_payload`, decodes the directory the way
//! the pipeline does, and checks the INI serialization against the store.

use std::path::Path;

use ssd_postmortem::telemetry::{self, encode_payload, DecoderError, FamilyLayout, FieldValue, Object, ObjectStore};

const LAYOUT: &str = r#"
family = "ADP"

[[objects]]
uid = 44
name = "ThermalSensor"

[[objects.fields]]
name = "temp"
kind = "i16"
sentinel = -32768.0

[[objects.fields]]
name = "state"
kind = "u8"
categories = ["IDLE", "BUSY"]

[[objects]]
uid = 45
name = "MediaWear"

[[objects.fields]]
name = "erase_count"
kind = "u32"

[[objects.fields]]
name = "ratio"
kind = "f32"
"#;

fn layout() -> FamilyLayout {
    toml::from_str(LAYOUT).unwrap()
}

fn capture(offset: f64) -> ObjectStore {
    let mut store = ObjectStore::new();
    let mut thermal = Object::new("uid-44", "ThermalSensor");
    thermal.fields.insert("temp".into(), FieldValue::Numeric(vec![40.0 + offset, f64::NAN, 42.0 + offset]));
    thermal.fields.insert(
        "state".into(),
        FieldValue::Categorical(vec!["IDLE".into(), "BUSY".into(), "BUSY".into()]),
    );
    store.insert(thermal);

    let mut wear = Object::new("uid-45", "MediaWear");
    wear.fields.insert("erase_count".into(), FieldValue::Numeric(vec![100.0 + offset, 101.0 + offset, 103.0 + offset]));
    wear.fields.insert("ratio".into(), FieldValue::Numeric(vec![0.5, 0.25, 0.125]));
    store.insert(wear);
    store
}

fn write_fixture(root: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let bin = root.join("bin");
    let fmt = root.join("layouts");
    std::fs::create_dir_all(&bin).unwrap();
    std::fs::create_dir_all(&fmt).unwrap();
    std::fs::write(fmt.join("ADP.toml"), LAYOUT).unwrap();
    std::fs::write(bin.join("pull_000.bin"), encode_payload(&layout(), &capture(0.0)).unwrap()).unwrap();
    std::fs::write(bin.join("pull_001.bin"), encode_payload(&layout(), &capture(10.0)).unwrap()).unwrap();
    (bin, fmt)
}

// ============================================================================
// Healthy decode
// ============================================================================

#[test]
fn healthy_decode_appends_captures_in_file_order() {
    let dir = tempfile::tempdir().unwrap();
    let (bin, fmt) = write_fixture(dir.path());
    let ini = dir.path().join("decoded.ini");

    let store = telemetry::decode(&bin, &fmt, &ini).unwrap();
    assert_eq!(store.uids().collect::<Vec<_>>(), vec!["uid-44", "uid-45"]);

    let thermal = store.get("uid-44").unwrap();
    assert_eq!(thermal.name, "ThermalSensor");
    assert_eq!(thermal.capture_depth(), 6);
    match &thermal.fields["temp"] {
        FieldValue::Numeric(v) => {
            assert_eq!(v.len(), 6);
            assert!(v[1].is_nan() && v[4].is_nan());
            assert_eq!(v[3], 50.0);
        }
        other => panic!("temp decoded as {:?}", other),
    }
    assert_eq!(thermal.fields["state"].sample_count(), Some(6));
}

#[test]
fn every_field_length_equals_capture_depth() {
    let dir = tempfile::tempdir().unwrap();
    let (bin, fmt) = write_fixture(dir.path());
    let store = telemetry::decode(&bin, &fmt, &dir.path().join("decoded.ini")).unwrap();
    for object in store.iter() {
        let depth = object.capture_depth();
        for (name, value) in &object.fields {
            assert_eq!(value.sample_count(), Some(depth), "{}/{}", object.uid, name);
        }
    }
}

#[test]
fn ini_reloads_to_the_same_store() {
    let dir = tempfile::tempdir().unwrap();
    let (bin, fmt) = write_fixture(dir.path());
    let ini = dir.path().join("decoded.ini");
    let decoded = telemetry::decode(&bin, &fmt, &ini).unwrap();

    let text = std::fs::read_to_string(&ini).unwrap();
    let first = text.find("[uid-44]").unwrap();
    let second = text.find("[uid-45]").unwrap();
    assert!(first < second, "sections follow insertion order");
    assert!(text.contains("nan"));

    let reloaded = telemetry::load(&ini).unwrap();
    assert_eq!(reloaded, decoded);
}

#[test]
fn selection_intersects_objects_of_interest() {
    let dir = tempfile::tempdir().unwrap();
    let (bin, fmt) = write_fixture(dir.path());
    let store = telemetry::decode(&bin, &fmt, &dir.path().join("decoded.ini")).unwrap();

    let wanted = vec!["uid-45".to_string(), "uid-191".to_string()];
    let selected: Vec<&str> = store.select(&wanted).iter().map(|o| o.uid.as_str()).collect();
    assert_eq!(selected, vec!["uid-45"]);
    assert_eq!(store.select(&[]).len(), 2);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn unknown_family_is_no_decoder() {
    let dir = tempfile::tempdir().unwrap();
    let (bin, _) = write_fixture(dir.path());
    let empty_catalog = dir.path().join("no-layouts");
    std::fs::create_dir_all(&empty_catalog).unwrap();

    let err = telemetry::decode(&bin, &empty_catalog, &dir.path().join("decoded.ini")).unwrap_err();
    assert!(matches!(err, DecoderError::NoDecoder { ref family, .. } if family == "ADP"));
    assert!(!dir.path().join("decoded.ini").exists());
}

#[test]
fn wrong_magic_is_bad_header() {
    let dir = tempfile::tempdir().unwrap();
    let (bin, fmt) = write_fixture(dir.path());
    std::fs::write(bin.join("pull_002.bin"), b"JUNKJUNKJUNK").unwrap();

    let err = telemetry::decode(&bin, &fmt, &dir.path().join("decoded.ini")).unwrap_err();
    assert!(matches!(err, DecoderError::BadHeader { .. }));
}

// ============================================================================
// Single pull with two objects
// ============================================================================

const PULL_LAYOUT: &str = r#"
family = "ADP"

[[objects]]
uid = 6
name = "ThermalSensor"

[[objects.fields]]
name = "core_temp"
kind = "i16"

[[objects.fields]]
name = "board_temp"
kind = "f32"

[[objects.fields]]
name = "throttle"
kind = "u8"
categories = ["OFF", "LIGHT", "HEAVY"]

[[objects]]
uid = 44
name = "DefragInfo"

[[objects.fields]]
name = "free_blocks"
kind = "u32"

[[objects.fields]]
name = "valid_pages"
kind = "u32"

[[objects.fields]]
name = "passes"
kind = "u16"

[[objects.fields]]
name = "write_amp"
kind = "f32"

[[objects.fields]]
name = "phase"
kind = "u8"
categories = ["IDLE", "SCAN", "MOVE"]
"#;

fn single_pull() -> ObjectStore {
    let n = 100;
    let mut store = ObjectStore::new();

    let mut thermal = Object::new("uid-6", "ThermalSensor");
    thermal.fields.insert("core_temp".into(), FieldValue::Numeric((0..n).map(|i| 35.0 + (i % 20) as f64).collect()));
    thermal.fields.insert("board_temp".into(), FieldValue::Numeric((0..n).map(|i| 30.0 + i as f64 * 0.25).collect()));
    let throttle = ["OFF", "LIGHT", "HEAVY"];
    thermal.fields.insert(
        "throttle".into(),
        FieldValue::Categorical((0..n).map(|i| throttle[i % 3].to_string()).collect()),
    );
    store.insert(thermal);

    let mut defrag = Object::new("uid-44", "DefragInfo");
    defrag.fields.insert("free_blocks".into(), FieldValue::Numeric((0..n).map(|i| 4096.0 - i as f64).collect()));
    defrag.fields.insert("valid_pages".into(), FieldValue::Numeric((0..n).map(|i| (i * 37 % 512) as f64).collect()));
    defrag.fields.insert("passes".into(), FieldValue::Numeric((0..n).map(|i| (i / 10) as f64).collect()));
    defrag.fields.insert("write_amp".into(), FieldValue::Numeric((0..n).map(|i| 1.0 + (i % 8) as f64 * 0.125).collect()));
    let phases = ["IDLE", "SCAN", "MOVE"];
    defrag.fields.insert(
        "phase".into(),
        FieldValue::Categorical((0..n).map(|i| phases[(i / 7) % 3].to_string()).collect()),
    );
    store.insert(defrag);
    store
}

#[test]
fn one_pull_decodes_two_objects_with_their_fields() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    let fmt = dir.path().join("layouts");
    std::fs::create_dir_all(&bin).unwrap();
    std::fs::create_dir_all(&fmt).unwrap();
    std::fs::write(fmt.join("ADP.toml"), PULL_LAYOUT).unwrap();
    let layout: FamilyLayout = toml::from_str(PULL_LAYOUT).unwrap();
    let input = single_pull();
    std::fs::write(bin.join("pull_000.bin"), encode_payload(&layout, &input).unwrap()).unwrap();

    let ini = dir.path().join("decoded.ini");
    let store = telemetry::decode(&bin, &fmt, &ini).unwrap();
    assert_eq!(store.uids().collect::<Vec<_>>(), vec!["uid-6", "uid-44"]);

    for (uid, fields) in [("uid-6", 3usize), ("uid-44", 5usize)] {
        let object = store.get(uid).unwrap();
        assert_eq!(object.fields.len(), fields, "{}", uid);
        assert_eq!(object.capture_depth(), 100, "{}", uid);
        assert!(object.fields.values().all(|v| v.sample_count() == Some(100)), "{}", uid);
    }
    assert_eq!(store, input);

    let text = std::fs::read_to_string(&ini).unwrap();
    let sections: Vec<&str> = text.lines().filter(|l| l.starts_with('[')).collect();
    assert_eq!(sections, vec!["[uid-6]", "[uid-44]"]);

    let keys_of = |section: &str| -> Vec<String> {
        text.split("\n\n")
            .find(|block| block.starts_with(section))
            .unwrap()
            .lines()
            .skip(1)
            .map(|l| l.split(" = ").next().unwrap().to_string())
            .collect()
    };
    assert_eq!(keys_of("[uid-6]"), vec!["board_temp", "core_temp", "name", "throttle"]);
    assert_eq!(
        keys_of("[uid-44]"),
        vec!["free_blocks", "name", "passes", "phase", "valid_pages", "write_amp"]
    );

    assert_eq!(telemetry::load(&ini).unwrap(), input);
}
