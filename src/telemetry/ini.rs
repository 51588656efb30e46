//! Stable sectioned-file serialization of an `ObjectStore`.
//!
//! ```text
//! [uid-6]
//! core_temp = [41.0, 42.5, nan]
//! name = ThermalSensor
//! state = ['IDLE', 'BUSY', 'IDLE']
//! ```
//!
//! One section per object in store order; keys sorted lexicographically.
//! `name` is a bare scalar, every other value is a literal readable by
//! `crate::literal::parse_literal`. An empty categorical sequence is written
//! as `()` so it loads back as categorical; an empty numeric one is `[]`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::literal::{self, Literal, LiteralError};
use crate::telemetry::object::{FieldValue, Object, ObjectStore};

/// Key holding the object's human-readable name.
pub const NAME_KEY: &str = "name";

#[derive(Debug, thiserror::Error)]
pub enum IniError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: {source}")]
    Literal {
        line: usize,
        #[source]
        source: LiteralError,
    },
}

/// Render one field value as a literal.
pub fn field_literal(value: &FieldValue) -> String {
    match value {
        FieldValue::Numeric(v) => {
            let items: Vec<String> = v.iter().map(|x| format_number(*x)).collect();
            format!("[{}]", items.join(", "))
        }
        FieldValue::Categorical(v) if v.is_empty() => "()".to_string(),
        FieldValue::Categorical(v) => {
            let items: Vec<String> = v.iter().map(|s| literal::quote(s)).collect();
            format!("[{}]", items.join(", "))
        }
        FieldValue::Text(s) => literal::quote(s),
        FieldValue::Nested(map) => {
            let items: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", literal::quote(k), field_literal(v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
        FieldValue::Missing => "None".to_string(),
    }
}

/// Shortest representation that parses back to the same `f64`.
fn format_number(x: f64) -> String {
    if x.is_nan() {
        "nan".to_string()
    } else if x.is_infinite() {
        if x > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        format!("{:?}", x)
    }
}

/// Convert a parsed literal back to a field value.
pub fn literal_field(lit: Literal) -> FieldValue {
    match lit {
        Literal::None => FieldValue::Missing,
        Literal::Str(s) => FieldValue::Text(s),
        Literal::Int(_) | Literal::Float(_) | Literal::Bool(_) => {
            FieldValue::Numeric(vec![lit.as_f64().unwrap_or(f64::NAN)])
        }
        Literal::Tuple(items) if items.is_empty() => FieldValue::Categorical(Vec::new()),
        Literal::List(items) | Literal::Tuple(items) => sequence_field(items),
        Literal::Dict(entries) => {
            let map = entries
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        Literal::Str(s) => s,
                        other => literal_key(&other),
                    };
                    (key, literal_field(v))
                })
                .collect::<BTreeMap<_, _>>();
            FieldValue::Nested(map)
        }
    }
}

fn literal_key(lit: &Literal) -> String {
    match lit {
        Literal::Int(i) => i.to_string(),
        Literal::Float(f) => f.to_string(),
        Literal::Bool(b) => b.to_string(),
        Literal::None => "None".to_string(),
        other => format!("{:?}", other),
    }
}

fn sequence_field(items: Vec<Literal>) -> FieldValue {
    let numeric = items
        .iter()
        .all(|i| matches!(i, Literal::Int(_) | Literal::Float(_) | Literal::Bool(_) | Literal::None));
    if numeric {
        return FieldValue::Numeric(
            items.iter().map(|i| i.as_f64().unwrap_or(f64::NAN)).collect(),
        );
    }
    // Mixed or string sequences keep their text form
    FieldValue::Categorical(
        items
            .into_iter()
            .map(|i| match i {
                Literal::Str(s) => s,
                other => literal_key(&other),
            })
            .collect(),
    )
}

/// Serialize a store to its sectioned text form.
pub fn to_ini_string(store: &ObjectStore) -> String {
    let mut out = String::new();
    for (i, object) in store.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "[{}]", object.uid);

        let mut entries: Vec<(&str, String)> = object
            .fields
            .iter()
            .map(|(k, v)| (k.as_str(), field_literal(v)))
            .collect();
        entries.push((NAME_KEY, object.name.clone()));
        entries.sort_by(|a, b| a.0.cmp(b.0));

        for (key, value) in entries {
            let _ = writeln!(out, "{} = {}", key, value);
        }
    }
    out
}

/// Parse the sectioned text form back into a store.
pub fn parse_ini(src: &str) -> Result<ObjectStore, IniError> {
    let mut store = ObjectStore::new();
    let mut current: Option<Object> = None;

    for (idx, raw) in src.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let uid = rest.strip_suffix(']').ok_or_else(|| IniError::Syntax {
                line: line_no,
                message: "unterminated section header".into(),
            })?;
            if let Some(done) = current.take() {
                store.insert(done);
            }
            current = Some(Object::new(uid.trim(), String::new()));
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| IniError::Syntax {
            line: line_no,
            message: format!("expected 'key = value', got '{}'", line),
        })?;
        let object = current.as_mut().ok_or_else(|| IniError::Syntax {
            line: line_no,
            message: "key outside of any section".into(),
        })?;
        let key = key.trim();
        let value = value.trim();

        if key == NAME_KEY {
            object.name = value.to_string();
        } else {
            let lit = literal::parse_literal(value)
                .map_err(|source| IniError::Literal { line: line_no, source })?;
            object.fields.insert(key.to_string(), literal_field(lit));
        }
    }

    if let Some(done) = current.take() {
        store.insert(done);
    }
    Ok(store)
}

/// Write the serialization atomically (temp file, then rename).
pub fn write_ini(store: &ObjectStore, path: &Path) -> Result<(), IniError> {
    let io_err = |source| IniError::Io { path: path.display().to_string(), source };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let tmp_path = path.with_extension("ini.tmp");
    std::fs::write(&tmp_path, to_ini_string(store)).map_err(io_err)?;
    std::fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}

/// Load a store previously written by `write_ini`.
pub fn load(path: &Path) -> Result<ObjectStore, IniError> {
    let src = std::fs::read_to_string(path)
        .map_err(|source| IniError::Io { path: path.display().to_string(), source })?;
    parse_ini(&src)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> ObjectStore {
        let mut store = ObjectStore::new();
        let mut thermal = Object::new("uid-6", "ThermalSensor");
        thermal.fields.insert("temp".into(), FieldValue::Numeric(vec![41.0, 42.5, f64::NAN]));
        thermal.fields.insert("core".into(), FieldValue::Numeric(vec![0.0, 1.0, 2.0]));
        thermal.fields.insert(
            "state".into(),
            FieldValue::Categorical(vec!["IDLE".into(), "BUSY".into(), "it's".into()]),
        );
        store.insert(thermal);
        let mut defrag = Object::new("uid-44", "DefragInfo");
        defrag.fields.insert("note".into(), FieldValue::Text("free = text".into()));
        defrag.fields.insert("tiny".into(), FieldValue::Numeric(vec![1e-7, -3.25e12]));
        store.insert(defrag);
        store.insert(Object::unknown(99));
        store
    }

    #[test]
    fn test_keys_sorted_and_sections_in_order() {
        let text = to_ini_string(&sample_store());
        let first = text.lines().take(5).collect::<Vec<_>>();
        assert_eq!(first[0], "[uid-6]");
        assert!(first[1].starts_with("core = "));
        assert_eq!(first[2], "name = ThermalSensor");
        assert!(first[3].starts_with("state = "));
        assert!(first[4].starts_with("temp = [41.0, 42.5, nan]"));
        let uid44 = text.find("[uid-44]").unwrap();
        let uid99 = text.find("[uid-99]").unwrap();
        assert!(uid44 < uid99);
    }

    #[test]
    fn test_round_trip() {
        let store = sample_store();
        let parsed = parse_ini(&to_ini_string(&store)).unwrap();
        assert_eq!(parsed, store);
    }

    #[test]
    fn test_empty_sequences_keep_their_type() {
        let mut store = ObjectStore::new();
        let mut object = Object::new("uid-7", "PowerMonitor");
        object.fields.insert("events".into(), FieldValue::Categorical(Vec::new()));
        object.fields.insert("volts".into(), FieldValue::Numeric(Vec::new()));
        let mut nested = BTreeMap::new();
        nested.insert("modes".to_string(), FieldValue::Categorical(Vec::new()));
        object.fields.insert("rail".into(), FieldValue::Nested(nested));
        store.insert(object);

        let text = to_ini_string(&store);
        assert!(text.contains("events = ()"));
        assert!(text.contains("volts = []"));
        assert!(text.contains("rail = {'modes': ()}"));

        let parsed = parse_ini(&text).unwrap();
        assert_eq!(parsed, store);
        let loaded = parsed.get("uid-7").unwrap();
        assert_eq!(loaded.fields["events"], FieldValue::Categorical(Vec::new()));
        assert_eq!(loaded.fields["volts"], FieldValue::Numeric(Vec::new()));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("decoded.ini");
        let store = sample_store();
        write_ini(&store, &path).unwrap();
        assert_eq!(load(&path).unwrap(), store);
    }

    #[test]
    fn test_syntax_errors_report_line() {
        let err = parse_ini("[uid-1]\nname = a\nbroken line\n").unwrap_err();
        match err {
            IniError::Syntax { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_ini("x = [1]\n").is_err());
        assert!(matches!(
            parse_ini("[uid-1]\nv = [1, \n").unwrap_err(),
            IniError::Literal { line: 2, .. }
        ));
    }
}
