//! Ticket records and the noise-field list.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::TicketError;
use crate::telemetry::FieldValue;

/// Fields compared against known-cause labels when ranking.
pub const TEXT_FIELDS: [&str; 4] = ["summary", "description", "Resolution Description", "Fixed in Component"];

/// One defect ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl TicketRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), fields: BTreeMap::new() }
    }

    pub fn with_text(mut self, field: &str, text: impl Into<String>) -> Self {
        self.fields.insert(field.to_string(), FieldValue::Text(text.into()));
        self
    }

    /// Build from a search-result issue: `key` becomes the id and every
    /// entry of `fields` a field value.
    pub fn from_issue(issue: &Value) -> Option<Self> {
        let id = issue.get("key").and_then(Value::as_str)?.to_string();
        let fields = issue
            .get("fields")
            .and_then(Value::as_object)
            .map(|map| map.iter().map(|(k, v)| (k.clone(), json_to_field(v))).collect())
            .unwrap_or_default();
        Some(Self { id, fields })
    }

    /// Lowercased text of one field, `None` when absent or empty.
    pub fn field_text(&self, field: &str, noise: &NoiseSet) -> Option<String> {
        self.fields.get(field).and_then(|v| v.embed_text(&|k| noise.contains(k)))
    }

    /// Non-noise field names carrying text, in key order.
    pub fn text_fields<'a>(&'a self, noise: &'a NoiseSet) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .keys()
            .map(String::as_str)
            .filter(move |k| !noise.contains(k))
            .filter(move |k| self.field_text(k, noise).is_some())
    }
}

fn json_to_field(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Missing,
        Value::Bool(b) => FieldValue::Text(b.to_string()),
        Value::Number(n) => n.as_f64().map_or(FieldValue::Missing, |v| FieldValue::Numeric(vec![v])),
        Value::String(s) => FieldValue::Text(s.clone()),
        Value::Array(items) => {
            if items.iter().all(|v| v.is_string()) {
                FieldValue::Categorical(items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            } else {
                FieldValue::Nested(items.iter().enumerate().map(|(i, v)| (i.to_string(), json_to_field(v))).collect())
            }
        }
        Value::Object(map) => FieldValue::Nested(map.iter().map(|(k, v)| (k.clone(), json_to_field(v))).collect()),
    }
}

// ============================================================================
// Noise list
// ============================================================================

/// Field names excluded from embedding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoiseSet {
    keys: BTreeSet<String>,
}

#[derive(Deserialize)]
struct NoiseDocument {
    #[serde(rename = "noiseKeys", default)]
    noise_keys: Vec<String>,
}

impl NoiseSet {
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { keys: keys.into_iter().map(Into::into).collect() }
    }

    /// Read a JSON or TOML document with a `noiseKeys` list; the format is
    /// chosen by extension.
    pub fn load(path: &Path) -> Result<Self, TicketError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| TicketError::Io { path: path.to_path_buf(), source })?;
        let doc: NoiseDocument = if path.extension().is_some_and(|e| e == "toml") {
            toml::from_str(&text)
                .map_err(|e| TicketError::Format { path: path.to_path_buf(), reason: e.to_string() })?
        } else {
            serde_json::from_str(&text)
                .map_err(|e| TicketError::Format { path: path.to_path_buf(), reason: e.to_string() })?
        };
        Ok(Self::from_keys(doc.noise_keys))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_issue_maps_json_shapes() {
        let issue = json!({
            "key": "FW-101",
            "fields": {
                "summary": "Assert DF049 on boot",
                "priority": {"name": "P1", "id": "2"},
                "labels": ["thermal", "boot"],
                "votes": 3,
                "resolution": null
            }
        });
        let t = TicketRecord::from_issue(&issue).unwrap();
        assert_eq!(t.id, "FW-101");
        assert_eq!(t.fields["summary"], FieldValue::Text("Assert DF049 on boot".into()));
        assert!(matches!(t.fields["priority"], FieldValue::Nested(_)));
        assert_eq!(t.fields["labels"], FieldValue::Categorical(vec!["thermal".into(), "boot".into()]));
        assert_eq!(t.fields["resolution"], FieldValue::Missing);
        assert!(TicketRecord::from_issue(&json!({"fields": {}})).is_none());
    }

    #[test]
    fn test_noise_keys_skip_fields_and_nested_keys() {
        let noise = NoiseSet::from_keys(["id", "self"]);
        let mut nested = BTreeMap::new();
        nested.insert("name".to_string(), FieldValue::Text("Firmware".into()));
        nested.insert("self".to_string(), FieldValue::Text("https://tickets/1".into()));
        let t = TicketRecord::new("FW-1")
            .with_text("summary", "Read Retry")
            .with_text("id", "12345")
            .with_text("environment", "None");
        let mut t = t;
        t.fields.insert("component".into(), FieldValue::Nested(nested));

        assert_eq!(t.field_text("component", &noise).as_deref(), Some("firmware"));
        let fields: Vec<&str> = t.text_fields(&noise).collect();
        assert_eq!(fields, vec!["component", "summary"]);
    }

    #[test]
    fn test_noise_document_formats() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("noise.json");
        std::fs::write(&json_path, r#"{"noiseKeys": ["id", "self"]}"#).unwrap();
        let toml_path = dir.path().join("noise.toml");
        std::fs::write(&toml_path, "noiseKeys = [\"watches\"]\n").unwrap();

        assert_eq!(NoiseSet::load(&json_path).unwrap().len(), 2);
        assert!(NoiseSet::load(&toml_path).unwrap().contains("watches"));
        assert!(NoiseSet::load(&dir.path().join("missing.json")).is_err());
    }
}
