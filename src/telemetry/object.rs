//! Decoded telemetry objects and the run-scoped object store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Value held by one field of an object or ticket.
///
/// Telemetry fields are mostly `Numeric` sequences (one sample per capture);
/// enum-valued counters decode to `Categorical`. Tickets additionally carry
/// free `Text` and `Nested` sub-records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Numeric(Vec<f64>),
    Categorical(Vec<String>),
    Text(String),
    Nested(BTreeMap<String, FieldValue>),
    Missing,
}

impl PartialEq for FieldValue {
    /// Structural equality where `NaN` samples compare equal to each other,
    /// so a store with missing samples still round-trips.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Numeric(a), FieldValue::Numeric(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
            }
            (FieldValue::Categorical(a), FieldValue::Categorical(b)) => a == b,
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            (FieldValue::Nested(a), FieldValue::Nested(b)) => a == b,
            (FieldValue::Missing, FieldValue::Missing) => true,
            _ => false,
        }
    }
}

impl FieldValue {
    /// Numeric view of the value, if it has one.
    ///
    /// `Text` that parses as a number becomes a one-sample sequence; every
    /// other non-numeric variant yields `None` and is skipped by numeric
    /// consumers.
    pub fn coerce_numeric(&self) -> Option<Vec<f64>> {
        match self {
            FieldValue::Numeric(v) => Some(v.clone()),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok().map(|x| vec![x]),
            _ => None,
        }
    }

    /// Number of samples for sequence variants.
    pub fn sample_count(&self) -> Option<usize> {
        match self {
            FieldValue::Numeric(v) => Some(v.len()),
            FieldValue::Categorical(v) => Some(v.len()),
            _ => None,
        }
    }

    /// Lowercased text suitable for sentence embedding.
    ///
    /// Nested records are walked depth-first (keys in order), skipping keys
    /// listed in `noise`. Values spelling `none` are dropped.
    pub fn embed_text(&self, noise: &dyn Fn(&str) -> bool) -> Option<String> {
        let mut parts = Vec::new();
        self.collect_text(noise, &mut parts);
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }

    fn collect_text(&self, noise: &dyn Fn(&str) -> bool, out: &mut Vec<String>) {
        match self {
            FieldValue::Text(s) => push_text(out, s),
            FieldValue::Categorical(v) => push_text(out, &v.join(" ")),
            FieldValue::Numeric(v) => push_text(
                out,
                &v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(" "),
            ),
            FieldValue::Nested(map) => {
                for (key, value) in map {
                    if !noise(key) {
                        value.collect_text(noise, out);
                    }
                }
            }
            FieldValue::Missing => {}
        }
    }

    /// Append the samples of another capture of the same field.
    ///
    /// Mismatched variants replace the current value; scalar variants keep the
    /// latest capture.
    pub fn append(&mut self, other: FieldValue) {
        match (self, other) {
            (FieldValue::Numeric(a), FieldValue::Numeric(b)) => a.extend(b),
            (FieldValue::Categorical(a), FieldValue::Categorical(b)) => a.extend(b),
            (slot, other) => *slot = other,
        }
    }
}

fn push_text(out: &mut Vec<String>, s: &str) {
    let s = s.trim().to_lowercase();
    if !s.is_empty() && s != "none" {
        out.push(s);
    }
}

/// A named time-series record decoded from telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Stable identifier, `uid-N`
    pub uid: String,
    /// Human-readable name (`unknown-<uid>` when no decoder knows the object)
    pub name: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Object {
    pub fn new(uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self { uid: uid.into(), name: name.into(), fields: BTreeMap::new() }
    }

    /// Placeholder for an object the decoder set does not describe.
    pub fn unknown(uid_number: u32) -> Self {
        let uid = format!("uid-{}", uid_number);
        Self::new(uid.clone(), format!("unknown-{}", uid))
    }

    pub fn is_unknown(&self) -> bool {
        self.name.starts_with("unknown-")
    }

    /// Number of captures, taken from the longest sequence field.
    pub fn capture_depth(&self) -> usize {
        self.fields.values().filter_map(FieldValue::sample_count).max().unwrap_or(0)
    }

    /// Fields with a numeric sequence, in key order.
    pub fn numeric_fields(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.fields.iter().filter_map(|(k, v)| match v {
            FieldValue::Numeric(s) => Some((k.as_str(), s.as_slice())),
            _ => None,
        })
    }

    /// Numeric field uid number (`uid-44` -> 44).
    pub fn uid_number(&self) -> Option<u32> {
        self.uid.strip_prefix("uid-").and_then(|n| n.parse().ok())
    }
}

/// Insertion-ordered mapping from object identifier to object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectStore {
    objects: Vec<Object>,
    index: HashMap<String, usize>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object; an existing uid keeps its position and is replaced.
    pub fn insert(&mut self, object: Object) {
        match self.index.get(&object.uid) {
            Some(&i) => self.objects[i] = object,
            None => {
                self.index.insert(object.uid.clone(), self.objects.len());
                self.objects.push(object);
            }
        }
    }

    pub fn get(&self, uid: &str) -> Option<&Object> {
        self.index.get(uid).map(|&i| &self.objects[i])
    }

    pub fn get_mut(&mut self, uid: &str) -> Option<&mut Object> {
        match self.index.get(uid) {
            Some(&i) => self.objects.get_mut(i),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn uids(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(|o| o.uid.as_str())
    }

    /// Objects named in `uids` that the store holds, in store order.
    ///
    /// An empty selection selects every known object.
    pub fn select(&self, uids: &[String]) -> Vec<&Object> {
        self.objects
            .iter()
            .filter(|o| !o.is_unknown())
            .filter(|o| uids.is_empty() || uids.iter().any(|u| u == &o.uid))
            .collect()
    }
}
