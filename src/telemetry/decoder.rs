//! Binary telemetry payload decoder.
//!
//! Payload layout (little-endian):
//!
//! ```text
//! magic "TLMY" | u16 version | u16 family_len | family (UTF-8) | u32 record_count
//! record: u32 uid | u32 depth | u32 byte_len | depth * sample bytes
//! ```
//!
//! The family named in the header selects the layout set. Records whose uid
//! the family does not describe are kept as `unknown-<uid>` objects with no
//! fields. Several payloads of the same drive append captures per object.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::ini::{self, IniError};
use super::layout::{FamilyLayout, FieldLayout, LayoutCatalog, ObjectLayout};
use super::object::{FieldValue, Object, ObjectStore};

/// Payload magic bytes.
pub const PAYLOAD_MAGIC: &[u8; 4] = b"TLMY";

/// Payload format version written by `encode_payload`.
pub const PAYLOAD_VERSION: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bad payload header in {file}: {reason}")]
    BadHeader { file: String, reason: String },
    #[error("no decoder for product family '{family}' in {catalog}")]
    NoDecoder { family: String, catalog: String },
    #[error("invalid layout for family '{family}': {message}")]
    Layout { family: String, message: String },
    #[error("truncated payload {file} at uid {uid}")]
    Truncated { file: String, uid: u32 },
    #[error("record uid {uid} in {file}: {reason}")]
    BadRecord { file: String, uid: u32, reason: String },
    #[error("cannot encode uid {uid} field '{field}': {reason}")]
    Encode { uid: u32, field: String, reason: String },
    #[error("no payloads found in {0}")]
    NoPayloads(String),
    #[error(transparent)]
    Ini(#[from] IniError),
}

/// Parsed payload header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    pub version: u16,
    pub family: String,
    pub record_count: u32,
}

/// Little-endian reader over a payload.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Read just the header of a payload.
pub fn read_header(bytes: &[u8], file: &str) -> Result<PayloadHeader, DecoderError> {
    let bad = |reason: &str| DecoderError::BadHeader { file: file.to_string(), reason: reason.to_string() };
    let mut r = ByteReader::new(bytes);
    let magic = r.take(4).ok_or_else(|| bad("shorter than magic"))?;
    if magic != PAYLOAD_MAGIC {
        return Err(bad("magic mismatch"));
    }
    let version = r.u16().ok_or_else(|| bad("missing version"))?;
    let family_len = r.u16().ok_or_else(|| bad("missing family length"))? as usize;
    let family = r.take(family_len).ok_or_else(|| bad("truncated family name"))?;
    let family = std::str::from_utf8(family).map_err(|_| bad("family name is not UTF-8"))?;
    let record_count = r.u32().ok_or_else(|| bad("missing record count"))?;
    Ok(PayloadHeader { version, family: family.to_string(), record_count })
}

/// Decodes payload directories into an `ObjectStore`.
#[derive(Debug)]
pub struct Decoder {
    catalog: LayoutCatalog,
}

impl Decoder {
    pub fn new(format_dir: impl Into<PathBuf>) -> Self {
        Self { catalog: LayoutCatalog::new(format_dir) }
    }

    pub fn with_catalog(catalog: LayoutCatalog) -> Self {
        Self { catalog }
    }

    /// Decode one payload, appending its objects to `store`.
    pub fn decode_payload(
        &mut self,
        bytes: &[u8],
        file: &str,
        store: &mut ObjectStore,
    ) -> Result<PayloadHeader, DecoderError> {
        let header = read_header(bytes, file)?;
        let layout = self.catalog.family(&header.family)?;

        let mut r = ByteReader::new(bytes);
        // Skip past the header we already validated
        r.take(4 + 2 + 2 + header.family.len() + 4);

        for _ in 0..header.record_count {
            let truncated = |uid| DecoderError::Truncated { file: file.to_string(), uid };
            let uid = r.u32().ok_or_else(|| truncated(0))?;
            let depth = r.u32().ok_or_else(|| truncated(uid))? as usize;
            let byte_len = r.u32().ok_or_else(|| truncated(uid))? as usize;
            let data = r.take(byte_len).ok_or_else(|| truncated(uid))?;

            let object = match layout.object(uid) {
                Some(object_layout) => decode_record(object_layout, depth, data, file)?,
                None => {
                    debug!(uid, family = %header.family, "Record not described by family layout");
                    Object::unknown(uid)
                }
            };
            merge_capture(store, object);
        }

        Ok(header)
    }
}

fn decode_record(
    layout: &ObjectLayout,
    depth: usize,
    data: &[u8],
    file: &str,
) -> Result<Object, DecoderError> {
    let sample_size = layout.sample_size();
    if data.len() != depth * sample_size {
        return Err(DecoderError::BadRecord {
            file: file.to_string(),
            uid: layout.uid,
            reason: format!(
                "{} bytes for {} samples of {} bytes",
                data.len(),
                depth,
                sample_size
            ),
        });
    }

    let mut object = Object::new(format!("uid-{}", layout.uid), layout.name.clone());
    let mut columns: Vec<Vec<f64>> = vec![Vec::with_capacity(depth); layout.fields.len()];

    for sample in 0..depth {
        let mut offset = sample * sample_size;
        for (i, field) in layout.fields.iter().enumerate() {
            let size = field.kind.size();
            let raw = field.kind.read(&data[offset..offset + size]);
            let value = match field.sentinel {
                Some(s) if raw == s => f64::NAN,
                _ => raw,
            };
            columns[i].push(value);
            offset += size;
        }
    }

    for (field, column) in layout.fields.iter().zip(columns) {
        object.fields.insert(field.name.clone(), column_value(field, column));
    }
    Ok(object)
}

fn column_value(field: &FieldLayout, column: Vec<f64>) -> FieldValue {
    if !field.is_categorical() {
        return FieldValue::Numeric(column);
    }
    let labels = column
        .into_iter()
        .map(|raw| {
            if raw.is_nan() {
                return String::new();
            }
            if field.categories.is_empty() {
                return char::from(raw as u8).to_string();
            }
            field
                .categories
                .get(raw as usize)
                .cloned()
                .unwrap_or_else(|| format!("#{}", raw as i64))
        })
        .collect();
    FieldValue::Categorical(labels)
}

fn merge_capture(store: &mut ObjectStore, object: Object) {
    match store.get_mut(&object.uid) {
        Some(existing) => {
            for (name, value) in object.fields {
                match existing.fields.get_mut(&name) {
                    Some(slot) => slot.append(value),
                    None => {
                        existing.fields.insert(name, value);
                    }
                }
            }
        }
        None => store.insert(object),
    }
}

/// Decode every payload in `binary_dir`, write the serialization to
/// `out_ini_path` and return the store.
///
/// Payloads are read in file-name order. Any payload whose family has no
/// layout in `format_dir` fails the whole decode.
pub fn decode(binary_dir: &Path, format_dir: &Path, out_ini_path: &Path) -> Result<ObjectStore, DecoderError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(binary_dir)
        .map_err(|source| DecoderError::Io { path: binary_dir.display().to_string(), source })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(DecoderError::NoPayloads(binary_dir.display().to_string()));
    }

    let mut decoder = Decoder::new(format_dir);
    let mut store = ObjectStore::new();
    for path in &files {
        let bytes = std::fs::read(path)
            .map_err(|source| DecoderError::Io { path: path.display().to_string(), source })?;
        let name = path.display().to_string();
        let header = decoder.decode_payload(&bytes, &name, &mut store)?;
        info!(file = %name, family = %header.family, records = header.record_count, "Decoded payload");
    }

    let unknown = store.iter().filter(|o| o.is_unknown()).count();
    if unknown > 0 {
        warn!(unknown, "Payload contained objects with no decoder entry");
    }

    ini::write_ini(&store, out_ini_path)?;
    info!(objects = store.len(), path = %out_ini_path.display(), "Object store written");
    Ok(store)
}

/// Inverse of `decode` for the stable serialization.
pub fn load(ini_path: &Path) -> Result<ObjectStore, DecoderError> {
    Ok(ini::load(ini_path)?)
}

/// Encode a store into a payload for `layout`.
///
/// Every object must be described by the layout and carry every layout field
/// with a consistent capture depth.
pub fn encode_payload(layout: &FamilyLayout, store: &ObjectStore) -> Result<Vec<u8>, DecoderError> {
    let mut out = Vec::new();
    out.extend_from_slice(PAYLOAD_MAGIC);
    out.extend_from_slice(&PAYLOAD_VERSION.to_le_bytes());
    out.extend_from_slice(&(layout.family.len() as u16).to_le_bytes());
    out.extend_from_slice(layout.family.as_bytes());
    out.extend_from_slice(&(store.len() as u32).to_le_bytes());

    for object in store.iter() {
        let uid = object.uid_number().ok_or_else(|| DecoderError::Encode {
            uid: 0,
            field: String::new(),
            reason: format!("object id '{}' is not of the form uid-N", object.uid),
        })?;
        let object_layout = layout.object(uid).ok_or_else(|| DecoderError::Encode {
            uid,
            field: String::new(),
            reason: "uid not in layout".to_string(),
        })?;
        let depth = object.capture_depth();

        let mut data = Vec::with_capacity(depth * object_layout.sample_size());
        for sample in 0..depth {
            for field in &object_layout.fields {
                let raw = encode_sample(uid, field, object.fields.get(&field.name), sample)?;
                field.kind.write(raw, &mut data);
            }
        }

        out.extend_from_slice(&uid.to_le_bytes());
        out.extend_from_slice(&(depth as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);
    }
    Ok(out)
}

fn encode_sample(uid: u32, field: &FieldLayout, value: Option<&FieldValue>, sample: usize) -> Result<f64, DecoderError> {
    let err = |reason: String| DecoderError::Encode { uid, field: field.name.clone(), reason };
    let raw = match value {
        Some(FieldValue::Numeric(v)) => *v.get(sample).ok_or_else(|| err("short sequence".into()))?,
        Some(FieldValue::Categorical(v)) => {
            let label = v.get(sample).ok_or_else(|| err("short sequence".into()))?;
            if label.is_empty() {
                f64::NAN
            } else if field.categories.is_empty() {
                f64::from(label.bytes().next().unwrap_or(0))
            } else {
                field
                    .categories
                    .iter()
                    .position(|c| c == label)
                    .map(|p| p as f64)
                    .or_else(|| label.strip_prefix('#').and_then(|n| n.parse().ok()))
                    .ok_or_else(|| err(format!("unknown category '{}'", label)))?
            }
        }
        Some(_) => return Err(err("field is not a sequence".into())),
        None => return Err(err("field missing".into())),
    };
    if raw.is_nan() && !field.kind.is_float() {
        return field.sentinel.ok_or_else(|| err("missing sample without sentinel".into()));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::layout::FieldKind;

    fn field(name: &str, kind: FieldKind) -> FieldLayout {
        FieldLayout { name: name.into(), kind, categories: Vec::new(), sentinel: None }
    }

    fn layout() -> FamilyLayout {
        let mut state = field("state", FieldKind::U8);
        state.categories = vec!["IDLE".into(), "BUSY".into()];
        let mut temp = field("temp", FieldKind::I16);
        temp.sentinel = Some(-32768.0);
        FamilyLayout {
            family: "ADP".into(),
            objects: vec![ObjectLayout {
                uid: 6,
                name: "ThermalSensor".into(),
                fields: vec![temp, state, field("ratio", FieldKind::F32)],
            }],
        }
    }

    fn store() -> ObjectStore {
        let mut store = ObjectStore::new();
        let mut o = Object::new("uid-6", "ThermalSensor");
        o.fields.insert("temp".into(), FieldValue::Numeric(vec![40.0, f64::NAN, -3.0]));
        o.fields.insert(
            "state".into(),
            FieldValue::Categorical(vec!["IDLE".into(), "BUSY".into(), "IDLE".into()]),
        );
        o.fields.insert("ratio".into(), FieldValue::Numeric(vec![0.5, 0.25, 1.0]));
        store.insert(o);
        store
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let layout = layout();
        let bytes = encode_payload(&layout, &store()).unwrap();
        let mut catalog = LayoutCatalog::new("unused");
        catalog.insert(layout);
        let mut decoder = Decoder::with_catalog(catalog);
        let mut decoded = ObjectStore::new();
        let header = decoder.decode_payload(&bytes, "mem", &mut decoded).unwrap();
        assert_eq!(header.family, "ADP");
        assert_eq!(decoded, store());
    }

    #[test]
    fn test_unknown_uid_kept_empty() {
        let layout = layout();
        let mut bytes = encode_payload(&layout, &ObjectStore::new()).unwrap();
        // Patch record count to 1 and append an undescribed record
        let count_at = bytes.len() - 4;
        bytes[count_at..].copy_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&77u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);

        let mut catalog = LayoutCatalog::new("unused");
        catalog.insert(layout);
        let mut decoder = Decoder::with_catalog(catalog);
        let mut decoded = ObjectStore::new();
        decoder.decode_payload(&bytes, "mem", &mut decoded).unwrap();
        let unknown = decoded.get("uid-77").unwrap();
        assert!(unknown.is_unknown());
        assert!(unknown.fields.is_empty());
    }

    #[test]
    fn test_bad_magic_and_missing_family() {
        assert!(matches!(read_header(b"NOPE\x01\x00", "f"), Err(DecoderError::BadHeader { .. })));

        let mut other = layout();
        other.family = "ZZZ".into();
        let bytes = encode_payload(&other, &ObjectStore::new()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = Decoder::new(dir.path());
        let err = decoder.decode_payload(&bytes, "f", &mut ObjectStore::new()).unwrap_err();
        assert!(matches!(err, DecoderError::NoDecoder { .. }));
    }

    #[test]
    fn test_second_payload_appends_captures() {
        let layout = layout();
        let bytes = encode_payload(&layout, &store()).unwrap();
        let mut catalog = LayoutCatalog::new("unused");
        catalog.insert(layout);
        let mut decoder = Decoder::with_catalog(catalog);
        let mut decoded = ObjectStore::new();
        decoder.decode_payload(&bytes, "a", &mut decoded).unwrap();
        decoder.decode_payload(&bytes, "b", &mut decoded).unwrap();
        assert_eq!(decoded.get("uid-6").unwrap().capture_depth(), 6);
    }
}
