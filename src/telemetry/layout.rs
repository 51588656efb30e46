//! Per-family object layouts used to decode telemetry payloads.
//!
//! Each product family ships one TOML file in the format directory:
//!
//! ```toml
//! family = "ADP"
//!
//! [[objects]]
//! uid = 6
//! name = "ThermalSensor"
//!
//! [[objects.fields]]
//! name = "temp"
//! kind = "i16"
//! sentinel = -32768
//!
//! [[objects.fields]]
//! name = "state"
//! kind = "u8"
//! categories = ["IDLE", "BUSY", "THROTTLED"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::decoder::DecoderError;

/// Wire type of one field sample (little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// One byte rendered as a character
    Char,
}

impl FieldKind {
    pub fn size(self) -> usize {
        match self {
            FieldKind::U8 | FieldKind::I8 | FieldKind::Char => 1,
            FieldKind::U16 | FieldKind::I16 => 2,
            FieldKind::U32 | FieldKind::I32 | FieldKind::F32 => 4,
            FieldKind::U64 | FieldKind::I64 | FieldKind::F64 => 8,
        }
    }

    /// Read one sample as `f64`. `bytes` must be exactly `size()` long.
    pub fn read(self, bytes: &[u8]) -> f64 {
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        match self {
            FieldKind::U8 | FieldKind::Char => f64::from(bytes[0]),
            FieldKind::I8 => f64::from(bytes[0] as i8),
            FieldKind::U16 => f64::from(u16::from_le_bytes([buf[0], buf[1]])),
            FieldKind::I16 => f64::from(i16::from_le_bytes([buf[0], buf[1]])),
            FieldKind::U32 => f64::from(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            FieldKind::I32 => f64::from(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            FieldKind::F32 => f64::from(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            FieldKind::U64 => u64::from_le_bytes(buf) as f64,
            FieldKind::I64 => i64::from_le_bytes(buf) as f64,
            FieldKind::F64 => f64::from_le_bytes(buf),
        }
    }

    /// Write one sample, truncating to the wire type.
    pub fn write(self, value: f64, out: &mut Vec<u8>) {
        match self {
            FieldKind::U8 | FieldKind::Char => out.push(value as u8),
            FieldKind::I8 => out.push((value as i8) as u8),
            FieldKind::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            FieldKind::I16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            FieldKind::U32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
            FieldKind::I32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            FieldKind::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            FieldKind::U64 => out.extend_from_slice(&(value as u64).to_le_bytes()),
            FieldKind::I64 => out.extend_from_slice(&(value as i64).to_le_bytes()),
            FieldKind::F64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, FieldKind::F32 | FieldKind::F64)
    }
}

/// Layout of one field inside an object sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldLayout {
    pub name: String,
    pub kind: FieldKind,

    /// Labels for enum-valued fields; the raw value indexes into this list
    #[serde(default)]
    pub categories: Vec<String>,

    /// Raw value marking a missing sample
    #[serde(default)]
    pub sentinel: Option<f64>,
}

impl FieldLayout {
    pub fn is_categorical(&self) -> bool {
        !self.categories.is_empty() || self.kind == FieldKind::Char
    }
}

/// Layout of one object: a fixed-size sample repeated per capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectLayout {
    pub uid: u32,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldLayout>,
}

impl ObjectLayout {
    /// Bytes per capture sample.
    pub fn sample_size(&self) -> usize {
        self.fields.iter().map(|f| f.kind.size()).sum()
    }
}

/// All object layouts of one product family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyLayout {
    pub family: String,
    #[serde(default)]
    pub objects: Vec<ObjectLayout>,
}

impl FamilyLayout {
    pub fn object(&self, uid: u32) -> Option<&ObjectLayout> {
        self.objects.iter().find(|o| o.uid == uid)
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for object in &self.objects {
            if !seen.insert(object.uid) {
                return Err(format!("duplicate uid {}", object.uid));
            }
            for field in &object.fields {
                if field.name == super::ini::NAME_KEY || field.name.contains('=') || field.name.is_empty() {
                    return Err(format!("uid {}: invalid field name '{}'", object.uid, field.name));
                }
            }
        }
        Ok(())
    }
}

/// Family-keyed catalog directory, loaded lazily.
#[derive(Debug)]
pub struct LayoutCatalog {
    dir: PathBuf,
    families: HashMap<String, FamilyLayout>,
}

impl LayoutCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), families: HashMap::new() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Register a layout directly (used when the layouts are already in memory).
    pub fn insert(&mut self, layout: FamilyLayout) {
        self.families.insert(layout.family.clone(), layout);
    }

    /// Layout for `family`, reading `<dir>/<family>.toml` on first use.
    pub fn family(&mut self, family: &str) -> Result<&FamilyLayout, DecoderError> {
        if !self.families.contains_key(family) {
            let path = self.dir.join(format!("{}.toml", family));
            if !path.exists() {
                return Err(DecoderError::NoDecoder {
                    family: family.to_string(),
                    catalog: self.dir.display().to_string(),
                });
            }
            let text = std::fs::read_to_string(&path)
                .map_err(|source| DecoderError::Io { path: path.display().to_string(), source })?;
            let layout: FamilyLayout = toml::from_str(&text).map_err(|e| DecoderError::Layout {
                family: family.to_string(),
                message: e.to_string(),
            })?;
            layout.validate().map_err(|message| DecoderError::Layout {
                family: family.to_string(),
                message,
            })?;
            self.families.insert(family.to_string(), layout);
        }
        self.families.get(family).ok_or_else(|| DecoderError::NoDecoder {
            family: family.to_string(),
            catalog: self.dir.display().to_string(),
        })
    }
}
