//! Firmware log format catalog.
//!
//! The catalog file assigns a literal dict to `formats`:
//!
//! ```text
//! formats = {
//!     0x101: ("ThermalSensor temp=%d core=%d", "thermal.c", 88, ["temp", "core"]),
//! }
//! ```
//!
//! Each entry becomes a matcher regex, a parameter type list and a dense
//! signature (sentence embedding of the literal words, PCA-projected).
//! Entries are bucketed by the first seven characters of their format, or
//! `generic` when a specifier starts inside that prefix.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::embedding::{Metric, NeighborIndex, Projection, SentenceEmbedder};
use crate::literal::{parse_assignments, Literal, LiteralError};

pub const GENERIC_LABEL: &str = "generic";
pub const LABEL_LEN: usize = 7;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read format catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("format catalog is not a valid literal file: {0}")]
    Parse(#[from] LiteralError),

    #[error("format catalog does not define a `formats` dict")]
    MissingFormats,

    #[error("format catalog entry {key}: {reason}")]
    BadEntry { key: String, reason: String },

    #[error("format catalog has no entries")]
    Empty,
}

// ============================================================================
// Specifiers
// ============================================================================

/// How a captured parameter is coerced to a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// `d`, `i`, `u`
    Int,
    /// `x`, `X`, `f`; unsigned
    Hex,
    /// `s`
    Str,
    /// `c`
    Chr,
}

/// One `%[-.digits][l...]conv` specifier and its byte span in the format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specifier {
    pub start: usize,
    pub end: usize,
    pub flags: String,
    pub long: bool,
    pub conversion: char,
}

impl Specifier {
    pub fn param_type(&self) -> ParamType {
        match self.conversion {
            'd' | 'i' | 'u' => ParamType::Int,
            'x' | 'X' | 'f' => ParamType::Hex,
            's' => ParamType::Str,
            _ => ParamType::Chr,
        }
    }

    /// Parameter words this specifier consumes: a long (`l`) specifier is a
    /// 64-bit value logged as a high and a low 32-bit word.
    pub fn slots(&self) -> usize {
        if self.long { 2 } else { 1 }
    }

    /// First digit run of the flags, read as a field width.
    fn width_hint(&self) -> Option<usize> {
        let digits: String = self
            .flags
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse().ok()
    }

    /// Capture group matching what this specifier prints.
    fn capture_pattern(&self) -> String {
        match (self.width_hint(), self.conversion) {
            (Some(n), 'd' | 'i' | 'u') => format!(r"(-?\w{{{}}})", n),
            (Some(n), 'f') => format!(r"(\w{{{}}})", n),
            (Some(n), 'x' | 'X') => format!(r"(\w{{{},{}}}?)", n, 2 * n),
            (Some(n), _) => format!(r"(.{{{}}})", n),
            (None, 'd' | 'i' | 'u') => r"(-?\w+)".to_string(),
            (None, 'c') => r"(.{1})".to_string(),
            (None, _) => r"(\w+)".to_string(),
        }
    }
}

const CONVERSIONS: &str = "cdfiusxX";

/// Scan a printf-style format for specifiers; `%%` is a literal percent.
pub fn specifiers(format: &str) -> Vec<Specifier> {
    let bytes = format.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'%') {
            i += 2;
            continue;
        }
        let mut j = i + 1;
        while j < bytes.len() && (bytes[j] == b'-' || bytes[j] == b'.' || bytes[j].is_ascii_digit()) {
            j += 1;
        }
        let flags_end = j;
        while j < bytes.len() && bytes[j] == b'l' {
            j += 1;
        }
        match bytes.get(j) {
            Some(&c) if CONVERSIONS.as_bytes().contains(&c) => {
                out.push(Specifier {
                    start: i,
                    end: j + 1,
                    flags: format[i + 1..flags_end].to_string(),
                    long: j > flags_end,
                    conversion: c as char,
                });
                i = j + 1;
            }
            _ => i += 1,
        }
    }
    out
}

/// Parameter words consumed by `specs`.
pub fn slot_count(specs: &[Specifier]) -> usize {
    specs.iter().map(Specifier::slots).sum()
}

/// Literal text between specifiers, with `%%` collapsed and line breaks removed.
pub fn literal_segments(format: &str, specs: &[Specifier]) -> Vec<String> {
    let mut segments = Vec::with_capacity(specs.len() + 1);
    let mut pos = 0;
    for s in specs {
        segments.push(clean_literal(&format[pos..s.start]));
        pos = s.end;
    }
    segments.push(clean_literal(&format[pos..]));
    segments
}

fn clean_literal(text: &str) -> String {
    text.replace("%%", "%").replace("\\n", "").replace('\n', "")
}

/// Format text as stored in the catalog: outer quotes and line breaks removed.
fn normalize_format(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.trim_end_matches("\\n").trim_end_matches('\n').trim().to_string()
}

/// Collapse whitespace runs so literal formats compare equal to parsed
/// descriptions (which are re-joined with single spaces).
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub index: usize,
    pub key: String,
    /// Literal format string, quotes stripped
    pub format: String,
    pub label: String,
    pub arity: usize,
    pub specifiers: Vec<Specifier>,
    pub param_types: Vec<ParamType>,
    pub signature: Vec<f64>,
    pub(crate) regex: Regex,
}

impl CatalogEntry {
    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

/// A raw catalog row before signatures are computed.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatSpec {
    pub key: String,
    pub format: String,
    /// Declared parameter count (length of the trailing name list), if any
    pub declared_arity: Option<usize>,
}

impl FormatSpec {
    pub fn new(key: impl Into<String>, format: impl Into<String>) -> Self {
        Self { key: key.into(), format: format.into(), declared_arity: None }
    }
}

#[derive(Debug, Clone)]
pub struct FormatCatalog {
    entries: Vec<CatalogEntry>,
    buckets: HashMap<String, Vec<usize>>,
    literals: HashMap<String, usize>,
    index: NeighborIndex,
    signature_dim: usize,
}

impl FormatCatalog {
    /// Read and build the catalog from a literal file.
    pub fn load(
        path: &Path,
        embedder: &dyn SentenceEmbedder,
        signature_dim: usize,
        seed: u64,
    ) -> Result<Self, CatalogError> {
        let src = std::fs::read_to_string(path)
            .map_err(|source| CatalogError::Io { path: path.to_path_buf(), source })?;
        let catalog = Self::from_source(&src, embedder, signature_dim, seed)?;
        info!(path = %path.display(), entries = catalog.len(), "Format catalog loaded");
        Ok(catalog)
    }

    pub fn from_source(
        src: &str,
        embedder: &dyn SentenceEmbedder,
        signature_dim: usize,
        seed: u64,
    ) -> Result<Self, CatalogError> {
        Self::build(parse_formats(src)?, embedder, signature_dim, seed)
    }

    pub fn build(
        specs: Vec<FormatSpec>,
        embedder: &dyn SentenceEmbedder,
        signature_dim: usize,
        seed: u64,
    ) -> Result<Self, CatalogError> {
        if specs.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut entries = Vec::with_capacity(specs.len());
        let mut texts = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let format = normalize_format(&spec.format);
            let specs_found = specifiers(&format);
            let segments = literal_segments(&format, &specs_found);

            let mut pattern = String::from("^");
            for (i, seg) in segments.iter().enumerate() {
                pattern.push_str(&literal_pattern(seg));
                if let Some(s) = specs_found.get(i) {
                    pattern.push_str(&s.capture_pattern());
                }
            }
            pattern.push_str(r"\s*$");
            let regex = Regex::new(&pattern)
                .map_err(|e| CatalogError::BadEntry { key: spec.key.clone(), reason: e.to_string() })?;

            // Declared names count specifiers; arity counts parameter words
            let arity = match spec.declared_arity {
                Some(n) if n > specs_found.len() => {
                    warn!(key = %spec.key, declared = n, found = specs_found.len(), "Catalog arity exceeds specifiers, clamping");
                    slot_count(&specs_found)
                }
                Some(n) => slot_count(&specs_found[..n]),
                None => slot_count(&specs_found),
            };

            let label = match specs_found.first() {
                Some(s) if format[..s.start].chars().count() < LABEL_LEN => GENERIC_LABEL.to_string(),
                _ => format.chars().take(LABEL_LEN).collect(),
            };

            texts.push(collapse_whitespace(&segments.join(" ")));
            entries.push(CatalogEntry {
                index,
                key: spec.key,
                param_types: specs_found.iter().map(Specifier::param_type).collect(),
                specifiers: specs_found,
                format,
                label,
                arity,
                signature: Vec::new(),
                regex,
            });
        }

        let embeddings = embedder.embed_batch(&texts);
        let projection = Projection::fit_pca(&embeddings, signature_dim, seed);
        let signatures = projection.transform_all(&embeddings, Some(signature_dim));
        debug!(components = projection.n_components(), signature_dim, "Catalog signatures projected");

        let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
        let mut literals: HashMap<String, usize> = HashMap::new();
        for (entry, sig) in entries.iter_mut().zip(signatures) {
            entry.signature = sig;
            buckets.entry(entry.label.clone()).or_default().push(entry.index);
            literals.entry(collapse_whitespace(&entry.format)).or_insert(entry.index);
        }

        let index = NeighborIndex::new(
            Metric::Euclidean,
            entries.iter().map(|e| e.key.clone()).collect(),
            entries.iter().map(|e| e.signature.clone()).collect(),
        );

        Ok(Self { entries, buckets, literals, index, signature_dim })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn signature_dim(&self) -> usize {
        self.signature_dim
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&CatalogEntry> {
        self.entries.get(index)
    }

    pub fn bucket(&self, label: &str) -> Option<&[usize]> {
        self.buckets.get(label).map(Vec::as_slice)
    }

    /// Entry whose literal format equals `text` (whitespace-insensitive).
    pub fn literal_match(&self, text: &str) -> Option<&CatalogEntry> {
        self.literals.get(&collapse_whitespace(text)).and_then(|&i| self.entries.get(i))
    }

    /// Entry with the signature closest (Euclidean) to `signature`.
    pub fn nearest_signature(&self, signature: &[f64]) -> Option<&CatalogEntry> {
        let hit = self.index.nearest(signature, 1, None);
        hit.first().and_then(|n| self.entries.get(n.index))
    }
}

/// Escaped literal text; whitespace runs match any whitespace run.
fn literal_pattern(segment: &str) -> String {
    let mut out = String::new();
    let mut in_space = false;
    for ch in segment.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push_str(r"\s+");
                in_space = true;
            }
        } else {
            in_space = false;
            out.push_str(&regex::escape(ch.encode_utf8(&mut [0u8; 4])));
        }
    }
    out
}

/// Extract the `formats` dict from a catalog file, in source order.
pub fn parse_formats(src: &str) -> Result<Vec<FormatSpec>, CatalogError> {
    let module = parse_assignments(src)?;
    let pairs = match module.get("formats") {
        Some(Literal::Dict(pairs)) => pairs,
        _ => return Err(CatalogError::MissingFormats),
    };

    pairs
        .iter()
        .map(|(k, v)| {
            let key = match k {
                Literal::Str(s) => s.clone(),
                Literal::Int(i) => format!("{:#x}", i),
                other => format!("{:?}", other),
            };
            let (format, declared_arity) = match v {
                Literal::Str(s) => (s.clone(), None),
                Literal::Tuple(items) | Literal::List(items) => {
                    let format = items
                        .first()
                        .and_then(Literal::as_str)
                        .ok_or_else(|| CatalogError::BadEntry {
                            key: key.clone(),
                            reason: "first element must be the format string".to_string(),
                        })?
                        .to_string();
                    let declared = if items.len() > 1 {
                        items.last().and_then(Literal::as_seq).map(<[Literal]>::len)
                    } else {
                        None
                    };
                    (format, declared)
                }
                _ => {
                    return Err(CatalogError::BadEntry {
                        key,
                        reason: "expected a tuple or a string".to_string(),
                    })
                }
            };
            Ok(FormatSpec { key, format, declared_arity })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    const CATALOG: &str = r#"
# firmware formats
formats = {
    0x101: ("ThermalSensor temp=%d core=%d", "thermal.c", 88, ["temp", "core"]),
    0x102: ("%d blocks retired", "bbm.c", 12, ["count"]),
    0x103: ("Media error on die %u at lba 0x%08lx", "media.c", 40, ["die", "lba"]),
    0x104: ("Boot complete", "boot.c", 5, []),
}
"#;

    fn catalog() -> FormatCatalog {
        FormatCatalog::from_source(CATALOG, &HashingEmbedder::default(), 4, 7).unwrap()
    }

    #[test]
    fn test_specifier_scan() {
        let specs = specifiers("100%% done: %-4d of %08lX %c");
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].flags, "-4");
        assert!(!specs[0].long);
        assert!(specs[1].long);
        assert_eq!(specs[1].conversion, 'X');
        assert_eq!(specs[2].param_type(), ParamType::Chr);
        assert_eq!(specs.iter().map(Specifier::slots).collect::<Vec<_>>(), vec![1, 2, 1]);
        assert_eq!(slot_count(&specs), 4);
    }

    #[test]
    fn test_capture_patterns() {
        let p = |f: &str| specifiers(f)[0].capture_pattern();
        assert_eq!(p("%d"), r"(-?\w+)");
        assert_eq!(p("%x"), r"(\w+)");
        assert_eq!(p("%c"), r"(.{1})");
        assert_eq!(p("%s"), r"(\w+)");
        assert_eq!(p("%4d"), r"(-?\w{4})");
        assert_eq!(p("%08x"), r"(\w{8,16}?)");
        assert_eq!(p("%3s"), r"(.{3})");
    }

    #[test]
    fn test_labels_and_arity() {
        let c = catalog();
        assert_eq!(c.len(), 4);
        assert_eq!(c.entry(0).unwrap().label, "Thermal");
        assert_eq!(c.entry(0).unwrap().arity, 2);
        assert_eq!(c.entry(1).unwrap().label, GENERIC_LABEL);
        // `%08lx` is logged as two words
        assert_eq!(c.entry(2).unwrap().arity, 3);
        assert_eq!(c.entry(3).unwrap().arity, 0);
        assert_eq!(c.bucket("Media e"), Some(&[2][..]));
    }

    #[test]
    fn test_signatures_are_deterministic_and_sized() {
        let a = catalog();
        let b = catalog();
        for (x, y) in a.entries().iter().zip(b.entries()) {
            assert_eq!(x.signature.len(), 4);
            assert_eq!(x.signature, y.signature);
        }
        let probe = a.entry(2).unwrap().signature.clone();
        assert_eq!(a.nearest_signature(&probe).unwrap().index, 2);
    }

    #[test]
    fn test_rejects_non_literal_catalog() {
        assert!(matches!(
            FormatCatalog::from_source("formats = open('x')", &HashingEmbedder::default(), 4, 1),
            Err(CatalogError::Parse(_))
        ));
        assert!(matches!(
            FormatCatalog::from_source("other = {}", &HashingEmbedder::default(), 4, 1),
            Err(CatalogError::MissingFormats)
        ));
    }
}
