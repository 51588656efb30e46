//! Line tokenization against the format catalog, and the reverse rendering
//! of predicted parameters back into a log line.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::catalog::{
    literal_segments, slot_count, CatalogEntry, FormatCatalog, ParamType, Specifier, GENERIC_LABEL, LABEL_LEN,
};

const WORD_MASK: u64 = 0xFFFF_FFFF;

/// A coerced parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Param {
    Int(i64),
    /// Hex words stay unsigned until rendered
    Hex(u64),
    Text(String),
}

impl Param {
    /// Numeric value fed to the sequence models; text is packed like `%c`.
    pub fn as_f64(&self) -> f64 {
        match self {
            Param::Int(v) => *v as f64,
            Param::Hex(v) => *v as f64,
            Param::Text(s) => pack_chars(s) as f64,
        }
    }

    /// High and low 32-bit words of a 64-bit value.
    fn split_words(self) -> [Param; 2] {
        match self {
            Param::Hex(v) => [Param::Hex(v >> 32), Param::Hex(v & WORD_MASK)],
            Param::Int(v) => [Param::Int((v as u64 >> 32) as i64), Param::Int((v as u64 & WORD_MASK) as i64)],
            Param::Text(s) => Param::Int(pack_chars(&s)).split_words(),
        }
    }
}

/// Result of tokenizing one description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub index: usize,
    pub signature: Vec<f64>,
    pub params: Vec<Param>,
}

impl Token {
    /// Placeholder for lines no catalog entry matches.
    pub fn unmatched(signature_dim: usize) -> Self {
        Self { index: 0, signature: vec![0.0; signature_dim], params: Vec::new() }
    }

    /// `max_params` numeric parameters (zero padded) followed by the catalog index.
    pub fn param_vector(&self, max_params: usize) -> Vec<f64> {
        let mut out: Vec<f64> = self.params.iter().take(max_params).map(Param::as_f64).collect();
        out.resize(max_params, 0.0);
        out.push(self.index as f64);
        out
    }
}

impl FormatCatalog {
    /// Match a description: exact literal format first, then the label
    /// bucket, the generic bucket and finally every entry. First regex
    /// match wins.
    pub fn tokenize(&self, description: &str) -> Option<Token> {
        if let Some(entry) = self.literal_match(description) {
            return Some(Token { index: entry.index, signature: entry.signature.clone(), params: Vec::new() });
        }

        let label: String = description.chars().take(LABEL_LEN).collect();
        let candidates = self
            .bucket(&label)
            .into_iter()
            .chain(self.bucket(GENERIC_LABEL))
            .flatten()
            .copied()
            .chain(0..self.len());

        for index in candidates {
            let Some(entry) = self.entry(index) else { continue };
            if let Some(params) = match_entry(entry, description) {
                return Some(Token { index, signature: entry.signature.clone(), params });
            }
        }
        None
    }

    pub fn tokenize_or_blank(&self, description: &str) -> Token {
        self.tokenize(description).unwrap_or_else(|| Token::unmatched(self.signature_dim()))
    }
}

/// One parameter per word: long specifiers yield their high then low word.
fn match_entry(entry: &CatalogEntry, description: &str) -> Option<Vec<Param>> {
    let caps = entry.regex().captures(description)?;
    let mut params = Vec::with_capacity(slot_count(&entry.specifiers));
    for (i, (spec, ty)) in entry.specifiers.iter().zip(&entry.param_types).enumerate() {
        let param = coerce(caps.get(i + 1).map_or("", |m| m.as_str()), *ty);
        if spec.long {
            params.extend(param.split_words());
        } else {
            params.push(param);
        }
    }
    params.truncate(entry.arity);
    Some(params)
}

/// Coerce captured text per its specifier type.
pub fn coerce(text: &str, ty: ParamType) -> Param {
    match ty {
        ParamType::Int => Param::Int(parse_int(text)),
        ParamType::Hex => Param::Hex(u64::from_str_radix(text.trim(), 16).unwrap_or(0)),
        ParamType::Chr => Param::Int(pack_chars(text)),
        ParamType::Str => Param::Text(text.to_string()),
    }
}

fn parse_int(text: &str) -> i64 {
    let t = text.trim();
    if let Ok(v) = t.parse::<i64>() {
        return v;
    }
    // Fall back to the first digit run
    let digits: String = t.chars().skip_while(|c| !c.is_ascii_digit()).take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// `sum(byte_k * 2^(k * 32 / len))`.
pub fn pack_chars(text: &str) -> i64 {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return 0;
    }
    let step = 32.0 / bytes.len() as f64;
    let total: f64 = bytes.iter().enumerate().map(|(k, b)| *b as f64 * 2f64.powf(k as f64 * step)).sum();
    total.round() as i64
}

// ============================================================================
// Rendering
// ============================================================================

/// Render `entry` with predicted parameter values (rounded to integers).
///
/// A long specifier combines two words, `(high << 32) + low`. When fewer
/// values than words are given and the format has long specifiers, every
/// specifier takes a single 32-bit value instead. Missing values print as zero.
pub fn render(entry: &CatalogEntry, params: &[f64]) -> String {
    let needed = slot_count(&entry.specifiers);
    let combine = params.len() >= needed;
    if !combine && entry.specifiers.iter().any(|s| s.long) {
        debug!(key = %entry.key, needed, given = params.len(), "Too few words for long specifiers, rendering them as 32-bit");
    }

    let word = |i: usize| params.get(i).map_or(0, |v| to_bits(*v));
    let segments = literal_segments(&entry.format, &entry.specifiers);
    let mut out = String::new();
    let mut next = 0;
    for (i, seg) in segments.iter().enumerate() {
        out.push_str(seg);
        if let Some(spec) = entry.specifiers.get(i) {
            if spec.long && combine {
                let value = (word(next) << 32).wrapping_add(word(next + 1));
                out.push_str(&format_bits(spec, value, 64));
                next += 2;
            } else {
                out.push_str(&format_bits(spec, word(next), 32));
                next += 1;
            }
        }
    }
    out
}

/// Rounded two's-complement bits of a predicted value; non-finite is zero.
fn to_bits(value: f64) -> u64 {
    if !value.is_finite() {
        0
    } else if value < 0.0 {
        value.round() as i64 as u64
    } else {
        value.round() as u64
    }
}

struct Flags {
    left: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

fn parse_flags(flags: &str) -> Flags {
    let left = flags.contains('-');
    let body = flags.trim_start_matches('-');
    let zero = body.starts_with('0');
    let (w, p) = match body.split_once('.') {
        Some((w, p)) => (w, Some(p.parse().unwrap_or(0))),
        None => (body, None),
    };
    Flags { left, zero, width: w.parse().unwrap_or(0), precision: p }
}

/// printf-style rendering of one value; `%d`/`%i` are sign-extended at the
/// specifier's bit width (64 for `l`, 32 otherwise).
pub fn format_value(spec: &Specifier, value: f64) -> String {
    format_bits(spec, to_bits(value), if spec.long { 64 } else { 32 })
}

fn format_bits(spec: &Specifier, raw: u64, bits: usize) -> String {
    let flags = parse_flags(&spec.flags);
    let masked = if bits == 64 { raw } else { raw & WORD_MASK };

    let (body, numeric) = match spec.conversion {
        'd' | 'i' => {
            let signed = if bits == 64 {
                masked as i64
            } else if masked & (1 << 31) != 0 {
                masked as i64 - (1i64 << 32)
            } else {
                masked as i64
            };
            (signed.to_string(), true)
        }
        'u' => (masked.to_string(), true),
        'x' => (format!("{:x}", masked), true),
        'X' => (format!("{:X}", masked), true),
        'f' => (format!("{:.*}", flags.precision.unwrap_or(6), raw as i64 as f64), true),
        _ => {
            let text: String = (0..bits / 8)
                .map(|k| ((masked >> (bits - (k + 1) * 8)) & 0xFF) as u8)
                .filter(|b| *b != 0)
                .map(char::from)
                .collect();
            (text, false)
        }
    };

    let len = body.chars().count();
    if len >= flags.width {
        return body;
    }
    let pad = flags.width - len;
    if flags.left {
        format!("{}{}", body, " ".repeat(pad))
    } else if flags.zero && numeric {
        match body.strip_prefix('-') {
            Some(rest) => format!("-{}{}", "0".repeat(pad), rest),
            None => format!("{}{}", "0".repeat(pad), body),
        }
    } else {
        format!("{}{}", " ".repeat(pad), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::events::catalog::{specifiers, FormatSpec};

    fn catalog() -> FormatCatalog {
        let specs = vec![
            FormatSpec::new("a", "ThermalSensor temp=%d core=%d"),
            FormatSpec::new("b", "ThermalSensor fan=%x"),
            FormatSpec::new("c", "%d blocks retired"),
            FormatSpec::new("d", "Boot complete"),
            FormatSpec::new("e", "Tag %c%c seen"),
        ];
        FormatCatalog::build(specs, &HashingEmbedder::default(), 3, 11).unwrap()
    }

    #[test]
    fn test_thermal_line_tokenizes_to_entry() {
        let c = catalog();
        let token = c.tokenize("ThermalSensor temp=42 core=1").unwrap();
        assert_eq!(token.index, 0);
        assert_eq!(token.params, vec![Param::Int(42), Param::Int(1)]);
        assert_eq!(token.signature, c.entry(0).unwrap().signature);
    }

    #[test]
    fn test_every_format_tokenizes_to_itself() {
        let c = catalog();
        for entry in c.entries() {
            assert_eq!(c.tokenize(&entry.format).unwrap().index, entry.index, "{}", entry.format);
        }
    }

    #[test]
    fn test_generic_and_full_scan_fallbacks() {
        let c = catalog();
        assert_eq!(c.tokenize("17 blocks retired").unwrap().params, vec![Param::Int(17)]);
        let fan = c.tokenize("ThermalSensor fan=ff").unwrap();
        assert_eq!(fan.index, 1);
        assert_eq!(fan.params, vec![Param::Hex(255)]);
        assert!(c.tokenize("no such event").is_none());
        assert_eq!(c.tokenize_or_blank("no such event").signature, vec![0.0; 3]);
    }

    #[test]
    fn test_param_vector_padding() {
        let t = Token { index: 5, signature: vec![], params: vec![Param::Int(1), Param::Int(2)] };
        assert_eq!(t.param_vector(4), vec![1.0, 2.0, 0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_char_packing() {
        assert_eq!(pack_chars("A"), 65);
        assert_eq!(pack_chars("AB"), 65 + 66 * 65536);
    }

    #[test]
    fn test_sign_extension() {
        let d = &specifiers("%d")[0];
        assert_eq!(format_value(d, 4_294_967_295.0), "-1");
        let ld = &specifiers("%ld")[0];
        assert_eq!(format_value(ld, 4_294_967_295.0), "4294967295");
        let x = &specifiers("%08X")[0];
        assert_eq!(format_value(x, 255.0), "000000FF");
        let c = &specifiers("%c")[0];
        assert_eq!(format_value(c, f64::from(0x4142_u16)), "AB");
    }

    #[test]
    fn test_hex_keeps_the_top_bit() {
        let x = &specifiers("%x")[0];
        assert_eq!(coerce("ffffffff", ParamType::Hex), Param::Hex(0xFFFF_FFFF));
        assert_eq!(coerce("8000000000000000", ParamType::Hex), Param::Hex(1 << 63));
        assert_eq!(Param::Hex(0xFFFF_FFFF).as_f64(), 4_294_967_295.0);
        assert_eq!(format_value(x, 4_294_967_295.0), "ffffffff");
        let lx = &specifiers("%lx")[0];
        assert_eq!(format_value(lx, 9_223_372_036_854_775_808.0), "8000000000000000");
        assert_eq!(format_value(lx, -1.0), "ffffffffffffffff");
    }

    #[test]
    fn test_long_specifier_takes_two_words() {
        let specs = vec![FormatSpec::new("m", "Media error on die %u at lba 0x%08lx")];
        let c = FormatCatalog::build(specs, &HashingEmbedder::default(), 2, 3).unwrap();
        let entry = c.entry(0).unwrap();
        assert_eq!(entry.arity, 3);

        let token = c.tokenize("Media error on die 3 at lba 0x1200000034").unwrap();
        assert_eq!(token.params, vec![Param::Int(3), Param::Hex(0x12), Param::Hex(0x34)]);

        let line = render(entry, &[3.0, 18.0, 52.0]);
        assert_eq!(line, "Media error on die 3 at lba 0x1200000034");
        let words: Vec<f64> = token.params.iter().map(Param::as_f64).collect();
        assert_eq!(render(entry, &words), line);

        // One word short: `l` is dropped and each specifier takes one value
        assert_eq!(render(entry, &[3.0, 52.0]), "Media error on die 3 at lba 0x00000034");
    }

    #[test]
    fn test_render_roundtrip() {
        let c = catalog();
        let entry = c.entry(0).unwrap();
        let line = render(entry, &[42.2, 0.9]);
        assert_eq!(line, "ThermalSensor temp=42 core=1");
        assert_eq!(c.tokenize(&line).unwrap().index, 0);
    }
}
