//! Restricted literal parser for catalog files and INI values.
//!
//! Accepts the literal subset used by firmware format catalogs and by the
//! decoded-store serialization: dicts, tuples, lists, quoted strings (with
//! adjacent-string concatenation), integers (decimal, hex, octal, binary),
//! floats including `nan`/`inf`, `None`, `True` and `False`. A file is a
//! sequence of `name = literal` assignments and comments. Anything else is
//! rejected; nothing is ever evaluated.

use std::collections::BTreeMap;

/// A parsed literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
    Tuple(Vec<Literal>),
    /// Key/value pairs in source order
    Dict(Vec<(Literal, Literal)>),
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(i) => Some(*i as f64),
            Literal::Float(f) => Some(*f),
            Literal::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Elements of a list or tuple.
    pub fn as_seq(&self) -> Option<&[Literal]> {
        match self {
            Literal::List(items) | Literal::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

/// Parse failure with the byte offset it occurred at.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("literal parse error at offset {offset}: {message}")]
pub struct LiteralError {
    pub offset: usize,
    pub message: String,
}

/// Parse a single literal expression (surrounding whitespace allowed).
pub fn parse_literal(src: &str) -> Result<Literal, LiteralError> {
    let mut p = Parser::new(src);
    p.skip_trivia();
    let value = p.value()?;
    p.skip_trivia();
    if !p.at_end() {
        return Err(p.error("trailing characters after literal"));
    }
    Ok(value)
}

/// Parse a module of `name = literal` assignments.
///
/// Later assignments to the same name replace earlier ones.
pub fn parse_assignments(src: &str) -> Result<BTreeMap<String, Literal>, LiteralError> {
    let mut p = Parser::new(src);
    let mut out = BTreeMap::new();
    loop {
        p.skip_trivia();
        if p.at_end() {
            break;
        }
        let name = p.identifier()?;
        p.skip_trivia();
        p.expect(b'=')?;
        p.skip_trivia();
        let value = p.value()?;
        out.insert(name, value);
    }
    Ok(out)
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, bytes: src.as_bytes(), pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn error(&self, message: &str) -> LiteralError {
        LiteralError { offset: self.pos, message: message.to_string() }
    }

    fn expect(&mut self, b: u8) -> Result<(), LiteralError> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", b as char)))
        }
    }

    /// Skip whitespace, comments and line continuations.
    fn skip_trivia(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'\\' if self.bytes.get(self.pos + 1) == Some(&b'\n') => self.pos += 2,
                b'#' => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn identifier(&mut self) -> Result<String, LiteralError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos || self.bytes[start].is_ascii_digit() {
            return Err(self.error("expected identifier"));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn value(&mut self) -> Result<Literal, LiteralError> {
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'{') => self.dict(),
            Some(b'[') => self.sequence(b'[', b']').map(Literal::List),
            Some(b'(') => self.paren(),
            Some(b'\'') | Some(b'"') => self.strings(),
            Some(b'-') | Some(b'+') | Some(b'.') => self.number(),
            Some(b) if b.is_ascii_digit() => self.number(),
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => self.keyword(),
            Some(_) => Err(self.error("unexpected character")),
        }
    }

    fn keyword(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        let word = self.identifier()?;
        match word.as_str() {
            "None" => Ok(Literal::None),
            "True" => Ok(Literal::Bool(true)),
            "False" => Ok(Literal::Bool(false)),
            "nan" | "NaN" => Ok(Literal::Float(f64::NAN)),
            "inf" => Ok(Literal::Float(f64::INFINITY)),
            _ => Err(LiteralError {
                offset: start,
                message: format!("name '{}' is not a literal", word),
            }),
        }
    }

    fn dict(&mut self) -> Result<Literal, LiteralError> {
        self.expect(b'{')?;
        let mut entries = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                break;
            }
            let key = self.value()?;
            self.skip_trivia();
            self.expect(b':')?;
            self.skip_trivia();
            let value = self.value()?;
            entries.push((key, value));
            self.skip_trivia();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {}
                _ => return Err(self.error("expected ',' or '}' in dict")),
            }
        }
        Ok(Literal::Dict(entries))
    }

    fn sequence(&mut self, open: u8, close: u8) -> Result<Vec<Literal>, LiteralError> {
        self.expect(open)?;
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some(close) {
                self.pos += 1;
                break;
            }
            items.push(self.value()?);
            self.skip_trivia();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(c) if c == close => {}
                _ => return Err(self.error(&format!("expected ',' or '{}'", close as char))),
            }
        }
        Ok(items)
    }

    /// `(x)` is a parenthesized value, `(x,)` and `(x, y)` are tuples.
    fn paren(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        self.expect(b'(')?;
        self.skip_trivia();
        if self.peek() == Some(b')') {
            self.pos += 1;
            return Ok(Literal::Tuple(Vec::new()));
        }
        let first = self.value()?;
        self.skip_trivia();
        if self.peek() == Some(b')') {
            self.pos += 1;
            return Ok(first);
        }
        self.pos = start;
        self.sequence(b'(', b')').map(Literal::Tuple)
    }

    /// One or more adjacent string literals, concatenated.
    fn strings(&mut self) -> Result<Literal, LiteralError> {
        let mut out = self.string()?;
        loop {
            let save = self.pos;
            self.skip_trivia();
            match self.peek() {
                Some(b'\'') | Some(b'"') => out.push_str(&self.string()?),
                _ => {
                    self.pos = save;
                    break;
                }
            }
        }
        Ok(Literal::Str(out))
    }

    fn string(&mut self) -> Result<String, LiteralError> {
        let quote = self.peek().ok_or_else(|| self.error("expected string"))?;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let rest = &self.src[self.pos..];
            let mut chars = rest.chars();
            let c = chars.next().ok_or_else(|| self.error("unterminated string"))?;
            self.pos += c.len_utf8();
            if c as u32 == u32::from(quote) {
                break;
            }
            if c == '\n' {
                return Err(self.error("newline in string"));
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let esc = chars.next().ok_or_else(|| self.error("unterminated escape"))?;
            self.pos += esc.len_utf8();
            match esc {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                '\n' => {}
                'x' => {
                    let hex = self.src.get(self.pos..self.pos + 2)
                        .ok_or_else(|| self.error("truncated \\x escape"))?;
                    let code = u8::from_str_radix(hex, 16)
                        .map_err(|_| self.error("invalid \\x escape"))?;
                    out.push(code as char);
                    self.pos += 2;
                }
                // Unknown escapes are kept verbatim, as format strings rely on it
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
        }
        Ok(out)
    }

    fn number(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        let negative = match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                true
            }
            Some(b'+') => {
                self.pos += 1;
                false
            }
            _ => false,
        };
        self.skip_trivia();
        if matches!(self.peek(), Some(b) if b.is_ascii_alphabetic()) {
            // -inf / -nan
            let lit = self.keyword()?;
            return match lit {
                Literal::Float(f) => Ok(Literal::Float(if negative { -f } else { f })),
                _ => Err(LiteralError { offset: start, message: "invalid signed literal".into() }),
            };
        }

        let body_start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' {
                self.pos += 1;
            } else if (b == b'-' || b == b'+')
                && matches!(self.bytes.get(self.pos - 1), Some(b'e') | Some(b'E'))
                && !self.src[body_start..self.pos].starts_with("0x")
            {
                self.pos += 1;
            } else {
                break;
            }
        }
        let body: String = self.src[body_start..self.pos].chars().filter(|c| *c != '_').collect();
        let sign = if negative { -1 } else { 1 };

        let radix = match body.get(..2) {
            Some("0x") | Some("0X") => Some(16),
            Some("0o") | Some("0O") => Some(8),
            Some("0b") | Some("0B") => Some(2),
            _ => None,
        };
        if let Some(radix) = radix {
            let v = u64::from_str_radix(&body[2..], radix)
                .map_err(|_| LiteralError { offset: start, message: format!("invalid integer '{}'", body) })?;
            return Ok(Literal::Int(sign * v as i64));
        }
        let trimmed = body.trim_end_matches(['L', 'l']);
        if let Ok(v) = trimmed.parse::<i64>() {
            return Ok(Literal::Int(sign * v));
        }
        body.parse::<f64>()
            .map(|v| Literal::Float(sign as f64 * v))
            .map_err(|_| LiteralError { offset: start, message: format!("invalid number '{}'", body) })
    }
}

/// Render a string as a single-quoted literal that `parse_literal` reads back.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars() {
        assert_eq!(parse_literal("42").unwrap(), Literal::Int(42));
        assert_eq!(parse_literal("-7").unwrap(), Literal::Int(-7));
        assert_eq!(parse_literal("0x1F").unwrap(), Literal::Int(31));
        assert_eq!(parse_literal("2.5e-1").unwrap(), Literal::Float(0.25));
        assert_eq!(parse_literal("None").unwrap(), Literal::None);
        assert_eq!(parse_literal("True").unwrap(), Literal::Bool(true));
        match parse_literal("nan").unwrap() {
            Literal::Float(f) => assert!(f.is_nan()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_literal("-inf").unwrap(), Literal::Float(f64::NEG_INFINITY));
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(parse_literal(r#""a\"b""#).unwrap(), Literal::Str("a\"b".into()));
        assert_eq!(parse_literal(r"'it\'s'").unwrap(), Literal::Str("it's".into()));
        assert_eq!(parse_literal("'ab' \"cd\"").unwrap(), Literal::Str("abcd".into()));
        // Unknown escapes survive (regex-ish format strings)
        assert_eq!(parse_literal(r"'\d'").unwrap(), Literal::Str("\\d".into()));
    }

    #[test]
    fn test_quote_reads_back() {
        let s = "it's a \\ test\n";
        assert_eq!(parse_literal(&quote(s)).unwrap(), Literal::Str(s.into()));
    }

    #[test]
    fn test_containers() {
        let lit = parse_literal("{1: ('\"Fmt %d\"', 'file.c', 12, ['x']), 2: (3,)}").unwrap();
        match lit {
            Literal::Dict(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].0, Literal::Int(1));
                let tuple = entries[0].1.as_seq().unwrap();
                assert_eq!(tuple[0].as_str(), Some("\"Fmt %d\""));
                assert_eq!(tuple[3], Literal::List(vec![Literal::Str("x".into())]));
                assert_eq!(entries[1].1, Literal::Tuple(vec![Literal::Int(3)]));
            }
            other => panic!("expected dict, got {:?}", other),
        }
        assert_eq!(parse_literal("(5)").unwrap(), Literal::Int(5));
        assert_eq!(parse_literal("[1, 2,]").unwrap(), Literal::List(vec![Literal::Int(1), Literal::Int(2)]));
    }

    #[test]
    fn test_assignments_with_comments() {
        let src = "# header\nversion = 3\nformats = {\n  # entry\n  7: ('\"x\"',),\n}\n";
        let module = parse_assignments(src).unwrap();
        assert_eq!(module.get("version"), Some(&Literal::Int(3)));
        assert!(matches!(module.get("formats"), Some(Literal::Dict(_))));
    }

    #[test]
    fn test_rejects_code() {
        assert!(parse_assignments("import os\n").is_err());
        assert!(parse_literal("__import__('os')").is_err());
        assert!(parse_assignments("formats = open('x')").is_err());
    }
}
