//! Firmware event-log captures.
//!
//! A capture is a text file whose first lines are a header, followed by one
//! event per line:
//!
//! ```text
//! [index] h:m:s core type description...
//! 17 01:02:03.250 0 ( ERR) Media error on die 3
//! ```
//!
//! The type token may be split in two (`(` then `ERR)`), and the time token
//! may carry `*` markers. Capture files are named `<tag>_<timestamp>_NLOG.txt`
//! where the timestamp uses the run-artifact format.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// A backwards jump larger than this is read as a midnight wrap rather
/// than cross-core reordering.
const WRAP_THRESHOLD: f64 = SECONDS_PER_DAY / 2.0;

const CAPTURE_SUFFIX: &str = "_NLOG.txt";
const CAPTURE_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d-%H-%M-%S-%6f", "%Y-%m-%d-%H-%M-%S"];

// ============================================================================
// Event model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventLevel {
    Err,
    Info,
    Warn,
    Debug,
    /// Unrecognized type token, kept verbatim
    Other(String),
}

impl EventLevel {
    /// Parse a type token such as `(ERR)`, `ERR` or `(WARN)`.
    pub fn from_token(token: &str) -> Self {
        let bare = token.trim_start_matches('(').trim_end_matches(')').trim();
        match bare.to_ascii_uppercase().as_str() {
            "ERR" | "ERROR" => EventLevel::Err,
            "INFO" | "INF" => EventLevel::Info,
            "WARN" | "WRN" | "WARNING" => EventLevel::Warn,
            "DBG" | "DEBUG" => EventLevel::Debug,
            _ => EventLevel::Other(token.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventLevel::Err => "ERR",
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Debug => "DEBUG",
            EventLevel::Other(raw) => raw,
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time of day as logged by the firmware. There is no day component.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LogTime {
    pub hours: f64,
    pub minutes: f64,
    pub seconds: f64,
}

impl LogTime {
    pub fn new(hours: f64, minutes: f64, seconds: f64) -> Self {
        Self { hours, minutes, seconds }
    }

    /// Parse `h:m:s`; unparsable components read as zero.
    pub fn parse(token: &str) -> Self {
        let mut parts = token.split(':').map(|p| p.trim().parse::<f64>().unwrap_or(0.0));
        let hours = parts.next().unwrap_or(0.0);
        let minutes = parts.next().unwrap_or(0.0);
        let seconds = parts.next().unwrap_or(0.0);
        Self { hours, minutes, seconds }
    }

    pub fn as_seconds(&self) -> f64 {
        self.hours * 3600.0 + self.minutes * 60.0 + self.seconds
    }

    pub fn as_vec(&self) -> Vec<f64> {
        vec![self.hours, self.minutes, self.seconds]
    }

    /// Build from a predicted `(h, m, s)` triple, clamping to a valid clock.
    pub fn from_prediction(values: &[f64]) -> Self {
        let clean = |i: usize| values.get(i).copied().filter(|v| v.is_finite()).unwrap_or(0.0).max(0.0);
        Self {
            hours: clean(0).round().min(23.0),
            minutes: clean(1).round().min(59.0),
            seconds: clean(2).min(59.999_999),
        }
    }
}

impl fmt::Display for LogTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}:{:09.6}", self.hours as i64, self.minutes as i64, self.seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub time: LogTime,
    pub core: u8,
    pub level: EventLevel,
    pub description: String,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t{}\t{}", self.time, self.core, self.level, self.description)
    }
}

/// Parse one event line. Lines with fewer than three fields are rejected.
pub fn parse_line(line: &str) -> Option<LogEvent> {
    let cleaned = line.replace('*', "");
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    let start = match tokens.first() {
        Some(t) if t.chars().all(|c| c.is_ascii_digit()) => 1,
        Some(_) => 0,
        None => return None,
    };
    let rest = tokens.get(start..)?;
    if rest.len() < 3 {
        return None;
    }

    let time = LogTime::parse(rest[0]);
    let core = rest[1]
        .trim_matches(|c: char| !c.is_ascii_digit())
        .parse::<u8>()
        .unwrap_or(0);
    let (type_token, desc_start) = if rest[2] == "(" && rest.len() > 3 {
        (format!("({}", rest[3]), 4)
    } else {
        (rest[2].to_string(), 3)
    };
    let description = rest.get(desc_start..).map(|d| d.join(" ")).unwrap_or_default();

    Some(LogEvent { time, core, level: EventLevel::from_token(&type_token), description })
}

// ============================================================================
// Captures
// ============================================================================

#[derive(Debug, Clone)]
pub struct Capture {
    pub name: String,
    /// Wall-clock time the capture was taken, from its file name
    pub taken_at: Option<NaiveDateTime>,
    /// Event lines in file order (header removed, blank lines dropped)
    pub lines: Vec<String>,
    pub events: Vec<LogEvent>,
}

impl Capture {
    pub fn parse(name: impl Into<String>, text: &str, header_lines: usize) -> Self {
        let name = name.into();
        let lines: Vec<String> = text
            .lines()
            .skip(header_lines)
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.trim().is_empty())
            .collect();
        let events = lines.iter().filter_map(|l| parse_line(l)).collect();
        let taken_at = capture_date(&name);
        Self { name, taken_at, lines, events }
    }

    pub fn load(path: &Path, header_lines: usize) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::parse(name, &text, header_lines))
    }

    pub fn errors(&self) -> impl Iterator<Item = &LogEvent> {
        self.events.iter().filter(|e| e.level == EventLevel::Err)
    }

    pub fn duration(&self) -> CaptureDuration {
        capture_duration(&self.events)
    }
}

/// Timestamp embedded in a capture file name (`<tag>_<timestamp>_NLOG.txt`).
pub fn capture_date(file_name: &str) -> Option<NaiveDateTime> {
    let stem = file_name.strip_suffix(CAPTURE_SUFFIX).unwrap_or(file_name);
    let (_, stamp) = stem.rsplit_once('_')?;
    CAPTURE_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(stamp, fmt).ok())
}

/// All capture files in `dir` that carry a parsable date, oldest first.
pub fn load_captures(dir: &Path, header_lines: usize) -> std::io::Result<Vec<Capture>> {
    let mut captures = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let dated = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| capture_date(n).is_some());
        if path.is_file() && dated {
            captures.push(Capture::load(&path, header_lines)?);
        }
    }
    captures.sort_by(|a, b| a.taken_at.cmp(&b.taken_at).then_with(|| a.name.cmp(&b.name)));
    Ok(captures)
}

/// Wall-clock seconds between two captures, when both are dated.
pub fn seconds_between(earlier: &Capture, later: &Capture) -> Option<f64> {
    let a = earlier.taken_at?;
    let b = later.taken_at?;
    Some((b - a).num_microseconds()? as f64 / 1e6)
}

/// Lines of `next` absent from `prev`, in `next` order, without duplicates.
pub fn new_lines<'a>(prev: &Capture, next: &'a Capture) -> Vec<&'a str> {
    let seen: HashSet<&str> = prev.lines.iter().map(String::as_str).collect();
    let mut emitted: HashSet<&str> = HashSet::new();
    next.lines
        .iter()
        .map(String::as_str)
        .filter(|l| !seen.contains(l) && emitted.insert(l))
        .collect()
}

// ============================================================================
// Duration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureDuration {
    pub seconds: f64,
    /// Midnight crossings detected between consecutive events
    pub day_wraps: usize,
}

/// Last minus first timestamp, unwrapping midnight crossings.
pub fn capture_duration(events: &[LogEvent]) -> CaptureDuration {
    let mut iter = events.iter().map(|e| e.time.as_seconds());
    let first = match iter.next() {
        Some(t) => t,
        None => return CaptureDuration::default(),
    };
    let mut prev = first;
    let mut offset = 0.0;
    let mut day_wraps = 0;
    let mut last = first;
    for t in iter {
        if prev - t > WRAP_THRESHOLD {
            day_wraps += 1;
            offset += SECONDS_PER_DAY;
        }
        prev = t;
        last = t + offset;
    }
    CaptureDuration { seconds: last - first, day_wraps }
}

// ============================================================================
// ERR summary
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub captures: usize,
    pub events: usize,
    pub errors: Vec<LogEvent>,
    /// Duration of the most recent capture
    pub duration: CaptureDuration,
}

pub fn summarize(captures: &[Capture]) -> ErrorSummary {
    ErrorSummary {
        captures: captures.len(),
        events: captures.iter().map(|c| c.events.len()).sum(),
        errors: captures.iter().flat_map(|c| c.errors().cloned()).collect(),
        duration: captures.last().map(Capture::duration).unwrap_or_default(),
    }
}

/// Write the ERR rows as tab-separated `(timestamp, core, level, description)`.
pub fn write_summary(summary: &ErrorSummary, path: &Path) -> std::io::Result<()> {
    let mut out = String::new();
    out.push_str(&format!(
        "# captures={} events={} errors={} duration_s={:.3} day_wraps={}\n",
        summary.captures,
        summary.events,
        summary.errors.len(),
        summary.duration.seconds,
        summary.duration.day_wraps
    ));
    for event in &summary.errors {
        out.push_str(&event.to_string());
        out.push('\n');
    }
    std::fs::write(path, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPTURE: &str = "NLOG dump\nproduct: X\nfw: 1.0\nserial: 42\n----\n\
        1 01:00:00.000 0 (INFO) Boot complete\n\
        2 01:00:01.500 1 ( ERR) Media error on die 3\n\
        3 01:00:02.000* 0 (WARN) Temp high 85\n";

    #[test]
    fn test_parse_line_with_split_type() {
        let e = parse_line("12 10:20:30.5 2 ( ERR) Read retry exhausted lba=0x10").unwrap();
        assert_eq!(e.time, LogTime::new(10.0, 20.0, 30.5));
        assert_eq!(e.core, 2);
        assert_eq!(e.level, EventLevel::Err);
        assert_eq!(e.description, "Read retry exhausted lba=0x10");
    }

    #[test]
    fn test_parse_line_without_index() {
        let e = parse_line("00:00:01 0 (DBG) tick").unwrap();
        assert_eq!(e.level, EventLevel::Debug);
        assert_eq!(e.description, "tick");
        assert!(parse_line("garbage").is_none());
    }

    #[test]
    fn test_unknown_level_kept() {
        assert_eq!(EventLevel::from_token("(TRC)"), EventLevel::Other("(TRC)".to_string()));
    }

    #[test]
    fn test_capture_skips_header_and_summarizes_errors() {
        let cap = Capture::parse("drive_2024-01-02-03-04-05-000001_NLOG.txt", CAPTURE, 5);
        assert_eq!(cap.events.len(), 3);
        assert!(cap.taken_at.is_some());
        let summary = summarize(std::slice::from_ref(&cap));
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].description, "Media error on die 3");
        assert!((summary.duration.seconds - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_duration_detects_day_wrap() {
        let events: Vec<LogEvent> = ["23:59:00", "23:59:30", "00:00:30"]
            .iter()
            .map(|t| parse_line(&format!("{} 0 (INFO) x", t)).unwrap())
            .collect();
        let d = capture_duration(&events);
        assert_eq!(d.day_wraps, 1);
        assert!((d.seconds - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_new_lines_is_set_difference_in_order() {
        let a = Capture::parse("a", "h\nh\nh\nh\nh\n00:00:01 0 (INFO) a\n00:00:02 0 (INFO) b\n", 5);
        let b = Capture::parse("b", "h\nh\nh\nh\nh\n00:00:01 0 (INFO) a\n00:00:03 0 (INFO) c\n00:00:04 0 (INFO) d\n", 5);
        assert_eq!(new_lines(&a, &b), vec!["00:00:03 0 (INFO) c", "00:00:04 0 (INFO) d"]);
    }

    #[test]
    fn test_capture_date_and_delta() {
        let a = Capture::parse("ssd_2024-01-01-00-00-00-000000_NLOG.txt", "", 5);
        let b = Capture::parse("ssd_2024-01-01-00-10-00-500000_NLOG.txt", "", 5);
        assert!((seconds_between(&a, &b).unwrap() - 600.5).abs() < 1e-9);
        assert!(capture_date("notes.txt").is_none());
    }

    #[test]
    fn test_prediction_time_is_clamped() {
        let t = LogTime::from_prediction(&[25.4, -3.0, f64::NAN]);
        assert_eq!(t, LogTime::new(23.0, 0.0, 0.0));
        assert_eq!(LogTime::new(1.0, 2.0, 3.5).to_string(), "1:02:03.500000");
    }
}
