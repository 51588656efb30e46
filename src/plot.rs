//! Minimal vector PDF charts for forecast and cluster artifacts.
//!
//! Produces a single-page PDF with a framed plot area, min/max axis labels,
//! a title, line or scatter series (optionally with error bars) and a legend.
//! Only the built-in Helvetica font is referenced, so no font embedding is
//! needed.

use std::fmt::Write as _;
use std::io;
use std::path::Path;

const PAGE_W: f64 = 612.0;
const PAGE_H: f64 = 396.0;
const LEFT: f64 = 70.0;
const RIGHT: f64 = 150.0;
const BOTTOM: f64 = 50.0;
const TOP: f64 = 40.0;

/// Color cycle shared by every chart.
const PALETTE: [[f64; 3]; 8] = [
    [0.12, 0.47, 0.71],
    [1.00, 0.50, 0.05],
    [0.17, 0.63, 0.17],
    [0.84, 0.15, 0.16],
    [0.58, 0.40, 0.74],
    [0.55, 0.34, 0.29],
    [0.89, 0.47, 0.76],
    [0.50, 0.50, 0.50],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesStyle {
    Line,
    Scatter,
}

/// One data series of a chart.
#[derive(Debug, Clone)]
pub struct Series {
    pub label: String,
    pub points: Vec<(f64, f64)>,
    /// Symmetric error per point (same length as `points`) or empty
    pub errors: Vec<f64>,
    pub style: SeriesStyle,
}

impl Series {
    pub fn line(label: impl Into<String>, points: Vec<(f64, f64)>) -> Self {
        Self { label: label.into(), points, errors: Vec::new(), style: SeriesStyle::Line }
    }

    pub fn scatter(label: impl Into<String>, points: Vec<(f64, f64)>) -> Self {
        Self { label: label.into(), points, errors: Vec::new(), style: SeriesStyle::Scatter }
    }

    pub fn with_errors(mut self, errors: Vec<f64>) -> Self {
        self.errors = errors;
        self
    }

    /// Line over `values` indexed from `start`.
    pub fn indexed(label: impl Into<String>, start: usize, values: &[f64]) -> Self {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, v)| ((start + i) as f64, *v))
            .collect();
        Self::line(label, points)
    }
}

/// A single-panel chart.
#[derive(Debug, Clone, Default)]
pub struct Chart {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub series: Vec<Series>,
}

impl Chart {
    pub fn new(title: impl Into<String>, x_label: impl Into<String>, y_label: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            x_label: x_label.into(),
            y_label: y_label.into(),
            series: Vec::new(),
        }
    }

    pub fn push(&mut self, series: Series) -> &mut Self {
        self.series.push(series);
        self
    }

    /// Data bounds over every finite point, padded when degenerate.
    fn bounds(&self) -> (f64, f64, f64, f64) {
        let mut x0 = f64::INFINITY;
        let mut x1 = f64::NEG_INFINITY;
        let mut y0 = f64::INFINITY;
        let mut y1 = f64::NEG_INFINITY;
        for s in &self.series {
            for (i, &(x, y)) in s.points.iter().enumerate() {
                if !x.is_finite() || !y.is_finite() {
                    continue;
                }
                let e = s.errors.get(i).copied().unwrap_or(0.0).abs();
                x0 = x0.min(x);
                x1 = x1.max(x);
                y0 = y0.min(y - e);
                y1 = y1.max(y + e);
            }
        }
        if !x0.is_finite() {
            return (0.0, 1.0, 0.0, 1.0);
        }
        if (x1 - x0).abs() < 1e-12 {
            x0 -= 0.5;
            x1 += 0.5;
        }
        if (y1 - y0).abs() < 1e-12 {
            y0 -= 0.5;
            y1 += 0.5;
        }
        (x0, x1, y0, y1)
    }

    fn content_stream(&self) -> String {
        let (x0, x1, y0, y1) = self.bounds();
        let plot_w = PAGE_W - LEFT - RIGHT;
        let plot_h = PAGE_H - BOTTOM - TOP;
        let px = |x: f64| LEFT + (x - x0) / (x1 - x0) * plot_w;
        let py = |y: f64| BOTTOM + (y - y0) / (y1 - y0) * plot_h;

        let mut s = String::new();
        // Frame
        let _ = writeln!(s, "0 0 0 RG 0.8 w {:.2} {:.2} {:.2} {:.2} re S", LEFT, BOTTOM, plot_w, plot_h);
        // Title and axis labels
        text(&mut s, 14.0, LEFT, PAGE_H - 25.0, &self.title);
        text(&mut s, 9.0, LEFT + plot_w / 2.0 - 20.0, 15.0, &self.x_label);
        text(&mut s, 9.0, 5.0, PAGE_H - TOP + 10.0, &self.y_label);
        text(&mut s, 8.0, LEFT, BOTTOM - 12.0, &format_tick(x0));
        text(&mut s, 8.0, LEFT + plot_w - 30.0, BOTTOM - 12.0, &format_tick(x1));
        text(&mut s, 8.0, 8.0, BOTTOM, &format_tick(y0));
        text(&mut s, 8.0, 8.0, BOTTOM + plot_h - 8.0, &format_tick(y1));

        for (idx, series) in self.series.iter().enumerate() {
            let [r, g, b] = PALETTE[idx % PALETTE.len()];
            let _ = writeln!(s, "{:.3} {:.3} {:.3} RG {:.3} {:.3} {:.3} rg 1.2 w", r, g, b, r, g, b);

            match series.style {
                SeriesStyle::Line => {
                    let mut pen_down = false;
                    for &(x, y) in &series.points {
                        if !x.is_finite() || !y.is_finite() {
                            pen_down = false;
                            continue;
                        }
                        let op = if pen_down { "l" } else { "m" };
                        let _ = writeln!(s, "{:.2} {:.2} {}", px(x), py(y), op);
                        pen_down = true;
                    }
                    s.push_str("S\n");
                }
                SeriesStyle::Scatter => {
                    for &(x, y) in &series.points {
                        if x.is_finite() && y.is_finite() {
                            let _ = writeln!(s, "{:.2} {:.2} 3 3 re f", px(x) - 1.5, py(y) - 1.5);
                        }
                    }
                }
            }

            for (i, &(x, y)) in series.points.iter().enumerate() {
                let Some(&e) = series.errors.get(i) else { break };
                if x.is_finite() && y.is_finite() && e > 0.0 {
                    let _ = writeln!(s, "{:.2} {:.2} m {:.2} {:.2} l S", px(x), py(y - e), px(x), py(y + e));
                }
            }

            // Legend entry
            let ly = PAGE_H - TOP - 12.0 - idx as f64 * 14.0;
            let lx = PAGE_W - RIGHT + 10.0;
            let _ = writeln!(s, "{:.2} {:.2} 10 6 re f", lx, ly);
            s.push_str("0 0 0 rg\n");
            text(&mut s, 8.0, lx + 14.0, ly, &series.label);
        }
        s
    }

    /// Render the chart as a complete PDF document.
    pub fn to_pdf(&self) -> Vec<u8> {
        let content = self.content_stream();
        let objects = [
            "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >>",
                PAGE_W, PAGE_H
            ),
            format!("<< /Length {} >>\nstream\n{}endstream", content.len(), content),
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
        ];

        let mut out = String::from("%PDF-1.4\n");
        let mut offsets = Vec::with_capacity(objects.len());
        for (i, body) in objects.iter().enumerate() {
            offsets.push(out.len());
            let _ = write!(out, "{} 0 obj\n{}\nendobj\n", i + 1, body);
        }
        let xref_at = out.len();
        let _ = write!(out, "xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
        for off in offsets {
            let _ = write!(out, "{:010} 00000 n \n", off);
        }
        let _ = write!(
            out,
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_at
        );
        out.into_bytes()
    }

    /// Write the PDF atomically (temp file, then rename).
    pub fn write_pdf(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("pdf.tmp");
        std::fs::write(&tmp_path, self.to_pdf())?;
        std::fs::rename(&tmp_path, path)
    }
}

fn text(out: &mut String, size: f64, x: f64, y: f64, s: &str) {
    let _ = writeln!(out, "BT /F1 {} Tf {:.2} {:.2} Td ({}) Tj ET", size, x, y, escape(s));
}

/// Escape a string for a PDF literal; non-ASCII becomes `?`.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

fn format_tick(v: f64) -> String {
    if v.abs() >= 1e5 || (v != 0.0 && v.abs() < 1e-3) {
        format!("{:.2e}", v)
    } else {
        format!("{:.3}", v)
    }
}
