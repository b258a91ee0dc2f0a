//! Minimal SVG chart surface for the embedded backend.

use std::fmt::Write as _;

use crate::core::outcome::ChartRef;
use crate::sandbox::frame::FrameError;

pub const SVG_MIME: &str = "image/svg+xml";
/// Figures kept per run; further drawing calls fail.
pub const MAX_CHARTS: usize = 20;

const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 400.0;
const LEFT: f64 = 64.0;
const RIGHT: f64 = 24.0;
const TOP: f64 = 48.0;
const BOTTOM: f64 = 64.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartKind {
    Bar,
    Line,
}

/// Figures drawn during one run, numbered in drawing order.
#[derive(Debug, Default)]
pub struct ChartSink {
    charts: Vec<ChartRef>,
}

impl ChartSink {
    pub fn draw(
        &mut self,
        kind: ChartKind,
        title: &str,
        labels: &[String],
        values: &[f64],
    ) -> Result<(), FrameError> {
        if self.charts.len() >= MAX_CHARTS {
            return Err(FrameError {
                exception: "RuntimeError",
                message: format!("at most {MAX_CHARTS} charts per run"),
            });
        }
        let svg = render(kind, title, labels, values)?;
        self.charts.push(ChartRef {
            filename: format!("chart_{}.svg", self.charts.len() + 1),
            mime_type: SVG_MIME.to_string(),
            data: svg.into_bytes(),
        });
        Ok(())
    }

    pub fn into_charts(self) -> Vec<ChartRef> {
        self.charts
    }
}

pub fn render(
    kind: ChartKind,
    title: &str,
    labels: &[String],
    values: &[f64],
) -> Result<String, FrameError> {
    let invalid = |message: String| FrameError {
        exception: "ValueError",
        message,
    };
    if labels.len() != values.len() {
        return Err(invalid(format!(
            "{} labels for {} values",
            labels.len(),
            values.len()
        )));
    }
    if values.is_empty() {
        return Err(invalid("nothing to plot".to_string()));
    }
    if values.iter().any(|value| !value.is_finite()) {
        return Err(invalid("chart values must be finite numbers".to_string()));
    }

    let low = values.iter().copied().fold(0.0_f64, f64::min);
    let high = values.iter().copied().fold(0.0_f64, f64::max);
    let span = if high > low { high - low } else { 1.0 };
    let plot_w = WIDTH - LEFT - RIGHT;
    let plot_h = HEIGHT - TOP - BOTTOM;
    let slot = plot_w / values.len() as f64;
    let y_of = |value: f64| TOP + (high - value) / span * plot_h;
    let x_of = |index: usize| LEFT + slot * (index as f64 + 0.5);

    let mut svg = String::new();
    // Writing into a String cannot fail.
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}" font-family="sans-serif" font-size="12">"#
    );
    let _ = write!(
        svg,
        r#"<rect width="{WIDTH}" height="{HEIGHT}" fill="white"/><text x="{}" y="28" text-anchor="middle" font-size="16">{}</text>"#,
        WIDTH / 2.0,
        escape(title)
    );

    match kind {
        ChartKind::Bar => {
            let zero = y_of(0.0);
            for (index, value) in values.iter().enumerate() {
                let top = y_of(*value).min(zero);
                let height = (y_of(*value) - zero).abs();
                let _ = write!(
                    svg,
                    r##"<rect x="{:.1}" y="{top:.1}" width="{:.1}" height="{height:.1}" fill="#4c72b0"/>"##,
                    x_of(index) - slot * 0.4,
                    slot * 0.8,
                );
            }
        }
        ChartKind::Line => {
            let points: Vec<String> = values
                .iter()
                .enumerate()
                .map(|(index, value)| format!("{:.1},{:.1}", x_of(index), y_of(*value)))
                .collect();
            let _ = write!(
                svg,
                r##"<polyline points="{}" fill="none" stroke="#4c72b0" stroke-width="2"/>"##,
                points.join(" ")
            );
        }
    }

    let _ = write!(
        svg,
        r#"<line x1="{LEFT}" y1="{zero:.1}" x2="{}" y2="{zero:.1}" stroke="black"/><line x1="{LEFT}" y1="{TOP}" x2="{LEFT}" y2="{}" stroke="black"/>"#,
        WIDTH - RIGHT,
        HEIGHT - BOTTOM,
        zero = y_of(0.0),
    );
    for (value, y) in [(high, TOP), (low, HEIGHT - BOTTOM)] {
        let _ = write!(
            svg,
            r#"<text x="{}" y="{:.1}" text-anchor="end">{}</text>"#,
            LEFT - 6.0,
            y + 4.0,
            format_tick(value)
        );
    }
    for (index, label) in labels.iter().enumerate() {
        let _ = write!(
            svg,
            r#"<text x="{:.1}" y="{}" text-anchor="middle">{}</text>"#,
            x_of(index),
            HEIGHT - BOTTOM + 18.0,
            escape(label)
        );
    }
    svg.push_str("</svg>");
    Ok(svg)
}

fn format_tick(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn bar_chart_draws_one_rect_per_value() {
        let svg = render(ChartKind::Bar, "Revenue", &labels(&["a", "b"]), &[3.0, 5.0])
            .expect("render");
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert_eq!(svg.matches(r##"fill="#4c72b0""##).count(), 2);
    }

    #[test]
    fn labels_are_escaped() {
        let svg = render(ChartKind::Line, "P&L <2024>", &labels(&["x"]), &[1.0]).expect("render");
        assert!(svg.contains("P&amp;L &lt;2024&gt;"));
    }

    #[test]
    fn mismatched_or_non_finite_input_is_rejected() {
        assert!(render(ChartKind::Bar, "t", &labels(&["a"]), &[1.0, 2.0]).is_err());
        assert!(render(ChartKind::Bar, "t", &labels(&["a"]), &[f64::NAN]).is_err());
        assert!(render(ChartKind::Bar, "t", &[], &[]).is_err());
    }

    #[test]
    fn sink_numbers_charts_and_caps_them() {
        let mut sink = ChartSink::default();
        for _ in 0..MAX_CHARTS {
            sink.draw(ChartKind::Bar, "t", &labels(&["a"]), &[1.0]).expect("draw");
        }
        assert!(sink.draw(ChartKind::Bar, "t", &labels(&["a"]), &[1.0]).is_err());
        let charts = sink.into_charts();
        assert_eq!(charts[0].filename, "chart_1.svg");
        assert_eq!(charts[MAX_CHARTS - 1].mime_type, SVG_MIME);
    }
}
