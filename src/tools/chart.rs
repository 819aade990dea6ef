//! Standalone chart rendering to SVG.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::{opt_str_arg, Arguments, Tool, ToolContext, ToolName, ToolOutput};
use super::package::xml_escape;

const WIDTH: f64 = 1000.0;
const HEIGHT: f64 = 600.0;
const MARGIN_LEFT: f64 = 90.0;
const MARGIN_RIGHT: f64 = 40.0;
const MARGIN_TOP: f64 = 70.0;
const MARGIN_BOTTOM: f64 = 130.0;

/// Sampled from the viridis colour map.
const PALETTE: [&str; 10] = [
    "#440154", "#482878", "#3e4989", "#31688e", "#26828e", "#1f9e89", "#35b779", "#6ece58",
    "#b5de2b", "#fde725",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
    Scatter,
}

impl ChartKind {
    pub fn parse(raw: Option<&str>) -> anyhow::Result<Self> {
        match raw.map(|s| s.trim().to_lowercase()).as_deref() {
            None | Some("") | Some("bar") => Ok(ChartKind::Bar),
            Some("line") => Ok(ChartKind::Line),
            Some("pie") => Ok(ChartKind::Pie),
            Some("scatter") => Ok(ChartKind::Scatter),
            Some(other) => Err(anyhow::anyhow!(
                "Unknown chart type '{}' (expected bar, line, pie or scatter)",
                other
            )),
        }
    }
}

/// Labels and values of one data series.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl Series {
    /// `{"label": value}` or a list of numbers (labelled by position).
    pub fn from_data(data: &Value) -> anyhow::Result<Self> {
        let series = match data {
            Value::Object(map) => {
                let mut labels = Vec::new();
                let mut values = Vec::new();
                for (label, value) in map {
                    let v = number(value).ok_or_else(|| {
                        anyhow::anyhow!("Value for '{}' is not a number: {}", label, value)
                    })?;
                    labels.push(label.clone());
                    values.push(v);
                }
                Series { labels, values }
            }
            Value::Array(items) => {
                let values = items
                    .iter()
                    .map(|v| number(v).ok_or_else(|| anyhow::anyhow!("Not a number: {}", v)))
                    .collect::<anyhow::Result<Vec<f64>>>()?;
                Series {
                    labels: (0..values.len()).map(|i| i.to_string()).collect(),
                    values,
                }
            }
            Value::String(s) if s.trim_start().starts_with(['{', '[']) => {
                let parsed: Value = serde_json::from_str(s)?;
                return Series::from_data(&parsed);
            }
            other => return Err(anyhow::anyhow!("Unsupported chart data: {}", other)),
        };
        if series.values.is_empty() {
            return Err(anyhow::anyhow!("Chart data is empty"));
        }
        Ok(series)
    }
}

/// Everything needed to draw one chart.
#[derive(Debug, Clone)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub title: String,
    pub xlabel: String,
    pub ylabel: String,
    pub series: Series,
}

fn fmt_value(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{:.2}", v)
    }
}

/// Round the axis maximum up to a 1/2/5 step.
fn nice_ceiling(max: f64) -> f64 {
    if max <= 0.0 {
        return 1.0;
    }
    let magnitude = 10f64.powf(max.log10().floor());
    for step in [1.0, 2.0, 5.0, 10.0] {
        if max <= step * magnitude {
            return step * magnitude;
        }
    }
    10.0 * magnitude
}

pub fn render_svg(spec: &ChartSpec) -> String {
    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}" font-family="sans-serif"><rect width="100%" height="100%" fill="white"/>"#,
        w = WIDTH,
        h = HEIGHT
    );
    let _ = write!(
        svg,
        r#"<text x="{}" y="40" font-size="22" font-weight="bold" text-anchor="middle">{}</text>"#,
        WIDTH / 2.0,
        xml_escape(&spec.title)
    );

    match spec.kind {
        ChartKind::Pie => draw_pie(&mut svg, &spec.series),
        kind => draw_axes_chart(&mut svg, spec, kind),
    }

    svg.push_str("</svg>");
    svg
}

fn draw_pie(svg: &mut String, series: &Series) {
    let total: f64 = series.values.iter().filter(|v| **v > 0.0).sum();
    let (cx, cy, r) = (WIDTH / 2.0, HEIGHT / 2.0 + 20.0, 220.0);
    if total <= 0.0 {
        return;
    }

    // Start at 12 o'clock and go counter-clockwise.
    let mut angle = std::f64::consts::FRAC_PI_2;
    for (i, (label, value)) in series.labels.iter().zip(&series.values).enumerate() {
        if *value <= 0.0 {
            continue;
        }
        let sweep = value / total * std::f64::consts::TAU;
        let (x1, y1) = (cx + r * angle.cos(), cy - r * angle.sin());
        let end = angle + sweep;
        let (x2, y2) = (cx + r * end.cos(), cy - r * end.sin());
        let large = if sweep > std::f64::consts::PI { 1 } else { 0 };
        let colour = PALETTE[i * PALETTE.len() / series.values.len().max(1) % PALETTE.len()];

        if (sweep - std::f64::consts::TAU).abs() < 1e-9 {
            let _ = write!(svg, r#"<circle cx="{cx}" cy="{cy}" r="{r}" fill="{colour}"/>"#);
        } else {
            let _ = write!(
                svg,
                r#"<path d="M{cx:.1},{cy:.1} L{x1:.1},{y1:.1} A{r},{r} 0 {large},0 {x2:.1},{y2:.1} Z" fill="{colour}" stroke="white"/>"#
            );
        }

        let mid = angle + sweep / 2.0;
        let (lx, ly) = (cx + (r + 30.0) * mid.cos(), cy - (r + 30.0) * mid.sin());
        let anchor = if mid.cos() >= 0.0 { "start" } else { "end" };
        let _ = write!(
            svg,
            r#"<text x="{lx:.1}" y="{ly:.1}" font-size="14" text-anchor="{anchor}">{} ({:.1}%)</text>"#,
            xml_escape(label),
            value / total * 100.0
        );
        angle = end;
    }
}

fn draw_axes_chart(svg: &mut String, spec: &ChartSpec, kind: ChartKind) {
    let series = &spec.series;
    let plot_w = WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_h = HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
    let base_y = MARGIN_TOP + plot_h;

    let max = nice_ceiling(series.values.iter().cloned().fold(0.0, f64::max));
    let min = series.values.iter().cloned().fold(0.0, f64::min);
    let min = if min < 0.0 { -nice_ceiling(-min) } else { 0.0 };
    let span = max - min;
    let y_of = |v: f64| base_y - (v - min) / span * plot_h;

    for tick in 0..=5 {
        let v = min + span * tick as f64 / 5.0;
        let y = y_of(v);
        let _ = write!(
            svg,
            r##"<line x1="{MARGIN_LEFT}" y1="{y:.1}" x2="{x2}" y2="{y:.1}" stroke="#e0e0e0"/><text x="{tx}" y="{ty:.1}" font-size="12" text-anchor="end">{label}</text>"##,
            x2 = MARGIN_LEFT + plot_w,
            tx = MARGIN_LEFT - 8.0,
            ty = y + 4.0,
            label = fmt_value(v)
        );
    }
    let _ = write!(
        svg,
        r##"<line x1="{MARGIN_LEFT}" y1="{y:.1}" x2="{x2}" y2="{y:.1}" stroke="#333"/><line x1="{MARGIN_LEFT}" y1="{MARGIN_TOP}" x2="{MARGIN_LEFT}" y2="{base_y}" stroke="#333"/>"##,
        y = y_of(0.0),
        x2 = MARGIN_LEFT + plot_w
    );

    let n = series.values.len();
    let slot = plot_w / n as f64;
    let x_of = |i: usize| MARGIN_LEFT + slot * (i as f64 + 0.5);

    match kind {
        ChartKind::Bar => {
            let bar_w = slot * 0.7;
            for (i, v) in series.values.iter().enumerate() {
                let (top, bottom) = (y_of(v.max(0.0)), y_of(v.min(0.0)));
                let colour = PALETTE[i * PALETTE.len() / n % PALETTE.len()];
                let _ = write!(
                    svg,
                    r#"<rect x="{x:.1}" y="{top:.1}" width="{bar_w:.1}" height="{h:.1}" fill="{colour}"/><text x="{cx:.1}" y="{ty:.1}" font-size="12" font-weight="bold" text-anchor="middle">{label}</text>"#,
                    x = x_of(i) - bar_w / 2.0,
                    h = (bottom - top).max(0.5),
                    cx = x_of(i),
                    ty = top - 6.0,
                    label = fmt_value(*v)
                );
            }
        }
        ChartKind::Line => {
            let points: Vec<String> = series
                .values
                .iter()
                .enumerate()
                .map(|(i, v)| format!("{:.1},{:.1}", x_of(i), y_of(*v)))
                .collect();
            let _ = write!(
                svg,
                r##"<polyline points="{}" fill="none" stroke="#1f77b4" stroke-width="2"/>"##,
                points.join(" ")
            );
            for (i, v) in series.values.iter().enumerate() {
                let _ = write!(
                    svg,
                    r##"<circle cx="{:.1}" cy="{:.1}" r="6" fill="#1f77b4"/>"##,
                    x_of(i),
                    y_of(*v)
                );
            }
        }
        ChartKind::Scatter | ChartKind::Pie => {
            for (i, v) in series.values.iter().enumerate() {
                let _ = write!(
                    svg,
                    r##"<circle cx="{:.1}" cy="{:.1}" r="10" fill="#1f77b4" fill-opacity="0.8"/>"##,
                    x_of(i),
                    y_of(*v)
                );
            }
        }
    }

    for (i, label) in series.labels.iter().enumerate() {
        let (x, y) = (x_of(i), base_y + 16.0);
        let _ = write!(
            svg,
            r#"<text x="{x:.1}" y="{y:.1}" font-size="12" text-anchor="end" transform="rotate(-45 {x:.1} {y:.1})">{}</text>"#,
            xml_escape(label)
        );
    }
    if !spec.xlabel.is_empty() {
        let _ = write!(
            svg,
            r#"<text x="{}" y="{}" font-size="14" text-anchor="middle">{}</text>"#,
            MARGIN_LEFT + plot_w / 2.0,
            HEIGHT - 12.0,
            xml_escape(&spec.xlabel)
        );
    }
    if !spec.ylabel.is_empty() {
        let (x, y) = (22.0, MARGIN_TOP + plot_h / 2.0);
        let _ = write!(
            svg,
            r#"<text x="{x}" y="{y}" font-size="14" text-anchor="middle" transform="rotate(-90 {x} {y})">{}</text>"#,
            xml_escape(&spec.ylabel)
        );
    }
}

/// Output file in `dir`. Only the file name is kept and raster extensions
/// become `.svg`.
fn chart_path(dir: &Path, requested: Option<&str>) -> PathBuf {
    let stem = requested
        .and_then(|r| Path::new(r.trim()).file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("chart_{}", chrono::Local::now().format("%Y%m%d_%H%M%S")));
    dir.join(format!("{}.svg", stem))
}

/// Render a chart into the working directory.
pub struct CreateChart;

#[async_trait]
impl Tool for CreateChart {
    fn name(&self) -> ToolName {
        ToolName::CreateChart
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let data = args
            .get("data")
            .ok_or_else(|| anyhow::anyhow!("Missing 'data' argument"))?;
        let series = Series::from_data(data)?;
        let mut kind = ChartKind::parse(opt_str_arg(args, "chart_type"))?;
        // A plain list is drawn as bars, or as a line for any other type.
        if data.is_array() && kind != ChartKind::Bar {
            kind = ChartKind::Line;
        }

        let spec = ChartSpec {
            kind,
            title: opt_str_arg(args, "title").unwrap_or("Chart").to_string(),
            xlabel: opt_str_arg(args, "xlabel").unwrap_or_default().to_string(),
            ylabel: opt_str_arg(args, "ylabel").unwrap_or_default().to_string(),
            series,
        };

        let path = chart_path(&ctx.config.working_dir, opt_str_arg(args, "filename"));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, render_svg(&spec)).await?;

        Ok(ToolOutput::new(format!("Chart saved: {}", path.display())).with_file(path))
    }
}
