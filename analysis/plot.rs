//! Text-rendered charts.
//!
//! Charts are drawn with `ratatui` widgets into an off-screen [`Buffer`] and
//! returned as plain text, one line per terminal row, so they can be printed
//! or stored in a report.

use crate::data::{DataError, FieldData};
use crate::diagnostics::Diagnostics;
use crate::inference::normal_quantile;
use ratatui::buffer::Buffer;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Style};
use ratatui::symbols;
use ratatui::text::Line;
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Widget};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlotError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("Nothing to plot: '{0}' has no finite values.")]
    NoData(String),
    #[error("Plots need at least {min_width}x{min_height} characters, got {width}x{height}.")]
    TooSmall {
        width: u16,
        height: u16,
        min_width: u16,
        min_height: u16,
    },
    #[error("Leverage is not defined for mixed models.")]
    LeverageUnavailable,
}

const MIN_WIDTH: u16 = 24;
const MIN_HEIGHT: u16 = 8;

/// Size of one chart in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotOptions {
    pub width: u16,
    pub height: u16,
}

impl Default for PlotOptions {
    fn default() -> Self {
        Self {
            width: 72,
            height: 20,
        }
    }
}

impl PlotOptions {
    fn check(&self) -> Result<(), PlotError> {
        if self.width < MIN_WIDTH || self.height < MIN_HEIGHT {
            return Err(PlotError::TooSmall {
                width: self.width,
                height: self.height,
                min_width: MIN_WIDTH,
                min_height: MIN_HEIGHT,
            });
        }
        Ok(())
    }
}

/// Everything needed to draw one scatter chart.
struct ChartSpec {
    title: String,
    x_title: String,
    y_title: String,
    points: Vec<(f64, f64)>,
    /// Reference lines drawn behind the points.
    lines: Vec<Vec<(f64, f64)>>,
    /// Tick labels replacing the numeric x labels (strip plots).
    x_ticks: Option<Vec<String>>,
    x_bounds: Option<[f64; 2]>,
}

impl ChartSpec {
    fn new(title: &str, x_title: &str, y_title: &str, points: Vec<(f64, f64)>) -> Self {
        Self {
            title: title.to_string(),
            x_title: x_title.to_string(),
            y_title: y_title.to_string(),
            points: points
                .into_iter()
                .filter(|(x, y)| x.is_finite() && y.is_finite())
                .collect(),
            lines: Vec::new(),
            x_ticks: None,
            x_bounds: None,
        }
    }

    fn bounds(&self) -> ([f64; 2], [f64; 2]) {
        let all = self.points.iter().chain(self.lines.iter().flatten());
        let (mut x_min, mut x_max, mut y_min, mut y_max) =
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
        for &(x, y) in all {
            x_min = x_min.min(x);
            x_max = x_max.max(x);
            y_min = y_min.min(y);
            y_max = y_max.max(y);
        }
        let pad = |lo: f64, hi: f64| {
            let span = (hi - lo).abs().max(1e-9);
            [lo - 0.05 * span, hi + 0.05 * span]
        };
        (self.x_bounds.unwrap_or_else(|| pad(x_min, x_max)), pad(y_min, y_max))
    }

    fn render(&self, area: Rect, buffer: &mut Buffer) {
        let (x_bounds, y_bounds) = self.bounds();
        let ticks = |b: [f64; 2]| {
            let mid = (b[0] + b[1]) / 2.0;
            [b[0], mid, b[1]]
                .iter()
                .map(|v| Line::from(format!("{v:.2}")))
                .collect::<Vec<Line>>()
        };
        let x_labels = match &self.x_ticks {
            Some(labels) => labels.iter().map(|l| Line::from(l.clone())).collect::<Vec<Line>>(),
            None => ticks(x_bounds),
        };

        let mut datasets: Vec<Dataset> = self
            .lines
            .iter()
            .map(|line| {
                Dataset::default()
                    .marker(symbols::Marker::Braille)
                    .graph_type(GraphType::Line)
                    .style(Style::default().fg(Color::DarkGray))
                    .data(line)
            })
            .collect();
        datasets.push(
            Dataset::default()
                .marker(symbols::Marker::Dot)
                .graph_type(GraphType::Scatter)
                .style(Style::default().fg(Color::Cyan))
                .data(&self.points),
        );

        Chart::new(datasets)
            .block(Block::default().title(self.title.as_str()).borders(Borders::ALL))
            .x_axis(
                Axis::default()
                    .title(self.x_title.as_str())
                    .bounds(x_bounds)
                    .labels(x_labels),
            )
            .y_axis(
                Axis::default()
                    .title(self.y_title.as_str())
                    .bounds(y_bounds)
                    .labels(ticks(y_bounds)),
            )
            .render(area, buffer);
    }
}

/// Turns a rendered buffer into text without trailing blanks.
fn buffer_to_text(buffer: &Buffer) -> String {
    let area = buffer.area;
    let mut lines = Vec::with_capacity(area.height as usize);
    for y in area.top()..area.bottom() {
        let mut line = String::with_capacity(area.width as usize);
        for x in area.left()..area.right() {
            if let Some(cell) = buffer.cell((x, y)) {
                line.push_str(cell.symbol());
            }
        }
        lines.push(line.trim_end().to_string());
    }
    lines.join("\n")
}

fn render_one(spec: &ChartSpec, options: &PlotOptions) -> Result<String, PlotError> {
    options.check()?;
    if spec.points.is_empty() {
        return Err(PlotError::NoData(spec.title.clone()));
    }
    let area = Rect::new(0, 0, options.width, options.height);
    let mut buffer = Buffer::empty(area);
    spec.render(area, &mut buffer);
    Ok(buffer_to_text(&buffer))
}

fn horizontal_line(y: f64, points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let (lo, hi) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(x, _)| (lo.min(x), hi.max(x)));
    if lo.is_finite() {
        vec![(lo, y), (hi, y)]
    } else {
        Vec::new()
    }
}

fn residuals_vs_fitted_spec(diagnostics: &Diagnostics) -> ChartSpec {
    let points = diagnostics.rows.iter().map(|r| (r.fitted, r.residual)).collect();
    let mut spec = ChartSpec::new("Residuals vs Fitted", "Fitted values", "Residuals", points);
    spec.lines.push(horizontal_line(0.0, &spec.points));
    spec
}

fn scale_location_spec(diagnostics: &Diagnostics) -> ChartSpec {
    let points = diagnostics
        .rows
        .iter()
        .map(|r| (r.fitted, r.sqrt_abs_standardized))
        .collect();
    ChartSpec::new("Scale-Location", "Fitted values", "√|Std. residuals|", points)
}

/// Linear interpolation quantile (R type 7) of sorted values.
fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

fn normal_qq_spec(diagnostics: &Diagnostics) -> ChartSpec {
    let points: Vec<(f64, f64)> = diagnostics
        .rows
        .iter()
        .map(|r| (r.theoretical_quantile, r.standardized))
        .collect();
    let mut spec = ChartSpec::new("Normal Q-Q", "Theoretical quantiles", "Std. residuals", points);
    let mut sample: Vec<f64> = spec.points.iter().map(|&(_, y)| y).collect();
    if sample.len() >= 2 {
        sample.sort_by(f64::total_cmp);
        // Line through the first and third quartiles, as R's qqline.
        let (q1, q3) = (quantile_sorted(&sample, 0.25), quantile_sorted(&sample, 0.75));
        let (t1, t3) = (normal_quantile(0.25), normal_quantile(0.75));
        let slope = (q3 - q1) / (t3 - t1);
        let intercept = q1 - slope * t1;
        let (lo, hi) = spec
            .points
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(x, _)| (lo.min(x), hi.max(x)));
        spec.lines.push(vec![(lo, intercept + slope * lo), (hi, intercept + slope * hi)]);
    }
    spec
}

fn residuals_vs_leverage_spec(diagnostics: &Diagnostics) -> Result<ChartSpec, PlotError> {
    if diagnostics.mixed {
        return Err(PlotError::LeverageUnavailable);
    }
    let points = diagnostics.rows.iter().map(|r| (r.leverage, r.standardized)).collect();
    let mut spec = ChartSpec::new("Residuals vs Leverage", "Leverage", "Std. residuals", points);
    spec.lines.push(horizontal_line(0.0, &spec.points));
    Ok(spec)
}

pub fn residuals_vs_fitted(diagnostics: &Diagnostics, options: &PlotOptions) -> Result<String, PlotError> {
    render_one(&residuals_vs_fitted_spec(diagnostics), options)
}

pub fn scale_location(diagnostics: &Diagnostics, options: &PlotOptions) -> Result<String, PlotError> {
    render_one(&scale_location_spec(diagnostics), options)
}

/// Standardized residuals against normal scores with the quartile line.
pub fn normal_qq(diagnostics: &Diagnostics, options: &PlotOptions) -> Result<String, PlotError> {
    render_one(&normal_qq_spec(diagnostics), options)
}

pub fn residuals_vs_leverage(
    diagnostics: &Diagnostics,
    options: &PlotOptions,
) -> Result<String, PlotError> {
    render_one(&residuals_vs_leverage_spec(diagnostics)?, options)
}

/// The four diagnostic charts in a 2×2 grid, each `options` in size. Mixed
/// models leave the leverage cell empty.
pub fn diagnostic_panel(diagnostics: &Diagnostics, options: &PlotOptions) -> Result<String, PlotError> {
    options.check()?;
    let mut specs = vec![
        residuals_vs_fitted_spec(diagnostics),
        normal_qq_spec(diagnostics),
        scale_location_spec(diagnostics),
    ];
    if !diagnostics.mixed {
        specs.push(residuals_vs_leverage_spec(diagnostics)?);
    }
    if specs[0].points.is_empty() {
        return Err(PlotError::NoData("residuals".to_string()));
    }

    let area = Rect::new(0, 0, options.width.saturating_mul(2), options.height.saturating_mul(2));
    let mut buffer = Buffer::empty(area);
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);
    let mut cells = Vec::with_capacity(4);
    for row in rows.iter() {
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(*row);
        cells.extend(columns.iter().copied());
    }
    for (spec, cell) in specs.iter().zip(cells) {
        spec.render(cell, &mut buffer);
    }
    Ok(buffer_to_text(&buffer))
}

/// Strip plot of `response` for each level of `factor`, with level means
/// marked by a short horizontal bar.
pub fn response_by_level(
    data: &FieldData,
    response: &str,
    factor: &str,
    options: &PlotOptions,
) -> Result<String, PlotError> {
    let values = data.numeric(response)?;
    let groups = data.factor(factor)?;
    let mut points = Vec::with_capacity(values.len());
    let mut sums = vec![(0.0, 0usize); groups.n_levels()];
    for (value, code) in values.iter().zip(&groups.codes) {
        if let (true, Some(code)) = (value.is_finite(), code) {
            points.push(((code + 1) as f64, *value));
            sums[*code].0 += value;
            sums[*code].1 += 1;
        }
    }
    let mut spec = ChartSpec::new(
        &format!("{response} by {factor}"),
        factor,
        response,
        points,
    );
    if spec.points.is_empty() {
        return Err(PlotError::NoData(response.to_string()));
    }
    for (level, &(sum, count)) in sums.iter().enumerate() {
        if count > 0 {
            let x = (level + 1) as f64;
            let mean = sum / count as f64;
            spec.lines.push(vec![(x - 0.2, mean), (x + 0.2, mean)]);
        }
    }
    // Axis labels are spread evenly from edge to edge, so the outer levels
    // sit on the bounds.
    if groups.n_levels() >= 2 {
        spec.x_bounds = Some([1.0, groups.n_levels() as f64]);
        spec.x_ticks = Some(groups.levels.clone());
    }
    render_one(&spec, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::builtin;
    use crate::diagnostics::residual_diagnostics;
    use crate::formula::Formula;
    use crate::model::{FitOptions, fit_model};

    fn diagnostics() -> Diagnostics {
        let data = builtin("plant_growth").unwrap();
        let fit = fit_model(
            &Formula::parse("weight ~ group").unwrap(),
            &data,
            &FitOptions::default(),
        )
        .unwrap();
        residual_diagnostics(&fit)
    }

    #[test]
    fn charts_have_the_requested_size_and_title() {
        let options = PlotOptions::default();
        let text = residuals_vs_fitted(&diagnostics(), &options).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 20);
        assert!(lines.iter().all(|l| l.chars().count() <= 72));
        assert!(text.contains("Residuals vs Fitted"));
        assert!(text.contains(symbols::DOT));
    }

    #[test]
    fn panel_holds_all_four_charts() {
        let options = PlotOptions {
            width: 40,
            height: 12,
        };
        let text = diagnostic_panel(&diagnostics(), &options).unwrap();
        assert_eq!(text.lines().count(), 24);
        for title in ["Residuals vs Fitted", "Normal Q-Q", "Scale-Location", "Residuals vs Leverage"] {
            assert!(text.contains(title), "missing {title}");
        }
    }

    #[test]
    fn strip_plot_labels_levels() {
        let data = builtin("plant_growth").unwrap();
        let text = response_by_level(&data, "weight", "group", &PlotOptions::default()).unwrap();
        assert!(text.contains("weight by group"));
        assert!(text.contains("ctrl"));
        assert!(text.contains("trt2"));
    }

    #[test]
    fn tiny_canvases_are_rejected() {
        let options = PlotOptions {
            width: 10,
            height: 4,
        };
        assert!(matches!(
            normal_qq(&diagnostics(), &options),
            Err(PlotError::TooSmall { .. })
        ));
    }

    #[test]
    fn type_seven_quantiles() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile_sorted(&sorted, 0.25), 1.75);
        assert_eq!(quantile_sorted(&sorted, 0.75), 3.25);
    }
}
