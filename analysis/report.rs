//! Text tables and the persisted analysis report.
//!
//! Every renderer returns a `String` laid out like the corresponding R
//! printout, with numbers to a fixed count of significant digits and tiny
//! p-values shown as `<2e-16`.

use crate::anova::{AnovaTable, AnovaType, ComparisonRow, LikelihoodRatio};
use crate::cld::CldTable;
use crate::comparisons::PairwiseTable;
use crate::data::GroupSummary;
use crate::emmeans::EmmTable;
use crate::inference::significance_stars;
use crate::linear::OverallF;
use crate::mixed::VarianceComponent;
use crate::model::{CoefficientRow, FittedModel, ModelFit};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Significant digits of estimates and statistics.
const DIGITS: usize = 5;
/// p-values below this print as `<2e-16`.
const P_VALUE_FLOOR: f64 = 2.2e-16;
const SIGNIF_CODES: &str = "Signif. codes:  0 '***' 0.001 '**' 0.01 '*' 0.05 '.' 0.1 ' ' 1";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write or read the report file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse the report TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize the report to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Fit statistics of either kind of model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FitSummary {
    /// `least squares`, `REML` or `ML`.
    pub method: String,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    /// Residual standard deviation.
    pub sigma: f64,
    pub df_residual: Option<f64>,
    pub r_squared: Option<f64>,
    pub adj_r_squared: Option<f64>,
    pub f_statistic: Option<OverallF>,
    pub deviance: Option<f64>,
    pub r2_marginal: Option<f64>,
    pub r2_conditional: Option<f64>,
    pub singular: bool,
    pub converged: bool,
}

impl FitSummary {
    pub fn from_fit(fit: &ModelFit) -> Self {
        match fit {
            ModelFit::Linear(lm) => Self {
                method: "least squares".to_string(),
                log_likelihood: lm.log_likelihood,
                aic: lm.aic,
                bic: lm.bic,
                sigma: lm.sigma,
                df_residual: Some(lm.df_residual as f64),
                r_squared: Some(lm.r_squared),
                adj_r_squared: Some(lm.adj_r_squared),
                f_statistic: lm.f_statistic,
                deviance: None,
                r2_marginal: None,
                r2_conditional: None,
                singular: false,
                converged: true,
            },
            ModelFit::Mixed(lmm) => Self {
                method: if lmm.reml { "REML" } else { "ML" }.to_string(),
                log_likelihood: lmm.log_likelihood,
                aic: lmm.aic,
                bic: lmm.bic,
                sigma: lmm.residual_variance.sqrt(),
                df_residual: None,
                r_squared: None,
                adj_r_squared: None,
                f_statistic: None,
                deviance: Some(lmm.deviance),
                r2_marginal: Some(lmm.r_squared.marginal),
                r2_conditional: Some(lmm.r_squared.conditional),
                singular: lmm.singular,
                converged: lmm.converged,
            },
        }
    }
}

/// Per-level summary of the response before modelling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExploratorySummary {
    pub response: String,
    pub factor: String,
    pub groups: Vec<GroupSummary>,
}

/// Means, comparisons and letters for one [`crate::emmeans::EmmSpec`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PosthocResult {
    pub spec: String,
    pub emmeans: EmmTable,
    pub pairwise: PairwiseTable,
    pub letters: CldTable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedPlot {
    pub title: String,
    pub text: String,
}

/// Everything one analysis produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisReport {
    pub data: String,
    pub formula: String,
    pub mixed: bool,
    pub n_obs: usize,
    pub dropped_rows: usize,
    pub fit: FitSummary,
    pub coefficients: Vec<CoefficientRow>,
    /// Coefficients dropped as linear combinations of others.
    pub aliased: Vec<String>,
    pub variance_components: Vec<VarianceComponent>,
    pub anova: AnovaTable,
    pub exploratory: Option<ExploratorySummary>,
    pub outlier_threshold: f64,
    /// Observations whose standardized residual exceeds the threshold.
    pub flagged: Vec<usize>,
    pub posthoc: Vec<PosthocResult>,
    pub plots: Vec<RenderedPlot>,
}

impl AnalysisReport {
    /// The parts of a report that come straight from a fit.
    pub fn from_fit(data: &str, fit: &ModelFit, anova: AnovaTable) -> Self {
        let (dropped_rows, variance_components) = match fit {
            ModelFit::Linear(lm) => (lm.dropped_rows, Vec::new()),
            ModelFit::Mixed(lmm) => (lmm.dropped_rows, lmm.variance_components.clone()),
        };
        Self {
            data: data.to_string(),
            formula: fit.formula().to_string(),
            mixed: fit.is_mixed(),
            n_obs: fit.n_obs(),
            dropped_rows,
            fit: FitSummary::from_fit(fit),
            coefficients: fit.coefficient_table(),
            aliased: fit.design().aliased.clone(),
            variance_components,
            anova,
            exploratory: None,
            outlier_threshold: crate::diagnostics::DEFAULT_OUTLIER_THRESHOLD,
            flagged: Vec::new(),
            posthoc: Vec::new(),
            plots: Vec::new(),
        }
    }

    /// Saves the report as TOML.
    pub fn save(&self, path: &str) -> Result<(), ReportError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        log::info!("Report saved to {path}");
        Ok(())
    }

    /// Loads a report written by [`AnalysisReport::save`].
    pub fn load(path: &str) -> Result<Self, ReportError> {
        let toml_string = fs::read_to_string(path)?;
        let report = toml::from_str(&toml_string)?;
        Ok(report)
    }
}

/// `value` rounded to `digits` significant digits; scientific notation for
/// very large or small magnitudes.
pub fn format_number(value: f64, digits: usize) -> String {
    if value.is_nan() {
        return "NA".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Inf" } else { "-Inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    let digits = digits.max(1);
    let magnitude = value.abs().log10().floor() as i32;
    if !(-4..6).contains(&magnitude) {
        return format!("{:.*e}", digits - 1, value);
    }
    let decimals = (digits as i32 - 1 - magnitude).max(0) as usize;
    format!("{value:.decimals$}")
}

pub fn format_p_value(p: f64) -> String {
    if p.is_nan() {
        "NA".to_string()
    } else if p < P_VALUE_FLOOR {
        "<2e-16".to_string()
    } else if p < 1e-4 {
        format!("{p:.1e}")
    } else {
        format_number(p, 3)
    }
}

/// Whole degrees of freedom print as integers, approximate ones with two
/// decimals.
pub fn format_df(df: f64) -> String {
    if (df - df.round()).abs() < 1e-8 {
        format!("{}", df.round() as i64)
    } else {
        format!("{df:.2}")
    }
}

/// Lays out rows under a header; the first column is left-aligned and the
/// others right-aligned.
fn table(header: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    let mut out = String::new();
    for line in std::iter::once(header).chain(rows.iter().map(Vec::as_slice)) {
        let mut text = String::new();
        for (i, (cell, width)) in line.iter().zip(&widths).enumerate() {
            if i == 0 {
                let _ = write!(text, "{cell:<width$}");
            } else {
                let _ = write!(text, "  {cell:>width$}");
            }
        }
        out.push_str(text.trim_end());
        out.push('\n');
    }
    out
}

fn header(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| c.to_string()).collect()
}

/// The coefficient table with t tests; mixed models add a df column.
pub fn render_coefficients(rows: &[CoefficientRow], mixed: bool) -> String {
    let mut columns = vec!["", "Estimate", "Std. Error"];
    if mixed {
        columns.push("df");
    }
    columns.extend(["t value", "Pr(>|t|)", "", "lower", "upper"]);
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            let mut cells = vec![
                r.name.clone(),
                format_number(r.estimate, DIGITS),
                format_number(r.std_error, DIGITS),
            ];
            if mixed {
                cells.push(format_df(r.df));
            }
            cells.extend([
                format_number(r.statistic, 4),
                format_p_value(r.p_value),
                significance_stars(r.p_value).to_string(),
                format_number(r.lower, DIGITS),
                format_number(r.upper, DIGITS),
            ]);
            cells
        })
        .collect();
    let mut out = String::from("Coefficients:\n");
    out.push_str(&table(&header(&columns), &body));
    out.push_str("---\n");
    out.push_str(SIGNIF_CODES);
    out.push('\n');
    out
}

pub fn render_anova(anova: &AnovaTable) -> String {
    let title = match (anova.kind, anova.mixed) {
        (AnovaType::Sequential, _) => "Analysis of Variance Table (sequential sums of squares)",
        (AnovaType::Marginal, false) => "Analysis of Variance Table (marginal sums of squares)",
        (AnovaType::Marginal, true) => {
            "Type III Analysis of Variance Table with Satterthwaite's method"
        }
    };
    let mut columns = vec!["", "Df", "Sum Sq", "Mean Sq"];
    if anova.mixed {
        columns.push("DenDF");
    }
    columns.extend(["F value", "Pr(>F)", ""]);
    let body: Vec<Vec<String>> = anova
        .rows
        .iter()
        .map(|r| {
            let mut cells = vec![
                r.term.clone(),
                format_df(r.df),
                format_number(r.sum_sq, DIGITS),
                format_number(r.mean_sq, DIGITS),
            ];
            if anova.mixed {
                cells.push(r.den_df.map(format_df).unwrap_or_default());
            }
            cells.push(r.f_value.map(|f| format_number(f, 4)).unwrap_or_default());
            cells.push(r.p_value.map(format_p_value).unwrap_or_default());
            cells.push(r.p_value.map(significance_stars).unwrap_or_default().to_string());
            cells
        })
        .collect();
    format!("{title}\n\n{}---\n{SIGNIF_CODES}\n", table(&header(&columns), &body))
}

pub fn render_variance_components(components: &[VarianceComponent]) -> String {
    let body: Vec<Vec<String>> = components
        .iter()
        .map(|c| {
            vec![
                c.group.clone(),
                if c.n_levels > 0 {
                    c.n_levels.to_string()
                } else {
                    String::new()
                },
                format_number(c.variance, DIGITS),
                format_number(c.std_dev, DIGITS),
            ]
        })
        .collect();
    let mut out = String::from("Random effects:\n");
    out.push_str(&table(&header(&["Groups", "Levels", "Variance", "Std.Dev."]), &body));
    out
}

/// Writes one block per `by` group with the given column header.
fn grouped<F>(groups: Vec<(String, Vec<usize>)>, by_names: &[String], columns: &[String], mut row: F) -> String
where
    F: FnMut(usize) -> Vec<String>,
{
    let mut out = String::new();
    for (by, members) in groups {
        if !by_names.is_empty() {
            let labels: Vec<String> = by_names
                .iter()
                .zip(by.split(':'))
                .map(|(name, level)| format!("{name} = {level}"))
                .collect();
            let _ = writeln!(out, "{}:", labels.join(", "));
        }
        let body: Vec<Vec<String>> = members.into_iter().map(&mut row).collect();
        out.push_str(&table(columns, &body));
        out.push('\n');
    }
    out
}

pub fn render_emmeans(emm: &EmmTable) -> String {
    let mut columns = emm.spec.factors.clone();
    columns.extend(header(&["emmean", "SE", "df", "lower.CL", "upper.CL"]));
    let mut out = grouped(emm.groups(), &emm.spec.by, &columns, |i| {
        let r = &emm.rows[i];
        let mut cells = r.levels.clone();
        if !r.estimable {
            cells.push("nonEst".to_string());
            cells.extend(std::iter::repeat_n("NA".to_string(), 4));
            return cells;
        }
        cells.extend([
            format_number(r.emmean, DIGITS),
            format_number(r.std_error, DIGITS),
            format_df(r.df),
            format_number(r.lower, DIGITS),
            format_number(r.upper, DIGITS),
        ]);
        cells
    });
    let _ = writeln!(out, "Confidence level used: {}", emm.confidence_level);
    out
}

pub fn render_pairwise(pairs: &PairwiseTable, by_names: &[String]) -> String {
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (i, row) in pairs.rows.iter().enumerate() {
        match groups.iter_mut().find(|(by, _)| *by == row.by) {
            Some((_, members)) => members.push(i),
            None => groups.push((row.by.clone(), vec![i])),
        }
    }
    let columns = header(&["contrast", "estimate", "SE", "df", "t.ratio", "p.value", "lower.CL", "upper.CL"]);
    let mut out = grouped(groups, by_names, &columns, |i| {
        let r = &pairs.rows[i];
        vec![
            r.contrast(),
            format_number(r.estimate, DIGITS),
            format_number(r.std_error, DIGITS),
            format_df(r.df),
            format_number(r.t_ratio, 4),
            format_p_value(r.p_value),
            format_number(r.lower, DIGITS),
            format_number(r.upper, DIGITS),
        ]
    });
    let _ = writeln!(
        out,
        "Confidence level used: {}\nP value adjustment: {} method",
        pairs.confidence_level, pairs.adjustment
    );
    out
}

pub fn render_cld(letters: &CldTable, by_names: &[String]) -> String {
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (i, row) in letters.rows.iter().enumerate() {
        match groups.iter_mut().find(|(by, _)| *by == row.by) {
            Some((_, members)) => members.push(i),
            None => groups.push((row.by.clone(), vec![i])),
        }
    }
    let columns = header(&["level", "emmean", "lower.CL", "upper.CL", ".group"]);
    let mut out = grouped(groups, by_names, &columns, |i| {
        let r = &letters.rows[i];
        vec![
            r.level.clone(),
            format_number(r.emmean, DIGITS),
            format_number(r.lower, DIGITS),
            format_number(r.upper, DIGITS),
            r.group.clone(),
        ]
    });
    let _ = writeln!(
        out,
        "Means sharing a symbol are not significantly different at alpha = {}",
        letters.alpha
    );
    out
}

/// Descriptive statistics of a response per factor level.
pub fn render_summary_table(summary: &ExploratorySummary) -> String {
    let columns = header(&[summary.factor.as_str(), "n", "mean", "sd", "min", "max"]);
    let body: Vec<Vec<String>> = summary
        .groups
        .iter()
        .map(|g| {
            vec![
                g.level.clone(),
                g.n.to_string(),
                format_number(g.mean, DIGITS),
                format_number(g.sd, DIGITS),
                format_number(g.min, DIGITS),
                format_number(g.max, DIGITS),
            ]
        })
        .collect();
    format!(
        "Summary of {} by {}:\n{}",
        summary.response,
        summary.factor,
        table(&columns, &body)
    )
}

/// Header of a model printout: formula, data, observations and fit statistics.
pub fn render_model_summary(report: &AnalysisReport) -> String {
    let fit = &report.fit;
    let mut out = String::new();
    if report.mixed {
        let _ = writeln!(out, "Linear mixed model fit by {}", fit.method);
    } else {
        let _ = writeln!(out, "Linear model fit by {}", fit.method);
    }
    let _ = writeln!(out, "Formula: {}", report.formula);
    let _ = writeln!(out, "   Data: {}", report.data);
    let _ = write!(out, "Observations: {}", report.n_obs);
    if report.dropped_rows > 0 {
        let _ = write!(out, " ({} rows with missing values removed)", report.dropped_rows);
    }
    out.push('\n');
    let _ = writeln!(
        out,
        "logLik: {}  AIC: {}  BIC: {}",
        format_number(fit.log_likelihood, 6),
        format_number(fit.aic, 6),
        format_number(fit.bic, 6)
    );
    if let Some(deviance) = fit.deviance {
        let label = if fit.method == "REML" { "REML criterion" } else { "deviance" };
        let _ = writeln!(out, "{label} at convergence: {}", format_number(deviance, 6));
    }
    match fit.df_residual {
        Some(df) => {
            let _ = writeln!(
                out,
                "Residual standard error: {} on {} degrees of freedom",
                format_number(fit.sigma, 4),
                format_df(df)
            );
        }
        None => {
            let _ = writeln!(out, "Residual standard deviation: {}", format_number(fit.sigma, 4));
        }
    }
    if let (Some(r2), Some(adj)) = (fit.r_squared, fit.adj_r_squared) {
        let _ = writeln!(
            out,
            "Multiple R-squared: {},  Adjusted R-squared: {}",
            format_number(r2, 4),
            format_number(adj, 4)
        );
    }
    if let Some(f) = fit.f_statistic {
        let _ = writeln!(
            out,
            "F-statistic: {} on {} and {} DF,  p-value: {}",
            format_number(f.value, 4),
            format_df(f.df1),
            format_df(f.df2),
            format_p_value(f.p_value)
        );
    }
    if let (Some(marginal), Some(conditional)) = (fit.r2_marginal, fit.r2_conditional) {
        let _ = writeln!(
            out,
            "Marginal R-squared: {},  Conditional R-squared: {}",
            format_number(marginal, 4),
            format_number(conditional, 4)
        );
    }
    if fit.singular {
        out.push_str("boundary (singular) fit: a variance component is estimated as zero\n");
    }
    if !fit.converged {
        out.push_str("The variance-parameter optimiser did not converge.\n");
    }
    if !report.aliased.is_empty() {
        let _ = writeln!(
            out,
            "Coefficients not defined because of singularities: {}",
            report.aliased.join(", ")
        );
    }
    out
}

/// The extra-sum-of-squares table of two nested linear models.
pub fn render_model_comparison(rows: &[ComparisonRow]) -> String {
    let mut out = String::from("Analysis of Variance Table\n\n");
    for (i, row) in rows.iter().enumerate() {
        let _ = writeln!(out, "Model {}: {}", i + 1, row.model);
    }
    let columns = header(&["", "Res.Df", "RSS", "Df", "Sum of Sq", "F", "Pr(>F)", ""]);
    let body: Vec<Vec<String>> = rows
        .iter()
        .enumerate()
        .map(|(i, r)| {
            vec![
                (i + 1).to_string(),
                format_df(r.df_residual),
                format_number(r.rss, DIGITS),
                r.df.map(format_df).unwrap_or_default(),
                r.sum_sq.map(|s| format_number(s, DIGITS)).unwrap_or_default(),
                r.f_value.map(|f| format_number(f, 4)).unwrap_or_default(),
                r.p_value.map(format_p_value).unwrap_or_default(),
                r.p_value.map(significance_stars).unwrap_or_default().to_string(),
            ]
        })
        .collect();
    out.push_str(&table(&columns, &body));
    out
}

pub fn render_likelihood_ratio(test: &LikelihoodRatio) -> String {
    let columns = header(&["", "AIC", "logLik", "Chisq", "Df", "Pr(>Chisq)", ""]);
    let body = vec![
        vec![
            test.small.clone(),
            format_number(test.small_aic, 6),
            format_number(test.small_log_likelihood, 6),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
        ],
        vec![
            test.big.clone(),
            format_number(test.big_aic, 6),
            format_number(test.big_log_likelihood, 6),
            format_number(test.statistic, 4),
            format_df(test.df),
            format_p_value(test.p_value),
            significance_stars(test.p_value).to_string(),
        ],
    ];
    format!("Likelihood ratio test\n\n{}", table(&columns, &body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anova::anova;
    use crate::datasets::builtin;
    use crate::formula::Formula;
    use crate::model::{FitOptions, fit_model};

    fn plant_growth() -> (ModelFit, AnovaTable) {
        let data = builtin("plant_growth").unwrap();
        let fit = fit_model(
            &Formula::parse("weight ~ group").unwrap(),
            &data,
            &FitOptions::default(),
        )
        .unwrap();
        let table = anova(&fit, AnovaType::Sequential).unwrap();
        (fit, table)
    }

    #[test]
    fn numbers_use_significant_digits() {
        assert_eq!(format_number(5.032, 4), "5.032");
        assert_eq!(format_number(0.19711, 3), "0.197");
        assert_eq!(format_number(1234.567, 5), "1234.6");
        assert_eq!(format_number(0.0, 5), "0");
        assert_eq!(format_number(f64::NAN, 5), "NA");
        assert_eq!(format_number(1.5e-7, 3), "1.50e-7");
        assert_eq!(format_number(2.5e8, 2), "2.5e8");
    }

    #[test]
    fn tiny_p_values_have_a_floor() {
        assert_eq!(format_p_value(1e-20), "<2e-16");
        assert_eq!(format_p_value(3.2e-5), "3.2e-5");
        assert_eq!(format_p_value(0.01591), "0.0159");
        assert_eq!(format_df(27.0), "27");
        assert_eq!(format_df(3.1071), "3.11");
    }

    #[test]
    fn coefficient_table_lists_every_coefficient() {
        let (fit, _) = plant_growth();
        let text = render_coefficients(&fit.coefficient_table(), false);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Coefficients:");
        assert!(lines[1].contains("Estimate") && lines[1].contains("Pr(>|t|)"));
        assert!(lines[2].starts_with("(Intercept)"));
        assert!(lines[2].contains("5.032") && lines[2].contains("<2e-16") && lines[2].contains("***"));
        assert!(lines[3].starts_with("grouptrt1"));
        assert!(!lines[1].contains(" df "));
        assert!(text.ends_with(&format!("{SIGNIF_CODES}\n")));
    }

    #[test]
    fn anova_table_has_group_and_residual_rows() {
        let (_, table) = plant_growth();
        let text = render_anova(&table);
        assert!(text.starts_with("Analysis of Variance Table (sequential"));
        let group = text.lines().find(|l| l.starts_with("group")).unwrap();
        assert!(group.contains("3.7663") && group.contains("4.846") && group.ends_with('*'));
        let residual = text.lines().find(|l| l.starts_with("Residuals")).unwrap();
        assert!(residual.contains("27") && residual.contains("10.492"));
    }

    #[test]
    fn summary_header_reports_the_fit() {
        let (fit, table) = plant_growth();
        let report = AnalysisReport::from_fit("builtin:plant_growth", &fit, table);
        let text = render_model_summary(&report);
        assert!(text.starts_with("Linear model fit by least squares\nFormula: weight ~ group\n"));
        assert!(text.contains("Observations: 30\n"));
        assert!(text.contains("Residual standard error: 0.6234 on 27 degrees of freedom"));
        assert!(text.contains("Multiple R-squared: 0.2641"));
    }

    #[test]
    fn reports_are_saved_and_loaded_as_toml() {
        let (fit, table) = plant_growth();
        let mut report = AnalysisReport::from_fit("builtin:plant_growth", &fit, table);
        report.exploratory = Some(ExploratorySummary {
            response: "weight".to_string(),
            factor: "group".to_string(),
            groups: builtin("plant_growth").unwrap().summarize_by("weight", "group").unwrap(),
        });
        report.flagged = vec![3];
        report.plots.push(RenderedPlot {
            title: "strip".to_string(),
            text: "  *\n *  \n".to_string(),
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.toml");
        let path = path.to_str().unwrap();
        report.save(path).unwrap();
        let loaded = AnalysisReport::load(path).unwrap();
        assert_eq!(loaded, report);
    }

    #[test]
    fn loading_garbage_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "formula = [").unwrap();
        assert!(matches!(
            AnalysisReport::load(path.to_str().unwrap()),
            Err(ReportError::TomlParseError(_))
        ));
    }
}
