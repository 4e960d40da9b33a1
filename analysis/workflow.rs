//! The model-fit-and-report workflow.
//!
//! [`run_analysis`] takes an [`AnalysisConfig`] through every stage: load the
//! data, summarize the response, fit the model, build the omnibus table,
//! check the residuals, then separate the means of each requested factor.
//! Everything lands in one [`AnalysisReport`], which [`render_report`] turns
//! into the text the command line prints.

use crate::anova::{
    AnovaError, ComparisonRow, LikelihoodRatio, anova, compare_linear, likelihood_ratio_test,
};
use crate::cld::compact_letter_display;
use crate::comparisons::pairwise;
use crate::config::{AnalysisConfig, ConfigError};
use crate::data::{DataError, FieldData};
use crate::datasets::load_source;
use crate::design::VariableInfo;
use crate::diagnostics::{DiagnosticsError, residual_diagnostics};
use crate::emmeans::{EmmSpec, EmmeansError, estimated_marginal_means};
use crate::formula::{Formula, FormulaError};
use crate::model::{FitError, FitOptions, FittedModel, ModelFit, fit_model};
use crate::plot::{PlotError, PlotOptions, diagnostic_panel, response_by_level};
use crate::report::{
    AnalysisReport, ExploratorySummary, PosthocResult, RenderedPlot, ReportError, render_anova,
    render_cld, render_coefficients, render_emmeans, render_likelihood_ratio,
    render_model_comparison, render_model_summary, render_pairwise, render_summary_table,
    render_variance_components,
};
use std::fmt::Write as _;
use std::path::Path;
use thiserror::Error;

/// Any failure along the workflow.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error("Model fitting failed: {0}")]
    Fit(#[from] FitError),
    #[error(transparent)]
    Anova(#[from] AnovaError),
    #[error(transparent)]
    Emmeans(#[from] EmmeansError),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    #[error(transparent)]
    Plot(#[from] PlotError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Runs a whole analysis as configured.
pub fn run_analysis(config: &AnalysisConfig) -> Result<AnalysisReport, WorkflowError> {
    config.validate()?;
    let formula = config.formula()?;
    let data = load_source(&config.data.path, &config.load_options())?;
    let plot_options = config.output.plots.then(|| config.plot_options());
    let mut plots = Vec::new();

    let mut exploratory = None;
    if config.data.explore {
        match first_factor(&formula, &data) {
            Some(factor) => {
                let (summary, plot) =
                    explore(&data, &formula.response, &factor, plot_options.as_ref())?;
                exploratory = Some(summary);
                plots.extend(plot);
            }
            None => log::info!("The model has no factor to summarize the response by."),
        }
    }

    let fit = fit_model(&formula, &data, &config.fit_options())?;
    log::info!(
        "Fitted {} model '{}' to {} observations",
        if fit.is_mixed() { "mixed" } else { "linear" },
        formula,
        fit.n_obs()
    );
    let table = anova(&fit, config.anova_type(fit.is_mixed()))?;
    let mut report = AnalysisReport::from_fit(&config.data.path, &fit, table);
    report.exploratory = exploratory;

    let diagnostics = residual_diagnostics(&fit);
    if let Some(path) = &config.output.diagnostics {
        diagnostics.write_csv(Path::new(path))?;
    }
    report.outlier_threshold = config.output.outlier_threshold;
    report.flagged = diagnostics.flagged(config.output.outlier_threshold);
    if !report.flagged.is_empty() {
        log::warn!(
            "{} observations have standardized residuals beyond ±{}",
            report.flagged.len(),
            config.output.outlier_threshold
        );
    }
    if let Some(options) = &plot_options {
        plots.push(RenderedPlot {
            title: "Residual diagnostics".to_string(),
            text: diagnostic_panel(&diagnostics, options)?,
        });
    }

    if config.posthoc.enabled {
        let mut specs = config.emm_specs()?;
        if specs.is_empty() {
            specs = default_specs(&fit);
        }
        for spec in &specs {
            report.posthoc.push(posthoc(&fit, spec, config)?);
        }
    }
    report.plots = plots;

    if let Some(path) = &config.output.report {
        report.save(path)?;
    }
    Ok(report)
}

/// The first fixed-effect variable of the formula that is a factor in `data`.
fn first_factor(formula: &Formula, data: &FieldData) -> Option<String> {
    formula
        .fixed_variables()
        .into_iter()
        .find(|name| data.is_factor(name).unwrap_or(false))
}

/// Per-level summary of `response`, with a strip plot when `plot` is given.
pub fn explore(
    data: &FieldData,
    response: &str,
    factor: &str,
    plot: Option<&PlotOptions>,
) -> Result<(ExploratorySummary, Option<RenderedPlot>), WorkflowError> {
    let summary = ExploratorySummary {
        response: response.to_string(),
        factor: factor.to_string(),
        groups: data.summarize_by(response, factor)?,
    };
    let rendered = match plot {
        Some(options) => Some(RenderedPlot {
            title: format!("{response} by {factor}"),
            text: response_by_level(data, response, factor, options)?,
        }),
        None => None,
    };
    Ok((summary, rendered))
}

/// One [`EmmSpec`] per categorical main effect of the model.
pub fn default_specs(fit: &ModelFit) -> Vec<EmmSpec> {
    let design = fit.design();
    design
        .terms
        .iter()
        .filter(|term| term.variables.len() == 1)
        .filter(|term| matches!(design.info(&term.variables[0]), Ok(VariableInfo::Factor { .. })))
        .map(|term| EmmSpec::single(&term.variables[0]))
        .collect()
}

fn posthoc(
    fit: &ModelFit,
    spec: &EmmSpec,
    config: &AnalysisConfig,
) -> Result<PosthocResult, WorkflowError> {
    for factor in &spec.factors {
        let in_interaction = fit
            .design()
            .terms
            .iter()
            .any(|t| t.variables.len() > 1 && t.variables.contains(factor));
        if in_interaction && spec.by.is_empty() {
            log::warn!("'{factor}' is involved in an interaction; its marginal means average over it.");
        }
    }
    let level = config.model.confidence_level;
    let emmeans = estimated_marginal_means(fit, spec, level)?;
    let pairs = pairwise(fit, &emmeans, config.posthoc.adjust, level);
    let letters = compact_letter_display(&emmeans, &pairs, config.posthoc.alpha, config.cld_options());
    Ok(PosthocResult {
        spec: spec.to_string(),
        emmeans,
        pairwise: pairs,
        letters,
    })
}

/// The printed form of a report.
pub fn render_report(report: &AnalysisReport) -> String {
    let mut out = render_model_summary(report);
    out.push('\n');
    if let Some(summary) = &report.exploratory {
        out.push_str(&render_summary_table(summary));
        out.push('\n');
    }
    if report.mixed {
        out.push_str(&render_variance_components(&report.variance_components));
        out.push('\n');
    }
    out.push_str(&render_coefficients(&report.coefficients, report.mixed));
    out.push('\n');
    out.push_str(&render_anova(&report.anova));

    for result in &report.posthoc {
        let by = &result.emmeans.spec.by;
        let _ = writeln!(out, "\nEstimated marginal means of {}:", result.spec);
        out.push_str(&render_emmeans(&result.emmeans));
        let _ = writeln!(out, "\nPairwise comparisons:");
        out.push_str(&render_pairwise(&result.pairwise, by));
        let _ = writeln!(out, "\nCompact letter display:");
        out.push_str(&render_cld(&result.letters, by));
    }

    if !report.flagged.is_empty() {
        let numbers: Vec<String> = report.flagged.iter().map(|i| (i + 1).to_string()).collect();
        let _ = writeln!(
            out,
            "\nObservations with |standardized residual| > {}: {}",
            report.outlier_threshold,
            numbers.join(", ")
        );
    }
    for plot in &report.plots {
        let _ = write!(out, "\n{}\n{}", plot.title, plot.text);
    }
    out
}

/// The outcome of comparing two nested models.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelComparison {
    /// Extra-sum-of-squares F test between linear models.
    Nested(Vec<ComparisonRow>),
    LikelihoodRatio(LikelihoodRatio),
}

/// Fits `small` and `big` to the rows complete for both and compares them.
///
/// Linear models get an F test. Otherwise a likelihood-ratio test is used;
/// both models are fitted by ML unless both are mixed with identical fixed
/// effects.
pub fn compare_models(
    data: &FieldData,
    small: &Formula,
    big: &Formula,
    options: &FitOptions,
) -> Result<ModelComparison, WorkflowError> {
    let mut names = small.variables();
    for name in big.variables() {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (common, rows) = data.complete_cases(&refs)?;
    let dropped = data.n_rows() - rows.len();
    if dropped > 0 {
        log::warn!("{dropped} rows with missing values in either model were removed.");
    }

    let mut options = options.clone();
    let both_mixed = small.has_random() && big.has_random();
    let any_random = small.has_random() || big.has_random();
    if any_random && options.reml && !(both_mixed && small.fixed_only() == big.fixed_only()) {
        log::info!("Restricted likelihoods are not comparable here; fitting both models by ML.");
        options.reml = false;
    }
    let small_fit = fit_model(small, &common, &options)?;
    let big_fit = fit_model(big, &common, &options)?;
    match (&small_fit, &big_fit) {
        (ModelFit::Linear(s), ModelFit::Linear(b)) => Ok(ModelComparison::Nested(compare_linear(s, b)?)),
        _ => Ok(ModelComparison::LikelihoodRatio(likelihood_ratio_test(
            &small_fit, &big_fit,
        )?)),
    }
}

pub fn render_comparison(comparison: &ModelComparison) -> String {
    match comparison {
        ModelComparison::Nested(rows) => render_model_comparison(rows),
        ModelComparison::LikelihoodRatio(test) => render_likelihood_ratio(test),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anova::AnovaType;
    use crate::datasets::builtin;
    use approx::assert_abs_diff_eq;

    #[test]
    fn plant_growth_end_to_end() {
        let config = AnalysisConfig::new("builtin:plant_growth", "weight ~ group");
        let report = run_analysis(&config).unwrap();
        assert!(!report.mixed);
        assert_eq!(report.n_obs, 30);
        assert_eq!(report.anova.kind, AnovaType::Sequential);
        let exploratory = report.exploratory.as_ref().unwrap();
        assert_eq!(exploratory.factor, "group");
        assert_eq!(exploratory.groups.len(), 3);
        assert_eq!(report.posthoc.len(), 1);
        let posthoc = &report.posthoc[0];
        assert_eq!(posthoc.spec, "group");
        assert_eq!(posthoc.letters.group_of("trt2"), Some("b"));
        assert!(report.plots.is_empty());

        let text = render_report(&report);
        assert!(text.contains("Formula: weight ~ group"));
        assert!(text.contains("Estimated marginal means of group:"));
        assert!(text.contains("P value adjustment: tukey method"));
        assert!(text.contains("Compact letter display:"));
    }

    #[test]
    fn mixed_model_gets_a_marginal_table_and_plots() {
        let mut config = AnalysisConfig::new("builtin:sorghum_rcbd", "yield ~ genotype + (1 | block)");
        config.output.plots = true;
        let report = run_analysis(&config).unwrap();
        assert!(report.mixed);
        assert_eq!(report.anova.kind, AnovaType::Marginal);
        assert_eq!(report.variance_components.len(), 2);
        assert_eq!(report.fit.method, "REML");
        // Strip plot and diagnostic panel.
        assert_eq!(report.plots.len(), 2);
        assert_eq!(report.posthoc[0].emmeans.rows.len(), 5);
        let text = render_report(&report);
        assert!(text.contains("Linear mixed model fit by REML"));
        assert!(text.contains("Random effects:"));
        assert!(text.contains("Satterthwaite"));
    }

    #[test]
    fn explicit_specs_and_disabled_posthoc() {
        let mut config = AnalysisConfig::new("builtin:plant_growth", "weight ~ group");
        config.posthoc.enabled = false;
        assert!(run_analysis(&config).unwrap().posthoc.is_empty());

        config.posthoc.enabled = true;
        config.posthoc.emmeans = vec!["weight".to_string()];
        assert!(matches!(
            run_analysis(&config),
            Err(WorkflowError::Emmeans(EmmeansError::NotInModel(_)))
        ));
    }

    #[test]
    fn outputs_are_written_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = dir.path().join("diagnostics.csv");
        let report_path = dir.path().join("report.toml");
        let mut config = AnalysisConfig::new("builtin:plant_growth", "weight ~ group");
        config.output.diagnostics = Some(diagnostics.to_str().unwrap().to_string());
        config.output.report = Some(report_path.to_str().unwrap().to_string());
        let report = run_analysis(&config).unwrap();
        assert!(diagnostics.exists());
        let loaded = AnalysisReport::load(report_path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.coefficients, report.coefficients);
        assert_eq!(loaded.posthoc[0].letters, report.posthoc[0].letters);
    }

    #[test]
    fn nested_linear_models_use_an_f_test() {
        let data = builtin("plant_growth").unwrap();
        let comparison = compare_models(
            &data,
            &Formula::parse("weight ~ 1").unwrap(),
            &Formula::parse("weight ~ group").unwrap(),
            &FitOptions::default(),
        )
        .unwrap();
        let ModelComparison::Nested(rows) = &comparison else {
            panic!("expected an F test");
        };
        assert_abs_diff_eq!(rows[1].f_value.unwrap(), 4.846088, epsilon = 1e-5);
        assert!(render_comparison(&comparison).contains("Res.Df"));
    }

    #[test]
    fn random_block_is_tested_by_likelihood_ratio() {
        let data = builtin("sorghum_rcbd").unwrap();
        let comparison = compare_models(
            &data,
            &Formula::parse("yield ~ genotype").unwrap(),
            &Formula::parse("yield ~ genotype + (1 | block)").unwrap(),
            &FitOptions::default(),
        )
        .unwrap();
        let ModelComparison::LikelihoodRatio(test) = &comparison else {
            panic!("expected a likelihood ratio test");
        };
        assert_abs_diff_eq!(test.df, 1.0);
        assert!(test.statistic > 0.0);
        assert!(test.p_value < 0.05);
        assert!(render_comparison(&comparison).starts_with("Likelihood ratio test"));
    }
}
