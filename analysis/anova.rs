//! Omnibus significance tables and model comparisons.
//!
//! Linear models get the classical sequential (type I) decomposition as well
//! as marginal Wald tests. Mixed models only get marginal tests, with
//! Satterthwaite denominator degrees of freedom, reported on the scale of the
//! residual variance so the columns line up with the linear case.

use crate::inference::{pvalue_chisq, pvalue_f};
use crate::linear::{LinearFit, residual_sum_of_squares};
use crate::model::{FitError, FittedModel, ModelFit};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnovaError {
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(
        "Sequential (type I) tables are only available for linear models; use the marginal table for mixed models."
    )]
    SequentialMixed,
    #[error("Unknown ANOVA type '{0}'. Use 'sequential' or 'marginal'.")]
    UnknownType(String),
    #[error("The models were fitted to different observations ({small} and {big} rows).")]
    DifferentObservations { small: usize, big: usize },
    #[error("The second model must have more parameters than the first to be compared with it.")]
    NotNested,
    #[error(
        "REML fits with different fixed effects cannot be compared by likelihood; refit both models with ML."
    )]
    RemlFixedEffectsDiffer,
}

/// Which hypotheses the table tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnovaType {
    /// Each term adjusted for the terms before it (type I).
    #[default]
    Sequential,
    /// Each term adjusted for every other term.
    Marginal,
}

impl FromStr for AnovaType {
    type Err = AnovaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" | "i" | "1" | "type1" => Ok(AnovaType::Sequential),
            "marginal" | "iii" | "3" | "type3" => Ok(AnovaType::Marginal),
            other => Err(AnovaError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for AnovaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnovaType::Sequential => write!(f, "sequential"),
            AnovaType::Marginal => write!(f, "marginal"),
        }
    }
}

/// One line of an ANOVA table. The residual line has no F test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnovaRow {
    pub term: String,
    pub df: f64,
    pub sum_sq: f64,
    pub mean_sq: f64,
    /// Denominator degrees of freedom of the F test.
    pub den_df: Option<f64>,
    pub f_value: Option<f64>,
    pub p_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnovaTable {
    pub kind: AnovaType,
    pub mixed: bool,
    pub rows: Vec<AnovaRow>,
}

impl AnovaTable {
    pub fn row(&self, term: &str) -> Option<&AnovaRow> {
        self.rows.iter().find(|r| r.term == term)
    }
}

/// Builds the ANOVA table of a fitted model.
pub fn anova(fit: &ModelFit, kind: AnovaType) -> Result<AnovaTable, AnovaError> {
    match (fit, kind) {
        (ModelFit::Linear(lm), AnovaType::Sequential) => sequential(lm),
        (ModelFit::Linear(lm), AnovaType::Marginal) => {
            let sigma2 = lm.sigma * lm.sigma;
            let mut rows = marginal_rows(lm, sigma2)?;
            rows.push(residual_row(lm));
            Ok(AnovaTable {
                kind,
                mixed: false,
                rows,
            })
        }
        (ModelFit::Mixed(_), AnovaType::Sequential) => Err(AnovaError::SequentialMixed),
        (ModelFit::Mixed(lmm), AnovaType::Marginal) => Ok(AnovaTable {
            kind,
            mixed: true,
            rows: marginal_rows(lmm, lmm.residual_variance)?,
        }),
    }
}

fn residual_row(lm: &LinearFit) -> AnovaRow {
    AnovaRow {
        term: "Residuals".to_string(),
        df: lm.df_residual as f64,
        sum_sq: lm.rss,
        mean_sq: lm.rss / lm.df_residual as f64,
        den_df: None,
        f_value: None,
        p_value: None,
    }
}

/// Type I sums of squares: the drop in RSS as each term enters in order.
fn sequential(lm: &LinearFit) -> Result<AnovaTable, AnovaError> {
    let design = &lm.design;
    let residual_ms = lm.rss / lm.df_residual as f64;
    let mut columns: Vec<usize> = design.intercept_column().into_iter().collect();
    let mut previous_rss =
        residual_sum_of_squares(design.x.select(Axis(1), &columns).view(), lm.y.view())?;

    let mut rows = Vec::with_capacity(design.terms.len() + 1);
    for term in &design.terms {
        if term.columns.is_empty() {
            log::warn!("Term '{}' has no estimable columns and is left out of the table.", term.label);
            continue;
        }
        columns.extend(&term.columns);
        let rss = residual_sum_of_squares(design.x.select(Axis(1), &columns).view(), lm.y.view())?;
        let df = term.columns.len() as f64;
        let sum_sq = (previous_rss - rss).max(0.0);
        let mean_sq = sum_sq / df;
        let f_value = mean_sq / residual_ms;
        rows.push(AnovaRow {
            term: term.label.clone(),
            df,
            sum_sq,
            mean_sq,
            den_df: Some(lm.df_residual as f64),
            f_value: Some(f_value),
            p_value: Some(pvalue_f(f_value, df, lm.df_residual as f64)),
        });
        previous_rss = rss;
    }
    rows.push(residual_row(lm));
    Ok(AnovaTable {
        kind: AnovaType::Sequential,
        mixed: false,
        rows,
    })
}

/// Wald F test of every term given all the others.
fn marginal_rows<M: FittedModel>(fit: &M, sigma2: f64) -> Result<Vec<AnovaRow>, AnovaError> {
    let mut rows = Vec::with_capacity(fit.design().terms.len());
    for (index, term) in fit.design().terms.iter().enumerate() {
        if term.columns.is_empty() {
            log::warn!("Term '{}' has no estimable columns and is left out of the table.", term.label);
            continue;
        }
        let test = fit.contrast_f_test(&fit.term_contrast(index))?;
        rows.push(AnovaRow {
            term: term.label.clone(),
            df: test.num_df,
            sum_sq: test.f_value * test.num_df * sigma2,
            mean_sq: test.f_value * sigma2,
            den_df: Some(test.den_df),
            f_value: Some(test.f_value),
            p_value: Some(test.p_value),
        });
    }
    Ok(rows)
}

/// One model in a nested-model F test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRow {
    pub model: String,
    pub df_residual: f64,
    pub rss: f64,
    pub df: Option<f64>,
    pub sum_sq: Option<f64>,
    pub f_value: Option<f64>,
    pub p_value: Option<f64>,
}

/// Extra-sum-of-squares F test of a smaller linear model against a larger
/// one fitted to the same rows.
pub fn compare_linear(small: &LinearFit, big: &LinearFit) -> Result<Vec<ComparisonRow>, AnovaError> {
    if small.n_obs != big.n_obs {
        return Err(AnovaError::DifferentObservations {
            small: small.n_obs,
            big: big.n_obs,
        });
    }
    if big.df_residual >= small.df_residual {
        return Err(AnovaError::NotNested);
    }
    let df = (small.df_residual - big.df_residual) as f64;
    let sum_sq = small.rss - big.rss;
    let f_value = (sum_sq / df) / (big.rss / big.df_residual as f64);
    Ok(vec![
        ComparisonRow {
            model: small.formula.to_string(),
            df_residual: small.df_residual as f64,
            rss: small.rss,
            df: None,
            sum_sq: None,
            f_value: None,
            p_value: None,
        },
        ComparisonRow {
            model: big.formula.to_string(),
            df_residual: big.df_residual as f64,
            rss: big.rss,
            df: Some(df),
            sum_sq: Some(sum_sq),
            f_value: Some(f_value),
            p_value: Some(pvalue_f(f_value, df, big.df_residual as f64)),
        },
    ])
}

/// A likelihood-ratio test between two nested models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LikelihoodRatio {
    pub small: String,
    pub big: String,
    pub small_log_likelihood: f64,
    pub big_log_likelihood: f64,
    pub small_aic: f64,
    pub big_aic: f64,
    pub statistic: f64,
    pub df: f64,
    pub p_value: f64,
}

fn is_reml(fit: &ModelFit) -> bool {
    fit.as_mixed().is_some_and(|m| m.reml)
}

/// `χ² = 2(ℓ_big - ℓ_small)` on the difference in parameter counts.
///
/// REML likelihoods are only comparable between models with identical fixed
/// effects; any other combination involving a REML fit is refused.
pub fn likelihood_ratio_test(small: &ModelFit, big: &ModelFit) -> Result<LikelihoodRatio, AnovaError> {
    if small.n_obs() != big.n_obs() {
        return Err(AnovaError::DifferentObservations {
            small: small.n_obs(),
            big: big.n_obs(),
        });
    }
    if (is_reml(small) || is_reml(big))
        && !(is_reml(small)
            && is_reml(big)
            && small.design().column_names == big.design().column_names)
    {
        return Err(AnovaError::RemlFixedEffectsDiffer);
    }
    let small_k = small.n_parameters();
    let big_k = big.n_parameters();
    if big_k <= small_k {
        return Err(AnovaError::NotNested);
    }
    let df = (big_k - small_k) as f64;
    let statistic = (2.0 * (big.log_likelihood() - small.log_likelihood())).max(0.0);
    Ok(LikelihoodRatio {
        small: small.formula().to_string(),
        big: big.formula().to_string(),
        small_log_likelihood: small.log_likelihood(),
        big_log_likelihood: big.log_likelihood(),
        small_aic: small.aic(),
        big_aic: big.aic(),
        statistic,
        df,
        p_value: pvalue_chisq(statistic, df),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{LoadOptions, load_csv_str};
    use crate::datasets::builtin;
    use crate::formula::Formula;
    use crate::model::{FitOptions, fit_model};
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn plant_growth(formula: &str) -> ModelFit {
        let data = builtin("plant_growth").unwrap();
        fit_model(&Formula::parse(formula).unwrap(), &data, &FitOptions::default()).unwrap()
    }

    #[test]
    fn one_way_table_matches_r() {
        let fit = plant_growth("weight ~ group");
        let table = anova(&fit, AnovaType::Sequential).unwrap();
        let group = table.row("group").unwrap();
        assert_eq!(group.df, 2.0);
        assert_abs_diff_eq!(group.sum_sq, 3.76634, epsilon = 1e-5);
        assert_abs_diff_eq!(group.f_value.unwrap(), 4.846088, epsilon = 1e-5);
        assert_abs_diff_eq!(group.p_value.unwrap(), 0.01591, epsilon = 1e-4);
        let residuals = table.row("Residuals").unwrap();
        assert_eq!(residuals.df, 27.0);
        assert_abs_diff_eq!(residuals.sum_sq, 10.49209, epsilon = 1e-5);

        let marginal = anova(&fit, AnovaType::Marginal).unwrap();
        let group = marginal.row("group").unwrap();
        assert_abs_diff_eq!(group.f_value.unwrap(), 4.846088, epsilon = 1e-5);
        assert_abs_diff_eq!(group.sum_sq, 3.76634, epsilon = 1e-5);
    }

    #[test]
    fn last_sequential_term_equals_its_marginal_test() {
        let text = "y,a,x\n3.1,p,1\n4.0,p,2\n5.2,q,2\n6.8,q,4\n6.1,r,3\n8.3,r,5\n4.4,p,3\n7.0,q,3\n";
        let data = load_csv_str(text, &LoadOptions::default()).unwrap();
        let fit = fit_model(&Formula::parse("y ~ a + x").unwrap(), &data, &FitOptions::default())
            .unwrap();
        let sequential = anova(&fit, AnovaType::Sequential).unwrap();
        let marginal = anova(&fit, AnovaType::Marginal).unwrap();
        assert_relative_eq!(
            sequential.row("x").unwrap().f_value.unwrap(),
            marginal.row("x").unwrap().f_value.unwrap(),
            max_relative = 1e-8
        );
        // Unbalanced covariate: the first term differs between the two tables.
        assert!(
            (sequential.row("a").unwrap().sum_sq - marginal.row("a").unwrap().sum_sq).abs() > 1e-6
        );
    }

    #[test]
    fn mixed_models_only_have_marginal_tables() {
        let text = "yield,trt,block\n\
                    12.1,A,1\n13.4,A,2\n11.8,A,3\n14.0,A,4\n\
                    13.9,B,1\n15.2,B,2\n13.1,B,3\n15.8,B,4\n\
                    11.0,C,1\n12.9,C,2\n10.7,C,3\n13.1,C,4\n";
        let data = load_csv_str(text, &LoadOptions::default()).unwrap();
        let formula = Formula::parse("yield ~ trt + (1 | block)").unwrap();
        let fit = fit_model(&formula, &data, &FitOptions::default()).unwrap();
        assert!(matches!(
            anova(&fit, AnovaType::Sequential),
            Err(AnovaError::SequentialMixed)
        ));
        let table = anova(&fit, AnovaType::Marginal).unwrap();
        let trt = table.row("trt").unwrap();
        // MS_trt / MSE of the randomised complete block analysis.
        assert_relative_eq!(trt.f_value.unwrap(), 6.8308333 / 0.0363889, max_relative = 2e-3);
        assert_abs_diff_eq!(trt.den_df.unwrap(), 6.0, epsilon = 0.05);
        assert_eq!(trt.df, 2.0);
    }

    #[test]
    fn nested_linear_models_compare_by_extra_sum_of_squares() {
        let small = plant_growth("weight ~ 1");
        let big = plant_growth("weight ~ group");
        let rows = compare_linear(small.as_linear().unwrap(), big.as_linear().unwrap()).unwrap();
        assert_abs_diff_eq!(rows[1].f_value.unwrap(), 4.846088, epsilon = 1e-5);
        assert_eq!(rows[1].df, Some(2.0));
        assert!(matches!(
            compare_linear(big.as_linear().unwrap(), small.as_linear().unwrap()),
            Err(AnovaError::NotNested)
        ));
    }

    #[test]
    fn likelihood_ratio_of_linear_models() {
        let small = plant_growth("weight ~ 1");
        let big = plant_growth("weight ~ group");
        let lrt = likelihood_ratio_test(&small, &big).unwrap();
        assert_eq!(lrt.df, 2.0);
        // 2(ℓ₁ - ℓ₀) = n log(RSS₀ / RSS₁)
        let expected = 30.0 * (14.25843 / 10.49209_f64).ln();
        assert_abs_diff_eq!(lrt.statistic, expected, epsilon = 1e-4);
        assert!(lrt.p_value < 0.05);
    }
}
