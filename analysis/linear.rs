//! Ordinary least squares for fixed-effect models.

use crate::data::FieldData;
use crate::design::ModelDesign;
use crate::formula::Formula;
use crate::inference::pvalue_f;
use crate::model::{FitError, FitOptions, FittedModel, ModelFrame, model_frame};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{FactorizeC, InverseC, SolveC, UPLO};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// The overall F test of a linear model against the intercept-only model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverallF {
    pub value: f64,
    pub df1: f64,
    pub df2: f64,
    pub p_value: f64,
}

/// A fitted linear model.
#[derive(Debug, Clone)]
pub struct LinearFit {
    pub formula: Formula,
    pub design: ModelDesign,
    pub y: Array1<f64>,
    pub coefficients: Array1<f64>,
    pub vcov: Array2<f64>,
    /// `(X'X)⁻¹`, shared by the leverage and the ANOVA computations.
    pub xtx_inverse: Array2<f64>,
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
    pub leverage: Array1<f64>,
    pub rss: f64,
    pub sigma: f64,
    pub df_residual: usize,
    pub r_squared: f64,
    pub adj_r_squared: f64,
    pub f_statistic: Option<OverallF>,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    pub n_obs: usize,
    /// Row of the input data behind each observation.
    pub data_rows: Vec<usize>,
    pub dropped_rows: usize,
    pub confidence_level: f64,
}

/// Fits `formula` by least squares on the complete cases of `data`.
pub fn fit_linear(
    formula: &Formula,
    data: &FieldData,
    options: &FitOptions,
) -> Result<LinearFit, FitError> {
    if formula.has_random() {
        return Err(FitError::RandomTermsInLinear);
    }
    let frame = model_frame(formula, data)?;
    let design = ModelDesign::build(formula, &frame.data, options.contrasts)?;
    let y = frame.data.numeric(&formula.response)?.clone();
    fit_design(formula.clone(), design, y, frame, options.confidence_level)
}

/// Least squares on an already-built design.
pub fn fit_design(
    formula: Formula,
    design: ModelDesign,
    y: Array1<f64>,
    frame: ModelFrame,
    confidence_level: f64,
) -> Result<LinearFit, FitError> {
    let x = &design.x;
    let (n, p) = x.dim();
    if n <= p {
        return Err(FitError::InsufficientObservations { n, p });
    }

    let (coefficients, xtx_inverse) = solve_normal_equations(x.view(), y.view())?;
    let fitted = x.dot(&coefficients);
    let residuals = &y - &fitted;
    let rss = residuals.dot(&residuals);
    let df_residual = n - p;
    let sigma2 = rss / df_residual as f64;
    let vcov = &xtx_inverse * sigma2;

    // h_i = x_i' (X'X)⁻¹ x_i
    let leverage = (x.dot(&xtx_inverse) * x).sum_axis(Axis(1));

    let has_intercept = design.intercept_column().is_some();
    let tss = if has_intercept {
        let mean = y.mean().unwrap_or(0.0);
        y.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
    } else {
        y.dot(&y)
    };
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { f64::NAN };
    let model_df = p - usize::from(has_intercept);
    let adj_r_squared = 1.0
        - (1.0 - r_squared) * (n - usize::from(has_intercept)) as f64 / df_residual as f64;
    let f_statistic = (model_df > 0).then(|| {
        let value = ((tss - rss) / model_df as f64) / sigma2;
        OverallF {
            value,
            df1: model_df as f64,
            df2: df_residual as f64,
            p_value: pvalue_f(value, model_df as f64, df_residual as f64),
        }
    });

    let log_likelihood = gaussian_log_likelihood(rss, n);
    let k = (p + 1) as f64;
    let aic = -2.0 * log_likelihood + 2.0 * k;
    let bic = -2.0 * log_likelihood + (n as f64).ln() * k;

    log::debug!("Linear fit: n = {n}, p = {p}, RSS = {rss:.6}, R² = {r_squared:.4}");

    Ok(LinearFit {
        formula,
        design,
        y,
        coefficients,
        vcov,
        xtx_inverse,
        fitted,
        residuals,
        leverage,
        rss,
        sigma: sigma2.sqrt(),
        df_residual,
        r_squared,
        adj_r_squared,
        f_statistic,
        log_likelihood,
        aic,
        bic,
        n_obs: n,
        data_rows: frame.rows,
        dropped_rows: frame.dropped,
        confidence_level,
    })
}

/// Solves `X'X β = X'y` through a Cholesky factorisation and also returns
/// the inverse `(X'X)⁻¹`.
pub(crate) fn solve_normal_equations(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> Result<(Array1<f64>, Array2<f64>), FitError> {
    let xtx = x.t().dot(&x);
    let xty = x.t().dot(&y);
    let factor = xtx.factorizec(UPLO::Lower)?;
    let beta = factor.solvec(&xty)?;
    let inverse = factor.invc()?;
    Ok((beta, inverse))
}

/// Residual sum of squares of the least-squares fit of `y` on `x`.
pub(crate) fn residual_sum_of_squares(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> Result<f64, FitError> {
    if x.ncols() == 0 {
        return Ok(y.dot(&y));
    }
    let xtx = x.t().dot(&x);
    let factor = xtx.factorizec(UPLO::Lower)?;
    let beta = factor.solvec(&x.t().dot(&y))?;
    let residuals = &y - &x.dot(&beta);
    Ok(residuals.dot(&residuals))
}

/// Maximised Gaussian log-likelihood for a residual sum of squares.
fn gaussian_log_likelihood(rss: f64, n: usize) -> f64 {
    let n = n as f64;
    -0.5 * n * ((2.0 * PI).ln() + (rss / n).ln() + 1.0)
}

impl FittedModel for LinearFit {
    fn formula(&self) -> &Formula {
        &self.formula
    }
    fn design(&self) -> &ModelDesign {
        &self.design
    }
    fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }
    fn vcov(&self) -> &Array2<f64> {
        &self.vcov
    }
    fn contrast_df(&self, _: ArrayView1<f64>) -> f64 {
        self.df_residual as f64
    }
    fn fitted(&self) -> &Array1<f64> {
        &self.fitted
    }
    fn residuals(&self) -> &Array1<f64> {
        &self.residuals
    }
    fn confidence_level(&self) -> f64 {
        self.confidence_level
    }
    fn is_mixed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::builtin;
    use approx::assert_abs_diff_eq;

    fn plant_growth_fit() -> LinearFit {
        let data = builtin("plant_growth").unwrap();
        let formula = Formula::parse("weight ~ group").unwrap();
        fit_linear(&formula, &data, &FitOptions::default()).unwrap()
    }

    #[test]
    fn plant_growth_coefficients_match_lm() {
        let fit = plant_growth_fit();
        let table = fit.coefficient_table();
        assert_eq!(table[0].name, "(Intercept)");
        assert_abs_diff_eq!(table[0].estimate, 5.032, epsilon = 1e-10);
        assert_abs_diff_eq!(table[1].estimate, -0.371, epsilon = 1e-10);
        assert_abs_diff_eq!(table[2].estimate, 0.494, epsilon = 1e-10);
        assert_abs_diff_eq!(table[0].std_error, 0.1971, epsilon = 1e-4);
        assert_abs_diff_eq!(table[1].std_error, 0.2788, epsilon = 1e-4);
        assert_abs_diff_eq!(table[2].p_value, 0.0877, epsilon = 5e-4);
        assert_eq!(fit.df_residual, 27);
    }

    #[test]
    fn plant_growth_fit_statistics_match_lm() {
        let fit = plant_growth_fit();
        assert_abs_diff_eq!(fit.rss, 10.49209, epsilon = 1e-5);
        assert_abs_diff_eq!(fit.sigma, 0.6234, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.r_squared, 0.2641, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.adj_r_squared, 0.2096, epsilon = 1e-4);
        let f = fit.f_statistic.unwrap();
        assert_abs_diff_eq!(f.value, 4.846088, epsilon = 1e-5);
        assert_abs_diff_eq!(f.p_value, 0.01591, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.log_likelihood, -26.80952, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.aic, 61.61904, epsilon = 1e-4);
    }

    #[test]
    fn leverage_of_a_balanced_one_way_layout_is_one_over_group_size() {
        let fit = plant_growth_fit();
        for h in fit.leverage.iter() {
            assert_abs_diff_eq!(*h, 0.1, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(fit.residuals.sum(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn too_few_rows_is_an_error() {
        let data = crate::data::load_csv_str("y,x\n1,2\n2,3\n", &Default::default()).unwrap();
        let formula = Formula::parse("y ~ x").unwrap();
        assert!(matches!(
            fit_linear(&formula, &data, &FitOptions::default()),
            Err(FitError::InsufficientObservations { n: 2, p: 2 })
        ));
    }

    #[test]
    fn random_terms_are_refused() {
        let data = builtin("plant_growth").unwrap();
        let formula = Formula::parse("weight ~ 1 + (1 | group)").unwrap();
        assert!(matches!(
            fit_linear(&formula, &data, &FitOptions::default()),
            Err(FitError::RandomTermsInLinear)
        ));
    }
}
