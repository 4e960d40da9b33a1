//! The seam between model fitting and everything that consumes a fit.
//!
//! Linear and mixed models expose the same view through [`FittedModel`]:
//! coefficients, their covariance, and the degrees of freedom attached to any
//! linear contrast. ANOVA tables, estimated marginal means, pairwise
//! comparisons and diagnostics are written against this trait only.

use crate::data::{DataError, FieldData};
use crate::design::{Contrasts, DesignError, ModelDesign};
use crate::formula::Formula;
use crate::inference::{confidence_interval_t, pvalue_f, pvalue_t};
use crate::linear::{LinearFit, fit_linear};
use crate::mixed::{MixedFit, fit_mixed};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A comprehensive error type for the model fitting process.
#[derive(Error, Debug)]
pub enum FitError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error("A linear system solve failed. The model matrix may be singular. Error: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),
    #[error(
        "Only {n} complete observations are available for {p} coefficients; at least {} are needed.",
        p + 1
    )]
    InsufficientObservations { n: usize, p: usize },
    #[error("The formula contains random terms; fit it as a mixed model.")]
    RandomTermsInLinear,
    #[error("The formula has no random terms; fit it as a linear model.")]
    NoRandomTerms,
    #[error("The grouping factor '{0}' has a single level, so its variance cannot be estimated.")]
    SingleGroup(String),
    #[error("REML/BFGS optimization failed to converge: {0}")]
    OptimizationFailed(String),
    #[error("The contrast has no estimable rows.")]
    EmptyContrast,
}

impl From<ndarray_linalg::error::LinalgError> for FitError {
    fn from(error: ndarray_linalg::error::LinalgError) -> Self {
        FitError::LinearSystemSolveFailed(error)
    }
}

/// Settings shared by linear and mixed fits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOptions {
    pub contrasts: Contrasts,
    /// Restricted maximum likelihood for mixed models; `false` selects ML.
    pub reml: bool,
    /// Confidence level for coefficient intervals.
    pub confidence_level: f64,
    /// Maximum iterations of the variance-parameter optimiser.
    pub max_iterations: usize,
    /// Gradient tolerance of the variance-parameter optimiser.
    pub tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            contrasts: Contrasts::Treatment,
            reml: true,
            confidence_level: 0.95,
            max_iterations: 200,
            tolerance: 1e-6,
        }
    }
}

/// One row of a coefficient table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoefficientRow {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub statistic: f64,
    pub df: f64,
    pub p_value: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Estimate, standard error and degrees of freedom of `l'β`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContrastEstimate {
    pub estimate: f64,
    pub std_error: f64,
    pub df: f64,
}

/// A Wald F test of `Lβ = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FTest {
    pub f_value: f64,
    pub num_df: f64,
    pub den_df: f64,
    pub p_value: f64,
}

/// Everything downstream analyses need from a fitted model.
pub trait FittedModel {
    fn formula(&self) -> &Formula;
    fn design(&self) -> &ModelDesign;
    fn coefficients(&self) -> &Array1<f64>;
    /// Covariance matrix of the fixed-effect estimates.
    fn vcov(&self) -> &Array2<f64>;
    /// Denominator degrees of freedom for the contrast `l'β`.
    fn contrast_df(&self, l: ArrayView1<f64>) -> f64;
    fn fitted(&self) -> &Array1<f64>;
    fn residuals(&self) -> &Array1<f64>;
    fn confidence_level(&self) -> f64;
    fn is_mixed(&self) -> bool;

    fn n_obs(&self) -> usize {
        self.fitted().len()
    }

    fn contrast_estimate(&self, l: ArrayView1<f64>) -> ContrastEstimate {
        let estimate = l.dot(self.coefficients());
        let variance = l.dot(&self.vcov().dot(&l));
        ContrastEstimate {
            estimate,
            std_error: variance.max(0.0).sqrt(),
            df: self.contrast_df(l),
        }
    }

    /// Tests `Lβ = 0` for the rows of `l`.
    ///
    /// `L C L'` is diagonalised; every eigen-direction is a one-df contrast
    /// with its own degrees of freedom `νᵢ`, and the denominator df of the
    /// combined F statistic is `2E / (E - q)` with `E = Σ νᵢ / (νᵢ - 2)`.
    /// When that is undefined the smallest `νᵢ` is used.
    fn contrast_f_test(&self, l: &Array2<f64>) -> Result<FTest, FitError> {
        let lcl = l.dot(self.vcov()).dot(&l.t());
        let (eigenvalues, eigenvectors) = lcl.eigh(UPLO::Lower)?;
        let largest = eigenvalues.iter().copied().fold(0.0_f64, f64::max);
        if largest <= 0.0 {
            return Err(FitError::EmptyContrast);
        }
        let lb = l.dot(self.coefficients());

        let mut statistic = 0.0;
        let mut dfs = Vec::new();
        for (i, &value) in eigenvalues.iter().enumerate() {
            if value <= 1e-10 * largest {
                continue;
            }
            let direction = eigenvectors.column(i);
            let row: Array1<f64> = direction.dot(l);
            let projected = direction.dot(&lb);
            statistic += projected * projected / value;
            dfs.push(self.contrast_df(row.view()));
        }
        let q = dfs.len() as f64;
        let den_df = if dfs.len() == 1 {
            dfs[0]
        } else {
            let e: f64 = dfs.iter().filter(|&&v| v > 2.0).map(|v| v / (v - 2.0)).sum();
            if e > q {
                2.0 * e / (e - q)
            } else {
                dfs.iter().copied().fold(f64::INFINITY, f64::min)
            }
        };
        let f_value = statistic / q;
        Ok(FTest {
            f_value,
            num_df: q,
            den_df,
            p_value: pvalue_f(f_value, q, den_df),
        })
    }

    /// Estimates, standard errors, t tests and confidence limits.
    fn coefficient_table(&self) -> Vec<CoefficientRow> {
        let p = self.coefficients().len();
        (0..p)
            .map(|j| {
                let mut l = Array1::zeros(p);
                l[j] = 1.0;
                let c = self.contrast_estimate(l.view());
                let statistic = c.estimate / c.std_error;
                let (lower, upper) =
                    confidence_interval_t(c.estimate, c.std_error, c.df, self.confidence_level());
                CoefficientRow {
                    name: self.design().column_names[j].clone(),
                    estimate: c.estimate,
                    std_error: c.std_error,
                    statistic,
                    df: c.df,
                    p_value: pvalue_t(statistic, c.df),
                    lower,
                    upper,
                }
            })
            .collect()
    }

    /// Rows of `I` selecting the coefficients of a term.
    fn term_contrast(&self, term: usize) -> Array2<f64> {
        let columns = self.design().term_columns(term);
        let p = self.coefficients().len();
        let mut l = Array2::zeros((columns.len(), p));
        for (row, &column) in columns.iter().enumerate() {
            l[[row, column]] = 1.0;
        }
        l
    }
}

/// A fitted linear or linear mixed model.
#[derive(Debug, Clone)]
pub enum ModelFit {
    Linear(LinearFit),
    Mixed(MixedFit),
}

/// Fits a mixed model when the formula has random terms and a linear model
/// otherwise.
pub fn fit_model(
    formula: &Formula,
    data: &FieldData,
    options: &FitOptions,
) -> Result<ModelFit, FitError> {
    if formula.has_random() {
        fit_mixed(formula, data, options).map(ModelFit::Mixed)
    } else {
        fit_linear(formula, data, options).map(ModelFit::Linear)
    }
}

/// The complete cases of a formula's variables.
#[derive(Debug, Clone)]
pub struct ModelFrame {
    pub data: FieldData,
    /// Row of the input data behind each observation.
    pub rows: Vec<usize>,
    pub dropped: usize,
}

/// Restricts `data` to rows where every variable of the formula is present.
pub fn model_frame(formula: &Formula, data: &FieldData) -> Result<ModelFrame, FitError> {
    let names = formula.variables();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (frame, rows) = data.complete_cases(&refs)?;
    let dropped = data.n_rows() - rows.len();
    if dropped > 0 {
        log::warn!("{dropped} rows with missing values in model variables were removed.");
    }
    Ok(ModelFrame {
        data: frame,
        rows,
        dropped,
    })
}

impl ModelFit {
    fn inner(&self) -> &dyn FittedModel {
        match self {
            ModelFit::Linear(fit) => fit,
            ModelFit::Mixed(fit) => fit,
        }
    }

    pub fn as_linear(&self) -> Option<&LinearFit> {
        match self {
            ModelFit::Linear(fit) => Some(fit),
            ModelFit::Mixed(_) => None,
        }
    }

    pub fn as_mixed(&self) -> Option<&MixedFit> {
        match self {
            ModelFit::Mixed(fit) => Some(fit),
            ModelFit::Linear(_) => None,
        }
    }

    pub fn log_likelihood(&self) -> f64 {
        match self {
            ModelFit::Linear(fit) => fit.log_likelihood,
            ModelFit::Mixed(fit) => fit.log_likelihood,
        }
    }

    pub fn aic(&self) -> f64 {
        match self {
            ModelFit::Linear(fit) => fit.aic,
            ModelFit::Mixed(fit) => fit.aic,
        }
    }

    pub fn bic(&self) -> f64 {
        match self {
            ModelFit::Linear(fit) => fit.bic,
            ModelFit::Mixed(fit) => fit.bic,
        }
    }

    /// Number of estimated parameters counted by the information criteria.
    pub fn n_parameters(&self) -> usize {
        match self {
            ModelFit::Linear(fit) => fit.coefficients.len() + 1,
            ModelFit::Mixed(fit) => fit.coefficients.len() + fit.random.blocks.len() + 1,
        }
    }

    /// Observations used in the fit.
    pub fn n_used(&self) -> usize {
        self.n_obs()
    }

    /// Row of the input data behind each observation.
    pub fn data_rows(&self) -> &[usize] {
        match self {
            ModelFit::Linear(fit) => &fit.data_rows,
            ModelFit::Mixed(fit) => &fit.data_rows,
        }
    }

    /// The response the model was fitted to.
    pub fn response(&self) -> &Array1<f64> {
        match self {
            ModelFit::Linear(fit) => &fit.y,
            ModelFit::Mixed(fit) => &fit.y,
        }
    }
}

impl FittedModel for ModelFit {
    fn formula(&self) -> &Formula {
        self.inner().formula()
    }
    fn design(&self) -> &ModelDesign {
        self.inner().design()
    }
    fn coefficients(&self) -> &Array1<f64> {
        self.inner().coefficients()
    }
    fn vcov(&self) -> &Array2<f64> {
        self.inner().vcov()
    }
    fn contrast_df(&self, l: ArrayView1<f64>) -> f64 {
        self.inner().contrast_df(l)
    }
    fn fitted(&self) -> &Array1<f64> {
        self.inner().fitted()
    }
    fn residuals(&self) -> &Array1<f64> {
        self.inner().residuals()
    }
    fn confidence_level(&self) -> f64 {
        self.inner().confidence_level()
    }
    fn is_mixed(&self) -> bool {
        matches!(self, ModelFit::Mixed(_))
    }
}

/// Sample variance of a vector (n - 1 denominator).
pub(crate) fn sample_variance(values: &Array1<f64>) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.mean_axis(Axis(0)).map(|m| m.into_scalar()).unwrap_or(0.0);
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
}
