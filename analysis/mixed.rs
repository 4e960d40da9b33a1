//! # Linear Mixed Models with Random Intercepts
//!
//! The model is `y = Xβ + Σ_k Z_k b_k + ε` with `b_k ~ N(0, σ²_k I)` and
//! `ε ~ N(0, σ² I)`. Writing `γ_k = σ²_k / σ²` and `Γ = diag(γ_k I)`, the
//! marginal covariance is `V = σ² H` with `H = I + Z Γ Z'`.
//!
//! `H` is never formed. Henderson's mixed-model equations give everything
//! through the small `q × q` matrix `M = Γ⁻¹ + Z'Z`:
//!
//! ```text
//! H⁻¹ a   = a - Z M⁻¹ Z'a
//! log|H|  = log|Γ| + log|M|
//! b̂       = M⁻¹ Z'(y - Xβ̂)
//! ```
//!
//! so one evaluation costs `O(q³ + p q²)` once the cross products `X'X`,
//! `X'Z`, `Z'Z`, `X'y`, `Z'y` and `y'y` are computed.
//!
//! `β` and `σ²` are profiled out and the log ratios `θ_k = ln γ_k` are
//! optimised with BFGS. The profiled REML deviance is
//!
//! ```text
//! (n - p) log(2π σ̂²) + log|H| + log|X'H⁻¹X| + (n - p),   σ̂² = r'H⁻¹r / (n - p)
//! ```
//!
//! and the ML deviance drops the `log|X'H⁻¹X|` term and uses `n`.
//!
//! Denominator degrees of freedom follow Satterthwaite: the deviance the fit
//! minimised (REML or ML) is differentiated twice numerically with respect to the variance parameters
//! `φ = (σ²_k, σ²)` to obtain their asymptotic covariance, and the gradient of
//! `Var(l'β̂)` in `φ` is taken by central differences.

use crate::data::FieldData;
use crate::design::{ModelDesign, RandomDesign};
use crate::formula::Formula;
use crate::model::{FitError, FitOptions, FittedModel, ModelFrame, model_frame, sample_variance};
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{DeterminantC, FactorizeC, Inverse, InverseC, SolveC, UPLO};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Bounds on `θ_k = ln(σ²_k / σ²)` during optimisation.
const LOG_RATIO_MIN: f64 = -20.0;
const LOG_RATIO_MAX: f64 = 12.0;
/// Variance ratios below this are reported as zero.
const SINGULAR_RATIO: f64 = 1e-8;
/// Step of the central-difference gradient in `θ`.
const GRADIENT_STEP: f64 = 1e-5;
/// Relative step of the central differences in `φ`.
const VARIANCE_STEP: f64 = 1e-4;
/// Deviance increase accepted when moving a ratio onto the boundary.
const BOUNDARY_TOLERANCE: f64 = 1e-6;
/// Returned by the objective when an evaluation fails.
const FAILED_COST: f64 = 1e10;

/// An estimated variance component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VarianceComponent {
    pub group: String,
    pub variance: f64,
    pub std_dev: f64,
    /// Number of levels of the grouping factor; zero for the residual.
    pub n_levels: usize,
}

/// The conditional mode (BLUP) of one random intercept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RandomEffect {
    pub group: String,
    pub level: String,
    pub estimate: f64,
}

/// Nakagawa and Schielzeth's coefficients of determination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NakagawaR2 {
    /// Variance explained by the fixed effects.
    pub marginal: f64,
    /// Variance explained by fixed and random effects together.
    pub conditional: f64,
}

/// What the Satterthwaite approximation needs after the fit.
#[derive(Debug, Clone)]
struct SatterthwaiteState {
    /// Asymptotic covariance `2 H⁻¹` of the free variance parameters.
    covariance: Array2<f64>,
    /// `∂C/∂φ_i` for every free variance parameter.
    gradients: Vec<Array2<f64>>,
}

/// A fitted linear mixed model.
#[derive(Debug, Clone)]
pub struct MixedFit {
    pub formula: Formula,
    pub design: ModelDesign,
    pub random: RandomDesign,
    pub y: Array1<f64>,
    pub coefficients: Array1<f64>,
    pub vcov: Array2<f64>,
    /// One row per grouping factor followed by the residual row.
    pub variance_components: Vec<VarianceComponent>,
    pub residual_variance: f64,
    pub random_effects: Vec<RandomEffect>,
    /// Conditional fitted values `Xβ + Zb`.
    pub fitted: Array1<f64>,
    /// Population-level fitted values `Xβ`.
    pub marginal_fitted: Array1<f64>,
    /// Conditional residuals `y - Xβ - Zb`.
    pub residuals: Array1<f64>,
    pub reml: bool,
    /// REML criterion or ML deviance at the optimum.
    pub deviance: f64,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    pub r_squared: NakagawaR2,
    pub singular: bool,
    pub converged: bool,
    pub iterations: usize,
    pub n_obs: usize,
    /// Row of the input data behind each observation.
    pub data_rows: Vec<usize>,
    pub dropped_rows: usize,
    pub confidence_level: f64,
    max_df: f64,
    satterthwaite: Option<SatterthwaiteState>,
}

/// Cross products of the data, computed once per fit.
#[derive(Debug, Clone)]
struct CrossProducts {
    xtx: Array2<f64>,
    xty: Array1<f64>,
    yty: f64,
    ztz: Array2<f64>,
    ztx: Array2<f64>,
    zty: Array1<f64>,
    block_sizes: Vec<usize>,
    n: usize,
    p: usize,
}

/// The mixed-model equations solved at one set of variance ratios.
struct Evaluation {
    log_det_h: f64,
    log_det_a: f64,
    /// Inverse of `X'H⁻¹X`.
    a_inverse: Array2<f64>,
    beta: Array1<f64>,
    /// `r'H⁻¹r` at the GLS estimate.
    weighted_rss: f64,
    /// `M⁻¹`
    m_inverse: Array2<f64>,
}

impl CrossProducts {
    fn new(x: &Array2<f64>, z: &Array2<f64>, y: &Array1<f64>, block_sizes: Vec<usize>) -> Self {
        Self {
            xtx: x.t().dot(x),
            xty: x.t().dot(y),
            yty: y.dot(y),
            ztz: z.t().dot(z),
            ztx: z.t().dot(x),
            zty: z.t().dot(y),
            block_sizes,
            n: x.nrows(),
            p: x.ncols(),
        }
    }

    fn evaluate(&self, ratios: &Array1<f64>) -> Result<Evaluation, FitError> {
        let mut m = self.ztz.clone();
        let mut log_det_gamma = 0.0;
        let mut offset = 0;
        for (&size, &ratio) in self.block_sizes.iter().zip(ratios.iter()) {
            for j in offset..offset + size {
                m[[j, j]] += 1.0 / ratio;
            }
            log_det_gamma += size as f64 * ratio.ln();
            offset += size;
        }
        let m_factor = m.factorizec(UPLO::Lower)?;
        let log_det_h = log_det_gamma + m_factor.ln_detc();
        let m_inverse = m_factor.invc()?;

        let m_ztx = m_inverse.dot(&self.ztx);
        let m_zty = m_inverse.dot(&self.zty);
        let a = &self.xtx - &self.ztx.t().dot(&m_ztx);
        let b = &self.xty - &self.ztx.t().dot(&m_zty);
        let yhy = self.yty - self.zty.dot(&m_zty);

        let a_factor = a.factorizec(UPLO::Lower)?;
        let beta = a_factor.solvec(&b)?;
        let weighted_rss = (yhy - beta.dot(&b)).max(f64::MIN_POSITIVE);
        Ok(Evaluation {
            log_det_h,
            log_det_a: a_factor.ln_detc(),
            a_inverse: a_factor.invc()?,
            beta,
            weighted_rss,
            m_inverse,
        })
    }

    fn residual_df(&self, reml: bool) -> f64 {
        if reml {
            (self.n - self.p) as f64
        } else {
            self.n as f64
        }
    }

    /// Deviance with `β` and `σ²` profiled out.
    fn profiled_deviance(&self, ratios: &Array1<f64>, reml: bool) -> Result<f64, FitError> {
        let e = self.evaluate(ratios)?;
        let df = self.residual_df(reml);
        let sigma2 = e.weighted_rss / df;
        let mut deviance = df * (2.0 * PI * sigma2).ln() + e.log_det_h + df;
        if reml {
            deviance += e.log_det_a;
        }
        Ok(deviance)
    }

    /// Deviance at explicit `σ²`, not profiled.
    fn deviance_at(&self, e: &Evaluation, sigma2: f64, reml: bool) -> f64 {
        let n = self.n as f64;
        let log_det_v = n * sigma2.ln() + e.log_det_h;
        let quadratic = e.weighted_rss / sigma2;
        if reml {
            let p = self.p as f64;
            log_det_v + e.log_det_a - p * sigma2.ln() + quadratic + (n - p) * (2.0 * PI).ln()
        } else {
            log_det_v + quadratic + n * (2.0 * PI).ln()
        }
    }
}

fn ratios_from(theta: &Array1<f64>) -> Array1<f64> {
    theta.mapv(|t| t.clamp(LOG_RATIO_MIN, LOG_RATIO_MAX).exp())
}

/// Fits a random-intercept mixed model by REML (default) or ML.
pub fn fit_mixed(
    formula: &Formula,
    data: &FieldData,
    options: &FitOptions,
) -> Result<MixedFit, FitError> {
    if !formula.has_random() {
        return Err(FitError::NoRandomTerms);
    }
    let ModelFrame {
        data: mut frame,
        rows: data_rows,
        dropped: dropped_rows,
    } = model_frame(formula, data)?;
    for term in &formula.random {
        for grouping in &term.grouping {
            frame.to_factor(grouping)?;
        }
    }

    let design = ModelDesign::build(formula, &frame, options.contrasts)?;
    let random = RandomDesign::build(&formula.random, &frame)?;
    for block in &random.blocks {
        if block.n_levels() < 2 {
            return Err(FitError::SingleGroup(block.label.clone()));
        }
    }
    let y = frame.numeric(&formula.response)?.clone();
    let (n, p) = design.x.dim();
    if n <= p {
        return Err(FitError::InsufficientObservations { n, p });
    }

    let z = random.z_matrix(n);
    let block_sizes: Vec<usize> = random.blocks.iter().map(|b| b.n_levels()).collect();
    let products = Arc::new(CrossProducts::new(&design.x, &z, &y, block_sizes));
    let reml = options.reml;

    log::info!(
        "Fitting mixed model by {}: {} observations, {} fixed effects, {} random effects",
        if reml { "REML" } else { "ML" },
        n,
        p,
        random.n_effects()
    );

    let (theta, iterations, converged) = optimise(products.clone(), reml, options);
    let theta = snap_to_boundary(&products, theta, reml)?;
    let mut ratios = ratios_from(&theta);
    let evaluation = products.evaluate(&ratios)?;
    let deviance = products.profiled_deviance(&ratios, reml)?;
    let sigma2 = evaluation.weighted_rss / products.residual_df(reml);

    let mut singular = false;
    let mut free = Vec::new();
    for (k, ratio) in ratios.iter_mut().enumerate() {
        if *ratio < SINGULAR_RATIO {
            singular = true;
            *ratio = 0.0;
        } else {
            free.push(k);
        }
    }
    if singular {
        log::warn!("Boundary (singular) fit: at least one variance component is estimated as zero.");
    }

    let beta = evaluation.beta.clone();
    let vcov = &evaluation.a_inverse * sigma2;
    let marginal_fitted = design.x.dot(&beta);
    let residual_marginal = &y - &marginal_fitted;
    let blups = evaluation.m_inverse.dot(&z.t().dot(&residual_marginal));
    let conditional = z.dot(&blups);
    let fitted = &marginal_fitted + &conditional;
    let residuals = &y - &fitted;

    let mut variance_components = Vec::with_capacity(random.blocks.len() + 1);
    let mut random_effects = Vec::with_capacity(random.n_effects());
    let mut offset = 0;
    for (block, &ratio) in random.blocks.iter().zip(ratios.iter()) {
        let variance = ratio * sigma2;
        variance_components.push(VarianceComponent {
            group: block.label.clone(),
            variance,
            std_dev: variance.sqrt(),
            n_levels: block.n_levels(),
        });
        for (j, level) in block.levels.iter().enumerate() {
            random_effects.push(RandomEffect {
                group: block.label.clone(),
                level: level.clone(),
                estimate: if ratio == 0.0 { 0.0 } else { blups[offset + j] },
            });
        }
        offset += block.n_levels();
    }
    variance_components.push(VarianceComponent {
        group: "Residual".to_string(),
        variance: sigma2,
        std_dev: sigma2.sqrt(),
        n_levels: 0,
    });

    let fixed_variance = sample_variance(&marginal_fitted);
    let random_variance: f64 = variance_components[..random.blocks.len()]
        .iter()
        .map(|c| c.variance)
        .sum();
    let total = fixed_variance + random_variance + sigma2;
    let r_squared = NakagawaR2 {
        marginal: fixed_variance / total,
        conditional: (fixed_variance + random_variance) / total,
    };

    let log_likelihood = -0.5 * deviance;
    let k = (p + random.blocks.len() + 1) as f64;
    let aic = deviance + 2.0 * k;
    let bic = deviance + (n as f64).ln() * k;
    let max_df = (n - p) as f64;

    let satterthwaite = match satterthwaite_state(&products, &ratios, &free, sigma2, reml) {
        Ok(state) => Some(state),
        Err(e) => {
            log::warn!(
                "Satterthwaite degrees of freedom unavailable ({e}); using the residual degrees of freedom."
            );
            None
        }
    };

    log::info!(
        "Mixed model converged: {} = {:.4}, residual variance = {:.6}",
        if reml { "REML criterion" } else { "deviance" },
        deviance,
        sigma2
    );

    Ok(MixedFit {
        formula: formula.clone(),
        design,
        random,
        y,
        coefficients: beta,
        vcov,
        variance_components,
        residual_variance: sigma2,
        random_effects,
        fitted,
        marginal_fitted,
        residuals,
        reml,
        deviance,
        log_likelihood,
        aic,
        bic,
        r_squared,
        singular,
        converged,
        iterations,
        n_obs: n,
        data_rows,
        dropped_rows,
        confidence_level: options.confidence_level,
        max_df,
        satterthwaite,
    })
}

/// Minimises the profiled deviance over `θ`. Returns the optimum, the
/// number of iterations and whether the optimiser reported convergence.
fn optimise(
    products: Arc<CrossProducts>,
    reml: bool,
    options: &FitOptions,
) -> (Array1<f64>, usize, bool) {
    let n_params = products.block_sizes.len();
    let initial_theta = Array1::zeros(n_params);

    let products_for_closure = products.clone();
    let cost = move |theta: &Array1<f64>| -> f64 {
        match products_for_closure.profiled_deviance(&ratios_from(theta), reml) {
            Ok(value) if value.is_finite() => value,
            Ok(value) => {
                log::debug!("Non-finite deviance {value} at θ = {theta}");
                FAILED_COST
            }
            Err(e) => {
                log::debug!("Deviance evaluation failed at θ = {theta}: {e}");
                FAILED_COST
            }
        }
    };

    let cost_for_bfgs = cost.clone();
    let cost_and_grad = move |theta: &Array1<f64>| -> (f64, Array1<f64>) {
        let value = cost_for_bfgs(theta);
        let gradient = central_gradient(&cost_for_bfgs, theta, GRADIENT_STEP);
        (value, gradient)
    };

    match Bfgs::new(initial_theta.clone(), cost_and_grad)
        .with_tolerance(options.tolerance)
        .with_max_iterations(options.max_iterations)
        .run()
    {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => {
            log::debug!("BFGS finished after {iterations} iterations, deviance {final_value:.6}");
            (
                final_point.mapv(|t| t.clamp(LOG_RATIO_MIN, LOG_RATIO_MAX)),
                iterations,
                true,
            )
        }
        Err(e) => {
            log::warn!("BFGS failed ({e:?}); falling back to coordinate search.");
            coordinate_search(&cost, initial_theta, options.max_iterations, options.tolerance)
        }
    }
}

/// Moves each log ratio to its lower bound when that does not worsen the
/// deviance. The profiled deviance flattens out as `γ_k → 0`, so a
/// gradient-based optimiser stops short of the boundary.
fn snap_to_boundary(
    products: &CrossProducts,
    mut theta: Array1<f64>,
    reml: bool,
) -> Result<Array1<f64>, FitError> {
    let mut current = products.profiled_deviance(&ratios_from(&theta), reml)?;
    for k in 0..theta.len() {
        if theta[k] <= LOG_RATIO_MIN {
            continue;
        }
        let mut boundary = theta.clone();
        boundary[k] = LOG_RATIO_MIN;
        let value = products.profiled_deviance(&ratios_from(&boundary), reml)?;
        if value <= current + BOUNDARY_TOLERANCE {
            log::debug!("Variance ratio {k} moved to the boundary ({current:.8} -> {value:.8})");
            theta = boundary;
            current = value;
        }
    }
    Ok(theta)
}

fn central_gradient<F: Fn(&Array1<f64>) -> f64>(f: &F, x: &Array1<f64>, step: f64) -> Array1<f64> {
    let mut gradient = Array1::zeros(x.len());
    let mut probe = x.clone();
    for i in 0..x.len() {
        probe[i] = x[i] + step;
        let forward = f(&probe);
        probe[i] = x[i] - step;
        let backward = f(&probe);
        probe[i] = x[i];
        gradient[i] = (forward - backward) / (2.0 * step);
    }
    gradient
}

/// Cyclic golden-section search over each coordinate of `θ` in turn.
fn coordinate_search<F: Fn(&Array1<f64>) -> f64>(
    f: &F,
    start: Array1<f64>,
    max_sweeps: usize,
    tolerance: f64,
) -> (Array1<f64>, usize, bool) {
    let mut x = start;
    let mut best = f(&x);
    for sweep in 1..=max_sweeps.max(1) {
        let before = best;
        for k in 0..x.len() {
            let mut trial = x.clone();
            let t = golden_section(
                |t| {
                    trial[k] = t;
                    f(&trial)
                },
                LOG_RATIO_MIN,
                LOG_RATIO_MAX,
                1e-8,
            );
            let mut candidate = x.clone();
            candidate[k] = t;
            let value = f(&candidate);
            if value < best {
                best = value;
                x = candidate;
            }
        }
        log::debug!("Coordinate sweep {sweep}: deviance {best:.8}");
        if before - best <= tolerance * (1.0 + best.abs()) {
            return (x, sweep, true);
        }
    }
    (x, max_sweeps, false)
}

/// Minimises a unimodal function on `[a, b]`.
fn golden_section<F: FnMut(f64) -> f64>(mut f: F, mut a: f64, mut b: f64, tolerance: f64) -> f64 {
    let inverse_phi = (5f64.sqrt() - 1.0) / 2.0;
    let mut c = b - inverse_phi * (b - a);
    let mut d = a + inverse_phi * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);
    while (b - a).abs() > tolerance {
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - inverse_phi * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + inverse_phi * (b - a);
            fd = f(d);
        }
    }
    (a + b) / 2.0
}

/// Variance parameters `φ`: the free components followed by `σ²`.
struct VarianceParameters<'a> {
    products: &'a CrossProducts,
    /// Ratios at the optimum; components on the boundary stay fixed.
    ratios: &'a Array1<f64>,
    free: &'a [usize],
    /// Whether the fit maximised the restricted likelihood.
    reml: bool,
}

impl VarianceParameters<'_> {
    fn evaluate(&self, phi: &Array1<f64>) -> Result<(Evaluation, f64), FitError> {
        let sigma2 = phi[phi.len() - 1];
        let mut ratios = self.ratios.mapv(|r| r.max(LOG_RATIO_MIN.exp()));
        for (i, &k) in self.free.iter().enumerate() {
            ratios[k] = phi[i] / sigma2;
        }
        Ok((self.products.evaluate(&ratios)?, sigma2))
    }

    fn deviance(&self, phi: &Array1<f64>) -> Result<f64, FitError> {
        let (e, sigma2) = self.evaluate(phi)?;
        Ok(self.products.deviance_at(&e, sigma2, self.reml))
    }

    fn fixed_covariance(&self, phi: &Array1<f64>) -> Result<Array2<f64>, FitError> {
        let (e, sigma2) = self.evaluate(phi)?;
        Ok(e.a_inverse * sigma2)
    }
}

fn satterthwaite_state(
    products: &CrossProducts,
    ratios: &Array1<f64>,
    free: &[usize],
    sigma2: f64,
    reml: bool,
) -> Result<SatterthwaiteState, FitError> {
    let parameters = VarianceParameters {
        products,
        ratios,
        free,
        reml,
    };
    let mut values: Vec<f64> = free.iter().map(|&k| ratios[k] * sigma2).collect();
    values.push(sigma2);
    let phi = Array1::from(values);
    let m = phi.len();
    let steps: Vec<f64> = phi.iter().map(|v| VARIANCE_STEP * v.abs().max(1e-10)).collect();

    let shifted = |moves: &[(usize, f64)]| -> Result<f64, FitError> {
        let mut probe = phi.clone();
        for &(i, delta) in moves {
            probe[i] += delta;
        }
        parameters.deviance(&probe)
    };

    let centre = parameters.deviance(&phi)?;
    let mut hessian = Array2::zeros((m, m));
    for i in 0..m {
        let hi = steps[i];
        let forward = shifted(&[(i, hi)])?;
        let backward = shifted(&[(i, -hi)])?;
        hessian[[i, i]] = (forward - 2.0 * centre + backward) / (hi * hi);
        for j in 0..i {
            let hj = steps[j];
            let value = (shifted(&[(i, hi), (j, hj)])? - shifted(&[(i, hi), (j, -hj)])?
                - shifted(&[(i, -hi), (j, hj)])?
                + shifted(&[(i, -hi), (j, -hj)])?)
                / (4.0 * hi * hj);
            hessian[[i, j]] = value;
            hessian[[j, i]] = value;
        }
    }
    let covariance = hessian.inv()? * 2.0;

    let mut gradients = Vec::with_capacity(m);
    for i in 0..m {
        let mut up = phi.clone();
        up[i] += steps[i];
        let mut down = phi.clone();
        down[i] -= steps[i];
        let derivative = (parameters.fixed_covariance(&up)? - parameters.fixed_covariance(&down)?)
            / (2.0 * steps[i]);
        gradients.push(derivative);
    }
    Ok(SatterthwaiteState {
        covariance,
        gradients,
    })
}

impl MixedFit {
    /// The variance component of a grouping term, by label.
    pub fn component(&self, group: &str) -> Option<&VarianceComponent> {
        self.variance_components.iter().find(|c| c.group == group)
    }

    /// The intraclass correlation of each grouping factor.
    pub fn intraclass_correlations(&self) -> Vec<(String, f64)> {
        let total: f64 = self.variance_components.iter().map(|c| c.variance).sum();
        self.variance_components
            .iter()
            .filter(|c| c.n_levels > 0)
            .map(|c| (c.group.clone(), c.variance / total))
            .collect()
    }
}

impl FittedModel for MixedFit {
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

    /// `ν = 2 (l'Cl)² / (g'Ag)`, clamped to `[1, n - p]`.
    fn contrast_df(&self, l: ArrayView1<f64>) -> f64 {
        let Some(state) = &self.satterthwaite else {
            return self.max_df;
        };
        let variance = l.dot(&self.vcov.dot(&l));
        let g: Array1<f64> = state.gradients.iter().map(|d| l.dot(&d.dot(&l))).collect();
        let denominator = g.dot(&state.covariance.dot(&g));
        if !(denominator > 0.0) || !(variance > 0.0) {
            return self.max_df;
        }
        let df = 2.0 * variance * variance / denominator;
        if df.is_finite() {
            df.clamp(1.0, self.max_df)
        } else {
            self.max_df
        }
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
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{LoadOptions, load_csv_str};
    use crate::linear::fit_linear;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    /// Three treatments in four complete blocks.
    const RCBD: &str = "yield,trt,block\n\
                        12.1,A,1\n13.4,A,2\n11.8,A,3\n14.0,A,4\n\
                        13.9,B,1\n15.2,B,2\n13.1,B,3\n15.8,B,4\n\
                        11.0,C,1\n12.9,C,2\n10.7,C,3\n13.1,C,4\n";

    /// The same layout with almost no block-to-block variation.
    const FLAT_BLOCKS: &str = "yield,trt,block\n\
                               12.1,A,1\n11.4,A,2\n11.8,A,3\n12.0,A,4\n\
                               13.9,B,1\n13.2,B,2\n14.1,B,3\n13.4,B,4\n\
                               11.0,C,1\n11.9,C,2\n10.7,C,3\n11.1,C,4\n";

    fn fit(text: &str, formula: &str, reml: bool) -> MixedFit {
        let data = load_csv_str(text, &LoadOptions::default()).unwrap();
        let formula = Formula::parse(formula).unwrap();
        let options = FitOptions {
            reml,
            ..FitOptions::default()
        };
        fit_mixed(&formula, &data, &options).unwrap()
    }

    #[test]
    fn balanced_blocks_recover_the_anova_estimators() {
        let fit = fit(RCBD, "yield ~ trt + (1 | block)", true);
        // σ²_e = MSE and σ²_b = (MS_block - MSE) / t for a balanced design.
        assert_relative_eq!(fit.residual_variance, 0.036388889, max_relative = 1e-3);
        let block = fit.component("block").unwrap();
        assert_relative_eq!(block.variance, 1.349722222, max_relative = 1e-3);
        assert_eq!(block.n_levels, 4);
        assert!(!fit.singular);

        // Treatment means are the raw means in a complete block design.
        assert_abs_diff_eq!(fit.coefficients[0], 12.825, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.coefficients[1], 14.5 - 12.825, epsilon = 1e-6);
    }

    #[test]
    fn within_block_contrasts_get_the_error_degrees_of_freedom() {
        let fit = fit(RCBD, "yield ~ trt + (1 | block)", true);
        let table = fit.coefficient_table();
        // SE of a treatment difference is sqrt(2 MSE / b).
        assert_relative_eq!(table[1].std_error, (2.0 * 0.036388889 / 4.0_f64).sqrt(), max_relative = 1e-3);
        assert_abs_diff_eq!(table[1].df, 6.0, epsilon = 0.05);
        assert_abs_diff_eq!(table[2].df, 6.0, epsilon = 0.05);
        // The intercept mixes the block and error strata:
        // (τ + 2σ²)² / (τ²/3 + (2σ²)²/6) with τ = MS_block.
        assert_abs_diff_eq!(table[0].df, 3.107, epsilon = 0.05);
    }

    #[test]
    fn blups_shrink_block_means() {
        let fit = fit(RCBD, "yield ~ trt + (1 | block)", true);
        let effects: Vec<f64> = fit.random_effects.iter().map(|e| e.estimate).collect();
        assert_eq!(effects.len(), 4);
        assert_abs_diff_eq!(effects.iter().sum::<f64>(), 0.0, epsilon = 1e-6);
        // Block 4 has the largest mean, block 3 the smallest.
        assert!(effects[3] > 0.0 && effects[2] < 0.0);
        let grand = 157.0 / 12.0;
        let raw_block_four = (14.0 + 15.8 + 13.1) / 3.0 - grand;
        assert!(effects[3] < raw_block_four);
        assert!(effects[3] > 0.9 * raw_block_four);
        assert_abs_diff_eq!(fit.fitted.sum(), fit.y.sum(), epsilon = 1e-6);
    }

    #[test]
    fn negative_block_mean_square_gives_a_singular_fit() {
        let fit = fit(FLAT_BLOCKS, "yield ~ trt + (1 | block)", true);
        assert!(fit.singular);
        assert_eq!(fit.component("block").unwrap().variance, 0.0);
        // At the boundary the fit reduces to the fixed-effects model.
        let data = load_csv_str(FLAT_BLOCKS, &LoadOptions::default()).unwrap();
        let lm = fit_linear(&Formula::parse("yield ~ trt").unwrap(), &data, &FitOptions::default())
            .unwrap();
        assert_relative_eq!(fit.residual_variance, lm.sigma * lm.sigma, max_relative = 1e-4);
        assert!(fit.random_effects.iter().all(|e| e.estimate == 0.0));
    }

    #[test]
    fn ml_variance_is_smaller_than_reml() {
        let reml = fit(RCBD, "yield ~ trt + (1 | block)", true);
        let ml = fit(RCBD, "yield ~ trt + (1 | block)", false);
        assert!(ml.residual_variance < reml.residual_variance);
        assert!(!ml.reml);
        assert_relative_eq!(ml.aic, ml.deviance + 2.0 * 5.0, max_relative = 1e-12);
    }

    #[test]
    fn r_squared_is_ordered() {
        let fit = fit(RCBD, "yield ~ trt + (1 | block)", true);
        assert!(fit.r_squared.marginal > 0.0);
        assert!(fit.r_squared.conditional > fit.r_squared.marginal);
        assert!(fit.r_squared.conditional < 1.0);
    }

    #[test]
    fn a_single_group_is_rejected() {
        let text = "y,g\n1,a\n2,a\n3,a\n";
        let data = load_csv_str(text, &LoadOptions::default()).unwrap();
        let formula = Formula::parse("y ~ 1 + (1 | g)").unwrap();
        assert!(matches!(
            fit_mixed(&formula, &data, &FitOptions::default()),
            Err(FitError::SingleGroup(_))
        ));
    }

    #[test]
    fn golden_section_finds_a_parabola_minimum() {
        let x = golden_section(|t| (t - 1.5).powi(2), -20.0, 12.0, 1e-9);
        assert_abs_diff_eq!(x, 1.5, epsilon = 1e-6);
    }
}
