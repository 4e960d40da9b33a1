//! Per-observation residual diagnostics.

use crate::inference::normal_quantile;
use crate::model::{FittedModel, ModelFit};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Absolute standardized residual above which an observation is flagged.
pub const DEFAULT_OUTLIER_THRESHOLD: f64 = 3.0;

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("Failed to write diagnostics to '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticRow {
    /// Row of the input data, counted from 0. Rows dropped for missing
    /// values keep their numbers out of the sequence.
    pub index: usize,
    pub observed: f64,
    pub fitted: f64,
    pub residual: f64,
    pub standardized: f64,
    pub sqrt_abs_standardized: f64,
    pub theoretical_quantile: f64,
    pub leverage: f64,
    pub cooks_distance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnostics {
    pub mixed: bool,
    /// Number of fixed-effect coefficients.
    pub n_coefficients: usize,
    pub rows: Vec<DiagnosticRow>,
}

/// Normal scores for a sample of size `n`, as R's `ppoints`.
pub fn ppoints(n: usize) -> Vec<f64> {
    let a = if n <= 10 { 3.0 / 8.0 } else { 0.5 };
    let denominator = n as f64 + 1.0 - 2.0 * a;
    (1..=n)
        .map(|i| normal_quantile((i as f64 - a) / denominator))
        .collect()
}

/// Residual diagnostics of a fit.
///
/// Linear models use internally studentized residuals `r / (σ √(1 - h))`
/// with leverage and Cook's distance. Mixed models use Pearson residuals
/// `r / σ` of the conditional residuals; leverage and Cook's distance are
/// not defined for them and are reported as NaN.
pub fn residual_diagnostics(fit: &ModelFit) -> Diagnostics {
    let residuals = fit.residuals();
    let fitted = fit.fitted();
    let observed = fit.response();
    let data_rows = fit.data_rows();
    let n = residuals.len();
    let p = fit.coefficients().len();

    let (standardized, leverage, cooks): (Vec<f64>, Vec<f64>, Vec<f64>) = match fit {
        ModelFit::Linear(lm) => {
            let mut standardized = Vec::with_capacity(n);
            let mut cooks = Vec::with_capacity(n);
            for (r, &h) in residuals.iter().zip(lm.leverage.iter()) {
                let (s, d) = if h < 1.0 - 1e-10 {
                    let s = r / (lm.sigma * (1.0 - h).sqrt());
                    (s, s * s * h / (p as f64 * (1.0 - h)))
                } else {
                    (f64::NAN, f64::NAN)
                };
                standardized.push(s);
                cooks.push(d);
            }
            (standardized, lm.leverage.to_vec(), cooks)
        }
        ModelFit::Mixed(lmm) => {
            let sigma = lmm.residual_variance.sqrt();
            (
                residuals.iter().map(|r| r / sigma).collect(),
                vec![f64::NAN; n],
                vec![f64::NAN; n],
            )
        }
    };

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| standardized[a].total_cmp(&standardized[b]));
    let scores = ppoints(n);
    let mut quantiles = vec![0.0; n];
    for (rank, &index) in order.iter().enumerate() {
        quantiles[index] = scores[rank];
    }

    let rows = (0..n)
        .map(|i| DiagnosticRow {
            index: data_rows[i],
            observed: observed[i],
            fitted: fitted[i],
            residual: residuals[i],
            standardized: standardized[i],
            sqrt_abs_standardized: standardized[i].abs().sqrt(),
            theoretical_quantile: quantiles[i],
            leverage: leverage[i],
            cooks_distance: cooks[i],
        })
        .collect();
    Diagnostics {
        mixed: fit.is_mixed(),
        n_coefficients: p,
        rows,
    }
}

impl Diagnostics {
    /// Observations whose absolute standardized residual exceeds `threshold`.
    pub fn flagged(&self, threshold: f64) -> Vec<usize> {
        self.rows
            .iter()
            .filter(|r| r.standardized.abs() > threshold)
            .map(|r| r.index)
            .collect()
    }

    /// Writes one CSV row per observation.
    pub fn write_csv(&self, path: &Path) -> Result<(), DiagnosticsError> {
        let wrap = |source: csv::Error| DiagnosticsError::Csv {
            path: path.display().to_string(),
            source,
        };
        let mut writer = csv::Writer::from_path(path).map_err(wrap)?;
        for row in &self.rows {
            writer.serialize(row).map_err(wrap)?;
        }
        writer
            .flush()
            .map_err(|e| wrap(csv::Error::from(e)))?;
        log::info!("Wrote {} diagnostic rows to {}", self.rows.len(), path.display());
        Ok(())
    }
}
