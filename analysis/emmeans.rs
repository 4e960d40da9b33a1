//! Estimated marginal means over an equally weighted reference grid.
//!
//! The grid crosses every level of every factor in the model, with numeric
//! covariates held at their means. The mean of a cell of the requested
//! factors is the unweighted average of the model predictions over the
//! remaining factors, so it is a linear function `l'β` of the coefficients
//! and inherits its standard error and degrees of freedom from the fit.
//!
//! A cell whose prediction needs an aliased column, such as an empty cell
//! of an interaction, has no estimable mean. Its row is kept with
//! `estimable = false` and NaN statistics and is left out of comparisons.

use crate::design::{CellValue, DesignError, VariableInfo};
use crate::inference::confidence_interval_t;
use crate::model::FittedModel;
use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmmeansError {
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error("The means specification '{0}' names no factor.")]
    EmptySpec(String),
    #[error("'{0}' is not a predictor in the fixed part of the model.")]
    NotInModel(String),
    #[error("'{0}' is numeric; marginal means are only defined for factors.")]
    NotAFactor(String),
    #[error("'{0}' appears more than once in the means specification.")]
    Repeated(String),
}

/// Which factors to average to, optionally within the levels of others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmmSpec {
    pub factors: Vec<String>,
    pub by: Vec<String>,
}

impl EmmSpec {
    /// Parses `"genotype"`, `"a:b"` or `"genotype | location"`.
    pub fn parse(text: &str) -> Result<Self, EmmeansError> {
        let split = |part: &str| -> Vec<String> {
            part.split([':', '*'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };
        let (factors, by) = match text.split_once('|') {
            Some((left, right)) => (split(left), split(right)),
            None => (split(text), Vec::new()),
        };
        if factors.is_empty() {
            return Err(EmmeansError::EmptySpec(text.to_string()));
        }
        let mut seen: Vec<&String> = Vec::new();
        for name in factors.iter().chain(&by) {
            if seen.contains(&name) {
                return Err(EmmeansError::Repeated(name.clone()));
            }
            seen.push(name);
        }
        Ok(Self { factors, by })
    }

    pub fn single(factor: &str) -> Self {
        Self {
            factors: vec![factor.to_string()],
            by: Vec::new(),
        }
    }
}

impl fmt::Display for EmmSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.factors.join(":"))?;
        if !self.by.is_empty() {
            write!(f, " | {}", self.by.join(":"))?;
        }
        Ok(())
    }
}

/// One estimated marginal mean.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmmRow {
    /// Level of each requested factor.
    pub levels: Vec<String>,
    /// Level of each `by` factor.
    pub by: Vec<String>,
    pub emmean: f64,
    pub std_error: f64,
    pub df: f64,
    pub lower: f64,
    pub upper: f64,
    pub estimable: bool,
    /// The linear function of the coefficients giving this mean.
    #[serde(skip)]
    pub weights: Vec<f64>,
}

impl EmmRow {
    pub fn label(&self) -> String {
        self.levels.join(":")
    }

    pub fn by_label(&self) -> String {
        self.by.join(":")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmmTable {
    pub spec: EmmSpec,
    pub confidence_level: f64,
    pub rows: Vec<EmmRow>,
}

impl EmmTable {
    /// Row indices grouped by `by` label, in table order.
    pub fn groups(&self) -> Vec<(String, Vec<usize>)> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            let label = row.by_label();
            match groups.iter_mut().find(|(l, _)| *l == label) {
                Some((_, members)) => members.push(i),
                None => groups.push((label, vec![i])),
            }
        }
        groups
    }

    /// Like [`EmmTable::groups`], keeping only estimable rows.
    pub fn estimable_groups(&self) -> Vec<(String, Vec<usize>)> {
        self.groups()
            .into_iter()
            .map(|(label, members)| {
                let kept = members.into_iter().filter(|&i| self.rows[i].estimable).collect();
                (label, kept)
            })
            .collect()
    }

    pub fn find(&self, label: &str) -> Option<&EmmRow> {
        self.rows.iter().find(|r| r.label() == label)
    }
}

/// Every combination of level indices, the first position varying fastest.
fn level_combinations(sizes: &[usize]) -> Vec<Vec<usize>> {
    if sizes.is_empty() {
        return vec![Vec::new()];
    }
    sizes
        .iter()
        .rev()
        .map(|&n| 0..n)
        .multi_cartesian_product()
        .map(|mut combination| {
            combination.reverse();
            combination
        })
        .collect()
}

/// Estimated marginal means for `spec`, with `level` confidence intervals.
pub fn estimated_marginal_means<M: FittedModel + ?Sized>(
    fit: &M,
    spec: &EmmSpec,
    level: f64,
) -> Result<EmmTable, EmmeansError> {
    let design = fit.design();
    for name in spec.factors.iter().chain(&spec.by) {
        match design.info(name) {
            Ok(VariableInfo::Factor { .. }) => {}
            Ok(VariableInfo::Numeric { .. }) => return Err(EmmeansError::NotAFactor(name.clone())),
            Err(_) => return Err(EmmeansError::NotInModel(name.clone())),
        }
    }

    let model_factors = design.factors();
    let levels_of = |name: &str| -> Vec<String> {
        model_factors
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, levels)| levels.to_vec())
            .unwrap_or_default()
    };
    let averaged: Vec<&str> = model_factors
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !spec.factors.iter().chain(&spec.by).any(|s| s == name))
        .collect();
    let averaged_sizes: Vec<usize> = averaged.iter().map(|name| levels_of(name).len()).collect();
    let averaged_cells = level_combinations(&averaged_sizes);

    let factor_levels: Vec<Vec<String>> = spec.factors.iter().map(|f| levels_of(f)).collect();
    let by_levels: Vec<Vec<String>> = spec.by.iter().map(|f| levels_of(f)).collect();
    let factor_cells = level_combinations(&factor_levels.iter().map(Vec::len).collect::<Vec<_>>());
    let by_cells = level_combinations(&by_levels.iter().map(Vec::len).collect::<Vec<_>>());

    let mut rows = Vec::with_capacity(by_cells.len() * factor_cells.len());
    for by_cell in &by_cells {
        for factor_cell in &factor_cells {
            let mut full = Array1::<f64>::zeros(0);
            for averaged_cell in &averaged_cells {
                let lookup = |name: &str| -> Option<CellValue> {
                    if let Some(i) = spec.factors.iter().position(|f| f == name) {
                        return Some(CellValue::Level(factor_cell[i]));
                    }
                    if let Some(i) = spec.by.iter().position(|f| f == name) {
                        return Some(CellValue::Level(by_cell[i]));
                    }
                    if let Some(i) = averaged.iter().position(|f| *f == name) {
                        return Some(CellValue::Level(averaged_cell[i]));
                    }
                    match design.info(name).ok()? {
                        VariableInfo::Numeric { mean } => Some(CellValue::Number(*mean)),
                        VariableInfo::Factor { .. } => None,
                    }
                };
                let encoded = design.encode_full(lookup)?;
                if full.is_empty() {
                    full = encoded;
                } else {
                    full += &encoded;
                }
            }
            full /= averaged_cells.len() as f64;
            let weights = design.kept_weights(&full);
            let estimable = design.is_estimable(&full);

            let (emmean, std_error, df, lower, upper) = if estimable {
                let estimate = fit.contrast_estimate(weights.view());
                let (lower, upper) =
                    confidence_interval_t(estimate.estimate, estimate.std_error, estimate.df, level);
                (estimate.estimate, estimate.std_error, estimate.df, lower, upper)
            } else {
                (f64::NAN, f64::NAN, f64::NAN, f64::NAN, f64::NAN)
            };
            rows.push(EmmRow {
                levels: factor_cell
                    .iter()
                    .zip(&factor_levels)
                    .map(|(&i, levels)| levels[i].clone())
                    .collect(),
                by: by_cell
                    .iter()
                    .zip(&by_levels)
                    .map(|(&i, levels)| levels[i].clone())
                    .collect(),
                emmean,
                std_error,
                df,
                lower,
                upper,
                estimable,
                weights: weights.to_vec(),
            });
        }
    }
    let missing = rows.iter().filter(|r| !r.estimable).count();
    if missing > 0 {
        log::warn!("{missing} marginal means of '{spec}' are not estimable; the grid has empty cells.");
    }
    log::debug!("Computed {} marginal means for '{spec}'", rows.len());
    Ok(EmmTable {
        spec: spec.clone(),
        confidence_level: level,
        rows,
    })
}

/// `l` of the row as an array view.
pub(crate) fn row_weights(row: &EmmRow) -> ArrayView1<'_, f64> {
    ArrayView1::from(row.weights.as_slice())
}
