//! # Model Matrix Construction
//!
//! Turns a parsed [`Formula`] and a complete-case [`FieldData`] into the
//! fixed-effect design matrix `X` and, for mixed models, the random-effect
//! grouping structure.
//!
//! Factors are coded following the marginality rule used by R's
//! `model.matrix`: inside a term, a factor is contrast-coded when the term
//! obtained by deleting it is also in the model (the empty term counts when
//! there is an intercept) and indicator-coded otherwise. Interaction columns
//! are products of the per-variable codings with the first variable varying
//! fastest.
//!
//! Linearly dependent columns (for example a missing genotype-by-site cell)
//! are detected by Gram-Schmidt and dropped; they are reported in
//! [`ModelDesign::aliased`], the analogue of `NA` coefficients.
//!
//! The same coding is reused by [`ModelDesign::encode`] to build rows for the
//! reference grid of estimated marginal means. A grid function `l'β` stated
//! over the full expansion is estimable only when `l` lies in the row space
//! of the full matrix; [`ModelDesign::is_estimable`] checks this against an
//! orthonormal basis of that space.

use crate::data::{DataError, FieldData, VariableValues, compare_levels};
use crate::formula::{Formula, RandomTerm};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Relative tolerance below which a column is considered a linear
/// combination of the columns before it.
const ALIAS_TOLERANCE: f64 = 1e-7;

/// Relative distance from the row space above which a linear function of
/// the coefficients is not estimable.
const ESTIMABILITY_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("The response '{0}' cannot also be used as a predictor.")]
    ResponseAsPredictor(String),
    #[error(
        "The factor '{0}' has a single level in the analysed rows, so no contrast can be estimated for it."
    )]
    SingleLevel(String),
    #[error("The predictor '{0}' contains missing or non-finite values.")]
    NonFinite(String),
    #[error("Unknown contrast coding '{0}'. Use 'treatment' or 'sum'.")]
    UnknownContrasts(String),
    #[error("No value supplied for predictor '{0}' when encoding a prediction row.")]
    MissingValue(String),
    #[error("Level index {index} is out of range for factor '{variable}'.")]
    LevelOutOfRange { variable: String, index: usize },
}

/// How factors are turned into columns when a term needs contrasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Contrasts {
    /// The first level is the reference; one column per remaining level.
    #[default]
    Treatment,
    /// Deviation coding: columns sum to zero over the levels, the last
    /// level is coded `-1` everywhere.
    Sum,
}

impl FromStr for Contrasts {
    type Err = DesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "treatment" | "contr.treatment" => Ok(Contrasts::Treatment),
            "sum" | "contr.sum" => Ok(Contrasts::Sum),
            other => Err(DesignError::UnknownContrasts(other.to_string())),
        }
    }
}

impl fmt::Display for Contrasts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contrasts::Treatment => write!(f, "treatment"),
            Contrasts::Sum => write!(f, "sum"),
        }
    }
}

/// What the design knows about a predictor variable.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableInfo {
    /// A covariate; the mean is where the reference grid holds it.
    Numeric { mean: f64 },
    Factor { levels: Vec<String> },
}

/// Coding of one variable inside one term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Numeric,
    Contrast,
    Indicator,
}

/// A fixed-effect term together with the kept columns it owns.
#[derive(Debug, Clone)]
pub struct DesignTerm {
    pub label: String,
    pub variables: Vec<String>,
    pub codings: Vec<Coding>,
    /// Indices into the kept columns of `X`.
    pub columns: Vec<usize>,
}

/// The value of one predictor in a row being encoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellValue {
    Number(f64),
    /// Index into the factor's levels.
    Level(usize),
}

/// The fixed-effect design of a model.
#[derive(Debug, Clone)]
pub struct ModelDesign {
    pub x: Array2<f64>,
    /// Names of the kept columns.
    pub column_names: Vec<String>,
    pub intercept: bool,
    pub terms: Vec<DesignTerm>,
    pub variables: Vec<(String, VariableInfo)>,
    pub contrasts: Contrasts,
    /// Columns dropped because they were linear combinations of earlier ones.
    pub aliased: Vec<String>,
    /// For each kept column, its index in the full expansion.
    kept: Vec<usize>,
    full_width: usize,
    /// Orthonormal basis of the row space of the full expansion.
    row_basis: Vec<Array1<f64>>,
}

impl ModelDesign {
    /// Builds `X` for the fixed part of `formula`. `data` must already be
    /// restricted to complete cases.
    pub fn build(
        formula: &Formula,
        data: &FieldData,
        contrasts: Contrasts,
    ) -> Result<Self, DesignError> {
        let predictors = formula.fixed_variables();
        if predictors.contains(&formula.response) {
            return Err(DesignError::ResponseAsPredictor(formula.response.clone()));
        }

        let mut variables = Vec::with_capacity(predictors.len());
        for name in &predictors {
            let info = match &data.variable(name)?.values {
                VariableValues::Numeric(values) => {
                    if values.iter().any(|v| !v.is_finite()) {
                        return Err(DesignError::NonFinite(name.clone()));
                    }
                    VariableInfo::Numeric {
                        mean: values.mean().unwrap_or(0.0),
                    }
                }
                VariableValues::Factor(factor) => VariableInfo::Factor {
                    levels: factor.levels.clone(),
                },
            };
            variables.push((name.clone(), info));
        }

        let mut design = ModelDesign {
            x: Array2::zeros((0, 0)),
            column_names: Vec::new(),
            intercept: formula.intercept,
            terms: Vec::new(),
            variables,
            contrasts,
            aliased: Vec::new(),
            kept: Vec::new(),
            full_width: 0,
            row_basis: Vec::new(),
        };
        design.assign_codings(formula)?;

        let full_names = design.full_column_names();
        design.full_width = full_names.len();

        let n = data.n_rows();
        let mut full = Array2::zeros((n, design.full_width));
        for row in 0..n {
            let encoded = design.encode_full(|name| row_value(data, name, row))?;
            full.row_mut(row).assign(&encoded);
        }

        design.kept = gram_schmidt(full.columns()).0;
        design.row_basis = gram_schmidt(full.rows()).1;
        for (j, name) in full_names.iter().enumerate() {
            if !design.kept.contains(&j) {
                log::warn!("Column '{name}' is aliased with earlier columns and was dropped.");
                design.aliased.push(name.clone());
            }
        }
        design.column_names = design.kept.iter().map(|&j| full_names[j].clone()).collect();
        design.x = full.select(ndarray::Axis(1), &design.kept);

        let spans = design.term_spans();
        for (term, span) in design.terms.iter_mut().zip(spans) {
            term.columns = design
                .kept
                .iter()
                .enumerate()
                .filter(|&(_, &full_index)| span.contains(&full_index))
                .map(|(kept_index, _)| kept_index)
                .collect();
        }
        Ok(design)
    }

    fn assign_codings(&mut self, formula: &Formula) -> Result<(), DesignError> {
        let mut indicator_main_effect = false;
        for term in &formula.fixed {
            let mut codings = Vec::with_capacity(term.variables.len());
            for variable in &term.variables {
                let coding = match self.info(variable)? {
                    VariableInfo::Numeric { .. } => Coding::Numeric,
                    VariableInfo::Factor { .. } => {
                        let rest: Vec<&String> =
                            term.variables.iter().filter(|v| *v != variable).collect();
                        let marginal_present = if rest.is_empty() {
                            formula.intercept || indicator_main_effect
                        } else {
                            formula.fixed.iter().any(|t| {
                                t.variables.len() == rest.len()
                                    && rest.iter().all(|r| t.variables.contains(r))
                            })
                        };
                        if marginal_present {
                            Coding::Contrast
                        } else {
                            Coding::Indicator
                        }
                    }
                };
                codings.push(coding);
            }
            if term.variables.len() == 1 && codings[0] == Coding::Indicator {
                indicator_main_effect = true;
            }
            for (variable, coding) in term.variables.iter().zip(&codings) {
                if *coding == Coding::Contrast && self.n_levels(variable) < 2 {
                    return Err(DesignError::SingleLevel(variable.clone()));
                }
            }
            self.terms.push(DesignTerm {
                label: term.label(),
                variables: term.variables.clone(),
                codings,
                columns: Vec::new(),
            });
        }
        Ok(())
    }

    /// Looks up a predictor's metadata.
    pub fn info(&self, name: &str) -> Result<&VariableInfo, DesignError> {
        self.variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, info)| info)
            .ok_or_else(|| DesignError::Data(DataError::ColumnNotFound(name.to_string())))
    }

    fn n_levels(&self, name: &str) -> usize {
        match self.info(name) {
            Ok(VariableInfo::Factor { levels }) => levels.len(),
            _ => 0,
        }
    }

    /// Factor predictors and their levels, in formula order.
    pub fn factors(&self) -> Vec<(&str, &[String])> {
        self.variables
            .iter()
            .filter_map(|(name, info)| match info {
                VariableInfo::Factor { levels } => Some((name.as_str(), levels.as_slice())),
                VariableInfo::Numeric { .. } => None,
            })
            .collect()
    }

    pub fn n_columns(&self) -> usize {
        self.column_names.len()
    }

    /// Index of the intercept column, if the model has one.
    pub fn intercept_column(&self) -> Option<usize> {
        if self.intercept && self.kept.first() == Some(&0) {
            Some(0)
        } else {
            None
        }
    }

    /// Kept columns belonging to term `index`.
    pub fn term_columns(&self, index: usize) -> &[usize] {
        &self.terms[index].columns
    }

    /// Position of a term by its label (`a:b` matches `b:a`).
    pub fn term_index(&self, label: &str) -> Option<usize> {
        let wanted: Vec<&str> = label.split(':').map(str::trim).collect();
        self.terms.iter().position(|t| {
            t.variables.len() == wanted.len() && wanted.iter().all(|w| t.variables.iter().any(|v| v == w))
        })
    }

    /// Encodes one row of predictor values into the kept columns.
    pub fn encode<F>(&self, lookup: F) -> Result<Array1<f64>, DesignError>
    where
        F: Fn(&str) -> Option<CellValue>,
    {
        let full = self.encode_full(lookup)?;
        Ok(self.kept_weights(&full))
    }

    /// Restricts a full-expansion vector to the kept columns.
    pub fn kept_weights(&self, full: &Array1<f64>) -> Array1<f64> {
        self.kept.iter().map(|&j| full[j]).collect()
    }

    /// Whether `l'β`, with `l` over the full expansion, is estimable.
    pub fn is_estimable(&self, full: &Array1<f64>) -> bool {
        let norm = full.dot(full).sqrt();
        let mut residual = full.clone();
        for q in &self.row_basis {
            let projection = q.dot(&residual);
            residual.scaled_add(-projection, q);
        }
        residual.dot(&residual).sqrt() <= ESTIMABILITY_TOLERANCE * norm.max(1.0)
    }

    /// Encodes one row of predictor values into every column of the full
    /// expansion, aliased ones included.
    pub fn encode_full<F>(&self, lookup: F) -> Result<Array1<f64>, DesignError>
    where
        F: Fn(&str) -> Option<CellValue>,
    {
        let mut row = Vec::with_capacity(self.full_width.max(1));
        if self.intercept {
            row.push(1.0);
        }
        for term in &self.terms {
            let mut block = vec![1.0];
            for (variable, coding) in term.variables.iter().zip(&term.codings) {
                let value =
                    lookup(variable).ok_or_else(|| DesignError::MissingValue(variable.clone()))?;
                let piece = self.code_value(variable, *coding, value)?;
                let mut next = Vec::with_capacity(block.len() * piece.len());
                for p in &piece {
                    for b in &block {
                        next.push(b * p);
                    }
                }
                block = next;
            }
            row.extend(block);
        }
        Ok(Array1::from(row))
    }

    fn code_value(
        &self,
        variable: &str,
        coding: Coding,
        value: CellValue,
    ) -> Result<Vec<f64>, DesignError> {
        match (coding, value) {
            (Coding::Numeric, CellValue::Number(v)) => Ok(vec![v]),
            (Coding::Numeric, CellValue::Level(_)) | (_, CellValue::Number(_)) => {
                Err(DesignError::MissingValue(variable.to_string()))
            }
            (coding, CellValue::Level(index)) => {
                let n_levels = self.n_levels(variable);
                if index >= n_levels {
                    return Err(DesignError::LevelOutOfRange {
                        variable: variable.to_string(),
                        index,
                    });
                }
                Ok(match (coding, self.contrasts) {
                    (Coding::Indicator, _) => {
                        (0..n_levels).map(|l| f64::from(u8::from(l == index))).collect()
                    }
                    (_, Contrasts::Treatment) => {
                        (1..n_levels).map(|l| f64::from(u8::from(l == index))).collect()
                    }
                    (_, Contrasts::Sum) => (0..n_levels - 1)
                        .map(|l| {
                            if index == n_levels - 1 {
                                -1.0
                            } else {
                                f64::from(u8::from(l == index))
                            }
                        })
                        .collect(),
                })
            }
        }
    }

    fn variable_column_names(&self, variable: &str, coding: Coding) -> Vec<String> {
        match (coding, self.info(variable)) {
            (Coding::Numeric, _) | (_, Err(_)) | (_, Ok(VariableInfo::Numeric { .. })) => {
                vec![variable.to_string()]
            }
            (Coding::Indicator, Ok(VariableInfo::Factor { levels })) => {
                levels.iter().map(|l| format!("{variable}{l}")).collect()
            }
            (Coding::Contrast, Ok(VariableInfo::Factor { levels })) => match self.contrasts {
                Contrasts::Treatment => levels[1..].iter().map(|l| format!("{variable}{l}")).collect(),
                Contrasts::Sum => (1..levels.len()).map(|i| format!("{variable}{i}")).collect(),
            },
        }
    }

    fn full_column_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.intercept {
            names.push("(Intercept)".to_string());
        }
        for term in &self.terms {
            let mut block = vec![String::new()];
            for (variable, coding) in term.variables.iter().zip(&term.codings) {
                let piece = self.variable_column_names(variable, *coding);
                let mut next = Vec::with_capacity(block.len() * piece.len());
                for p in &piece {
                    for b in &block {
                        next.push(if b.is_empty() {
                            p.clone()
                        } else {
                            format!("{b}:{p}")
                        });
                    }
                }
                block = next;
            }
            names.extend(block);
        }
        names
    }

    /// Full-expansion column ranges owned by each term.
    fn term_spans(&self) -> Vec<std::ops::Range<usize>> {
        let mut start = usize::from(self.intercept);
        self.terms
            .iter()
            .map(|term| {
                let width: usize = term
                    .variables
                    .iter()
                    .zip(&term.codings)
                    .map(|(v, c)| self.variable_column_names(v, *c).len())
                    .product();
                let span = start..start + width;
                start += width;
                span
            })
            .collect()
    }
}

fn row_value(data: &FieldData, name: &str, row: usize) -> Option<CellValue> {
    match &data.variable(name).ok()?.values {
        VariableValues::Numeric(values) => Some(CellValue::Number(values[row])),
        VariableValues::Factor(factor) => factor.codes[row].map(CellValue::Level),
    }
}

/// Modified Gram-Schmidt over `vectors`: the indices of those that are not
/// linear combinations of earlier ones, and an orthonormal basis of their
/// span.
fn gram_schmidt<'a, I>(vectors: I) -> (Vec<usize>, Vec<Array1<f64>>)
where
    I: IntoIterator<Item = ArrayView1<'a, f64>>,
{
    let mut basis: Vec<Array1<f64>> = Vec::new();
    let mut kept = Vec::new();
    for (j, column) in vectors.into_iter().enumerate() {
        let norm = column.dot(&column).sqrt();
        if norm == 0.0 {
            continue;
        }
        let mut residual = column.to_owned();
        for q in &basis {
            let projection = q.dot(&residual);
            residual.scaled_add(-projection, q);
        }
        let residual_norm = residual.dot(&residual).sqrt();
        if residual_norm > ALIAS_TOLERANCE * norm {
            basis.push(residual / residual_norm);
            kept.push(j);
        }
    }
    (kept, basis)
}

/// One block of random intercepts: the levels of a grouping factor (or of a
/// combination of factors) and the level of each observation.
#[derive(Debug, Clone)]
pub struct RandomBlock {
    pub label: String,
    pub levels: Vec<String>,
    /// Level index of each observation.
    pub codes: Vec<usize>,
}

impl RandomBlock {
    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }
}

/// The random-effect structure of a mixed model.
#[derive(Debug, Clone)]
pub struct RandomDesign {
    pub blocks: Vec<RandomBlock>,
}

impl RandomDesign {
    /// Builds one block per random term. Grouping variables must be factors
    /// without missing values in `data`.
    pub fn build(terms: &[RandomTerm], data: &FieldData) -> Result<Self, DesignError> {
        let n = data.n_rows();
        let mut blocks = Vec::with_capacity(terms.len());
        for term in terms {
            let factors = term
                .grouping
                .iter()
                .map(|g| data.factor(g))
                .collect::<Result<Vec<_>, _>>()?;
            let mut labels = Vec::with_capacity(n);
            for row in 0..n {
                let parts = factors
                    .iter()
                    .zip(&term.grouping)
                    .map(|(f, name)| {
                        f.label(row)
                            .map(str::to_string)
                            .ok_or_else(|| DesignError::NonFinite(name.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                labels.push(parts.join(":"));
            }
            let mut levels = labels.clone();
            levels.sort_by(|a, b| compare_levels(a, b));
            levels.dedup();
            let codes = labels
                .iter()
                .map(|l| levels.binary_search_by(|probe| compare_levels(probe, l)).unwrap_or(0))
                .collect();
            blocks.push(RandomBlock {
                label: term.label(),
                levels,
                codes,
            });
        }
        Ok(Self { blocks })
    }

    /// Total number of random effects across blocks.
    pub fn n_effects(&self) -> usize {
        self.blocks.iter().map(RandomBlock::n_levels).sum()
    }

    /// Dense `Z`: one indicator column per level of every block.
    pub fn z_matrix(&self, n: usize) -> Array2<f64> {
        let mut z = Array2::zeros((n, self.n_effects()));
        let mut offset = 0;
        for block in &self.blocks {
            for (row, &code) in block.codes.iter().enumerate() {
                z[[row, offset + code]] = 1.0;
            }
            offset += block.n_levels();
        }
        z
    }
}
