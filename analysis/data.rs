//! # Field Data Loading and Validation
//!
//! This module is the entry point for user-provided trial data. It reads flat
//! tabular files (one row per experimental plot), classifies every column as a
//! numeric measurement or a categorical factor, and hands the result to the
//! model-building code as plain `ndarray` vectors and coded factors.
//!
//! - Flexible schema: column names are whatever the trial used (`yield`,
//!   `genotype`, `block`, `row`, `col`). Which columns matter is decided later
//!   by the model formula.
//! - Factors on request: layout factors are often stored as integers (block 1,
//!   2, 3). Such columns are converted to factors when named in
//!   `LoadOptions::factors`.
//! - Missing data: `NA` and empty cells are read as missing. Rows are only
//!   dropped when a model actually uses the affected column.

use ndarray::Array1;
use polars::prelude::{
    CsvParseOptions, CsvReadOptions, CsvReader, DataFrame, DataType, NullValues, PolarsError,
    SerReader,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error while reading '{path}': {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },
    #[error("The input file contains no data rows.")]
    Empty,
    #[error("The column '{0}' was not found in the input data. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error("The column '{column_name}' is {found}, but {expected} was required here.")]
    ColumnWrongType {
        column_name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("The column name '{0}' appears more than once in the input data.")]
    DuplicateColumn(String),
    #[error("Failed to read the header row: {0}")]
    HeaderError(#[from] csv::Error),
    #[error("Column '{name}' has {found} rows, but the dataset has {expected}.")]
    LengthMismatch {
        name: String,
        found: usize,
        expected: usize,
    },
    #[error("Unknown built-in dataset '{0}'. Run `fieldstat datasets` to list the available ones.")]
    UnknownDataset(String),
}

/// Options controlling how a delimited file is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Field separator, `b','` for CSV and `b'\t'` for TSV.
    pub separator: u8,
    /// Columns to treat as factors even when they hold numbers.
    pub factors: Vec<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            separator: b',',
            factors: Vec::new(),
        }
    }
}

/// A categorical variable stored as level codes.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    /// Level labels in natural sort order. Code `i` refers to `levels[i]`.
    pub levels: Vec<String>,
    /// One code per row, `None` where the value is missing.
    pub codes: Vec<Option<usize>>,
}

impl Factor {
    /// Builds a factor from raw labels, ordering the levels naturally
    /// (`G2` sorts before `G10`).
    pub fn from_labels(labels: &[Option<String>]) -> Self {
        let mut levels: Vec<String> = labels
            .iter()
            .flatten()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        levels.sort_by(|a, b| natord::compare(a, b));
        let codes = labels
            .iter()
            .map(|label| {
                label
                    .as_ref()
                    .and_then(|l| levels.iter().position(|level| level == l))
            })
            .collect();
        Self { levels, codes }
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// The label of row `i`, if present.
    pub fn label(&self, i: usize) -> Option<&str> {
        self.codes[i].map(|c| self.levels[c].as_str())
    }

    /// Restricts the factor to the given rows and drops levels that no longer occur.
    fn subset(&self, rows: &[usize]) -> Self {
        let labels: Vec<Option<String>> = rows
            .iter()
            .map(|&r| self.label(r).map(str::to_string))
            .collect();
        let used: HashSet<&String> = labels.iter().flatten().collect();
        let levels: Vec<String> = self
            .levels
            .iter()
            .filter(|level| used.contains(level))
            .cloned()
            .collect();
        let codes = labels
            .iter()
            .map(|label| {
                label
                    .as_ref()
                    .and_then(|l| levels.iter().position(|level| level == l))
            })
            .collect();
        Self { levels, codes }
    }
}

/// The values held by one column.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValues {
    /// Measurements; missing entries are `NaN`.
    Numeric(Array1<f64>),
    Factor(Factor),
}

impl VariableValues {
    fn kind(&self) -> &'static str {
        match self {
            VariableValues::Numeric(_) => "numeric",
            VariableValues::Factor(_) => "a factor",
        }
    }

    fn is_missing(&self, row: usize) -> bool {
        match self {
            VariableValues::Numeric(values) => !values[row].is_finite(),
            VariableValues::Factor(factor) => factor.codes[row].is_none(),
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub values: VariableValues,
}

/// Per-level descriptive statistics of a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSummary {
    pub level: String,
    pub n: usize,
    pub mean: f64,
    pub sd: f64,
    pub min: f64,
    pub max: f64,
}

/// An in-memory trial dataset: equally long named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldData {
    variables: Vec<Variable>,
    n_rows: usize,
}

impl FieldData {
    /// Assembles a dataset from columns. All columns must have the same length.
    pub fn from_variables(variables: Vec<Variable>) -> Result<Self, DataError> {
        let mut seen = HashSet::new();
        for variable in &variables {
            if !seen.insert(variable.name.clone()) {
                return Err(DataError::DuplicateColumn(variable.name.clone()));
            }
        }
        let n_rows = variables.first().map(|v| v.len()).unwrap_or(0);
        if n_rows == 0 {
            return Err(DataError::Empty);
        }
        if let Some(bad) = variables.iter().find(|v| v.len() != n_rows) {
            return Err(DataError::LengthMismatch {
                name: bad.name.clone(),
                found: bad.len(),
                expected: n_rows,
            });
        }
        Ok(Self { variables, n_rows })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Result<&Variable, DataError> {
        self.variables
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.iter().any(|v| v.name == name)
    }

    pub fn numeric(&self, name: &str) -> Result<&Array1<f64>, DataError> {
        match &self.variable(name)?.values {
            VariableValues::Numeric(values) => Ok(values),
            other => Err(DataError::ColumnWrongType {
                column_name: name.to_string(),
                expected: "numeric",
                found: other.kind(),
            }),
        }
    }

    pub fn factor(&self, name: &str) -> Result<&Factor, DataError> {
        match &self.variable(name)?.values {
            VariableValues::Factor(factor) => Ok(factor),
            other => Err(DataError::ColumnWrongType {
                column_name: name.to_string(),
                expected: "a factor",
                found: other.kind(),
            }),
        }
    }

    pub fn is_factor(&self, name: &str) -> Result<bool, DataError> {
        Ok(matches!(
            self.variable(name)?.values,
            VariableValues::Factor(_)
        ))
    }

    /// Converts a numeric column into a factor. Integer-valued numbers are
    /// labelled without a decimal point, so block `1.0` becomes level `"1"`.
    /// Converting a column that already is a factor is a no-op.
    pub fn to_factor(&mut self, name: &str) -> Result<(), DataError> {
        let variable = self
            .variables
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
        if let VariableValues::Numeric(values) = &variable.values {
            let labels: Vec<Option<String>> = values.iter().map(|&v| number_label(v)).collect();
            variable.values = VariableValues::Factor(Factor::from_labels(&labels));
        }
        Ok(())
    }

    /// Keeps the rows with no missing value in any of `names`.
    ///
    /// Returns the filtered dataset and the indices of the kept rows. Factor
    /// levels that no longer occur are removed from every factor column.
    pub fn complete_cases(&self, names: &[&str]) -> Result<(FieldData, Vec<usize>), DataError> {
        let checked: Vec<&Variable> = names
            .iter()
            .map(|name| self.variable(name))
            .collect::<Result<_, _>>()?;
        let rows: Vec<usize> = (0..self.n_rows)
            .filter(|&row| checked.iter().all(|v| !v.values.is_missing(row)))
            .collect();
        if rows.is_empty() {
            return Err(DataError::Empty);
        }
        Ok((self.subset(&rows), rows))
    }

    /// Restricts every column to the given row indices.
    pub fn subset(&self, rows: &[usize]) -> FieldData {
        let variables = self
            .variables
            .iter()
            .map(|v| Variable {
                name: v.name.clone(),
                values: match &v.values {
                    VariableValues::Numeric(values) => {
                        VariableValues::Numeric(rows.iter().map(|&r| values[r]).collect())
                    }
                    VariableValues::Factor(factor) => VariableValues::Factor(factor.subset(rows)),
                },
            })
            .collect();
        FieldData {
            variables,
            n_rows: rows.len(),
        }
    }

    /// Descriptive statistics of `response` for each level of `factor`.
    ///
    /// Missing responses are skipped; levels without any observed response
    /// are omitted.
    pub fn summarize_by(&self, response: &str, factor: &str) -> Result<Vec<GroupSummary>, DataError> {
        let y = self.numeric(response)?;
        let groups = self.factor(factor)?;
        let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); groups.n_levels()];
        for (row, code) in groups.codes.iter().enumerate() {
            if let Some(code) = code {
                if y[row].is_finite() {
                    buckets[*code].push(y[row]);
                }
            }
        }
        Ok(groups
            .levels
            .iter()
            .zip(buckets)
            .filter(|(_, values)| !values.is_empty())
            .map(|(level, values)| summarize(level, &values))
            .collect())
    }

    /// Descriptive statistics of a whole numeric column.
    pub fn describe(&self, name: &str) -> Result<GroupSummary, DataError> {
        let values: Vec<f64> = self
            .numeric(name)?
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        if values.is_empty() {
            return Err(DataError::Empty);
        }
        Ok(summarize(name, &values))
    }
}

impl Variable {
    pub fn len(&self) -> usize {
        match &self.values {
            VariableValues::Numeric(values) => values.len(),
            VariableValues::Factor(factor) => factor.codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn summarize(level: &str, values: &[f64]) -> GroupSummary {
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let sd = if n < 2 {
        f64::NAN
    } else {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
    };
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    GroupSummary {
        level: level.to_string(),
        n,
        mean,
        sd,
        min,
        max,
    }
}

fn number_label(value: f64) -> Option<String> {
    if !value.is_finite() {
        None
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        Some(format!("{}", value as i64))
    } else {
        Some(format!("{value}"))
    }
}

/// Loads a delimited file from disk.
pub fn load_csv(path: &str, options: &LoadOptions) -> Result<FieldData, DataError> {
    log::info!("Loading data from '{path}'");
    let bytes = fs::read(Path::new(path)).map_err(|source| DataError::IoError {
        path: path.to_string(),
        source,
    })?;
    let df = internal::read_frame(bytes, options.separator)?;
    internal::frame_to_field_data(&df, options)
}

/// Loads delimited text held in memory, such as a built-in dataset.
pub fn load_csv_str(text: &str, options: &LoadOptions) -> Result<FieldData, DataError> {
    let df = internal::read_frame(text.as_bytes().to_vec(), options.separator)?;
    internal::frame_to_field_data(&df, options)
}

/// Shared Polars plumbing.
mod internal {
    use super::*;

    /// Rejects repeated header names, which Polars would otherwise rename.
    fn check_header(bytes: &[u8], separator: u8) -> Result<(), DataError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(separator)
            .has_headers(true)
            .from_reader(bytes);
        let mut seen = HashSet::new();
        for name in reader.headers()?.iter() {
            let name = name.trim();
            if !seen.insert(name.to_string()) {
                return Err(DataError::DuplicateColumn(name.to_string()));
            }
        }
        Ok(())
    }

    pub(super) fn read_frame(bytes: Vec<u8>, separator: u8) -> Result<DataFrame, DataError> {
        check_header(&bytes, separator)?;
        let df = CsvReader::new(Cursor::new(bytes))
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(
                        CsvParseOptions::default()
                            .with_separator(separator)
                            .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                    ),
            )
            .finish()?;
        if df.height() == 0 {
            return Err(DataError::Empty);
        }
        Ok(df)
    }

    fn is_numeric(dtype: &DataType) -> bool {
        matches!(
            dtype,
            DataType::Float32
                | DataType::Float64
                | DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
        )
    }

    pub(super) fn frame_to_field_data(
        df: &DataFrame,
        options: &LoadOptions,
    ) -> Result<FieldData, DataError> {
        let names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        for requested in &options.factors {
            if !names.contains(requested) {
                return Err(DataError::ColumnNotFound(requested.clone()));
            }
        }

        let mut variables = Vec::with_capacity(names.len());
        for name in &names {
            let series = df.column(name)?.as_materialized_series();
            let values = if is_numeric(series.dtype()) {
                let casted = series.cast(&DataType::Float64)?;
                let values: Array1<f64> = casted
                    .f64()?
                    .into_iter()
                    .map(|v| v.unwrap_or(f64::NAN))
                    .collect();
                VariableValues::Numeric(values)
            } else {
                let casted = series.cast(&DataType::String)?;
                let labels: Vec<Option<String>> = casted
                    .str()?
                    .into_iter()
                    .map(|v| {
                        v.map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                    })
                    .collect();
                VariableValues::Factor(Factor::from_labels(&labels))
            };
            variables.push(Variable {
                name: name.clone(),
                values,
            });
        }

        let mut data = FieldData::from_variables(variables)?;
        for requested in &options.factors {
            data.to_factor(requested)?;
        }
        log::info!(
            "Loaded {} rows and {} columns ({}).",
            data.n_rows(),
            names.len(),
            names.join(", ")
        );
        Ok(data)
    }
}

/// Natural ordering helper used wherever level labels are sorted.
pub fn compare_levels(a: &str, b: &str) -> Ordering {
    natord::compare(a, b)
}
