//! Pairwise comparisons of estimated marginal means with multiplicity
//! adjustment.

use crate::emmeans::{EmmTable, row_weights};
use crate::inference::{pvalue_t, t_quantile};
use crate::model::FittedModel;
use crate::studentized::{ptukey, qtukey};
use itertools::Itertools;
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown p-value adjustment '{0}'. Use tukey, bonferroni, holm, sidak or none.")]
pub struct UnknownAdjustment(pub String);

/// Multiplicity adjustment applied within each family of comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Adjustment {
    #[default]
    Tukey,
    Bonferroni,
    Holm,
    Sidak,
    None,
}

impl FromStr for Adjustment {
    type Err = UnknownAdjustment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tukey" | "hsd" => Ok(Adjustment::Tukey),
            "bonferroni" => Ok(Adjustment::Bonferroni),
            "holm" => Ok(Adjustment::Holm),
            "sidak" | "šidák" => Ok(Adjustment::Sidak),
            "none" => Ok(Adjustment::None),
            other => Err(UnknownAdjustment(other.to_string())),
        }
    }
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Adjustment::Tukey => "tukey",
            Adjustment::Bonferroni => "bonferroni",
            Adjustment::Holm => "holm",
            Adjustment::Sidak => "sidak",
            Adjustment::None => "none",
        };
        write!(f, "{name}")
    }
}

/// One pairwise difference `first - second`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairwiseRow {
    pub first: String,
    pub second: String,
    pub by: String,
    pub estimate: f64,
    pub std_error: f64,
    pub df: f64,
    pub t_ratio: f64,
    pub p_value: f64,
    pub lower: f64,
    pub upper: f64,
}

impl PairwiseRow {
    pub fn contrast(&self) -> String {
        format!("{} - {}", self.first, self.second)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairwiseTable {
    pub adjustment: Adjustment,
    pub confidence_level: f64,
    pub rows: Vec<PairwiseRow>,
}

impl PairwiseTable {
    pub fn find(&self, first: &str, second: &str) -> Option<&PairwiseRow> {
        self.rows
            .iter()
            .find(|r| (r.first == first && r.second == second) || (r.first == second && r.second == first))
    }
}

/// Every pair of means within each `by` group, in table order.
pub fn pairwise<M: FittedModel + Sync + ?Sized>(
    fit: &M,
    emm: &EmmTable,
    adjustment: Adjustment,
    level: f64,
) -> PairwiseTable {
    let mut rows = Vec::new();
    for (by, members) in emm.estimable_groups() {
        let k = members.len();
        let pairs: Vec<(usize, usize)> = members.iter().copied().tuple_combinations().collect();
        let family = pairs.len();
        if family == 0 {
            continue;
        }
        log::debug!("Comparing {k} means in group '{by}' ({family} pairs, {adjustment} adjustment)");

        let mut group_rows: Vec<(PairwiseRow, f64)> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let first = &emm.rows[i];
                let second = &emm.rows[j];
                let l: Array1<f64> = &row_weights(first) - &row_weights(second);
                let c = fit.contrast_estimate(l.view());
                let t_ratio = c.estimate / c.std_error;
                let raw = pvalue_t(t_ratio, c.df);
                let (p_value, margin) = match adjustment {
                    Adjustment::Tukey => (
                        1.0 - ptukey(t_ratio.abs() * 2f64.sqrt(), k, c.df),
                        qtukey(level, k, c.df) / 2f64.sqrt(),
                    ),
                    Adjustment::Bonferroni => (
                        (raw * family as f64).min(1.0),
                        t_quantile(1.0 - (1.0 - level) / (2.0 * family as f64), c.df),
                    ),
                    Adjustment::Sidak => {
                        let per_comparison = 1.0 - level.powf(1.0 / family as f64);
                        (
                            1.0 - (1.0 - raw).powi(family as i32),
                            t_quantile(1.0 - per_comparison / 2.0, c.df),
                        )
                    }
                    Adjustment::Holm | Adjustment::None => {
                        (raw, t_quantile(1.0 - (1.0 - level) / 2.0, c.df))
                    }
                };
                let row = PairwiseRow {
                    first: first.label(),
                    second: second.label(),
                    by: by.clone(),
                    estimate: c.estimate,
                    std_error: c.std_error,
                    df: c.df,
                    t_ratio,
                    p_value: p_value.clamp(0.0, 1.0),
                    lower: c.estimate - margin * c.std_error,
                    upper: c.estimate + margin * c.std_error,
                };
                (row, raw)
            })
            .collect();

        if adjustment == Adjustment::Holm {
            let raw: Vec<f64> = group_rows.iter().map(|(_, p)| *p).collect();
            for ((row, _), adjusted) in group_rows.iter_mut().zip(holm(&raw)) {
                row.p_value = adjusted;
            }
        }
        rows.extend(group_rows.into_iter().map(|(row, _)| row));
    }
    PairwiseTable {
        adjustment,
        confidence_level: level,
        rows,
    }
}

/// Holm's step-down adjustment, returned in input order.
pub fn holm(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len();
    let order: Vec<usize> = (0..m)
        .sorted_by(|&a, &b| p_values[a].total_cmp(&p_values[b]))
        .collect();
    let mut adjusted = vec![0.0; m];
    let mut running = 0.0_f64;
    for (rank, &index) in order.iter().enumerate() {
        running = running.max(((m - rank) as f64 * p_values[index]).min(1.0));
        adjusted[index] = running;
    }
    adjusted
}
