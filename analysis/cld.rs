//! Compact letter display.
//!
//! Means that share a symbol are not significantly different. Symbols are
//! found with Piepho's insert-and-absorb algorithm: start with one group
//! holding every mean; for each significant pair, split every group that
//! contains both members into two copies, each without one of them, then
//! drop groups that are contained in another group.

use crate::comparisons::PairwiseTable;
use crate::emmeans::EmmTable;
use serde::{Deserialize, Serialize};

/// Symbols used to label groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Alphabet {
    #[default]
    Letters,
    Numbers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CldOptions {
    pub alphabet: Alphabet,
    /// Sort means from largest to smallest before labelling.
    pub descending: bool,
}

/// One mean with its group symbols.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CldRow {
    pub level: String,
    pub by: String,
    pub emmean: f64,
    pub lower: f64,
    pub upper: f64,
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CldTable {
    pub alpha: f64,
    pub rows: Vec<CldRow>,
}

impl CldTable {
    pub fn group_of(&self, level: &str) -> Option<&str> {
        self.rows.iter().find(|r| r.level == level).map(|r| r.group.as_str())
    }
}

/// Groups of `n` items given the pairs that must be separated. Each returned
/// column marks the members of one group; columns are ordered by their first
/// member.
pub fn insert_absorb(n: usize, separated: &[(usize, usize)]) -> Vec<Vec<bool>> {
    if n == 0 {
        return Vec::new();
    }
    let mut columns = vec![vec![true; n]];
    for &(i, j) in separated {
        if i == j || i >= n || j >= n {
            continue;
        }
        let mut next = Vec::with_capacity(columns.len() + 1);
        for column in columns {
            if column[i] && column[j] {
                let mut without_i = column.clone();
                without_i[i] = false;
                let mut without_j = column;
                without_j[j] = false;
                next.push(without_i);
                next.push(without_j);
            } else {
                next.push(column);
            }
        }
        columns = absorb(next);
    }
    columns.sort_by_key(|column| column.iter().position(|&member| member).unwrap_or(n));
    columns
}

/// Removes empty columns, duplicates and columns contained in another one.
fn absorb(columns: Vec<Vec<bool>>) -> Vec<Vec<bool>> {
    let contained = |small: &[bool], big: &[bool]| small.iter().zip(big).all(|(&s, &b)| !s || b);
    let mut kept: Vec<Vec<bool>> = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        if !column.iter().any(|&member| member) {
            continue;
        }
        let redundant = columns.iter().enumerate().any(|(other_index, other)| {
            other_index != index
                && contained(column, other)
                && (column != other || other_index < index)
        });
        if !redundant {
            kept.push(column.clone());
        }
    }
    kept
}

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn symbol(alphabet: Alphabet, index: usize) -> String {
    match alphabet {
        Alphabet::Letters if index < LETTERS.len() => char::from(LETTERS[index]).to_string(),
        Alphabet::Letters => format!(
            "{}{}",
            char::from(LETTERS[index % LETTERS.len()]),
            index / LETTERS.len()
        ),
        Alphabet::Numbers => (index + 1).to_string(),
    }
}

/// Symbols of the groups holding the item at `position`. They are run
/// together while every symbol in use is a single character and separated
/// by commas once some need more.
fn group_symbols(columns: &[Vec<bool>], position: usize, alphabet: Alphabet) -> String {
    let single_characters = match alphabet {
        Alphabet::Letters => LETTERS.len(),
        Alphabet::Numbers => 9,
    };
    let separator = if columns.len() > single_characters { "," } else { "" };
    columns
        .iter()
        .enumerate()
        .filter(|(_, column)| column[position])
        .map(|(c, _)| symbol(alphabet, c))
        .collect::<Vec<_>>()
        .join(separator)
}

/// Labels the means of each `by` group so that means sharing a symbol do
/// not differ at level `alpha`.
pub fn compact_letter_display(
    emm: &EmmTable,
    comparisons: &PairwiseTable,
    alpha: f64,
    options: CldOptions,
) -> CldTable {
    let mut rows = Vec::with_capacity(emm.rows.len());
    for (by, members) in emm.estimable_groups() {
        let mut order = members.clone();
        order.sort_by(|&a, &b| emm.rows[a].emmean.total_cmp(&emm.rows[b].emmean));
        if options.descending {
            order.reverse();
        }
        let labels: Vec<String> = order.iter().map(|&i| emm.rows[i].label()).collect();
        let position = |label: &str| labels.iter().position(|l| l == label);

        let separated: Vec<(usize, usize)> = comparisons
            .rows
            .iter()
            .filter(|r| r.by == by && r.p_value < alpha)
            .filter_map(|r| Some((position(&r.first)?, position(&r.second)?)))
            .collect();
        let columns = insert_absorb(order.len(), &separated);
        log::debug!(
            "Group '{by}': {} significant pairs, {} letters",
            separated.len(),
            columns.len()
        );

        for (position, &index) in order.iter().enumerate() {
            let row = &emm.rows[index];
            let group = group_symbols(&columns, position, options.alphabet);
            rows.push(CldRow {
                level: row.label(),
                by: by.clone(),
                emmean: row.emmean,
                lower: row.lower,
                upper: row.upper,
                group,
            });
        }
    }
    CldTable { alpha, rows }
}
