//! Model formulas in the familiar `response ~ predictors` notation.
//!
//! Supported on the right-hand side:
//!
//! - `a + b` main effects, `a:b` interactions, `a*b` crossing (`a + b + a:b`);
//! - `1`, `0` and `-1` to keep or drop the intercept;
//! - `- a:b` to remove a term added by a crossing;
//! - `(1 | block)` random intercepts, with `(1 | a:b)` for an interaction of
//!   grouping factors and `(1 | rep/block)` for nesting (`(1|rep) + (1|rep:block)`).

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("A formula needs exactly one '~' separating the response from the predictors: '{0}'")]
    MissingTilde(String),
    #[error("The formula has no response variable on the left of '~'.")]
    MissingResponse,
    #[error("'{0}' is not a valid variable name.")]
    InvalidName(String),
    #[error("Unbalanced parentheses in '{0}'.")]
    UnbalancedParentheses(String),
    #[error("Empty term in formula '{0}'.")]
    EmptyTerm(String),
    #[error(
        "Only random intercepts of the form (1 | group) are supported, found '({0})'."
    )]
    UnsupportedRandomTerm(String),
    #[error("Unsupported formula syntax '{0}'.")]
    UnsupportedSyntax(String),
    #[error("Cannot remove '{0}': the term is not part of the model.")]
    RemovedTermAbsent(String),
    #[error("The model has neither an intercept nor any fixed-effect terms.")]
    EmptyModel,
}

/// A fixed-effect term: one variable (main effect) or several (interaction).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    pub variables: Vec<String>,
}

impl Term {
    pub fn new<S: AsRef<str>>(variables: &[S]) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(variables.len());
        for v in variables {
            if !unique.iter().any(|u| u == v.as_ref()) {
                unique.push(v.as_ref().to_string());
            }
        }
        Self { variables: unique }
    }

    pub fn label(&self) -> String {
        self.variables.join(":")
    }

    pub fn degree(&self) -> usize {
        self.variables.len()
    }

    /// Same variables regardless of the order they were written in.
    pub fn same_as(&self, other: &Term) -> bool {
        self.variables.len() == other.variables.len()
            && self.variables.iter().all(|v| other.variables.contains(v))
    }

    pub fn contains(&self, variable: &str) -> bool {
        self.variables.iter().any(|v| v == variable)
    }
}

/// A random intercept for the levels of one grouping factor (or of the
/// combinations of several).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomTerm {
    pub grouping: Vec<String>,
}

impl RandomTerm {
    pub fn label(&self) -> String {
        self.grouping.join(":")
    }
}

/// A parsed model formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub response: String,
    pub intercept: bool,
    pub fixed: Vec<Term>,
    pub random: Vec<RandomTerm>,
}

impl Formula {
    pub fn parse(text: &str) -> Result<Self, FormulaError> {
        let mut sides = text.split('~');
        let (lhs, rhs) = match (sides.next(), sides.next(), sides.next()) {
            (Some(lhs), Some(rhs), None) => (lhs.trim(), rhs.trim()),
            _ => return Err(FormulaError::MissingTilde(text.to_string())),
        };
        if lhs.is_empty() {
            return Err(FormulaError::MissingResponse);
        }
        validate_name(lhs)?;

        let mut formula = Formula {
            response: lhs.to_string(),
            intercept: true,
            fixed: Vec::new(),
            random: Vec::new(),
        };

        for (negated, item) in split_top_level(rhs)? {
            formula.apply_item(negated, &item, text)?;
        }

        formula.fixed.sort_by_key(Term::degree);
        if !formula.intercept && formula.fixed.is_empty() {
            return Err(FormulaError::EmptyModel);
        }
        Ok(formula)
    }

    fn apply_item(&mut self, negated: bool, item: &str, text: &str) -> Result<(), FormulaError> {
        match item {
            "" => Err(FormulaError::EmptyTerm(text.to_string())),
            "1" => {
                self.intercept = !negated;
                Ok(())
            }
            "0" => {
                self.intercept = negated;
                Ok(())
            }
            _ if item.starts_with('(') => {
                if negated {
                    return Err(FormulaError::UnsupportedSyntax(format!("-{item}")));
                }
                let inner = item
                    .strip_prefix('(')
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(|| FormulaError::UnsupportedSyntax(item.to_string()))?;
                for grouping in parse_random(inner)? {
                    let term = RandomTerm { grouping };
                    if !self.random.contains(&term) {
                        self.random.push(term);
                    }
                }
                Ok(())
            }
            _ => {
                for term in expand_product(item)? {
                    let existing = self.fixed.iter().position(|t| t.same_as(&term));
                    match (negated, existing) {
                        (false, None) => self.fixed.push(term),
                        (false, Some(_)) => {}
                        (true, Some(index)) => {
                            self.fixed.remove(index);
                        }
                        (true, None) => return Err(FormulaError::RemovedTermAbsent(term.label())),
                    }
                }
                Ok(())
            }
        }
    }

    pub fn has_random(&self) -> bool {
        !self.random.is_empty()
    }

    /// Every variable the formula refers to, response first, without repeats.
    pub fn variables(&self) -> Vec<String> {
        let mut names = vec![self.response.clone()];
        let referenced = self
            .fixed
            .iter()
            .flat_map(|t| t.variables.iter())
            .chain(self.random.iter().flat_map(|r| r.grouping.iter()));
        for name in referenced {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Predictor variables appearing in fixed-effect terms.
    pub fn fixed_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.fixed.iter().flat_map(|t| t.variables.iter()) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// The same formula without random terms.
    pub fn fixed_only(&self) -> Formula {
        Formula {
            random: Vec::new(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if !self.intercept {
            parts.push("0".to_string());
        } else if self.fixed.is_empty() {
            parts.push("1".to_string());
        }
        parts.extend(self.fixed.iter().map(Term::label));
        parts.extend(self.random.iter().map(|r| format!("(1 | {})", r.label())));
        write!(f, "{} ~ {}", self.response, parts.join(" + "))
    }
}

fn validate_name(name: &str) -> Result<(), FormulaError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '.' || c == '_');
    let valid_rest = name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '_');
    if valid_start && valid_rest {
        Ok(())
    } else {
        Err(FormulaError::InvalidName(name.to_string()))
    }
}

/// Splits the right-hand side on `+` and `-` outside parentheses, returning
/// each item with whether it was subtracted.
fn split_top_level(rhs: &str) -> Result<Vec<(bool, String)>, FormulaError> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    let mut negated = false;
    let mut started = false;

    for c in rhs.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| FormulaError::UnbalancedParentheses(rhs.to_string()))?;
                current.push(c);
            }
            '+' | '-' if depth == 0 => {
                let item = current.trim().to_string();
                if !item.is_empty() || started {
                    items.push((negated, item));
                }
                started = true;
                negated = c == '-';
                current.clear();
            }
            c if c.is_whitespace() => {}
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(FormulaError::UnbalancedParentheses(rhs.to_string()));
    }
    let item = current.trim().to_string();
    if item.is_empty() && !started {
        return Err(FormulaError::EmptyTerm(rhs.to_string()));
    }
    items.push((negated, item));
    Ok(items)
}

/// Expands `a*b:c` style products into individual terms, lower orders first.
fn expand_product(item: &str) -> Result<Vec<Term>, FormulaError> {
    if item.contains('(') || item.contains('^') || item.contains('/') {
        return Err(FormulaError::UnsupportedSyntax(item.to_string()));
    }
    let factors: Vec<Vec<&str>> = item.split('*').map(|f| f.split(':').collect()).collect();
    for name in factors.iter().flatten() {
        if name.is_empty() {
            return Err(FormulaError::EmptyTerm(item.to_string()));
        }
        validate_name(name)?;
    }

    let mut terms: Vec<Term> = Vec::new();
    for mask in 1usize..(1 << factors.len()) {
        let variables: Vec<&str> = factors
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .flat_map(|(_, f)| f.iter().copied())
            .collect();
        let term = Term::new(&variables);
        if !terms.iter().any(|t| t.same_as(&term)) {
            terms.push(term);
        }
    }
    terms.sort_by_key(Term::degree);
    Ok(terms)
}

/// Parses the inside of `( ... | ... )` into the grouping factors it defines.
fn parse_random(inner: &str) -> Result<Vec<Vec<String>>, FormulaError> {
    let (effect, grouping) = inner
        .split_once('|')
        .ok_or_else(|| FormulaError::UnsupportedSyntax(format!("({inner})")))?;
    if effect.trim() != "1" {
        return Err(FormulaError::UnsupportedRandomTerm(inner.to_string()));
    }
    let grouping = grouping.trim();
    if grouping.is_empty() {
        return Err(FormulaError::EmptyTerm(format!("({inner})")));
    }

    let mut nested: Vec<Vec<String>> = Vec::new();
    let mut prefix: Vec<String> = Vec::new();
    for level in grouping.split('/') {
        for name in level.split(':') {
            let name = name.trim();
            validate_name(name)?;
            if !prefix.iter().any(|p| p == name) {
                prefix.push(name.to_string());
            }
        }
        nested.push(prefix.clone());
    }
    Ok(nested)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(formula: &Formula) -> Vec<String> {
        formula.fixed.iter().map(Term::label).collect()
    }

    #[test]
    fn parses_main_effects_and_intercept() {
        let f = Formula::parse("yield ~ genotype + block").unwrap();
        assert_eq!(f.response, "yield");
        assert!(f.intercept);
        assert_eq!(labels(&f), vec!["genotype", "block"]);
        assert!(!f.has_random());
    }

    #[test]
    fn crossing_expands_and_orders_by_degree() {
        let f = Formula::parse("y ~ a*b*c").unwrap();
        assert_eq!(
            labels(&f),
            vec!["a", "b", "c", "a:b", "a:c", "b:c", "a:b:c"]
        );
        let g = Formula::parse("y ~ a*b - a:b").unwrap();
        assert_eq!(labels(&g), vec!["a", "b"]);
    }

    #[test]
    fn intercept_can_be_removed() {
        let f = Formula::parse("y ~ 0 + trt").unwrap();
        assert!(!f.intercept);
        let g = Formula::parse("y ~ trt - 1").unwrap();
        assert!(!g.intercept);
        assert_eq!(g.to_string(), "y ~ 0 + trt");
        assert_eq!(Formula::parse("y ~ 0"), Err(FormulaError::EmptyModel));
    }

    #[test]
    fn random_intercepts_and_nesting() {
        let f = Formula::parse("yield ~ genotype + (1 | rep/block) + (1|row:col)").unwrap();
        assert_eq!(labels(&f), vec!["genotype"]);
        let groups: Vec<String> = f.random.iter().map(RandomTerm::label).collect();
        assert_eq!(groups, vec!["rep", "rep:block", "row:col"]);
        assert_eq!(
            f.variables(),
            vec!["yield", "genotype", "rep", "block", "row", "col"]
        );
        assert_eq!(
            f.to_string(),
            "yield ~ genotype + (1 | rep) + (1 | rep:block) + (1 | row:col)"
        );
    }

    #[test]
    fn rejects_malformed_formulas() {
        assert!(matches!(
            Formula::parse("yield genotype"),
            Err(FormulaError::MissingTilde(_))
        ));
        assert_eq!(Formula::parse(" ~ a"), Err(FormulaError::MissingResponse));
        assert!(matches!(
            Formula::parse("y ~ a + (1 | b"),
            Err(FormulaError::UnbalancedParentheses(_))
        ));
        assert!(matches!(
            Formula::parse("y ~ a + (x | b)"),
            Err(FormulaError::UnsupportedRandomTerm(_))
        ));
        assert!(matches!(
            Formula::parse("y ~ a - b"),
            Err(FormulaError::RemovedTermAbsent(_))
        ));
        assert!(matches!(
            Formula::parse("y ~ 2a"),
            Err(FormulaError::InvalidName(_))
        ));
        assert!(matches!(
            Formula::parse("y ~ a + + b"),
            Err(FormulaError::EmptyTerm(_))
        ));
    }
}
