use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Dynamically typed result of evaluating a formula.
///
/// `Missing` stands for an unresolved or non-numeric input. It is distinct
/// from zero and from `false`, and it propagates through arithmetic and
/// comparisons instead of raising an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FormulaValue {
    Number(f64),
    Text(String),
    Bool(bool),
    Missing,
}

impl FormulaValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, FormulaValue::Missing)
    }

    /// Numeric view used by arithmetic. Booleans count as 1/0 and numeric
    /// text is parsed; anything else has no numeric value.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FormulaValue::Number(n) => Some(*n),
            FormulaValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            FormulaValue::Text(s) => s.trim().parse().ok(),
            FormulaValue::Missing => None,
        }
    }

    /// Boolean view used by `IF`, `AND`, `OR` and `NOT`.
    pub fn truthiness(&self) -> Option<bool> {
        match self {
            FormulaValue::Bool(b) => Some(*b),
            FormulaValue::Number(n) if n.is_nan() => None,
            FormulaValue::Number(n) => Some(*n != 0.0),
            FormulaValue::Text(s) if s.eq_ignore_ascii_case("true") => Some(true),
            FormulaValue::Text(s) if s.eq_ignore_ascii_case("false") => Some(false),
            FormulaValue::Text(_) | FormulaValue::Missing => None,
        }
    }

    /// Spreadsheet ordering across types: numbers < text < booleans.
    /// Text compares case-insensitively. `None` when either side is
    /// missing or a number is NaN.
    pub fn compare(&self, other: &FormulaValue) -> Option<Ordering> {
        fn rank(v: &FormulaValue) -> u8 {
            match v {
                FormulaValue::Number(_) => 0,
                FormulaValue::Text(_) => 1,
                FormulaValue::Bool(_) => 2,
                FormulaValue::Missing => 3,
            }
        }
        match (self, other) {
            (FormulaValue::Missing, _) | (_, FormulaValue::Missing) => None,
            (FormulaValue::Number(a), FormulaValue::Number(b)) => a.partial_cmp(b),
            (FormulaValue::Text(a), FormulaValue::Text(b)) => {
                Some(a.to_lowercase().cmp(&b.to_lowercase()))
            }
            (FormulaValue::Bool(a), FormulaValue::Bool(b)) => Some(a.cmp(b)),
            (a, b) => Some(rank(a).cmp(&rank(b))),
        }
    }
}

impl From<f64> for FormulaValue {
    fn from(n: f64) -> Self {
        FormulaValue::Number(n)
    }
}

impl From<bool> for FormulaValue {
    fn from(b: bool) -> Self {
        FormulaValue::Bool(b)
    }
}

impl From<&str> for FormulaValue {
    fn from(s: &str) -> Self {
        FormulaValue::Text(s.to_string())
    }
}

impl From<Option<f64>> for FormulaValue {
    fn from(v: Option<f64>) -> Self {
        v.map_or(FormulaValue::Missing, FormulaValue::Number)
    }
}

impl fmt::Display for FormulaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormulaValue::Number(n) => write!(f, "{}", n),
            FormulaValue::Text(s) => write!(f, "{:?}", s),
            FormulaValue::Bool(true) => f.write_str("TRUE"),
            FormulaValue::Bool(false) => f.write_str("FALSE"),
            FormulaValue::Missing => f.write_str("#MISSING"),
        }
    }
}
