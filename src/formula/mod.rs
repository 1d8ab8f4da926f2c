//! Formula language: a small spreadsheet-style expression subset.
//!
//! ```text
//! IF(AND(Q14>0, P14>0, Q12>=20), "BUY", IF(Q13<0, "SELL", "No Signal"))
//! ```
//!
//! Source text is compiled once (lexer → recursive-descent parser → AST) and
//! the AST is evaluated against an [`Environment`] of named cells. Syntax
//! problems surface as [`FormulaSyntaxError`] at compile time; evaluation
//! itself never fails. Unknown identifiers evaluate to
//! [`FormulaValue::Missing`], which propagates instead of erroring.
//!
//! Supported functions: `IF`, `AND`, `OR`, `NOT`, `ISNUMBER`, `MIN`, `ABS`.

pub mod eval;
pub mod lexer;
pub mod parser;
pub mod value;

use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

pub use self::parser::Expr;
pub use self::value::FormulaValue;

/// Malformed formula source. `position` is a character offset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at position {position}")]
pub struct FormulaSyntaxError {
    pub message: String,
    pub position: usize,
}

impl FormulaSyntaxError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

/// Named cell values visible to a formula. Names are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    vars: HashMap<String, FormulaValue>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FormulaValue>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FormulaValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FormulaValue> {
        self.vars.get(name)
    }
}

/// Parsed, validated formula ready for repeated evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFormula {
    source: String,
    expr: Expr,
}

impl CompiledFormula {
    pub fn evaluate(&self, env: &Environment) -> FormulaValue {
        eval::eval(&self.expr, env)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Distinct identifiers the formula reads, sorted.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut names = Vec::new();
        self.expr.visit_idents(&mut names);
        names.into_iter().map(String::from).collect()
    }
}

pub fn compile(source: &str) -> Result<CompiledFormula, FormulaSyntaxError> {
    Ok(CompiledFormula {
        source: source.to_string(),
        expr: parser::parse(source)?,
    })
}

/// Compile and evaluate in one step.
pub fn evaluate(source: &str, env: &Environment) -> Result<FormulaValue, FormulaSyntaxError> {
    Ok(compile(source)?.evaluate(env))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_with(src: &str, env: &Environment) -> FormulaValue {
        evaluate(src, env).unwrap()
    }

    fn eval_str(src: &str) -> FormulaValue {
        eval_with(src, &Environment::new())
    }

    #[test]
    fn nested_if_returns_winning_branch_text() {
        let env = Environment::new().with("Q12", 15.0).with("P12", 5.0);
        assert_eq!(
            eval_with(r#"IF(AND(Q12>10, P12>10), "BUY", "No Signal")"#, &env),
            FormulaValue::from("No Signal")
        );
        let env = env.with("P12", 11.0);
        assert_eq!(
            eval_with(r#"IF(AND(Q12>10, P12>10), "BUY", "No Signal")"#, &env),
            FormulaValue::from("BUY")
        );
    }

    #[test]
    fn branch_types_are_preserved() {
        assert_eq!(eval_str("IF(1>0, 42, \"x\")"), FormulaValue::Number(42.0));
        assert_eq!(eval_str("IF(1<0, 42, TRUE)"), FormulaValue::Bool(true));
        assert_eq!(eval_str("IF(1<0, 42)"), FormulaValue::Bool(false));
    }

    #[test]
    fn division_by_zero_follows_ieee() {
        assert_eq!(eval_str("5/0"), FormulaValue::Number(f64::INFINITY));
        assert_eq!(eval_str("-5/0"), FormulaValue::Number(f64::NEG_INFINITY));
        assert!(matches!(eval_str("0/0"), FormulaValue::Number(n) if n.is_nan()));
    }

    #[test]
    fn isnumber_takes_else_branch_for_unresolved_cell() {
        assert_eq!(
            eval_str(r#"IF(ISNUMBER(X), "has", "missing")"#),
            FormulaValue::from("missing")
        );
        let env = Environment::new().with("X", 0.0);
        assert_eq!(
            eval_with(r#"IF(ISNUMBER(X), "has", "missing")"#, &env),
            FormulaValue::from("has")
        );
        assert_eq!(eval_str(r#"ISNUMBER("12")"#), FormulaValue::Bool(false));
    }

    #[test]
    fn missing_propagates_through_arithmetic_and_comparison() {
        assert_eq!(eval_str("X + 1"), FormulaValue::Missing);
        assert_eq!(eval_str("X > 1"), FormulaValue::Missing);
        assert_eq!(eval_str("-X"), FormulaValue::Missing);
        assert_eq!(eval_str("ABS(X)"), FormulaValue::Missing);
        assert_eq!(eval_str("MIN(1, X)"), FormulaValue::Missing);
        assert_eq!(eval_str(r#"IF(X > 1, "BUY", "SELL")"#), FormulaValue::Missing);
        assert_eq!(eval_str("NOT(X)"), FormulaValue::Missing);
    }

    #[test]
    fn missing_is_not_zero() {
        let env = Environment::new().with("X", FormulaValue::Missing);
        assert_eq!(eval_with("X = 0", &env), FormulaValue::Missing);
        assert_ne!(eval_with("X * 1", &env), FormulaValue::Number(0.0));
    }

    #[test]
    fn and_or_short_circuit_over_missing() {
        assert_eq!(eval_str("AND(1>2, X>1)"), FormulaValue::Bool(false));
        assert_eq!(eval_str("AND(1<2, X>1)"), FormulaValue::Missing);
        assert_eq!(eval_str("OR(1<2, X>1)"), FormulaValue::Bool(true));
        assert_eq!(eval_str("OR(1>2, X>1)"), FormulaValue::Missing);
        assert_eq!(eval_str("OR(1>2)"), FormulaValue::Bool(false));
    }

    #[test]
    fn arithmetic_precedence_and_functions() {
        assert_eq!(eval_str("2 + 3 * 4"), FormulaValue::Number(14.0));
        assert_eq!(eval_str("(2 + 3) * 4"), FormulaValue::Number(20.0));
        assert_eq!(eval_str("10 - 4 - 3"), FormulaValue::Number(3.0));
        assert_eq!(eval_str("-2 * -3"), FormulaValue::Number(6.0));
        assert_eq!(eval_str("MIN(4, -1, 7)"), FormulaValue::Number(-1.0));
        assert_eq!(eval_str("ABS(3 - 10)"), FormulaValue::Number(7.0));
        assert_eq!(eval_str("1 + 1 = 2"), FormulaValue::Bool(true));
        assert_eq!(eval_str("NOT(0)"), FormulaValue::Bool(true));
    }

    #[test]
    fn text_comparison_is_case_insensitive() {
        let env = Environment::new().with("S", "buy");
        assert_eq!(eval_with(r#"S = "BUY""#, &env), FormulaValue::Bool(true));
        assert_eq!(eval_with(r#"S <> "SELL""#, &env), FormulaValue::Bool(true));
    }

    #[test]
    fn identifiers_are_case_sensitive() {
        let env = Environment::new().with("Q12", 1.0);
        assert_eq!(eval_with("q12", &env), FormulaValue::Missing);
        assert_eq!(eval_with("Q12", &env), FormulaValue::Number(1.0));
    }

    #[test]
    fn compile_reports_identifiers() {
        let f = compile("IF(Q12 > P12, Q12, MIN(Q13, Q12))").unwrap();
        let ids: Vec<String> = f.identifiers().into_iter().collect();
        assert_eq!(ids, vec!["P12", "Q12", "Q13"]);
    }

    #[test]
    fn syntax_error_is_typed_and_positioned() {
        let err = evaluate("IF(Q12 > 1, \"BUY\", \"SELL\"", &Environment::new()).unwrap_err();
        assert_eq!(err.position, 25);
        assert!(err.to_string().contains("at position 25"));
    }

    #[test]
    fn tallest_accepted_tree_evaluates_on_a_worker_stack() {
        let src = format!("Q12{}", "+1".repeat(parser::MAX_HEIGHT - 1));
        let f = compile(&src).unwrap();
        let value = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || f.evaluate(&Environment::new().with("Q12", 1.0)))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(value, FormulaValue::Number(parser::MAX_HEIGHT as f64));
    }

    #[test]
    fn nested_operator_chains_past_the_height_cap_fail_to_compile() {
        let mut src = "Q12".to_string();
        for _ in 0..120 {
            src = format!("({}{})", src, "+1".repeat(1000));
        }
        let err: FormulaSyntaxError = compile(&src).unwrap_err();
        assert!(err.message.contains("tree deeper"), "{}", err);
    }

    #[test]
    fn compiled_formula_is_reusable() {
        let f = compile("Q12 * 2").unwrap();
        assert_eq!(f.evaluate(&Environment::new().with("Q12", 2.0)), FormulaValue::Number(4.0));
        assert_eq!(f.evaluate(&Environment::new().with("Q12", 3.0)), FormulaValue::Number(6.0));
        assert_eq!(f.source(), "Q12 * 2");
    }
}
