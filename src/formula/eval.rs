use super::Environment;
use super::parser::{BinaryOp, Expr, Function, UnaryOp};
use super::value::FormulaValue;
use std::cmp::Ordering;

/// Evaluate a parsed expression. Total: every input yields a value.
pub fn eval(expr: &Expr, env: &Environment) -> FormulaValue {
    match expr {
        Expr::Number(n) => FormulaValue::Number(*n),
        Expr::Text(s) => FormulaValue::Text(s.clone()),
        Expr::Bool(b) => FormulaValue::Bool(*b),
        Expr::Ident(name) => env.get(name).cloned().unwrap_or(FormulaValue::Missing),
        Expr::Unary { op, expr } => {
            let v = eval(expr, env);
            match (op, v.as_number()) {
                (_, None) => FormulaValue::Missing,
                (UnaryOp::Neg, Some(n)) => FormulaValue::Number(-n),
                (UnaryOp::Plus, Some(n)) => FormulaValue::Number(n),
            }
        }
        Expr::Binary { op, left, right } => binary(*op, eval(left, env), eval(right, env)),
        Expr::Call { func, args } => call(*func, args, env),
    }
}

fn binary(op: BinaryOp, left: FormulaValue, right: FormulaValue) -> FormulaValue {
    // IEEE semantics: x/0 is ±inf, 0/0 is NaN
    match op {
        BinaryOp::Add => arithmetic(&left, &right, |a, b| a + b),
        BinaryOp::Sub => arithmetic(&left, &right, |a, b| a - b),
        BinaryOp::Mul => arithmetic(&left, &right, |a, b| a * b),
        BinaryOp::Div => arithmetic(&left, &right, |a, b| a / b),
        BinaryOp::Eq => compare(&left, &right, |o| o == Some(Ordering::Equal)),
        BinaryOp::Ne => compare(&left, &right, |o| o != Some(Ordering::Equal)),
        BinaryOp::Lt => compare(&left, &right, |o| o == Some(Ordering::Less)),
        BinaryOp::Le => compare(&left, &right, |o| {
            matches!(o, Some(Ordering::Less | Ordering::Equal))
        }),
        BinaryOp::Gt => compare(&left, &right, |o| o == Some(Ordering::Greater)),
        BinaryOp::Ge => compare(&left, &right, |o| {
            matches!(o, Some(Ordering::Greater | Ordering::Equal))
        }),
    }
}

fn arithmetic(left: &FormulaValue, right: &FormulaValue, f: impl Fn(f64, f64) -> f64) -> FormulaValue {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => FormulaValue::Number(f(a, b)),
        _ => FormulaValue::Missing,
    }
}

fn compare(
    left: &FormulaValue,
    right: &FormulaValue,
    test: impl Fn(Option<Ordering>) -> bool,
) -> FormulaValue {
    if left.is_missing() || right.is_missing() {
        return FormulaValue::Missing;
    }
    FormulaValue::Bool(test(left.compare(right)))
}

fn arg(args: &[Expr], index: usize, env: &Environment) -> FormulaValue {
    args.get(index).map_or(FormulaValue::Missing, |a| eval(a, env))
}

fn call(func: Function, args: &[Expr], env: &Environment) -> FormulaValue {
    match func {
        Function::If => {
            let Some(cond) = arg(args, 0, env).truthiness() else {
                return FormulaValue::Missing;
            };
            match (cond, args.get(2)) {
                (true, _) => arg(args, 1, env),
                (false, Some(otherwise)) => eval(otherwise, env),
                (false, None) => FormulaValue::Bool(false),
            }
        }
        // Kleene logic: a definite false (AND) / true (OR) wins over missing
        Function::And => {
            let mut missing = false;
            for arg in args {
                match eval(arg, env).truthiness() {
                    Some(false) => return FormulaValue::Bool(false),
                    Some(true) => {}
                    None => missing = true,
                }
            }
            if missing { FormulaValue::Missing } else { FormulaValue::Bool(true) }
        }
        Function::Or => {
            let mut missing = false;
            for arg in args {
                match eval(arg, env).truthiness() {
                    Some(true) => return FormulaValue::Bool(true),
                    Some(false) => {}
                    None => missing = true,
                }
            }
            if missing { FormulaValue::Missing } else { FormulaValue::Bool(false) }
        }
        Function::Not => match arg(args, 0, env).truthiness() {
            Some(b) => FormulaValue::Bool(!b),
            None => FormulaValue::Missing,
        },
        Function::IsNumber => {
            let v = arg(args, 0, env);
            FormulaValue::Bool(matches!(v, FormulaValue::Number(n) if !n.is_nan()))
        }
        Function::Min => {
            let mut min = f64::INFINITY;
            for arg in args {
                let Some(n) = eval(arg, env).as_number() else {
                    return FormulaValue::Missing;
                };
                if n.is_nan() {
                    return FormulaValue::Number(f64::NAN);
                }
                min = min.min(n);
            }
            FormulaValue::Number(min)
        }
        Function::Abs => match arg(args, 0, env).as_number() {
            Some(n) => FormulaValue::Number(n.abs()),
            None => FormulaValue::Missing,
        },
    }
}
