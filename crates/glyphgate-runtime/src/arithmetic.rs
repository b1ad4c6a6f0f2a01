//! Evaluator for recognized arithmetic captions such as `3+4*2=?`.
//!
//! Parenthesized groups are reduced innermost first, then multiplication
//! and division left to right, then runs of signs are collapsed and the
//! remaining signed terms are summed. The result is truncated to an integer.

use regex::Regex;
use std::sync::LazyLock;

static INNER_GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^()]*)\)").expect("static regex"));

static MUL_DIV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?\d+(?:\.\d+)?)([*/])([+-]?\d+(?:\.\d+)?)").expect("static regex")
});

static TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[+-]?\d+(?:\.\d+)?").expect("static regex"));

/// True if `text` looks like an expression worth evaluating.
pub fn is_expression(text: &str) -> bool {
    text.contains(['+', '-', '*', '/', '='])
}

/// Evaluate `text`; `None` when no number can be produced.
pub fn evaluate(text: &str) -> Option<i64> {
    let expr = strip(text);
    if expr.is_empty() {
        return None;
    }

    let mut expr = expr;
    while let Some(caps) = INNER_GROUP.captures(&expr) {
        let whole = caps.get(0)?;
        let value = eval_flat(&caps[1])?;
        expr.replace_range(whole.range(), &format_signed(value));
    }

    eval_flat(&expr).map(|v| v.trunc() as i64)
}

/// Evaluate `text` and render the integer, or return it unchanged.
pub fn evaluate_or_raw(text: &str) -> String {
    evaluate(text).map_or_else(|| text.to_string(), |v| v.to_string())
}

fn strip(text: &str) -> String {
    let left = match text.split_once('=') {
        Some((lhs, rhs)) if lhs.trim().is_empty() => rhs,
        Some((lhs, _)) => lhs,
        None => text,
    };
    left.chars()
        .filter(|c| !c.is_whitespace() && *c != '?')
        .map(|c| match c {
            'x' | 'X' | '×' => '*',
            '÷' => '/',
            other => other,
        })
        .collect()
}

fn eval_flat(expr: &str) -> Option<f64> {
    let mut expr = expr.to_string();
    while let Some(caps) = MUL_DIV.captures(&expr) {
        let whole = caps.get(0)?;
        let lhs: f64 = caps[1].parse().ok()?;
        let rhs: f64 = caps[3].parse().ok()?;
        let value = match &caps[2] {
            "*" => lhs * rhs,
            _ if rhs == 0.0 => return None,
            _ => lhs / rhs,
        };
        expr.replace_range(whole.range(), &format_signed(value));
    }

    let expr = collapse_signs(&expr);
    let mut terms = TERM.find_iter(&expr).peekable();
    terms.peek()?;
    terms.map(|m| m.as_str().parse::<f64>().ok()).sum()
}

fn collapse_signs(expr: &str) -> String {
    let mut out = expr.to_string();
    loop {
        let next = out
            .replace("--", "+")
            .replace("++", "+")
            .replace("+-", "-")
            .replace("-+", "-");
        if next == out {
            return out;
        }
        out = next;
    }
}

/// Always carry an explicit sign so the replacement splices cleanly into
/// the surrounding expression.
fn format_signed(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        format!("{:+}", value as i64)
    } else {
        format!("{:+}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_sums() {
        assert_eq!(evaluate("1+2="), Some(3));
        assert_eq!(evaluate("9-4=?"), Some(5));
        assert_eq!(evaluate("5--3"), Some(8));
    }

    #[test]
    fn test_precedence() {
        assert_eq!(evaluate("9-3*2"), Some(3));
        assert_eq!(evaluate("3+4*2"), Some(11));
        assert_eq!(evaluate("8/2/2"), Some(2));
        assert_eq!(evaluate("3-2*-2"), Some(7));
    }

    #[test]
    fn test_parentheses() {
        assert_eq!(evaluate("3*(2+4)"), Some(18));
        assert_eq!(evaluate("2*(1-3)"), Some(-4));
        assert_eq!(evaluate("(1+(2*3))*2"), Some(14));
    }

    #[test]
    fn test_truncates() {
        assert_eq!(evaluate("7/2"), Some(3));
        assert_eq!(evaluate("-7/2"), Some(-3));
    }

    #[test]
    fn test_alternate_operators() {
        assert_eq!(evaluate("3x4="), Some(12));
        assert_eq!(evaluate("8÷4"), Some(2));
    }

    #[test]
    fn test_no_number() {
        assert_eq!(evaluate("+=?"), None);
        assert_eq!(evaluate(""), None);
        assert_eq!(evaluate("4/0"), None);
        assert_eq!(evaluate_or_raw("+="), "+=");
        assert_eq!(evaluate_or_raw("6*7="), "42");
    }

    #[test]
    fn test_is_expression() {
        assert!(is_expression("1+1"));
        assert!(is_expression("="));
        assert!(!is_expression("abcd"));
    }
}
