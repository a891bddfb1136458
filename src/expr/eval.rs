//! Comparison-expression evaluator: `path (OP literal)?`.

use serde_json::Value;

use super::get_path;
use crate::error::StepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// A parsed expression: either a bare path (truthiness check) or a
/// comparison of a path against a literal.
#[derive(Debug, Clone)]
pub enum Expr {
    Truthy(String),
    Compare { path: String, op: Op, literal: Value },
    Literal(bool),
}

impl Expr {
    /// Parse an expression string. Operators are searched longest-first so
    /// `>=` is not read as `>` followed by `=`.
    pub fn parse(expression: &str) -> Result<Expr, StepError> {
        let expr = expression.trim();
        if expr.is_empty() || expr == "true" {
            return Ok(Expr::Literal(true));
        }
        if expr == "false" {
            return Ok(Expr::Literal(false));
        }

        for (token, op) in [
            ("==", Op::Eq),
            ("!=", Op::Ne),
            (">=", Op::Ge),
            ("<=", Op::Le),
            (">", Op::Gt),
            ("<", Op::Lt),
        ] {
            if let Some(pos) = expr.find(token) {
                let path = expr[..pos].trim().to_string();
                let raw = expr[pos + token.len()..].trim();
                let literal = parse_literal(raw).ok_or_else(|| {
                    StepError::TemplateRender(format!("invalid literal in expression: {raw}"))
                })?;
                return Ok(Expr::Compare { path, op, literal });
            }
        }

        Ok(Expr::Truthy(expr.to_string()))
    }

    pub fn evaluate(&self, data: &Value) -> bool {
        match self {
            Expr::Literal(value) => *value,
            Expr::Truthy(path) => get_path(data, path).map(is_truthy).unwrap_or(false),
            Expr::Compare { path, op, literal } => {
                let left = get_path(data, path).cloned().unwrap_or(Value::Null);
                match op {
                    Op::Eq => loose_eq(&left, literal),
                    Op::Ne => !loose_eq(&left, literal),
                    Op::Gt => numeric_cmp(&left, literal, |a, b| a > b),
                    Op::Lt => numeric_cmp(&left, literal, |a, b| a < b),
                    Op::Ge => numeric_cmp(&left, literal, |a, b| a >= b),
                    Op::Le => numeric_cmp(&left, literal, |a, b| a <= b),
                }
            }
        }
    }
}

/// Parse and evaluate in one call.
pub fn evaluate_bool(expression: &str, data: &Value) -> Result<bool, StepError> {
    Ok(Expr::parse(expression)?.evaluate(data))
}

/// Evaluate an expression to its referenced value (used by templates): a
/// bare path yields the value at that path, a comparison yields a boolean.
pub fn evaluate(expression: &str, data: &Value) -> Option<Value> {
    match Expr::parse(expression).ok()? {
        Expr::Literal(b) => Some(Value::Bool(b)),
        Expr::Truthy(path) => get_path(data, &path).cloned(),
        expr @ Expr::Compare { .. } => Some(Value::Bool(expr.evaluate(data))),
    }
}

/// Standard JS truthiness over JSON values.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn parse_literal(raw: &str) -> Option<Value> {
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Some(Value::String(raw[1..raw.len() - 1].to_string()));
    }
    match raw {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    raw.parse::<f64>().ok().and_then(|n| {
        if n.fract() == 0.0 && raw.parse::<i64>().is_ok() {
            Some(Value::Number(raw.parse::<i64>().ok()?.into()))
        } else {
            serde_json::Number::from_f64(n).map(Value::Number)
        }
    })
}

/// Equality with the same cross-type coercions the condition steps rely on:
/// numbers compare by value, numeric strings compare against numbers,
/// `"true"`/`"false"` compare against booleans.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.parse::<f64>().ok() == n.as_f64()
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            match s.to_lowercase().as_str() {
                "true" => *b,
                "false" => !*b,
                _ => false,
            }
        }
        _ => false,
    }
}

fn numeric_cmp(left: &Value, right: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_expressions() {
        assert!(evaluate_bool("true", &json!({})).unwrap());
        assert!(!evaluate_bool("false", &json!({})).unwrap());
        assert!(evaluate_bool("", &json!({})).unwrap());
    }

    #[test]
    fn test_bare_path_truthiness() {
        let data = json!({"flag": true, "count": 0, "name": "", "items": []});
        assert!(evaluate_bool("$.flag", &data).unwrap());
        assert!(!evaluate_bool("$.count", &data).unwrap());
        assert!(!evaluate_bool("$.name", &data).unwrap());
        // Arrays and objects are truthy even when empty, as in JS.
        assert!(evaluate_bool("$.items", &data).unwrap());
        assert!(!evaluate_bool("$.missing", &data).unwrap());
    }

    #[test]
    fn test_numeric_comparison() {
        let data = json!({"x": 11});
        assert!(evaluate_bool("$.x > 10", &data).unwrap());
        assert!(!evaluate_bool("$.x > 11", &data).unwrap());
        assert!(evaluate_bool("$.x >= 11", &data).unwrap());
        assert!(evaluate_bool("$.x <= 11", &data).unwrap());
        assert!(!evaluate_bool("$.x < 11", &data).unwrap());
    }

    #[test]
    fn test_string_number_coercion() {
        let data = json!({"score": "100"});
        assert!(evaluate_bool("$.score > 60", &data).unwrap());
        assert!(evaluate_bool("$.score == 100", &data).unwrap());
    }

    #[test]
    fn test_equality_with_literals() {
        let data = json!({"status": "open", "done": false, "n": null});
        assert!(evaluate_bool("$.status == \"open\"", &data).unwrap());
        assert!(evaluate_bool("$.status != 'closed'", &data).unwrap());
        assert!(evaluate_bool("$.done == false", &data).unwrap());
        assert!(evaluate_bool("$.n == null", &data).unwrap());
    }

    #[test]
    fn test_missing_path_comparisons() {
        let data = json!({});
        assert!(evaluate_bool("$.missing == null", &data).unwrap());
        assert!(!evaluate_bool("$.missing > 0", &data).unwrap());
    }

    #[test]
    fn test_ge_not_parsed_as_gt() {
        let data = json!({"x": 10});
        assert!(evaluate_bool("$.x >= 10", &data).unwrap());
    }

    #[test]
    fn test_evaluate_returns_value() {
        let data = json!({"user": {"name": "Ada"}});
        assert_eq!(evaluate("$.user.name", &data), Some(json!("Ada")));
        assert_eq!(evaluate("$.user.name == 'Ada'", &data), Some(json!(true)));
        assert_eq!(evaluate("$.nope", &data), None);
    }
}
