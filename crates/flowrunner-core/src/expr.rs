//! Small bridge between JSON values and `evalexpr` used by the condition,
//! router, and function handlers. Variables are exposed under dotted names
//! (`input.n`, `payload.items.0`); composite values are additionally bound at
//! their own name as JSON text so they can be compared wholesale.

use evalexpr::{
    ContextWithMutableVariables as _, HashMapContext, Value as ExprValue, eval_with_context,
};
use serde_json::{Number, Value};

/// Evaluate `expression` with the given variables in scope.
pub fn evaluate(expression: &str, vars: &[(String, Value)]) -> Result<Value, String> {
    let mut context = HashMapContext::new();
    for (name, value) in vars {
        context
            .set_value(name.clone(), to_expr_value(value))
            .map_err(|e| format!("binding {name:?}: {e}"))?;
    }
    let result =
        eval_with_context(expression, &context).map_err(|e| format!("{expression:?}: {e}"))?;
    Ok(from_expr_value(result))
}

/// Evaluate an expression expected to yield a Boolean. Numbers fall back to
/// zero/non-zero truthiness; anything else is an error.
pub fn evaluate_bool(expression: &str, vars: &[(String, Value)]) -> Result<bool, String> {
    match evaluate(expression, vars)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        other => Err(format!(
            "{expression:?} evaluated to non-boolean {other}"
        )),
    }
}

/// Flatten a JSON value into dotted variable bindings rooted at `prefix`.
/// Objects and arrays recurse; each composite is also bound at its own prefix
/// as JSON text.
pub fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            out.push((prefix.to_string(), Value::String(value.to_string())));
            for (key, child) in map {
                flatten(&format!("{prefix}.{key}"), child, out);
            }
        }
        Value::Array(items) => {
            out.push((prefix.to_string(), Value::String(value.to_string())));
            for (i, child) in items.iter().enumerate() {
                flatten(&format!("{prefix}.{i}"), child, out);
            }
        }
        other => out.push((prefix.to_string(), other.clone())),
    }
}

fn to_expr_value(value: &Value) -> ExprValue {
    match value {
        Value::Null => ExprValue::Empty,
        Value::Bool(b) => ExprValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ExprValue::Int(i)
            } else {
                ExprValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => ExprValue::String(s.clone()),
        composite => ExprValue::String(composite.to_string()),
    }
}

fn from_expr_value(value: ExprValue) -> Value {
    match value {
        ExprValue::Empty => Value::Null,
        ExprValue::Boolean(b) => Value::Bool(b),
        ExprValue::Int(i) => Value::Number(i.into()),
        ExprValue::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ExprValue::String(s) => Value::String(s),
        ExprValue::Tuple(items) => Value::Array(items.into_iter().map(from_expr_value).collect()),
    }
}
