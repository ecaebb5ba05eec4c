//! Input resolution: materialize a block's params immediately before
//! invocation by substituting `{{ ... }}` references against prior outputs,
//! the injected environment, and the innermost loop binding.
//!
//! The resolver is pure: it reads the scope, never mutates it, and performs
//! no I/O. A reference to a block that has not executed yet fails with
//! [`ErrorKind::UnresolvedReference`], which the executor treats as "not
//! runnable yet" rather than as an error; it never surfaces to callers.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{EngineError, ErrorKind};
use crate::handler::LoopBinding;
use crate::model::normalize_name;

fn unresolved(reference: &str) -> EngineError {
    EngineError::new(
        ErrorKind::UnresolvedReference,
        format!("unresolved reference {{{{ {reference} }}}}"),
    )
}

/// Read-only view of the run state a single resolution works against.
pub struct ResolveScope<'a> {
    /// Normalized block name -> block id.
    pub names: &'a HashMap<String, String>,
    /// Executed block id -> output projection.
    pub outputs: &'a HashMap<String, Value>,
    /// Injected environment values for `{{ env.KEY }}`.
    pub env: &'a HashMap<String, String>,
    /// Innermost loop binding for `{{ loop.index }}` / `{{ loop.currentItem }}`.
    pub loop_binding: Option<&'a LoopBinding>,
}

/// Resolve every templated value in a block's params.
pub fn resolve_params(
    params: &Map<String, Value>,
    scope: &ResolveScope<'_>,
) -> Result<Map<String, Value>, EngineError> {
    let mut resolved = Map::new();
    for (key, value) in params {
        resolved.insert(key.clone(), resolve_value(value, scope)?);
    }
    Ok(resolved)
}

/// Resolve a single value: strings are scanned for references, composites
/// recurse, everything else passes through.
pub fn resolve_value(value: &Value, scope: &ResolveScope<'_>) -> Result<Value, EngineError> {
    match value {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(input: &str, scope: &ResolveScope<'_>) -> Result<Value, EngineError> {
    // Whole-value reference: the substituted value keeps its type.
    let trimmed = input.trim();
    if let Some(inner) = single_reference(trimmed) {
        return lookup(inner.trim(), scope);
    }

    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        let Some(end_rel) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + end_rel;
        out.push_str(&rest[..start]);
        let reference = rest[start + 2..end].trim();
        out.push_str(&splice_text(&lookup(reference, scope)?));
        rest = &rest[end + 2..];
    }
    if out.is_empty() && rest.len() == input.len() {
        return Ok(Value::String(input.to_string()));
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// When `s` is exactly one `{{ ... }}` reference, return its inner path.
fn single_reference(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

/// Spliced (in-string) form of a substituted value: strings verbatim,
/// composites as JSON.
fn splice_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn lookup(reference: &str, scope: &ResolveScope<'_>) -> Result<Value, EngineError> {
    let mut segments = reference.split('.').map(str::trim);
    let Some(head) = segments.next().filter(|s| !s.is_empty()) else {
        return Err(unresolved(reference));
    };
    let rest: Vec<&str> = segments.collect();

    match head {
        "env" => {
            let key = rest.join(".");
            Ok(scope
                .env
                .get(&key)
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null))
        }
        "loop" => Ok(resolve_loop_segment(&rest, scope.loop_binding)),
        name => {
            let id = scope
                .names
                .get(&normalize_name(name))
                .map(String::as_str)
                // Ids are accepted anywhere a name is.
                .unwrap_or(name);
            let Some(output) = scope.outputs.get(id) else {
                return Err(unresolved(reference));
            };
            Ok(walk_path(output, &rest))
        }
    }
}

fn resolve_loop_segment(rest: &[&str], binding: Option<&LoopBinding>) -> Value {
    let Some(binding) = binding else {
        return Value::Null;
    };
    match rest {
        ["index", tail @ ..] if tail.is_empty() => Value::Number(binding.index.into()),
        ["currentItem", tail @ ..] => {
            let item = binding.current_item.clone().unwrap_or(Value::Null);
            walk_path(&item, tail)
        }
        _ => Value::Null,
    }
}

/// Walk dotted segments into a value; array segments may be numeric indices.
/// A missing path resolves to null rather than blocking the run.
fn walk_path(value: &Value, segments: &[&str]) -> Value {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => match map.get(*segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// Field-name patterns whose values never reach the trace.
const SECRET_SUFFIXES: [&str; 3] = ["apikey", "token", "secret"];
const REDACTED: &str = "***";

pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    lower == "password" || SECRET_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// Deep-copy `value` with every secret-named field scrubbed. Span
/// construction uses this copy, never the live value.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if is_secret_key(k) {
                    out.insert(k.clone(), Value::String(REDACTED.into()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope_fixture() -> (
        HashMap<String, String>,
        HashMap<String, Value>,
        HashMap<String, String>,
    ) {
        let names = HashMap::from([("fetch data".to_string(), "b1".to_string())]);
        let outputs = HashMap::from([(
            "b1".to_string(),
            json!({"status": 200, "body": {"items": [10, 20]}}),
        )]);
        let env = HashMap::from([("REGION".to_string(), "eu-west-1".to_string())]);
        (names, outputs, env)
    }

    #[test]
    fn whole_value_reference_preserves_type() {
        let (names, outputs, env) = scope_fixture();
        let scope = ResolveScope {
            names: &names,
            outputs: &outputs,
            env: &env,
            loop_binding: None,
        };
        let v = resolve_value(&json!("{{ Fetch Data.body.items }}"), &scope).unwrap();
        assert_eq!(v, json!([10, 20]));
        let n = resolve_value(&json!("{{ Fetch Data.status }}"), &scope).unwrap();
        assert_eq!(n, json!(200));
    }

    #[test]
    fn embedded_references_splice_as_text() {
        let (names, outputs, env) = scope_fixture();
        let scope = ResolveScope {
            names: &names,
            outputs: &outputs,
            env: &env,
            loop_binding: None,
        };
        let v = resolve_value(
            &json!("status={{fetch data.status}} items={{fetch data.body.items}}"),
            &scope,
        )
        .unwrap();
        assert_eq!(v, json!("status=200 items=[10,20]"));
    }

    #[test]
    fn env_and_loop_references() {
        let (names, outputs, env) = scope_fixture();
        let binding = LoopBinding {
            loop_id: "l1".into(),
            index: 2,
            current_item: Some(json!({"id": "x"})),
        };
        let scope = ResolveScope {
            names: &names,
            outputs: &outputs,
            env: &env,
            loop_binding: Some(&binding),
        };
        assert_eq!(
            resolve_value(&json!("{{ env.REGION }}"), &scope).unwrap(),
            json!("eu-west-1")
        );
        assert_eq!(
            resolve_value(&json!("{{ loop.index }}"), &scope).unwrap(),
            json!(2)
        );
        assert_eq!(
            resolve_value(&json!("{{ loop.currentItem.id }}"), &scope).unwrap(),
            json!("x")
        );
    }

    #[test]
    fn unexecuted_block_reference_is_unresolved() {
        let (names, outputs, env) = scope_fixture();
        let scope = ResolveScope {
            names: &names,
            outputs: &outputs,
            env: &env,
            loop_binding: None,
        };
        let err = resolve_value(&json!("{{ Later Block.field }}"), &scope).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedReference);
        assert!(err.message.contains("Later Block"));
    }

    #[test]
    fn missing_path_inside_executed_output_is_null() {
        let (names, outputs, env) = scope_fixture();
        let scope = ResolveScope {
            names: &names,
            outputs: &outputs,
            env: &env,
            loop_binding: None,
        };
        assert_eq!(
            resolve_value(&json!("{{ fetch data.body.missing }}"), &scope).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn params_without_templates_pass_through() {
        let (names, outputs, env) = scope_fixture();
        let scope = ResolveScope {
            names: &names,
            outputs: &outputs,
            env: &env,
            loop_binding: None,
        };
        let mut params = Map::new();
        params.insert("count".into(), json!(7));
        params.insert("flag".into(), json!(true));
        let resolved = resolve_params(&params, &scope).unwrap();
        assert_eq!(resolved["count"], 7);
        assert_eq!(resolved["flag"], true);
    }

    #[test]
    fn redaction_scrubs_secret_patterns() {
        let value = json!({
            "url": "https://api.example.com",
            "openaiApiKey": "sk-123",
            "authToken": "t-1",
            "clientSecret": "s-1",
            "password": "hunter2",
            "nested": {"refresh_token": "r-1"},
        });
        let redacted = redact(&value);
        assert_eq!(redacted["url"], "https://api.example.com");
        for key in ["openaiApiKey", "authToken", "clientSecret", "password"] {
            assert_eq!(redacted[key], "***", "{key} should be redacted");
        }
        assert_eq!(redacted["nested"]["refresh_token"], "***");
    }
}
