// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step condition evaluation.
//!
//! Conditions are opaque to the core beyond truthiness and identity:
//!
//! - `true` / `false`: taken as is
//! - `"path.to.var"`: truthiness of the variable at that dotted path,
//!   `"!path"` negates, `"true"` / `"false"` are literals
//! - `{"var": "path", "equals": <value>}`: identity comparison
//! - anything else: truthiness of the value itself

use serde_json::Value;

/// Evaluate `condition` against execution `variables`.
pub fn evaluate(condition: &Value, variables: &Value) -> bool {
    match condition {
        Value::Bool(b) => *b,
        Value::String(expr) => evaluate_expr(expr.trim(), variables),
        Value::Object(obj) if obj.contains_key("var") => {
            let resolved = obj
                .get("var")
                .and_then(Value::as_str)
                .and_then(|path| lookup(variables, path));
            match obj.get("equals") {
                Some(expected) => resolved == Some(expected),
                None => resolved.is_some_and(is_truthy),
            }
        }
        other => is_truthy(other),
    }
}

fn evaluate_expr(expr: &str, variables: &Value) -> bool {
    if let Some(rest) = expr.strip_prefix('!') {
        return !evaluate_expr(rest.trim(), variables);
    }
    match expr {
        "true" => true,
        "false" | "" => false,
        path => lookup(variables, path).is_some_and(is_truthy),
    }
}

/// Resolve a dotted path (`steps.fetch.status`) inside `root`.
/// Numeric segments index into arrays.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// `null`, `false`, `0`, and empty strings, arrays and objects are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Value {
        json!({
            "region": "eu",
            "enabled": true,
            "threshold": 0,
            "hosts": ["a", "b"],
            "steps": {"check": {"healthy": false, "count": 3}}
        })
    }

    #[test]
    fn test_literals() {
        assert!(evaluate(&json!(true), &vars()));
        assert!(!evaluate(&json!(false), &vars()));
        assert!(evaluate(&json!("true"), &vars()));
        assert!(!evaluate(&json!("false"), &vars()));
        assert!(!evaluate(&Value::Null, &vars()));
    }

    #[test]
    fn test_variable_paths() {
        assert!(evaluate(&json!("enabled"), &vars()));
        assert!(!evaluate(&json!("threshold"), &vars()));
        assert!(!evaluate(&json!("steps.check.healthy"), &vars()));
        assert!(evaluate(&json!("!steps.check.healthy"), &vars()));
        assert!(evaluate(&json!("steps.check.count"), &vars()));
        assert!(evaluate(&json!("hosts.1"), &vars()));
        assert!(!evaluate(&json!("hosts.5"), &vars()));
        assert!(!evaluate(&json!("missing.path"), &vars()));
    }

    #[test]
    fn test_equals() {
        assert!(evaluate(&json!({"var": "region", "equals": "eu"}), &vars()));
        assert!(!evaluate(&json!({"var": "region", "equals": "us"}), &vars()));
        assert!(evaluate(
            &json!({"var": "steps.check.count", "equals": 3}),
            &vars()
        ));
        assert!(!evaluate(&json!({"var": "missing", "equals": null}), &vars()));
    }
}
