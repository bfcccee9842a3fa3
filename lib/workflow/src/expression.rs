//! Expression resolution for node parameters.
//!
//! Parameter strings may embed `{{ … }}` segments that resolve against the
//! run-time scope:
//!
//! - `$json` — output of the immediate upstream node
//! - `$node["id"].json` — output of any prior node, by node id
//! - `$env` — workspace environment variables
//! - `$vars` — workflow-scoped variables
//! - `$input` — the execution's input data
//! - `$item` / `$index` — the current loop item and iteration index
//!
//! The scope never exposes the ambient process environment, the
//! filesystem, or credential values.

use crate::error::ExpressionError;
use crate::node::NodeId;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;

/// Returns true when a string contains a `{{ … }}` expression segment.
#[must_use]
pub fn is_expression(s: &str) -> bool {
    if let Some(open) = s.find("{{") {
        if let Some(close) = s[open..].find("}}") {
            return close > 0;
        }
    }
    false
}

/// The binding scope an expression resolves against.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    input: Option<&'a JsonValue>,
    current: Option<&'a JsonValue>,
    outputs: Option<&'a HashMap<NodeId, JsonValue>>,
    env: Option<&'a JsonMap<String, JsonValue>>,
    vars: Option<&'a JsonMap<String, JsonValue>>,
    item: Option<&'a JsonValue>,
    index: Option<u64>,
}

impl<'a> Scope<'a> {
    /// Creates an empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the execution input (`$input`).
    #[must_use]
    pub fn with_input(mut self, input: &'a JsonValue) -> Self {
        self.input = Some(input);
        self
    }

    /// Sets the immediate upstream output (`$json`).
    #[must_use]
    pub fn with_current(mut self, current: &'a JsonValue) -> Self {
        self.current = Some(current);
        self
    }

    /// Sets the accumulated node output map (`$node["id"].json`).
    #[must_use]
    pub fn with_outputs(mut self, outputs: &'a HashMap<NodeId, JsonValue>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Sets the workspace environment variables (`$env`).
    #[must_use]
    pub fn with_env(mut self, env: &'a JsonMap<String, JsonValue>) -> Self {
        self.env = Some(env);
        self
    }

    /// Sets the workflow variables (`$vars`).
    #[must_use]
    pub fn with_vars(mut self, vars: &'a JsonMap<String, JsonValue>) -> Self {
        self.vars = Some(vars);
        self
    }

    /// Sets the loop context (`$item` / `$index`).
    #[must_use]
    pub fn with_loop(mut self, item: &'a JsonValue, index: u64) -> Self {
        self.item = Some(item);
        self.index = Some(index);
        self
    }
}

/// Resolves a template string.
///
/// When the whole template is a single `{{ … }}` segment the resolved
/// value keeps its JSON type; otherwise segments are stringified into the
/// surrounding text.
///
/// # Errors
///
/// Returns [`ExpressionError::MissingBinding`] for references that do not
/// resolve, and [`ExpressionError::Syntax`] for unparseable segments.
/// Callers resolving optional parameters map `MissingBinding` to `null`.
pub fn evaluate(template: &str, scope: &Scope<'_>) -> Result<JsonValue, ExpressionError> {
    if !is_expression(template) {
        return Ok(JsonValue::String(template.to_string()));
    }

    let trimmed = template.trim();
    if trimmed.starts_with("{{")
        && trimmed.ends_with("}}")
        && trimmed.matches("{{").count() == 1
    {
        let inner = trimmed[2..trimmed.len() - 2].trim();
        return resolve_reference(inner, scope);
    }

    let mut out = String::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            return Err(ExpressionError::Syntax {
                reason: "unterminated '{{'".to_string(),
            });
        };
        let inner = after[..close].trim();
        let value = resolve_reference(inner, scope)?;
        out.push_str(&stringify(&value));
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(JsonValue::String(out))
}

/// Recursively resolves expression strings inside a JSON value.
///
/// Strings containing `{{ … }}` are evaluated; arrays and objects recurse;
/// everything else is returned as-is.
///
/// # Errors
///
/// Propagates resolution errors from embedded expressions.
pub fn evaluate_value(value: &JsonValue, scope: &Scope<'_>) -> Result<JsonValue, ExpressionError> {
    match value {
        JsonValue::String(s) if is_expression(s) => evaluate(s, scope),
        JsonValue::Array(items) => items
            .iter()
            .map(|v| evaluate_value(v, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        JsonValue::Object(map) => {
            let mut out = JsonMap::new();
            for (k, v) in map {
                out.insert(k.clone(), evaluate_value(v, scope)?);
            }
            Ok(JsonValue::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Evaluates a predicate expression to a boolean.
///
/// Supports `lhs OP rhs` with `==`, `!=`, `>=`, `<=`, `>`, `<` and
/// `contains`, where each side is a `$`-reference, a JSON literal, or a
/// bare string. A bare resolved value falls back to JSON truthiness
/// (false/null/0/""/empty are false).
///
/// # Errors
///
/// Returns resolution or syntax errors from the underlying references.
pub fn evaluate_predicate(expression: &str, scope: &Scope<'_>) -> Result<bool, ExpressionError> {
    let mut expr = expression.trim();
    // Predicates may be written with or without the {{ }} wrapper.
    if expr.starts_with("{{") && expr.ends_with("}}") {
        expr = expr[2..expr.len() - 2].trim();
    }
    let expr = expr.trim_start_matches('(').trim_end_matches(')').trim();

    for op in ["==", "!=", ">=", "<=", ">", "<", " contains "] {
        if let Some(pos) = expr.find(op) {
            let lhs = resolve_operand(expr[..pos].trim(), scope)?;
            let rhs = resolve_operand(expr[pos + op.len()..].trim(), scope)?;
            return Ok(compare(&lhs, op.trim(), &rhs));
        }
    }

    let value = resolve_operand(expr, scope)?;
    Ok(truthy(&value))
}

fn resolve_operand(operand: &str, scope: &Scope<'_>) -> Result<JsonValue, ExpressionError> {
    if operand.starts_with('$') {
        return match resolve_reference(operand, scope) {
            Ok(v) => Ok(v),
            // A missing operand compares as null rather than failing the
            // whole predicate.
            Err(ExpressionError::MissingBinding { .. }) => Ok(JsonValue::Null),
            Err(e) => Err(e),
        };
    }
    if let Ok(v) = serde_json::from_str::<JsonValue>(operand) {
        return Ok(v);
    }
    Ok(JsonValue::String(
        operand.trim_matches(|c| c == '\'' || c == '"').to_string(),
    ))
}

fn compare(lhs: &JsonValue, op: &str, rhs: &JsonValue) -> bool {
    match op {
        "==" => loose_eq(lhs, rhs),
        "!=" => !loose_eq(lhs, rhs),
        "contains" => match (lhs, rhs) {
            (JsonValue::String(l), JsonValue::String(r)) => l.contains(r.as_str()),
            (JsonValue::Array(items), needle) => items.iter().any(|v| loose_eq(v, needle)),
            _ => false,
        },
        _ => {
            let (Some(l), Some(r)) = (as_f64(lhs), as_f64(rhs)) else {
                return false;
            };
            match op {
                ">" => l > r,
                ">=" => l >= r,
                "<" => l < r,
                "<=" => l <= r,
                _ => false,
            }
        }
    }
}

fn loose_eq(lhs: &JsonValue, rhs: &JsonValue) -> bool {
    if lhs == rhs {
        return true;
    }
    if let (Some(l), Some(r)) = (as_f64(lhs), as_f64(rhs)) {
        return l == r;
    }
    false
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

fn resolve_reference(reference: &str, scope: &Scope<'_>) -> Result<JsonValue, ExpressionError> {
    let missing = || ExpressionError::MissingBinding {
        reference: reference.to_string(),
    };

    if let Some(rest) = reference.strip_prefix("$json") {
        let base = scope.current.ok_or_else(missing)?;
        return walk(base, rest).cloned().ok_or_else(missing);
    }

    if let Some(rest) = reference.strip_prefix("$node[") {
        let close = rest.find(']').ok_or_else(|| ExpressionError::Syntax {
            reason: format!("missing ']' in {reference}"),
        })?;
        let node_id = rest[..close].trim_matches(|c| c == '"' || c == '\'');
        let mut path = &rest[close + 1..];
        path = path.strip_prefix(".json").unwrap_or(path);

        let outputs = scope.outputs.ok_or_else(missing)?;
        let base = outputs.get(&NodeId::new(node_id)).ok_or_else(missing)?;
        return walk(base, path).cloned().ok_or_else(missing);
    }

    if let Some(rest) = reference.strip_prefix("$env") {
        let env = scope.env.ok_or_else(missing)?;
        let base = JsonValue::Object(env.clone());
        return walk(&base, rest).cloned().ok_or_else(missing);
    }

    if let Some(rest) = reference.strip_prefix("$vars") {
        let vars = scope.vars.ok_or_else(missing)?;
        let base = JsonValue::Object(vars.clone());
        return walk(&base, rest).cloned().ok_or_else(missing);
    }

    if let Some(rest) = reference.strip_prefix("$input") {
        let base = scope.input.ok_or_else(missing)?;
        return walk(base, rest).cloned().ok_or_else(missing);
    }

    if let Some(rest) = reference.strip_prefix("$item") {
        let base = scope.item.ok_or_else(missing)?;
        return walk(base, rest).cloned().ok_or_else(missing);
    }

    if reference == "$index" {
        let index = scope.index.ok_or_else(missing)?;
        return Ok(JsonValue::from(index));
    }

    Err(ExpressionError::Syntax {
        reason: format!("unknown reference '{reference}'"),
    })
}

/// Walks a dotted path (`.a.b.0`) into a JSON value. An empty path returns
/// the base value.
fn walk<'v>(base: &'v JsonValue, path: &str) -> Option<&'v JsonValue> {
    let path = path.trim();
    if path.is_empty() {
        return Some(base);
    }

    let mut current = base;
    for segment in path.trim_start_matches('.').split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_expressions() {
        assert!(is_expression("{{ $json.a }}"));
        assert!(is_expression("prefix {{ $env.HOST }} suffix"));
        assert!(!is_expression("plain text"));
        assert!(!is_expression("{{ unterminated"));
    }

    #[test]
    fn whole_segment_keeps_json_type() {
        let current = json!({"count": 7, "nested": {"flag": true}});
        let scope = Scope::new().with_current(&current);

        assert_eq!(evaluate("{{ $json.count }}", &scope).unwrap(), json!(7));
        assert_eq!(
            evaluate("{{ $json.nested.flag }}", &scope).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn embedded_segments_stringify() {
        let current = json!({"name": "orders", "count": 3});
        let scope = Scope::new().with_current(&current);

        let result = evaluate("{{ $json.count }} items in {{ $json.name }}", &scope).unwrap();
        assert_eq!(result, json!("3 items in orders"));
    }

    #[test]
    fn node_reference_resolves_prior_output() {
        let mut outputs = HashMap::new();
        outputs.insert(NodeId::new("fetch"), json!({"status": 200}));
        let scope = Scope::new().with_outputs(&outputs);

        assert_eq!(
            evaluate("{{ $node[\"fetch\"].json.status }}", &scope).unwrap(),
            json!(200)
        );
    }

    #[test]
    fn env_vars_input_and_loop_references() {
        let env: JsonMap<String, JsonValue> =
            [("HOST".to_string(), json!("api.example.com"))].into_iter().collect();
        let vars: JsonMap<String, JsonValue> =
            [("region".to_string(), json!("eu"))].into_iter().collect();
        let input = json!({"order": 42});
        let item = json!({"sku": "A-1"});
        let scope = Scope::new()
            .with_env(&env)
            .with_vars(&vars)
            .with_input(&input)
            .with_loop(&item, 2);

        assert_eq!(evaluate("{{ $env.HOST }}", &scope).unwrap(), json!("api.example.com"));
        assert_eq!(evaluate("{{ $vars.region }}", &scope).unwrap(), json!("eu"));
        assert_eq!(evaluate("{{ $input.order }}", &scope).unwrap(), json!(42));
        assert_eq!(evaluate("{{ $item.sku }}", &scope).unwrap(), json!("A-1"));
        assert_eq!(evaluate("{{ $index }}", &scope).unwrap(), json!(2));
    }

    #[test]
    fn missing_reference_errors() {
        let current = json!({"a": 1});
        let scope = Scope::new().with_current(&current);

        let err = evaluate("{{ $json.absent }}", &scope).unwrap_err();
        assert!(matches!(err, ExpressionError::MissingBinding { .. }));
    }

    #[test]
    fn unknown_reference_is_syntax_error() {
        let scope = Scope::new();
        let err = evaluate("{{ $bogus }}", &scope).unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { .. }));
    }

    #[test]
    fn evaluate_value_recurses_into_objects_and_arrays() {
        let current = json!({"x": 5});
        let scope = Scope::new().with_current(&current);
        let value = json!({
            "static": 1,
            "dynamic": "{{ $json.x }}",
            "list": ["{{ $json.x }}", "plain"]
        });

        let resolved = evaluate_value(&value, &scope).unwrap();
        assert_eq!(resolved, json!({"static": 1, "dynamic": 5, "list": [5, "plain"]}));
    }

    #[test]
    fn predicate_comparisons() {
        let current = json!({"x": 3, "name": "abc"});
        let scope = Scope::new().with_current(&current);

        assert!(!evaluate_predicate("($json.x > 10)", &scope).unwrap());
        assert!(evaluate_predicate("$json.x <= 3", &scope).unwrap());
        assert!(evaluate_predicate("$json.name == \"abc\"", &scope).unwrap());
        assert!(evaluate_predicate("$json.name contains \"b\"", &scope).unwrap());
        assert!(evaluate_predicate("{{ $json.x == 3 }}", &scope).unwrap());
    }

    #[test]
    fn predicate_truthiness_fallback() {
        let current = json!({"present": "yes", "empty": "", "zero": 0});
        let scope = Scope::new().with_current(&current);

        assert!(evaluate_predicate("$json.present", &scope).unwrap());
        assert!(!evaluate_predicate("$json.empty", &scope).unwrap());
        assert!(!evaluate_predicate("$json.zero", &scope).unwrap());
        // Missing operands are null, which is falsy.
        assert!(!evaluate_predicate("$json.absent", &scope).unwrap());
    }

    #[test]
    fn array_index_paths() {
        let current = json!({"items": [{"id": 1}, {"id": 2}]});
        let scope = Scope::new().with_current(&current);

        assert_eq!(evaluate("{{ $json.items.1.id }}", &scope).unwrap(), json!(2));
    }
}
