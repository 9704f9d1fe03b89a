//! Layered configuration resolution.
//!
//! Merges an ordered list of partial config maps into one effective map
//! (later layers override earlier ones), then runs a single
//! environment-variable expansion pass over the fully merged result.
//! Expanding after the merge keeps a variable reference from being resolved
//! differently in different layers.

use std::env;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// `${VAR}` or `${VAR:default}`.
#[allow(clippy::expect_used)]
fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}")
            .expect("static env-var pattern is valid")
    })
}

/// Merge ordered partial config maps into one effective map and expand
/// environment-variable references.
///
/// Precedence is left→right: later layers override earlier ones. Scalars
/// full-replace, lists union by identity key, nested maps merge
/// key-by-key recursively.
///
/// # Errors
///
/// Returns `AppError::Validation` if a layer is not a map, or if expansion
/// hits a `${VAR}` reference with no such environment variable and no
/// default.
pub fn resolve(layers: &[Value]) -> Result<Value> {
    let mut merged = Value::Object(Map::new());
    for (index, layer) in layers.iter().enumerate() {
        if !layer.is_object() {
            return Err(AppError::Validation(format!(
                "resolver layer {index} is not a map"
            )));
        }
        merged = merge_values(merged, layer.clone());
    }
    expand_env(merged)
}

/// Merge `overlay` onto `base` with the smart-single-value rule.
///
/// Maps merge recursively, lists union by identity (an overlay item whose
/// identity matches an existing item merges into it in place; new
/// identities append, preserving first-seen order), and everything else is
/// replaced by the overlay value.
#[must_use]
pub fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (Value::Array(base_items), Value::Array(overlay_items)) => {
            Value::Array(union_by_identity(base_items, overlay_items))
        }
        (_, overlay) => overlay,
    }
}

/// Identity key for list-union purposes: `module` field, else `name` field,
/// else the item's own serialized form.
fn identity_of(item: &Value) -> String {
    if let Value::Object(map) = item {
        for key in ["module", "name"] {
            if let Some(Value::String(id)) = map.get(key) {
                return format!("{key}:{id}");
            }
        }
    }
    item.to_string()
}

fn union_by_identity(base: Vec<Value>, overlay: Vec<Value>) -> Vec<Value> {
    let mut result = base;
    for item in overlay {
        let identity = identity_of(&item);
        match result
            .iter()
            .position(|existing| identity_of(existing) == identity)
        {
            Some(index) => {
                let existing = result[index].take();
                result[index] = merge_values(existing, item);
            }
            None => result.push(item),
        }
    }
    result
}

/// Expand `${VAR}` / `${VAR:default}` references in every string of `value`.
fn expand_env(value: Value) -> Result<Value> {
    match value {
        Value::String(text) => Ok(Value::String(expand_str(&text)?)),
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(expand_env)
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Object(map) => {
            let mut expanded = Map::with_capacity(map.len());
            for (key, item) in map {
                expanded.insert(key, expand_env(item)?);
            }
            Ok(Value::Object(expanded))
        }
        other => Ok(other),
    }
}

fn expand_str(text: &str) -> Result<String> {
    let pattern = var_pattern();
    let mut result = String::with_capacity(text.len());
    let mut last_end = 0;

    for captures in pattern.captures_iter(text) {
        let full = captures
            .get(0)
            .ok_or_else(|| AppError::Validation("malformed variable reference".into()))?;
        result.push_str(&text[last_end..full.start()]);

        let var_name = captures
            .get(1)
            .map(|m| m.as_str())
            .ok_or_else(|| AppError::Validation("malformed variable reference".into()))?;
        let default = captures.get(2).map(|m| m.as_str());

        match env::var(var_name) {
            Ok(value) => result.push_str(&value),
            Err(_) => match default {
                Some(fallback) => result.push_str(fallback),
                None => {
                    return Err(AppError::Validation(format!(
                        "environment variable '{var_name}' is not set and has no default"
                    )));
                }
            },
        }

        last_end = full.end();
    }

    result.push_str(&text[last_end..]);
    Ok(result)
}
