//! `{{toolName.dotted.path}}` references between tool calls of one
//! specialist run.
//!
//! A reference resolves against the most recent recorded result of that tool
//! name. Unresolved references are left verbatim.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// A completed tool call, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRecord {
    pub name: String,
    pub result: Value,
}

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+)((?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
            .expect("template reference regex")
    })
}

/// Resolve every string inside `args` (recursively) against `history`.
pub fn resolve_args(args: &Value, history: &[ToolRecord]) -> Value {
    match args {
        Value::String(s) => resolve_string(s, history),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_args(v, history)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_args(v, history)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A string that is exactly one reference becomes the referenced JSON value;
/// embedded references are interpolated as text.
pub fn resolve_string(input: &str, history: &[ToolRecord]) -> Value {
    let re = reference_re();

    if let Some(caps) = re.captures(input) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        if whole.len() == input.trim().len() {
            return match resolve_reference(&caps[1], &caps[2], history) {
                Some(v) => v,
                None => Value::String(input.to_string()),
            };
        }
    } else {
        return Value::String(input.to_string());
    }

    let replaced = re.replace_all(input, |caps: &regex::Captures| {
        match resolve_reference(&caps[1], &caps[2], history) {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

fn resolve_reference(tool: &str, dotted: &str, history: &[ToolRecord]) -> Option<Value> {
    let record = history.iter().rev().find(|r| r.name == tool)?;
    let segments: Vec<&str> = dotted.split('.').filter(|s| !s.is_empty()).collect();
    lookup_path(&record.result, &segments)
}

/// Walk `path` through `root`. If an intermediate segment is missing but the
/// final segment exists at the root, that value is returned instead.
pub fn lookup_path(root: &Value, path: &[&str]) -> Option<Value> {
    if path.is_empty() {
        return Some(root.clone());
    }

    let mut current = root;
    let mut walked = true;
    for segment in path {
        let next = match current {
            Value::Object(map) => map.get(*segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => {
                walked = false;
                break;
            }
        }
    }
    if walked {
        return Some(current.clone());
    }

    let last = path.last()?;
    root.as_object().and_then(|m| m.get(*last)).cloned()
}
