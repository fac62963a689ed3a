//! Dotted field-path traversal over resource JSON.
//!
//! Accessors flatten arrays at every step, so `name.given` against a
//! resource with repeating `name` yields every given name. Scalar leaves
//! are compared through their canonical string form.

use serde_json::Value;

/// Resolve a dotted path, flattening arrays. Objects and nulls at the leaf
/// are dropped; only scalars survive into the result.
pub(crate) fn lookup<'a>(resource: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    lookup_segments(resource, &segments)
}

/// Resolve a pre-split path, flattening arrays at every step.
pub(crate) fn lookup_segments<'a>(resource: &'a Value, segments: &[&str]) -> Vec<&'a Value> {
    let mut current: Vec<&Value> = vec![resource];

    for segment in segments {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(v) = map.get(*segment) {
                        flatten_into(v, &mut next);
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(v) = item.get(*segment) {
                            flatten_into(v, &mut next);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }

    current
}

fn flatten_into<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        Value::Null => {}
        other => out.push(other),
    }
}

/// Canonical string form of a scalar JSON value, used for predicate and
/// filter comparisons. Objects have no scalar form.
pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// All scalar string values a path yields.
pub(crate) fn string_values(resource: &Value, path: &str) -> Vec<String> {
    lookup(resource, path)
        .into_iter()
        .filter_map(scalar_string)
        .collect()
}
