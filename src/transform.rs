/// JSON body transformation
use bytes::Bytes;
use log::debug;
use serde_json::{Map, Value};

use crate::config::TransformRules;

/// Rewrite a request body before it is forwarded
pub fn transform_request(body: &Bytes, rules: Option<&TransformRules>) -> Bytes {
    apply(body, rules)
}

/// Rewrite a backend response body before it is returned and cached
pub fn transform_response(body: &Bytes, rules: Option<&TransformRules>) -> Bytes {
    apply(body, rules)
}

/// Rules run in a fixed order: rename, remove, add, then value map.
/// Bodies that are not JSON are returned untouched.
fn apply(body: &Bytes, rules: Option<&TransformRules>) -> Bytes {
    let Some(rules) = rules else {
        return body.clone();
    };
    if body.is_empty() {
        return body.clone();
    }

    let mut value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            debug!("Body is not JSON, skipping transform: {}", e);
            return body.clone();
        }
    };

    match &mut value {
        Value::Array(items) => {
            for item in items.iter_mut() {
                apply_rules(item, rules);
            }
        }
        other => apply_rules(other, rules),
    }

    match serde_json::to_vec(&value) {
        Ok(encoded) => Bytes::from(encoded),
        Err(_) => body.clone(),
    }
}

fn apply_rules(value: &mut Value, rules: &TransformRules) {
    if !value.is_object() {
        return;
    }

    for (from, to) in &rules.rename {
        if let Some(moved) = take_path(value, from) {
            set_path(value, to, moved);
        }
    }

    for path in &rules.remove {
        take_path(value, path);
    }

    // Added fields overwrite whatever is already there
    for (path, added) in &rules.add {
        set_path(value, path, added.clone());
    }

    for (path, mapping) in &rules.value_map {
        if let Some(field) = get_path_mut(value, path) {
            if let Some(replacement) = mapping.get(&value_key(field)) {
                *field = replacement.clone();
            }
        }
    }
}

/// Strings map by their content, everything else by its JSON text
fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn split(path: &str) -> Option<(Vec<&str>, &str)> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().filter(|s| !s.is_empty())?;
    Some((segments, last))
}

fn get_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

fn take_path(value: &mut Value, path: &str) -> Option<Value> {
    let (parents, last) = split(path)?;
    let mut current = value;
    for segment in parents {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    current.as_object_mut()?.remove(last)
}

/// Intermediate objects are created as needed; non-object parents are left
/// alone
fn set_path(value: &mut Value, path: &str, new_value: Value) -> Option<()> {
    let (parents, last) = split(path)?;
    let mut current = value;
    for segment in parents {
        current = current
            .as_object_mut()?
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    current.as_object_mut()?.insert(last.to_string(), new_value);
    Some(())
}
