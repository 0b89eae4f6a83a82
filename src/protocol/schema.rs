//! Tool parameter schema sanitizer for the backend's restricted JSON-Schema
//! dialect.

use serde_json::{Map, Value};

const MAX_DEPTH: usize = 32;

const COMPOSITION_KEYS: &[&str] = &["anyOf", "oneOf", "allOf"];

const STRIP_KEYS: &[&str] = &[
    // meta
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "$comment",
    "definitions",
    "title",
    "default",
    "examples",
    "const",
    "deprecated",
    "readOnly",
    "writeOnly",
    // overloaded keyword the backend fails to parse
    "value",
    "nullable",
    // numeric constraints
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    // string constraints
    "minLength",
    "maxLength",
    "pattern",
    "format",
    // collection constraints
    "minItems",
    "maxItems",
    "uniqueItems",
    "minProperties",
    "maxProperties",
    "additionalItems",
];

const NESTED_SCHEMA_KEYS: &[&str] = &["additionalProperties", "propertyNames", "contains"];

/// The fallback schema for inputs that cannot be repaired.
#[must_use]
pub fn empty_object_schema() -> Value {
    let mut map = Map::new();
    map.insert("type".into(), Value::String("object".into()));
    map.insert("properties".into(), Value::Object(Map::new()));
    Value::Object(map)
}

/// Sanitize a tool's parameter schema. The result always carries
/// `type: "object"` and a `properties` object.
#[must_use]
pub fn sanitize_tool_schema(schema: &Value) -> Value {
    if !schema.is_object() {
        return empty_object_schema();
    }
    let mut root = sanitize_node(schema, 0);
    let Value::Object(map) = &mut root else {
        return empty_object_schema();
    };
    if map.get("type").and_then(Value::as_str) != Some("object") {
        return empty_object_schema();
    }
    if !map.get("properties").is_some_and(Value::is_object) {
        map.insert("properties".into(), Value::Object(Map::new()));
    }
    root
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
#[must_use]
pub fn normalize_property_name(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if normalized.is_empty() {
        "_".to_string()
    } else {
        normalized
    }
}

fn sanitize_node(node: &Value, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return empty_object_schema();
    }
    let Value::Object(source) = node else {
        return empty_object_schema();
    };

    let mut map = collapse_composition(source, depth);
    for key in STRIP_KEYS {
        map.remove(*key);
    }

    let ty = resolve_type(&map);
    map.insert("type".into(), Value::String(ty.clone()));

    let mut kept_names: Vec<(String, String)> = Vec::new();
    if let Some(Value::Object(properties)) = map.remove("properties") {
        let mut cleaned = Map::with_capacity(properties.len());
        for (name, child) in &properties {
            let normalized = normalize_property_name(name);
            if cleaned.contains_key(&normalized) {
                tracing::debug!(property = %name, "dropping property that collides after normalization");
                continue;
            }
            cleaned.insert(normalized.clone(), sanitize_node(child, depth + 1));
            kept_names.push((name.clone(), normalized));
        }
        map.insert("properties".into(), Value::Object(cleaned));
    }

    if let Some(required) = map.remove("required") {
        let mut filtered: Vec<Value> = Vec::new();
        if let Value::Array(items) = required {
            for item in items {
                let Some(name) = item.as_str() else { continue };
                let normalized = normalize_property_name(name);
                let present = kept_names.iter().any(|(_, kept)| kept == &normalized);
                if present && !filtered.iter().any(|v| v.as_str() == Some(normalized.as_str())) {
                    filtered.push(Value::String(normalized));
                }
            }
        }
        if !filtered.is_empty() {
            map.insert("required".into(), Value::Array(filtered));
        }
    }

    match map.remove("items") {
        Some(items @ Value::Object(_)) => {
            map.insert("items".into(), sanitize_node(&items, depth + 1));
        }
        Some(Value::Array(tuple)) => {
            if let Some(first) = tuple.first() {
                map.insert("items".into(), sanitize_node(first, depth + 1));
            }
        }
        _ => {}
    }
    if ty == "array" && !map.contains_key("items") {
        let mut item = Map::new();
        item.insert("type".into(), Value::String("string".into()));
        map.insert("items".into(), Value::Object(item));
    }

    if let Some(Value::Object(patterns)) = map.remove("patternProperties") {
        let cleaned: Map<String, Value> = patterns
            .iter()
            .map(|(pattern, child)| (pattern.clone(), sanitize_node(child, depth + 1)))
            .collect();
        map.insert("patternProperties".into(), Value::Object(cleaned));
    }

    for key in NESTED_SCHEMA_KEYS {
        match map.remove(*key) {
            Some(child @ Value::Object(_)) => {
                map.insert((*key).to_string(), sanitize_node(&child, depth + 1));
            }
            Some(flag @ Value::Bool(_)) if *key == "additionalProperties" => {
                map.insert((*key).to_string(), flag);
            }
            _ => {}
        }
    }

    if let Some(values) = map.remove("enum") {
        if let Value::Array(values) = values {
            let strings: Vec<Value> = values
                .into_iter()
                .filter(|v| !v.is_null())
                .map(|v| match v {
                    Value::String(s) => Value::String(s),
                    other => Value::String(other.to_string()),
                })
                .collect();
            if !strings.is_empty() {
                map.insert("enum".into(), Value::Array(strings));
            }
        }
    }

    if ty == "object" && !map.get("properties").is_some_and(Value::is_object) {
        map.insert("properties".into(), Value::Object(Map::new()));
    }

    Value::Object(map)
}

/// Replace composition keywords with one representative branch, overlaid by
/// the parent's own keys. Repeats while the chosen branch is itself composed.
fn collapse_composition(source: &Map<String, Value>, depth: usize) -> Map<String, Value> {
    let mut current = source.clone();
    for _ in depth..=MAX_DEPTH {
        let Some(branches) = COMPOSITION_KEYS
            .iter()
            .find_map(|key| current.get(*key).and_then(Value::as_array).cloned())
        else {
            for key in COMPOSITION_KEYS {
                current.remove(*key);
            }
            return current;
        };

        let parent: Map<String, Value> = current
            .into_iter()
            .filter(|(key, _)| !COMPOSITION_KEYS.contains(&key.as_str()))
            .collect();
        let mut merged = pick_branch(&branches).unwrap_or_default();
        for (key, value) in parent {
            merged.insert(key, value);
        }
        current = merged;
    }
    for key in COMPOSITION_KEYS {
        current.remove(*key);
    }
    current
}

fn pick_branch(branches: &[Value]) -> Option<Map<String, Value>> {
    let objects = || branches.iter().filter_map(Value::as_object);
    objects()
        .find(|branch| branch.get("type").and_then(Value::as_str) == Some("string"))
        .or_else(|| objects().find(|branch| branch.get("type").and_then(Value::as_str) != Some("null")))
        .cloned()
}

fn resolve_type(map: &Map<String, Value>) -> String {
    match map.get("type") {
        Some(Value::String(ty)) if ty != "null" => return ty.clone(),
        Some(Value::Array(types)) => {
            return types
                .iter()
                .filter_map(Value::as_str)
                .find(|ty| *ty != "null")
                .unwrap_or("object")
                .to_string();
        }
        _ => {}
    }
    if map.contains_key("properties") {
        "object".into()
    } else if map.contains_key("items") {
        "array".into()
    } else if map.contains_key("enum") {
        "string".into()
    } else {
        "object".into()
    }
}
