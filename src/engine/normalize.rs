//! Tool-call normalization pass (spec §4.1 step 4, §9 "Dynamic tool-call
//! payloads"). Providers send loose JSON; this rewrites it to one canonical
//! `{items:[{...}]}` shape before any tool is invoked. Grounded in the
//! teacher's `engine::tool_registry::canonical_tool_name` alias table,
//! generalized from a fixed match arm into data-driven tables.

use serde_json::{Map, Value as JsonValue};

const LEGACY_PARAM_ALIASES: &[(&str, &str)] = &[
    ("start_line", "start"),
    ("end_line", "end"),
    ("q", "query"),
    ("num_results", "count"),
    ("workdir", "cwd"),
    ("yield_time_ms", "timeout_seconds"),
];

const LEGACY_TOOL_NAMES: &[(&str, &str)] = &[
    ("exec_command", "shell"),
    ("functions.exec_command", "shell"),
    ("view_file", "view"),
    ("view_file_lines", "view"),
    ("view_file_lins", "view"),
];

/// Rewrites a legacy/alias tool name to its canonical form. Unknown names
/// pass through unchanged — capability-based routing (§4.6) happens after.
pub fn canonical_tool_name(name: &str) -> String {
    LEGACY_TOOL_NAMES
        .iter()
        .find(|(legacy, _)| *legacy == name)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Unwraps `input|arguments|args`, rewrites legacy param aliases, and wraps
/// the result into `{items:[...]}`. `raw` is the tool-call payload exactly as
/// the provider returned it.
pub fn normalize_params(raw: &JsonValue) -> JsonValue {
    let unwrapped = unwrap_envelope(raw);
    let rewritten = rewrite_aliases(&unwrapped);
    wrap_items(rewritten)
}

fn unwrap_envelope(raw: &JsonValue) -> JsonValue {
    if let Some(obj) = raw.as_object() {
        for key in ["input", "arguments", "args"] {
            if let Some(inner) = obj.get(key) {
                return inner.clone();
            }
        }
    }
    raw.clone()
}

fn rewrite_aliases(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut rewritten = Map::new();
            for (key, val) in map {
                let canonical_key = LEGACY_PARAM_ALIASES
                    .iter()
                    .find(|(legacy, _)| legacy == key)
                    .map(|(_, canonical)| canonical.to_string())
                    .unwrap_or_else(|| key.clone());
                rewritten.insert(canonical_key, val.clone());
            }
            JsonValue::Object(rewritten)
        }
        other => other.clone(),
    }
}

/// If `items` is present as an object, wraps it as a single-element array; if
/// there is no top-level `items` key at all, wraps the whole object into
/// `{items:[...]}` so every tool sees the same shape.
fn wrap_items(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(mut map) => {
            match map.remove("items") {
                Some(JsonValue::Array(arr)) => {
                    map.insert("items".to_string(), JsonValue::Array(arr));
                    JsonValue::Object(map)
                }
                Some(JsonValue::Object(single)) => {
                    map.insert("items".to_string(), JsonValue::Array(vec![JsonValue::Object(single)]));
                    JsonValue::Object(map)
                }
                Some(other) => {
                    map.insert("items".to_string(), JsonValue::Array(vec![other]));
                    JsonValue::Object(map)
                }
                None => {
                    let mut wrapper = Map::new();
                    wrapper.insert("items".to_string(), JsonValue::Array(vec![JsonValue::Object(map)]));
                    JsonValue::Object(wrapper)
                }
            }
        }
        other => {
            let mut wrapper = Map::new();
            wrapper.insert("items".to_string(), JsonValue::Array(vec![other]));
            JsonValue::Object(wrapper)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_tool_name_rewrites_legacy_names() {
        assert_eq!(canonical_tool_name("exec_command"), "shell");
        assert_eq!(canonical_tool_name("functions.exec_command"), "shell");
        assert_eq!(canonical_tool_name("view_file_lines"), "view");
        assert_eq!(canonical_tool_name("shell"), "shell");
    }

    #[test]
    fn normalize_params_unwraps_input_envelope() {
        let raw = json!({ "input": { "start_line": 1, "end_line": 10 } });
        let got = normalize_params(&raw);
        let item = &got["items"][0];
        assert_eq!(item["start"], 1);
        assert_eq!(item["end"], 10);
    }

    #[test]
    fn normalize_params_rewrites_query_alias() {
        let raw = json!({ "arguments": { "q": "rust", "num_results": 5 } });
        let got = normalize_params(&raw);
        let item = &got["items"][0];
        assert_eq!(item["query"], "rust");
        assert_eq!(item["count"], 5);
    }

    #[test]
    fn normalize_params_wraps_object_items_as_single_element_array() {
        let raw = json!({ "items": { "path": "a.txt" } });
        let got = normalize_params(&raw);
        assert!(got["items"].is_array());
        assert_eq!(got["items"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn normalize_params_passes_through_existing_array_items() {
        let raw = json!({ "items": [{ "path": "a.txt" }, { "path": "b.txt" }] });
        let got = normalize_params(&raw);
        assert_eq!(got["items"].as_array().unwrap().len(), 2);
    }
}
