//! Tolerant extraction of JSON objects from model replies.
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn object_span() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[\s\S]*\}").ok()).as_ref()
}

/// First `{ ... }` span of `text` that parses as a JSON object. Surrounding
/// prose and markdown fences are ignored.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let span = object_span()?.find(text)?.as_str();
    if let Ok(Value::Object(map)) = serde_json::from_str(span) {
        return Some(map);
    }
    // Greedy span may swallow trailing prose that contains a brace; retry by
    // trimming from the last closing brace backwards.
    let mut end = span.len();
    while let Some(pos) = span[..end].rfind('}') {
        if let Ok(Value::Object(map)) = serde_json::from_str(&span[..=pos]) {
            return Some(map);
        }
        end = pos;
    }
    None
}

pub fn get_bool(map: &serde_json::Map<String, Value>, key: &str) -> Option<bool> {
    match map.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn get_f64(map: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    match map.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn get_string(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
