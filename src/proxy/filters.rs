//! Request body filters
//!
//! Before a request is forwarded, the model's configured filters rewrite
//! the buffered JSON body: `stripParams` removes top-level keys (`model`
//! is protected), `setParams` overrides keys, and `useModelName` rewrites
//! the `model` field to whatever the upstream expects. Multipart bodies
//! are forwarded verbatim; only the `model` form field is read out of
//! them for routing.

use bytes::Bytes;
use serde_json::Value;

use crate::config::ModelConfig;

/// Extract the `model` field from a JSON request body
pub fn extract_model_json(body: &[u8]) -> Option<(Value, String)> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let model = value.get("model")?.as_str()?.to_string();
    Some((value, model))
}

/// Extract the `model` form field from a buffered multipart body.
///
/// The body must be forwarded to the upstream byte-for-byte, so a
/// consuming multipart extractor is off the table; a plain scan for the
/// field is enough for routing.
pub fn extract_model_multipart(body: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let idx = text.find("name=\"model\"")?;
    let rest = &text[idx..];
    let start = rest
        .find("\r\n\r\n")
        .map(|i| i + 4)
        .or_else(|| rest.find("\n\n").map(|i| i + 2))?;
    let rest = &rest[start..];
    let end = rest
        .find("\r\n")
        .or_else(|| rest.find('\n'))
        .unwrap_or(rest.len());
    let value = rest[..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Apply a model's request filters to its parsed body and re-serialize
pub fn apply_filters(mut body: Value, config: &ModelConfig) -> Bytes {
    if let Some(obj) = body.as_object_mut() {
        for key in &config.filters.strip_params {
            if key != "model" {
                obj.remove(key);
            }
        }
        for (key, value) in &config.filters.set_params {
            obj.insert(key.clone(), value.clone());
        }
        if !config.use_model_name.is_empty() {
            obj.insert("model".to_string(), Value::String(config.use_model_name.clone()));
        }
    }
    Bytes::from(serde_json::to_vec(&body).unwrap_or_default())
}
