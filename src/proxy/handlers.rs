//! Request handlers for the inference surface
//!
//! Every inference route lands here: the buffered body yields the `model`
//! (JSON field or multipart form field), aliases resolve to a canonical
//! ID, the model's filters rewrite the body, and the scheduler dispatches
//! to the owning group. `/upstream/:model/*path` skips filtering and
//! forwards verbatim after activating the process.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header;
use axum::response::Response;

use super::error::ProxyError;
use super::filters::{apply_filters, extract_model_json, extract_model_multipart};
use super::state::ProxyState;

/// Main inference handler: extract model, filter body, dispatch
pub async fn inference_handler(
    State(state): State<ProxyState>,
    req: Request,
) -> Result<Response<Body>, ProxyError> {
    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::Client(format!("failed to read request body: {e}")))?;

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    // Multipart bodies are forwarded untouched; the model comes from the
    // form field and filters do not apply.
    if content_type.starts_with("multipart/form-data") {
        let requested = extract_model_multipart(&body_bytes)
            .ok_or_else(|| ProxyError::Client("missing \"model\" form field".into()))?;
        let (canonical, _) = state
            .resolve(&requested)
            .ok_or_else(|| ProxyError::Client(format!("unknown model {requested:?}")))?;
        tracing::debug!("{} {} -> {}", parts.method, parts.uri.path(), canonical);
        return state
            .dispatch(&canonical, parts, body_bytes)
            .await
            .map_err(Into::into);
    }

    let (json, requested) = extract_model_json(&body_bytes).ok_or_else(|| {
        ProxyError::Client("request body must be JSON with a \"model\" field".into())
    })?;
    let (canonical, _) = state
        .resolve(&requested)
        .ok_or_else(|| ProxyError::Client(format!("unknown model {requested:?}")))?;

    let model_config = state
        .config
        .models
        .get(&canonical)
        .cloned()
        .ok_or_else(|| ProxyError::Client(format!("unknown model {requested:?}")))?;
    let filtered = apply_filters(json, &model_config);

    tracing::debug!("{} {} -> {}", parts.method, parts.uri.path(), canonical);
    state
        .dispatch(&canonical, parts, filtered)
        .await
        .map_err(Into::into)
}

/// `ANY /upstream/:model/*path` - activate the process and forward verbatim
pub async fn upstream_passthrough(
    State(state): State<ProxyState>,
    Path((model, rest)): Path<(String, String)>,
    req: Request,
) -> Result<Response<Body>, ProxyError> {
    let (mut parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::Client(format!("failed to read request body: {e}")))?;

    let (canonical, _) = state
        .resolve(&model)
        .ok_or_else(|| ProxyError::Client(format!("unknown model {model:?}")))?;

    let suffix = format!("/{rest}");
    let rewritten = match parts.uri.query() {
        Some(query) => format!("{suffix}?{query}"),
        None => suffix,
    };
    parts.uri = rewritten
        .parse()
        .map_err(|_| ProxyError::Client(format!("invalid upstream path {rest:?}")))?;

    state
        .dispatch(&canonical, parts, body_bytes)
        .await
        .map_err(Into::into)
}
