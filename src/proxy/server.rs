//! Proxy server setup and initialization

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::Router;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;

use super::api;
use super::error::ProxyError;
use super::handlers::{inference_handler, upstream_passthrough};
use super::state::ProxyState;

/// All inference routes share one handler; the body carries the model
const INFERENCE_ROUTES: &[&str] = &[
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/responses",
    "/v1/messages",
    "/v1/messages/count_tokens",
    "/v1/embeddings",
    "/v1/audio/speech",
    "/v1/audio/voices",
    "/v1/images/generations",
    "/infill",
    "/completion",
    "/rerank",
    "/reranking",
    "/v1/rerank",
    "/v1/reranking",
    // multipart: model comes from the form field
    "/v1/audio/transcriptions",
    "/v1/images/edits",
];

/// Build the full application router
pub fn build_router(state: ProxyState) -> Router {
    let mut router = Router::new();
    for route in INFERENCE_ROUTES {
        router = router.route(route, post(inference_handler));
    }

    router
        // Management
        .route("/v1/models", get(api::list_models))
        .route("/running", get(api::running))
        .route("/unload", get(api::unload_all))
        .route("/api/models/unload", post(api::unload_all))
        .route("/api/models/unload/:model", post(api::unload_model))
        .route("/api/models/sleep/:model", post(api::sleep_model))
        // Observability
        .route("/api/events", get(api::events_sse))
        .route("/api/metrics", get(api::metrics_snapshot))
        .route("/api/captures/:id", get(api::get_capture))
        .route("/logs", get(api::get_logs))
        .route("/logs/stream", get(api::logs_stream))
        .route("/health", get(api::health))
        // Direct upstream passthrough
        .route("/upstream/:model/*path", any(upstream_passthrough))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}

/// API key check for every route except /health. Disabled when no keys
/// are configured.
async fn require_api_key(
    State(state): State<ProxyState>,
    req: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    if state.config.api_keys.is_empty() || req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
        });

    let fingerprint = match provided {
        Some(key) if state.config.api_keys.iter().any(|k| k == key) => key_fingerprint(key),
        _ => return Err(ProxyError::Auth),
    };
    tracing::debug!("authenticated request from key {}", fingerprint);
    Ok(next.run(req).await)
}

/// Short SHA-256 fingerprint for logging; keys are never logged raw
fn key_fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

/// Start the proxy server
pub async fn start_proxy(
    state: ProxyState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = state.config.listen.clone();
    let app = build_router(state);

    tracing::info!("Starting proxy on {}", bind_addr);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Proxy listening on {}", bind_addr);

    // Start serving requests with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}
