// HTTP API module - management and observability endpoints
//
// Model listing, process control (unload/sleep), the metrics snapshot and
// captures, and the SSE surfaces for events and logs. All endpoints
// return JSON unless noted and are designed for local consumption.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::events::ProxyEvent;
use crate::logging::LogEntry;
use crate::metrics::TokenMetrics;
use crate::process::{ProcessStatus, StopMode};

use super::error::ProxyError;
use super::state::ProxyState;

// ─────────────────────────────────────────────────────────────────────────────
// Models
// ─────────────────────────────────────────────────────────────────────────────

/// Query parameters for /v1/models
#[derive(Debug, Deserialize)]
pub struct ModelsQuery {
    /// Include configured aliases as additional entries
    #[serde(default)]
    pub aliases: bool,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

/// GET /v1/models - configured models in OpenAI list format
pub async fn list_models(
    State(state): State<ProxyState>,
    Query(params): Query<ModelsQuery>,
) -> Json<ModelsResponse> {
    let mut data = Vec::new();
    for (id, model) in &state.config.models {
        data.push(ModelEntry {
            id: id.clone(),
            object: "model",
            owned_by: "llmsnap",
        });
        if params.aliases {
            for alias in &model.aliases {
                data.push(ModelEntry {
                    id: alias.clone(),
                    object: "model",
                    owned_by: "llmsnap",
                });
            }
        }
    }
    Json(ModelsResponse {
        object: "list",
        data,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Process control
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RunningResponse {
    pub processes: Vec<ProcessStatus>,
}

/// GET /running - every managed process with its current state
pub async fn running(State(state): State<ProxyState>) -> Json<RunningResponse> {
    Json(RunningResponse {
        processes: state.statuses(),
    })
}

/// GET /unload and POST /api/models/unload - stop everything
pub async fn unload_all(State(state): State<ProxyState>) -> &'static str {
    tracing::info!("unloading all models");
    state.stop_all(StopMode::Immediate).await;
    "OK"
}

/// POST /api/models/unload/:model - stop one process
pub async fn unload_model(
    State(state): State<ProxyState>,
    Path(model): Path<String>,
) -> Result<Json<ProcessStatus>, ProxyError> {
    let (canonical, _) = state
        .resolve(&model)
        .ok_or_else(|| ProxyError::Client(format!("unknown model {model:?}")))?;
    let process = state
        .process(&canonical)
        .ok_or_else(|| ProxyError::Client(format!("unknown model {model:?}")))?;
    process.stop(StopMode::Immediate).await;
    Ok(Json(process.status()))
}

/// POST /api/models/sleep/:model - sleep one process; 409 when the model
/// has no sleep support configured
pub async fn sleep_model(
    State(state): State<ProxyState>,
    Path(model): Path<String>,
) -> Result<Json<ProcessStatus>, ProxyError> {
    let (canonical, _) = state
        .resolve(&model)
        .ok_or_else(|| ProxyError::Client(format!("unknown model {model:?}")))?;
    let process = state
        .process(&canonical)
        .ok_or_else(|| ProxyError::Client(format!("unknown model {model:?}")))?;
    if !process.sleep_configured() {
        return Err(ProxyError::SleepNotSupported(format!(
            "model {canonical:?} has no sleep endpoints configured"
        )));
    }
    process.sleep().await.map_err(ProxyError::from)?;
    Ok(Json(process.status()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics and captures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub metrics: Vec<TokenMetrics>,
}

/// GET /api/metrics - snapshot of the token metrics ring
pub async fn metrics_snapshot(State(state): State<ProxyState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        metrics: state.metrics.snapshot(),
    })
}

/// GET /api/captures/:id - captured response body for a metric record
pub async fn get_capture(
    State(state): State<ProxyState>,
    Path(id): Path<u64>,
) -> Result<Response<Body>, ProxyError> {
    let capture = state
        .metrics
        .capture(id)
        .ok_or_else(|| ProxyError::NotFound(format!("no capture for metric {id}")))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        capture,
    )
        .into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// Event and log streams
// ─────────────────────────────────────────────────────────────────────────────

fn sse_frames(
    rx: tokio::sync::broadcast::Receiver<ProxyEvent>,
    filter_logs: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(move |result| {
        let event = match result {
            Ok(event) => event,
            // Lagged subscriber: skip what was lost and keep following
            Err(_) => return None,
        };
        if filter_logs && !matches!(event, ProxyEvent::LogLine { .. }) {
            return None;
        }
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event(event.event_type()).data(data)))
    })
}

/// GET /api/events - SSE stream of state-change, metric, and log events
pub async fn events_sse(State(state): State<ProxyState>) -> impl IntoResponse {
    let stream = sse_frames(state.events.subscribe(), false);
    (
        [("X-Accel-Buffering", "no")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
}

/// GET /logs - recent captured log entries
pub async fn get_logs(State(state): State<ProxyState>) -> Json<Vec<LogEntry>> {
    Json(state.logs.get_all())
}

/// GET /logs/stream - SSE stream of live log lines
pub async fn logs_stream(State(state): State<ProxyState>) -> impl IntoResponse {
    let stream = sse_frames(state.events.subscribe(), true);
    (
        [("X-Accel-Buffering", "no")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
}

/// GET /health - liveness probe for the proxy itself
pub async fn health() -> &'static str {
    "OK"
}
