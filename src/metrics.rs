// Token metrics collection
//
// After a proxied response completes, the bytes captured by the tee writer
// are parsed here to extract token usage. Parsing never touches the bytes
// forwarded to the client and never surfaces errors to it; failures are
// logged and suppressed. Records live in a bounded FIFO ring with
// monotonically assigned IDs.

use std::collections::VecDeque;
use std::sync::RwLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::events::{EventBus, ProxyEvent};

/// Sentinel for unknown rates and cached-token counts
const UNKNOWN_RATE: f64 = -1.0;
const UNKNOWN_COUNT: i64 = -1;

/// One record per completed 2xx upstream response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetrics {
    /// Monotonically assigned within a MetricsMonitor, starting at 0
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    /// Prompt tokens; 0 when unknown
    pub input_tokens: i64,
    /// Completion tokens; 0 when unknown
    pub output_tokens: i64,
    /// Prefix-cache hits; -1 when unknown
    pub cached_tokens: i64,
    /// Prompt tokens/second; -1.0 when unknown
    pub prompt_per_second: f64,
    /// Output tokens/second; -1.0 when unknown
    pub tokens_per_second: f64,
    /// Wall-clock duration of the upstream request in milliseconds
    pub duration_ms: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Usage extraction
// ─────────────────────────────────────────────────────────────────────────────

/// Token fields pulled out of a response payload's `usage`/`timings`
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UsageFields {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cached_tokens: Option<i64>,
    pub prompt_per_second: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub duration_ms: Option<i64>,
}

impl UsageFields {
    fn is_empty(&self) -> bool {
        *self == UsageFields::default()
    }
}

/// Extract usage fields from a parsed response payload.
///
/// `usage` supplies token counts; `timings` (llama.cpp style) overrides
/// them field-by-field and additionally supplies rates and the measured
/// duration. Returns None when the payload has neither object.
pub fn extract_usage(payload: &Value) -> Option<UsageFields> {
    let usage = payload.get("usage").filter(|v| v.is_object());
    let timings = payload.get("timings").filter(|v| v.is_object());
    if usage.is_none() && timings.is_none() {
        return None;
    }

    let mut fields = UsageFields::default();

    if let Some(usage) = usage {
        fields.input_tokens = int_field(usage, &["prompt_tokens", "input_tokens"]);
        fields.output_tokens = int_field(usage, &["completion_tokens", "output_tokens"]);
        fields.cached_tokens = int_field(usage, &["cache_read_input_tokens"]);
    }

    if let Some(timings) = timings {
        if let Some(n) = int_field(timings, &["prompt_n"]) {
            fields.input_tokens = Some(n);
        }
        if let Some(n) = int_field(timings, &["predicted_n"]) {
            fields.output_tokens = Some(n);
        }
        if let Some(n) = int_field(timings, &["cache_n"]) {
            fields.cached_tokens = Some(n);
        }
        fields.prompt_per_second = float_field(timings, &["prompt_per_second"]);
        fields.tokens_per_second = float_field(timings, &["predicted_per_second"]);

        let prompt_ms = float_field(timings, &["prompt_ms"]);
        let predicted_ms = float_field(timings, &["predicted_ms"]);
        if prompt_ms.is_some() || predicted_ms.is_some() {
            fields.duration_ms =
                Some((prompt_ms.unwrap_or(0.0) + predicted_ms.unwrap_or(0.0)) as i64);
        }
    }

    Some(fields)
}

fn int_field(obj: &Value, names: &[&str]) -> Option<i64> {
    names.iter().find_map(|n| obj.get(*n).and_then(Value::as_i64))
}

fn float_field(obj: &Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| obj.get(*n).and_then(Value::as_f64))
}

/// Result of scanning a captured SSE body for its last meaningful payload
#[derive(Debug)]
struct SseScan {
    /// Last `data:` payload carrying `usage` or `timings`
    usage: Option<UsageFields>,
    /// Whether any valid JSON data line was seen at all
    saw_valid_json: bool,
}

/// Scan a captured SSE body backwards for the last `data:` line whose
/// payload is valid JSON and carries `usage` or `timings`.
///
/// Scanning from the tail keeps the cost proportional to the final frames
/// instead of the whole multi-megabyte stream in the common case.
fn scan_sse_tail(body: &str) -> SseScan {
    let mut saw_valid_json = false;
    for line in body.rsplit('\n') {
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        saw_valid_json = true;
        if let Some(fields) = extract_usage(&value) {
            return SseScan {
                usage: Some(fields),
                saw_valid_json: true,
            };
        }
    }
    SseScan {
        usage: None,
        saw_valid_json,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Monitor
// ─────────────────────────────────────────────────────────────────────────────

struct Ring {
    next_id: u64,
    records: VecDeque<StoredMetric>,
}

struct StoredMetric {
    metric: TokenMetrics,
    capture: Option<Bytes>,
}

/// Bounded FIFO of token metrics with captured response bodies
pub struct MetricsMonitor {
    capacity: usize,
    inner: RwLock<Ring>,
    bus: EventBus,
}

impl MetricsMonitor {
    pub fn new(capacity: usize, bus: EventBus) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Ring {
                next_id: 0,
                records: VecDeque::new(),
            }),
            bus,
        }
    }

    /// Parse a completed upstream response and record a metric.
    ///
    /// Skipped (with a log line, never an error) for non-2xx statuses and
    /// empty bodies. Returns the assigned record ID when one was recorded.
    pub fn observe_response(
        &self,
        model: &str,
        status: u16,
        content_type: &str,
        body: &Bytes,
        duration_ms: i64,
    ) -> Option<u64> {
        if !(200..300).contains(&status) {
            tracing::warn!(model, status, "skipping metrics for non-2xx response");
            return None;
        }
        if body.is_empty() {
            tracing::warn!(model, "skipping metrics for empty response body");
            return None;
        }

        let fields = if content_type.contains("text/event-stream") {
            let text = String::from_utf8_lossy(body);
            let scan = scan_sse_tail(&text);
            match scan.usage {
                Some(fields) => fields,
                None if scan.saw_valid_json => UsageFields::default(),
                None => {
                    tracing::warn!(model, "no parseable SSE data lines; skipping metric");
                    return None;
                }
            }
        } else {
            match serde_json::from_slice::<Value>(body) {
                Ok(value) => extract_usage(&value).unwrap_or_default(),
                Err(e) => {
                    tracing::warn!(model, error = %e, "response body is not JSON; skipping metric");
                    return None;
                }
            }
        };

        let metric = finalize_metric(model, fields, duration_ms);
        Some(self.record(metric, Some(body.clone())))
    }

    /// Append a metric, assigning its ID and evicting FIFO at capacity
    pub fn record(&self, mut metric: TokenMetrics, capture: Option<Bytes>) -> u64 {
        let id;
        {
            let mut ring = self.inner.write().unwrap_or_else(|e| e.into_inner());
            id = ring.next_id;
            ring.next_id += 1;
            metric.id = id;
            ring.records.push_back(StoredMetric {
                metric: metric.clone(),
                capture,
            });
            while ring.records.len() > self.capacity {
                ring.records.pop_front();
            }
        }
        self.bus.publish(ProxyEvent::MetricRecorded {
            timestamp: metric.timestamp,
            metric,
        });
        id
    }

    /// Copy of the retained records, oldest first
    pub fn snapshot(&self) -> Vec<TokenMetrics> {
        let ring = self.inner.read().unwrap_or_else(|e| e.into_inner());
        ring.records.iter().map(|r| r.metric.clone()).collect()
    }

    /// Captured response body for a record, if still retained
    pub fn capture(&self, id: u64) -> Option<Bytes> {
        let ring = self.inner.read().unwrap_or_else(|e| e.into_inner());
        ring.records
            .iter()
            .find(|r| r.metric.id == id)
            .and_then(|r| r.capture.clone())
    }

    pub fn len(&self) -> usize {
        let ring = self.inner.read().unwrap_or_else(|e| e.into_inner());
        ring.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fill in sentinels and derived values for a metric record
fn finalize_metric(model: &str, fields: UsageFields, elapsed_ms: i64) -> TokenMetrics {
    let duration_ms = fields.duration_ms.unwrap_or(elapsed_ms);
    let output_tokens = fields.output_tokens.unwrap_or(0);

    let mut tokens_per_second = fields.tokens_per_second.unwrap_or(UNKNOWN_RATE);
    if tokens_per_second < 0.0 && output_tokens > 0 && duration_ms > 0 {
        tokens_per_second = output_tokens as f64 / (duration_ms as f64 / 1000.0);
    }

    TokenMetrics {
        id: 0, // assigned by the ring
        timestamp: Utc::now(),
        model: model.to_string(),
        input_tokens: fields.input_tokens.unwrap_or(0),
        output_tokens,
        cached_tokens: fields.cached_tokens.unwrap_or(UNKNOWN_COUNT),
        prompt_per_second: fields.prompt_per_second.unwrap_or(UNKNOWN_RATE),
        tokens_per_second,
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(capacity: usize) -> MetricsMonitor {
        MetricsMonitor::new(capacity, EventBus::new())
    }

    #[test]
    fn json_usage_only() {
        let m = monitor(10);
        let body = Bytes::from(r#"{"usage":{"prompt_tokens":100,"completion_tokens":50}}"#);
        m.observe_response("llama", 200, "application/json", &body, 2000)
            .unwrap();

        let rec = &m.snapshot()[0];
        assert_eq!(rec.input_tokens, 100);
        assert_eq!(rec.output_tokens, 50);
        assert_eq!(rec.cached_tokens, -1);
        assert_eq!(rec.prompt_per_second, -1.0);
        assert_eq!(rec.duration_ms, 2000);
        // 50 tokens over 2 seconds
        assert!((rec.tokens_per_second - 25.0).abs() < 1e-9);
    }

    #[test]
    fn json_timings_override_usage() {
        let m = monitor(10);
        let body = Bytes::from(
            r#"{"usage":{"prompt_tokens":50,"completion_tokens":25},
                "timings":{"prompt_n":100,"predicted_n":50,
                           "prompt_per_second":150.5,"predicted_per_second":25.5,
                           "prompt_ms":500.0,"predicted_ms":1500.0}}"#,
        );
        m.observe_response("llama", 200, "application/json", &body, 99)
            .unwrap();

        let rec = &m.snapshot()[0];
        assert_eq!(rec.input_tokens, 100);
        assert_eq!(rec.output_tokens, 50);
        assert_eq!(rec.prompt_per_second, 150.5);
        assert_eq!(rec.tokens_per_second, 25.5);
        assert_eq!(rec.duration_ms, 2000);
    }

    #[test]
    fn sse_last_data_payload_wins() {
        let m = monitor(10);
        let body = Bytes::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n\
             data: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":20},\
                    \"timings\":{\"predicted_per_second\":50.0,\"prompt_ms\":100,\"predicted_ms\":400}}\n\n\
             data: [DONE]\n\n",
        );
        m.observe_response("llama", 200, "text/event-stream", &body, 9999)
            .unwrap();

        let rec = &m.snapshot()[0];
        assert_eq!(rec.input_tokens, 10);
        assert_eq!(rec.output_tokens, 20);
        assert_eq!(rec.tokens_per_second, 50.0);
        assert_eq!(rec.duration_ms, 500);
    }

    #[test]
    fn sse_without_usage_records_unknowns() {
        let m = monitor(10);
        let body = Bytes::from("data: {\"choices\":[]}\n\ndata: [DONE]\n\n");
        m.observe_response("llama", 200, "text/event-stream", &body, 150)
            .unwrap();

        let rec = &m.snapshot()[0];
        assert_eq!(rec.input_tokens, 0);
        assert_eq!(rec.output_tokens, 0);
        assert_eq!(rec.cached_tokens, -1);
        assert_eq!(rec.tokens_per_second, -1.0);
        assert_eq!(rec.duration_ms, 150);
    }

    #[test]
    fn sse_without_any_json_is_skipped() {
        let m = monitor(10);
        let body = Bytes::from(": comment\n\nevent: ping\n\n");
        assert!(m
            .observe_response("llama", 200, "text/event-stream", &body, 10)
            .is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn json_without_usage_records_unknowns() {
        let m = monitor(10);
        let body = Bytes::from(r#"{"object":"list","data":[]}"#);
        m.observe_response("llama", 200, "application/json", &body, 42)
            .unwrap();
        let rec = &m.snapshot()[0];
        assert_eq!(rec.input_tokens, 0);
        assert_eq!(rec.cached_tokens, -1);
    }

    #[test]
    fn non_2xx_and_empty_bodies_are_skipped() {
        let m = monitor(10);
        let body = Bytes::from(r#"{"usage":{"prompt_tokens":1}}"#);
        assert!(m
            .observe_response("llama", 500, "application/json", &body, 10)
            .is_none());
        assert!(m
            .observe_response("llama", 200, "application/json", &Bytes::new(), 10)
            .is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn zero_output_or_zero_duration_never_divides() {
        let m = monitor(10);
        let body = Bytes::from(r#"{"usage":{"prompt_tokens":5,"completion_tokens":0}}"#);
        m.observe_response("llama", 200, "application/json", &body, 1000)
            .unwrap();
        assert_eq!(m.snapshot()[0].tokens_per_second, -1.0);

        let body = Bytes::from(r#"{"usage":{"prompt_tokens":5,"completion_tokens":9}}"#);
        m.observe_response("llama", 200, "application/json", &body, 0)
            .unwrap();
        assert_eq!(m.snapshot()[1].tokens_per_second, -1.0);
        assert_eq!(m.snapshot()[1].duration_ms, 0);
    }

    #[test]
    fn ring_evicts_fifo_and_ids_stay_monotonic() {
        let m = monitor(3);
        for i in 0..5 {
            let metric = finalize_metric("m", UsageFields::default(), i);
            m.record(metric, None);
        }
        let snapshot = m.snapshot();
        assert_eq!(snapshot.len(), 3);
        let ids: Vec<u64> = snapshot.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn captures_are_retained_until_eviction() {
        let m = monitor(2);
        let body = Bytes::from(r#"{"usage":{"prompt_tokens":1,"completion_tokens":2}}"#);
        let id0 = m
            .observe_response("llama", 200, "application/json", &body, 10)
            .unwrap();
        assert_eq!(m.capture(id0).unwrap(), body);

        m.observe_response("llama", 200, "application/json", &body, 10);
        m.observe_response("llama", 200, "application/json", &body, 10);
        assert!(m.capture(id0).is_none());
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let m = std::sync::Arc::new(monitor(500));
        std::thread::scope(|scope| {
            for _ in 0..10 {
                let m = m.clone();
                scope.spawn(move || {
                    for i in 0..100 {
                        let metric = finalize_metric("m", UsageFields::default(), i);
                        m.record(metric, None);
                    }
                });
            }
            for _ in 0..5 {
                let m = m.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        let snapshot = m.snapshot();
                        for pair in snapshot.windows(2) {
                            assert!(pair[0].id < pair[1].id);
                        }
                    }
                });
            }
        });

        let snapshot = m.snapshot();
        assert_eq!(snapshot.len(), 500);
        for pair in snapshot.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[test]
    fn extract_usage_returns_none_without_either_object() {
        assert!(extract_usage(&serde_json::json!({"choices": []})).is_none());
    }

    #[test]
    fn extract_usage_accepts_openai_responses_field_names() {
        let fields = extract_usage(&serde_json::json!({
            "usage": {"input_tokens": 7, "output_tokens": 3, "cache_read_input_tokens": 2}
        }))
        .unwrap();
        assert_eq!(fields.input_tokens, Some(7));
        assert_eq!(fields.output_tokens, Some(3));
        assert_eq!(fields.cached_tokens, Some(2));
    }
}
