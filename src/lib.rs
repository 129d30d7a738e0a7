//! llmsnap - OpenAI-compatible proxy that starts, sleeps, wakes, and stops
//! local inference servers on demand
//!
//! A client names a `model` in an ordinary chat/completions/embeddings
//! request; llmsnap resolves it to a managed child process, makes that
//! process ready (starting it or waking it, displacing conflicting
//! processes first), streams the request through a reverse proxy, and
//! collects token metrics from the response without interfering with it.
//!
//! Architecture:
//! - Proxy server (axum): routes requests and the management/observability API
//! - Process engine: per-process state machine, health checks, TTL, sleep/wake
//! - Group scheduler: swap/exclusive/persistent displacement policy
//! - Metrics: tee'd response capture parsed into a bounded ring
//! - Event bus: state changes, metrics, and logs fanned out over SSE

pub mod cli;
pub mod config;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod proxy;
