// Proxy module - HTTP surface over the process lifecycle engine
//
// The router dispatches inference requests (body names the model) through
// the group scheduler to a managed process, streams responses back with a
// metrics tee, and exposes the management and observability endpoints.

pub mod api;
pub mod error;
pub mod filters;
pub mod handlers;
pub mod server;
pub mod state;

pub use error::ProxyError;
pub use server::{build_router, start_proxy};
pub use state::ProxyState;
