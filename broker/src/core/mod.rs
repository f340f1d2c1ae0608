//! Core broker infrastructure.

pub mod broker;
pub mod cache;
pub mod config;
pub mod inflight;
pub mod metrics;
pub mod retry;
pub mod transport;

use std::sync::Arc;

/// Untyped tool response. Shared between the cache and every caller.
pub type RawPayload = Arc<serde_json::Value>;

pub use broker::Broker;
pub use cache::{CacheEntry, CacheStats, CacheStore};
pub use config::{
    BrokerConfig, CacheConfig, CatalogConfig, Environment, ServiceCatalog,
    ServiceTransportConfig, ToolCatalog, ToolSpec, TransportKind, ENVIRONMENT_VAR,
};
pub use inflight::{InFlightTracker, JoinRole, Joined};
pub use metrics::{BrokerMetrics, LatencySnapshot, MetricsSnapshot};
pub use retry::{invoke_with_retry, Attempted, RetryPolicy};
pub use transport::{
    handler_fn, DirectRegistry, DirectTransport, FnHandler, McpTransport, ServiceHandle,
    ToolHandler, ToolTransport, TransportSelector,
};
