//! Request broker for the career dashboard.
//!
//! Sits between the dashboard's widgets and the backend tool services
//! (GitHub, resume, job market, learning). Every call is validated, served
//! from a TTL cache when possible, collapsed with identical concurrent calls,
//! and sent over the transport configured for the current environment with
//! bounded retries.
//!
//! ## Modules
//!
//! - [`core`]: broker, cache, in-flight tracking, retry, transports, config
//! - [`call`]: tool calls, parameter values and cache keys
//! - [`validation`]: per-tool parameter contracts
//! - [`error`]: error types
//! - [`logging`]: tracing subscriber setup

pub mod call;
pub mod error;
pub mod logging;
pub mod validation;

pub mod core;

pub use call::{CacheKey, CallContext, ParamValue, Params, ToolCall};
pub use self::core::{
    handler_fn, Broker, BrokerConfig, BrokerMetrics, CacheStats, DirectRegistry, Environment,
    MetricsSnapshot, RawPayload, RetryPolicy, ServiceHandle, ToolCatalog, ToolHandler,
    ToolTransport, TransportKind, TransportSelector,
};
pub use error::{
    BrokerError, BrokerResult, ConfigError, ErrorCategory, ErrorKind, TransportError,
    ValidationError,
};
pub use logging::LoggingConfig;
pub use validation::{ParamConstraint, ParamType, ValidationContract};
