//! Request broker.
//!
//! Every call goes through the same pipeline:
//!
//! 1. validate the parameters against the tool's contract
//! 2. look up the cache
//! 3. on a miss, join the in-flight call for the same key or start one
//! 4. the started call resolves the service's transport and runs it through
//!    the retry controller
//! 5. a success is cached with the tool's TTL before any waiter sees it
//!
//! Failures are never cached and never replaced by stale data.
//!
//! ## Example
//!
//! ```ignore
//! let config = BrokerConfig::from_file("broker.yaml").await?;
//! let broker = Broker::init(&config, Environment::from_env()?, registry)?;
//!
//! let repos = broker
//!     .call("github", "fetch_repos", params! { "username" => "alice" })
//!     .await?;
//! ```

use std::{
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    cache::{CacheStats, CacheStore},
    config::{BrokerConfig, Environment, ToolCatalog},
    inflight::{InFlightTracker, JoinRole},
    metrics::BrokerMetrics,
    retry::invoke_with_retry,
    transport::{DirectRegistry, TransportSelector},
    RawPayload,
};
use crate::{
    call::{CacheKey, CallContext, Params, ToolCall},
    error::{BrokerResult, ConfigError, ErrorKind},
};

/// Interval at which shutdown checks for remaining calls.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one transport execution, shared by every joined caller.
/// `attempts` is carried on failures too so every caller can report it.
#[derive(Debug, Clone)]
struct Resolution {
    result: BrokerResult<RawPayload>,
    attempts: u32,
}

/// Where a call's result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Rejected,
    Cache,
    Transport,
    Joined,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Source::Rejected => "rejected",
            Source::Cache => "hit",
            Source::Transport => "miss",
            Source::Joined => "joined",
        }
    }
}

struct CallOutcome {
    result: BrokerResult<RawPayload>,
    source: Source,
    attempts: u32,
}

struct BrokerInner {
    catalog: ToolCatalog,
    selector: TransportSelector,
    cache: CacheStore,
    in_flight: InFlightTracker<Resolution>,
    metrics: BrokerMetrics,
    shutdown_token: CancellationToken,
    active_calls: Arc<AtomicUsize>,
    shutdown_grace: Duration,
}

/// Mediates every call from the dashboard to its tool services.
///
/// Cheap to clone; clones share cache, in-flight calls and transports. Create
/// one per process with [`Broker::init`] and hand it to whoever needs it.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Build a broker for `environment` from `config`.
    ///
    /// Fails if any catalog service cannot be reached in that environment.
    pub fn init(
        config: &BrokerConfig,
        environment: Environment,
        registry: DirectRegistry,
    ) -> Result<Self, ConfigError> {
        let selector = TransportSelector::from_config(config, environment, &registry)?;
        let broker = Self::new(
            ToolCatalog::new(&config.catalog),
            selector,
            config.cache.max_entries,
            config.shutdown_grace(),
        );
        info!(
            environment = %environment,
            max_cache_entries = config.cache.max_entries,
            "Broker initialized"
        );
        Ok(broker)
    }

    /// Assemble a broker from already-built parts.
    pub fn new(
        catalog: ToolCatalog,
        selector: TransportSelector,
        max_cache_entries: usize,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                catalog,
                selector,
                cache: CacheStore::with_capacity(max_cache_entries),
                in_flight: InFlightTracker::new(),
                metrics: BrokerMetrics::new(),
                shutdown_token: CancellationToken::new(),
                active_calls: Arc::new(AtomicUsize::new(0)),
                shutdown_grace,
            }),
        }
    }

    /// Call `tool` on `service`.
    pub async fn call(
        &self,
        service: &str,
        tool: &str,
        params: Params,
    ) -> BrokerResult<RawPayload> {
        self.execute(ToolCall::new(service, tool, params)).await
    }

    /// Run a prepared [`ToolCall`].
    pub async fn execute(&self, call: ToolCall) -> BrokerResult<RawPayload> {
        let ctx = CallContext::new(&call);
        let span = info_span!(
            "broker_call",
            correlation_id = %ctx.correlation_id,
            service = %ctx.service,
            tool = %ctx.tool,
        );
        self.execute_with_context(call, ctx).instrument(span).await
    }

    async fn execute_with_context(
        &self,
        call: ToolCall,
        ctx: CallContext,
    ) -> BrokerResult<RawPayload> {
        let inner = &self.inner;
        if inner.shutdown_token.is_cancelled() {
            warn!("Call refused, broker is shut down");
            return Err(ctx.error(ErrorKind::TransportUnavailable(
                "broker is shut down".to_string(),
            )));
        }

        inner.active_calls.fetch_add(1, Ordering::SeqCst);
        inner.metrics.record_call_start();
        // Runs on drop too, so a caller abandoning the call releases both
        let mut completed = scopeguard::guard((Arc::clone(inner), false), |(inner, done)| {
            inner.active_calls.fetch_sub(1, Ordering::SeqCst);
            inner.metrics.record_call_exit(done);
        });
        let start = Instant::now();

        let outcome = self.resolve(&call, &ctx).await;

        let latency_ms = start.elapsed().as_millis() as u64;
        inner.metrics.record_call_end(
            call.service(),
            call.tool(),
            outcome.result.is_ok(),
            latency_ms,
        );
        completed.1 = true;

        match &outcome.result {
            Ok(_) => info!(
                outcome = "success",
                cache = outcome.source.as_str(),
                attempts = outcome.attempts,
                latency_ms,
                "Tool call completed"
            ),
            Err(e) => warn!(
                outcome = "failure",
                cache = outcome.source.as_str(),
                category = ?e.category(),
                error = %e.kind,
                attempts = outcome.attempts,
                latency_ms,
                "Tool call failed"
            ),
        }

        outcome.result
    }

    async fn resolve(&self, call: &ToolCall, ctx: &CallContext) -> CallOutcome {
        let inner = &self.inner;

        // Validating
        if let Err(e) = inner.catalog.validate(call) {
            inner.metrics.record_validation_failure();
            return CallOutcome {
                result: Err(ctx.error(ErrorKind::ValidationFailed(e))),
                source: Source::Rejected,
                attempts: 0,
            };
        }
        if let Some(contract) = inner.catalog.contract(call.service(), call.tool()) {
            let empty = contract.empty_params(call);
            if !empty.is_empty() {
                info!(params = ?empty, "Call carries empty parameters, executing anyway");
            }
        }

        // CacheCheck
        let key = call.cache_key();
        if let Some(entry) = inner.cache.get(&key) {
            inner.metrics.record_cache_hit();
            return CallOutcome {
                result: Ok(entry.payload),
                source: Source::Cache,
                attempts: 0,
            };
        }
        inner.metrics.record_cache_miss();

        // InFlightJoinOrStart. The cache is looked at again under the
        // in-flight lock: a leader that finished since the lookup above has
        // already stored its result.
        let joined = inner
            .in_flight
            .join_or_start_unless(
                &key,
                ctx,
                || {
                    inner.cache.peek(&key).map(|entry| Resolution {
                        result: Ok(entry.payload),
                        attempts: 0,
                    })
                },
                || {
                    Self::run_transport(
                        Arc::clone(&self.inner),
                        call.clone(),
                        key.clone(),
                        ctx.clone(),
                    )
                },
            )
            .await;

        let source = match joined.role {
            JoinRole::Leader => Source::Transport,
            JoinRole::Follower => {
                inner.metrics.record_joined();
                Source::Joined
            }
            JoinRole::Settled => Source::Cache,
        };
        match joined.result {
            Ok(resolution) => CallOutcome {
                result: resolution.result,
                source,
                attempts: resolution.attempts,
            },
            Err(e) => CallOutcome {
                result: Err(e),
                source,
                attempts: 0,
            },
        }
    }

    /// Body of an in-flight call: transport with retry, then cache store.
    ///
    /// Failures are returned inside the [`Resolution`] so they keep their
    /// attempt count; the outer error is left to a task that died.
    async fn run_transport(
        inner: Arc<BrokerInner>,
        call: ToolCall,
        key: CacheKey,
        ctx: CallContext,
    ) -> BrokerResult<Resolution> {
        let Some(handle) = inner.selector.resolve(call.service()) else {
            return Ok(Resolution {
                result: Err(ctx.error(ErrorKind::TransportUnavailable(format!(
                    "no transport for service '{}'",
                    call.service()
                )))),
                attempts: 0,
            });
        };

        debug!(
            correlation_id = %ctx.correlation_id,
            transport = handle.transport.kind(),
            "Invoking transport"
        );
        let attempts = AtomicU32::new(0);
        let result = invoke_with_retry(&handle.policy, &ctx, || {
            attempts.fetch_add(1, Ordering::Relaxed);
            let transport = Arc::clone(&handle.transport);
            let call = call.clone();
            async move { transport.execute(&call).await }
        })
        .await;
        let attempts = attempts.load(Ordering::Relaxed);
        inner.metrics.record_transport_execution(attempts);

        let attempted = match result {
            Ok(attempted) => attempted,
            Err(e) => {
                return Ok(Resolution {
                    result: Err(e),
                    attempts,
                })
            }
        };
        let payload: RawPayload = Arc::new(attempted.value);
        let ttl = inner.catalog.ttl(call.service(), call.tool());
        inner.cache.put(key, Arc::clone(&payload), ttl);

        Ok(Resolution {
            result: Ok(payload),
            attempts: attempted.attempts,
        })
    }

    /// Drop every cached response and reset the hit/miss counters.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        info!("Cache cleared");
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Drop the cached response of one call. Returns whether there was one.
    pub fn invalidate(&self, service: &str, tool: &str, params: &Params) -> bool {
        self.inner
            .cache
            .invalidate(&CacheKey::new(service, tool, params))
    }

    /// Drop every cached response of one tool. Returns how many were dropped.
    pub fn invalidate_tool(&self, service: &str, tool: &str) -> usize {
        let removed = self.inner.cache.invalidate_tool(service, tool);
        debug!(service, tool, removed, "Invalidated tool cache");
        removed
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.inner.metrics
    }

    pub fn environment(&self) -> Environment {
        self.inner.selector.environment()
    }

    /// Calls currently being executed (cache hits included while they run).
    pub fn active_calls(&self) -> usize {
        self.inner.active_calls.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown_token.is_cancelled()
    }

    /// Shut the broker down.
    ///
    /// New calls are refused immediately. Calls already running get up to
    /// the configured grace period to finish, then transports are closed and
    /// the cache is cleared. Safe to call more than once.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown_token.is_cancelled() {
            return;
        }
        info!("Starting graceful shutdown of broker");
        inner.shutdown_token.cancel();

        let start = Instant::now();
        while inner.active_calls.load(Ordering::SeqCst) > 0 || !inner.in_flight.is_empty() {
            if start.elapsed() >= inner.shutdown_grace {
                warn!(
                    active_calls = inner.active_calls.load(Ordering::SeqCst),
                    in_flight = inner.in_flight.len(),
                    "Shutdown grace period elapsed with calls still running"
                );
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        inner.selector.close_all().await;
        inner.cache.clear();
        info!("Broker shutdown complete");
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("environment", &self.environment())
            .field("active_calls", &self.active_calls())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
