//! In-process transport: the tool logic is linked into the broker's process.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use super::ToolTransport;
use crate::{call::ToolCall, error::TransportError};

/// Tool implementation of one service.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run `call.tool()` with `call.params()`.
    async fn call(&self, call: &ToolCall) -> Result<Value, TransportError>;
}

#[async_trait]
impl<H: ToolHandler + ?Sized> ToolHandler for Arc<H> {
    async fn call(&self, call: &ToolCall) -> Result<Value, TransportError> {
        (**self).call(call).await
    }
}

/// [`ToolHandler`] backed by an async closure. See [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TransportError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TransportError>> + Send,
{
    async fn call(&self, call: &ToolCall) -> Result<Value, TransportError> {
        (self.f)(call.clone()).await
    }
}

/// Handlers for services reached through the direct transport, keyed by
/// service name.
#[derive(Clone, Default)]
pub struct DirectRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl DirectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler of `service`.
    pub fn register<H>(&mut self, service: impl Into<String>, handler: H) -> &mut Self
    where
        H: ToolHandler + 'static,
    {
        self.handlers.insert(service.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(service).cloned()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.handlers.contains_key(service)
    }
}

impl fmt::Debug for DirectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services: Vec<&String> = self.handlers.keys().collect();
        services.sort();
        f.debug_struct("DirectRegistry")
            .field("services", &services)
            .finish()
    }
}

pub struct DirectTransport {
    handler: Arc<dyn ToolHandler>,
}

impl DirectTransport {
    pub fn new(handler: Arc<dyn ToolHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl ToolTransport for DirectTransport {
    fn kind(&self) -> &'static str {
        "direct"
    }

    async fn execute(&self, call: &ToolCall) -> Result<Value, TransportError> {
        self.handler.call(call).await
    }
}
