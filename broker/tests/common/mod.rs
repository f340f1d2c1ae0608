//! Shared fixtures for broker integration tests.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashboard_broker::{
    Broker, BrokerConfig, DirectRegistry, Environment, ToolCall, ToolHandler, TransportError,
};
use serde_json::{json, Value};

/// Catalog plus a `test` environment where every service is direct.
/// Retry settings are small so tests with a paused clock stay readable.
pub const CONFIG_YAML: &str = r#"
catalog:
  default_ttl_ms: 60000
  services:
    github:
      tools:
        fetch_repos:
          ttl_ms: 600000
          params:
            username: { type: string, required: true, min_length: 1 }
            limit: { type: integer }
    resume:
      tools:
        score:
          params:
            id: { type: string, required: true }
    jobs:
      tools:
        live_postings:
          ttl_ms: 1
          params:
            region: { type: string, required: true, enum: [eu, us, apac] }
        search:
          params:
            skills: { type: list, required: true, max_length: 20 }

environments:
  test:
    github:
      transport: direct
      timeout_ms: 100
      max_retries: 3
      base_delay_ms: 10
      backoff_multiplier: 2
    resume:
      transport: direct
      timeout_ms: 1000
      max_retries: 3
      base_delay_ms: 10
    jobs:
      transport: direct
      timeout_ms: 1000
      max_retries: 0

shutdown_grace_ms: 1000
"#;

/// Scriptable direct handler.
///
/// Returns a distinct payload per invocation. Can sleep before answering and
/// fail its first N invocations.
pub struct StubHandler {
    calls: AtomicU32,
    delay: Duration,
    fail_first: u32,
    failure: TransportError,
}

impl StubHandler {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            fail_first: 0,
            failure: TransportError::Unavailable("stub failure".to_string()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(mut self, times: u32, failure: TransportError) -> Self {
        self.fail_first = times;
        self.failure = failure;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Invocations so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolHandler for StubHandler {
    async fn call(&self, call: &ToolCall) -> Result<Value, TransportError> {
        let invocation = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if invocation <= self.fail_first {
            return Err(self.failure.clone());
        }
        Ok(json!({
            "tool": call.tool(),
            "invocation": invocation,
            "params": Value::Object(call.arguments()),
        }))
    }
}

pub fn config() -> BrokerConfig {
    BrokerConfig::from_yaml_str(CONFIG_YAML).unwrap()
}

/// Broker for the `test` environment with one handler per service.
pub fn broker(
    github: &Arc<StubHandler>,
    resume: &Arc<StubHandler>,
    jobs: &Arc<StubHandler>,
) -> Broker {
    let mut registry = DirectRegistry::new();
    registry
        .register("github", Arc::clone(github))
        .register("resume", Arc::clone(resume))
        .register("jobs", Arc::clone(jobs));
    Broker::init(&config(), Environment::Test, registry).unwrap()
}

/// Broker where every service shares one handler.
pub fn broker_with(handler: &Arc<StubHandler>) -> Broker {
    broker(handler, handler, handler)
}
