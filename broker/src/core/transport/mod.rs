//! Transports that carry a tool call to its service.
//!
//! Which transport a service uses is decided once at startup from the
//! environment's configuration. Callers of the broker never see it.

mod direct;
mod mcp;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

pub use direct::{handler_fn, DirectRegistry, DirectTransport, FnHandler, ToolHandler};
pub use mcp::McpTransport;

use crate::{
    call::ToolCall,
    core::{
        config::{BrokerConfig, Environment, TransportKind},
        retry::RetryPolicy,
    },
    error::{ConfigError, TransportError},
};

/// One way of executing a tool call.
///
/// `execute` performs a single attempt. Timeouts and retries are applied by
/// the caller.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Short name for logs ("direct", "process", "network").
    fn kind(&self) -> &'static str;

    async fn execute(&self, call: &ToolCall) -> Result<Value, TransportError>;

    /// Release connections or worker processes.
    async fn close(&self) {}
}

/// Transport of one service together with its retry policy.
#[derive(Clone)]
pub struct ServiceHandle {
    pub transport: Arc<dyn ToolTransport>,
    pub policy: RetryPolicy,
}

impl ServiceHandle {
    pub fn new(transport: Arc<dyn ToolTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("transport", &self.transport.kind())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Service name to transport mapping for the active environment.
pub struct TransportSelector {
    environment: Environment,
    services: HashMap<String, ServiceHandle>,
}

impl TransportSelector {
    /// Build the transport of every service configured for `environment`.
    ///
    /// Fails when the environment has no section, a catalog service has no
    /// entry, or a direct service has no registered handler.
    pub fn from_config(
        config: &BrokerConfig,
        environment: Environment,
        registry: &DirectRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate(environment)?;

        let mut services = HashMap::new();
        for (service, cfg) in config.transports_for(environment)? {
            let transport: Arc<dyn ToolTransport> = match &cfg.transport {
                TransportKind::Direct => {
                    let handler = registry
                        .get(service)
                        .ok_or_else(|| ConfigError::MissingDirectHandler(service.clone()))?;
                    Arc::new(DirectTransport::new(handler))
                }
                TransportKind::Process {
                    command,
                    args,
                    envs,
                } => Arc::new(McpTransport::process(
                    service,
                    command.clone(),
                    args.clone(),
                    envs.clone(),
                )),
                TransportKind::Network {
                    url,
                    token,
                    headers,
                } => Arc::new(McpTransport::network(service, url, token, headers)?),
            };

            debug!(
                service = %service,
                transport = ?cfg.transport,
                "Configured service transport"
            );
            services.insert(
                service.clone(),
                ServiceHandle::new(transport, cfg.retry_policy()),
            );
        }

        info!(
            environment = %environment,
            services = services.len(),
            "Transport selection complete"
        );
        Ok(Self {
            environment,
            services,
        })
    }

    /// Selector over prebuilt handles.
    pub fn from_handles(
        environment: Environment,
        handles: impl IntoIterator<Item = (String, ServiceHandle)>,
    ) -> Self {
        Self {
            environment,
            services: handles.into_iter().collect(),
        }
    }

    pub fn resolve(&self, service: &str) -> Option<&ServiceHandle> {
        self.services.get(service)
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub async fn close_all(&self) {
        for (service, handle) in &self.services {
            debug!(service = %service, transport = handle.transport.kind(), "Closing transport");
            handle.transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::params;

    const YAML: &str = r#"
catalog:
  services:
    github:
      tools:
        fetch_repos: {}
    jobs:
      tools:
        search: {}
environments:
  development:
    github: { transport: direct }
    jobs: { transport: direct, max_retries: 5 }
  production:
    github:
      transport: process
      command: "node"
      args: ["github/server.js"]
    jobs:
      transport: network
      url: "http://127.0.0.1:9/mcp"
      token: "secret"
"#;

    fn registry() -> DirectRegistry {
        let handler = handler_fn(|call: ToolCall| async move {
            Ok(json!({ "tool": call.tool() }))
        });
        let mut registry = DirectRegistry::new();
        registry.register("github", handler.clone());
        registry.register("jobs", handler);
        registry
    }

    #[tokio::test]
    async fn test_development_uses_direct_handlers() {
        let config = BrokerConfig::from_yaml_str(YAML).unwrap();
        let selector =
            TransportSelector::from_config(&config, Environment::Development, &registry()).unwrap();

        assert_eq!(selector.environment(), Environment::Development);
        let handle = selector.resolve("jobs").unwrap();
        assert_eq!(handle.transport.kind(), "direct");
        assert_eq!(handle.policy.max_retries, 5);

        let call = ToolCall::new("jobs", "search", params! { "q" => "rust" });
        let value = handle.transport.execute(&call).await.unwrap();
        assert_eq!(value, json!({ "tool": "search" }));
        assert!(selector.resolve("unknown").is_none());
    }

    #[tokio::test]
    async fn test_production_uses_remote_transports() {
        let config = BrokerConfig::from_yaml_str(YAML).unwrap();
        let selector = TransportSelector::from_config(
            &config,
            Environment::Production,
            &DirectRegistry::new(),
        )
        .unwrap();

        assert_eq!(selector.resolve("github").unwrap().transport.kind(), "process");
        assert_eq!(selector.resolve("jobs").unwrap().transport.kind(), "network");
        assert_eq!(selector.services().count(), 2);
    }

    #[test]
    fn test_missing_direct_handler_is_fatal() {
        let config = BrokerConfig::from_yaml_str(YAML).unwrap();
        let mut registry = DirectRegistry::new();
        registry.register(
            "github",
            handler_fn(|_call: ToolCall| async { Ok(Value::Null) }),
        );

        let err = TransportSelector::from_config(&config, Environment::Development, &registry)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingDirectHandler(service) if service == "jobs"));
    }

    #[test]
    fn test_missing_environment_is_fatal() {
        let config = BrokerConfig::from_yaml_str(YAML).unwrap();
        let err = TransportSelector::from_config(&config, Environment::Test, &registry())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingEnvironment(_)));
    }
}
