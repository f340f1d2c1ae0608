//! Broker configuration types and utilities.
//!
//! The configuration has three parts:
//! - `catalog`: every service and tool the broker knows, with the tool's cache
//!   TTL and parameter contract. Environment independent.
//! - `environments`: per deployment environment, how each service is reached
//!   (direct / process / network) and its timeout and retry policy.
//! - process settings: cache cap, shutdown grace period, logging.
//!
//! Everything is loaded once at startup and immutable afterwards.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    call::{CacheKey, ToolCall},
    core::retry::RetryPolicy,
    error::{ConfigError, ValidationError},
    logging::LoggingConfig,
    validation::ValidationContract,
};

/// Environment variable naming the deployment environment.
pub const ENVIRONMENT_VAR: &str = "DASHBOARD_ENV";

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    /// Read the environment from `DASHBOARD_ENV` (default: development).
    ///
    /// Call once at startup and pass the result down; the broker never
    /// re-reads it.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(ENVIRONMENT_VAR) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Services and tools (TTL + parameter contracts)
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Transport settings per environment
    #[serde(default)]
    pub environments: HashMap<Environment, HashMap<String, ServiceTransportConfig>>,

    #[serde(default)]
    pub cache: CacheConfig,

    /// How long shutdown waits for in-flight calls (milliseconds)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// TTL for tools that do not declare one (milliseconds)
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    #[serde(default)]
    pub services: HashMap<String, ServiceCatalog>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceCatalog {
    #[serde(default)]
    pub tools: HashMap<String, ToolSpec>,
}

/// Per-tool settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolSpec {
    /// Cache TTL (milliseconds). `0` disables caching for the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,

    /// Parameter contract
    #[serde(default)]
    pub params: ValidationContract,
}

/// How a service is reached.
#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportKind {
    /// Tool logic linked into this process.
    Direct,
    /// Worker process speaking MCP over stdio.
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    /// Remote MCP server over streamable HTTP.
    Network {
        url: String,
        /// Bearer token for Authorization header
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::Process { .. } => "process",
            TransportKind::Network { .. } => "network",
        }
    }
}

impl fmt::Debug for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => f.write_str("Direct"),
            TransportKind::Process {
                command,
                args,
                envs,
            } => f
                .debug_struct("Process")
                .field("command", command)
                .field("args", args)
                .field("envs", &format!("{} vars", envs.len()))
                .finish(),
            TransportKind::Network {
                url,
                token,
                headers,
            } => f
                .debug_struct("Network")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
        }
    }
}

/// Transport and retry settings of one service in one environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceTransportConfig {
    #[serde(flatten)]
    pub transport: TransportKind,

    /// Per-attempt timeout (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl ServiceTransportConfig {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_multiplier: default_backoff_multiplier(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            attempt_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Upper bound on cached responses; least recently used go first
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

// Default value functions
fn default_ttl_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_entries() -> usize {
    10_000
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            services: HashMap::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a YAML file
    pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Transport settings for `environment`.
    pub fn transports_for(
        &self,
        environment: Environment,
    ) -> Result<&HashMap<String, ServiceTransportConfig>, ConfigError> {
        self.environments
            .get(&environment)
            .ok_or_else(|| ConfigError::MissingEnvironment(environment.to_string()))
    }

    /// Check that every declared service can be reached in `environment` and
    /// that all numeric settings are usable.
    pub fn validate(&self, environment: Environment) -> Result<(), ConfigError> {
        self.validate_catalog()?;
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }

        let transports = self.transports_for(environment)?;

        let mut services: Vec<&String> = self.catalog.services.keys().collect();
        services.sort();
        for service in services {
            let Some(cfg) = transports.get(service) else {
                return Err(ConfigError::MissingService {
                    service: service.clone(),
                    environment: environment.to_string(),
                });
            };
            if cfg.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "service '{}': timeout_ms must be greater than 0",
                    service
                )));
            }
            if !cfg.backoff_multiplier.is_finite() || cfg.backoff_multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "service '{}': backoff_multiplier must be >= 1.0, got {}",
                    service, cfg.backoff_multiplier
                )));
            }
            match &cfg.transport {
                TransportKind::Process { command, .. } if command.trim().is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "service '{}': process transport needs a command",
                        service
                    )));
                }
                TransportKind::Network { url, .. } if url.trim().is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "service '{}': network transport needs a url",
                        service
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Names must not contain the cache key separator, and every parameter
    /// constraint must be checkable.
    fn validate_catalog(&self) -> Result<(), ConfigError> {
        for (service, catalog) in &self.catalog.services {
            check_name("service", service)?;
            for (tool, spec) in &catalog.tools {
                check_name("tool", tool)?;
                spec.params.check_definition().map_err(|e| {
                    ConfigError::Invalid(format!("tool '{}.{}': {}", service, tool, e))
                })?;
            }
        }
        Ok(())
    }
}

fn check_name(what: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.contains(CacheKey::SEPARATOR) {
        return Err(ConfigError::Invalid(format!(
            "{} name '{}' must be non-empty and must not contain '{}'",
            what,
            name,
            CacheKey::SEPARATOR
        )));
    }
    Ok(())
}

/// Read-only view of the catalog used on the call path.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    default_ttl: Duration,
    services: HashMap<String, ServiceCatalog>,
}

impl ToolCatalog {
    pub fn new(config: &CatalogConfig) -> Self {
        Self {
            default_ttl: Duration::from_millis(config.default_ttl_ms),
            services: config.services.clone(),
        }
    }

    pub fn tool(&self, service: &str, tool: &str) -> Option<&ToolSpec> {
        self.services.get(service)?.tools.get(tool)
    }

    pub fn contract(&self, service: &str, tool: &str) -> Option<&ValidationContract> {
        self.tool(service, tool).map(|spec| &spec.params)
    }

    /// Cache TTL for a tool (the catalog default when the tool sets none).
    pub fn ttl(&self, service: &str, tool: &str) -> Duration {
        self.tool(service, tool)
            .and_then(|spec| spec.ttl_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.default_ttl)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Validate a call against its tool's contract. Unknown tools fail.
    pub fn validate(&self, call: &ToolCall) -> Result<(), ValidationError> {
        let contract = self
            .contract(call.service(), call.tool())
            .ok_or_else(|| ValidationError::UnknownTool {
                service: call.service().to_string(),
                tool: call.tool().to_string(),
            })?;
        contract.validate(call)
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::params;

    const FULL_YAML: &str = r#"
catalog:
  default_ttl_ms: 60000
  services:
    github:
      tools:
        fetch_repos:
          ttl_ms: 600000
          params:
            username: { type: string, required: true, min_length: 1 }
        repo_stats:
          ttl_ms: 30000
    learning:
      tools:
        catalog:
          ttl_ms: 86400000

environments:
  development:
    github:
      transport: direct
    learning:
      transport: direct
  production:
    github:
      transport: process
      command: "node"
      args: ["tools/github/server.js"]
      envs:
        GITHUB_TOKEN: "ghp_secret"
      timeout_ms: 15000
      max_retries: 2
      backoff_multiplier: 3
    learning:
      transport: network
      url: "https://tools.internal/learning/mcp"
      token: "secret-token"

cache:
  max_entries: 500

shutdown_grace_ms: 5000
"#;

    #[test]
    fn test_environment_parse() {
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!("DEV".parse::<Environment>().unwrap(), Environment::Development);
        assert!(matches!(
            "staging".parse::<Environment>(),
            Err(ConfigError::UnknownEnvironment(_))
        ));
    }

    #[test]
    #[serial]
    fn test_environment_from_env() {
        std::env::remove_var(ENVIRONMENT_VAR);
        assert_eq!(Environment::from_env().unwrap(), Environment::Development);

        std::env::set_var(ENVIRONMENT_VAR, "production");
        assert_eq!(Environment::from_env().unwrap(), Environment::Production);

        std::env::remove_var(ENVIRONMENT_VAR);
    }

    #[test]
    fn test_yaml_full_config() {
        let config = BrokerConfig::from_yaml_str(FULL_YAML).expect("Failed to parse YAML");

        assert_eq!(config.cache.max_entries, 500);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.catalog.services.len(), 2);

        let prod = config.transports_for(Environment::Production).unwrap();
        let github = &prod["github"];
        match &github.transport {
            TransportKind::Process {
                command,
                args,
                envs,
            } => {
                assert_eq!(command, "node");
                assert_eq!(args.len(), 1);
                assert_eq!(envs.get("GITHUB_TOKEN").unwrap(), "ghp_secret");
            }
            other => panic!("Expected process transport, got {:?}", other),
        }
        assert_eq!(github.timeout_ms, 15_000);
        assert_eq!(github.max_retries, 2);
        assert_eq!(github.backoff_multiplier, 3.0);

        let learning = &prod["learning"];
        assert_eq!(learning.transport.name(), "network");
        // Defaults
        assert_eq!(learning.max_retries, 3);
        assert_eq!(learning.timeout_ms, 30_000);

        assert!(config.validate(Environment::Development).is_ok());
        assert!(config.validate(Environment::Production).is_ok());
    }

    #[test]
    fn test_yaml_minimal_config() {
        let config = BrokerConfig::from_yaml_str("{}").unwrap();
        assert!(config.catalog.services.is_empty());
        assert_eq!(config.catalog.default_ttl_ms, 300_000);
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.shutdown_grace_ms, 30_000);
    }

    #[test]
    fn test_missing_environment_is_fatal() {
        let config = BrokerConfig::from_yaml_str(FULL_YAML).unwrap();
        assert!(matches!(
            config.validate(Environment::Test),
            Err(ConfigError::MissingEnvironment(env)) if env == "test"
        ));
    }

    #[test]
    fn test_missing_service_is_fatal() {
        let yaml = r#"
catalog:
  services:
    github: { tools: { fetch_repos: {} } }
    resume: { tools: { score: {} } }
environments:
  development:
    github: { transport: direct }
"#;
        let config = BrokerConfig::from_yaml_str(yaml).unwrap();
        match config.validate(Environment::Development) {
            Err(ConfigError::MissingService {
                service,
                environment,
            }) => {
                assert_eq!(service, "resume");
                assert_eq!(environment, "development");
            }
            other => panic!("Expected MissingService, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let yaml = r#"
catalog:
  services:
    github: { tools: { fetch_repos: {} } }
environments:
  development:
    github: { transport: direct, backoff_multiplier: 0.5 }
"#;
        let config = BrokerConfig::from_yaml_str(yaml).unwrap();
        assert!(matches!(
            config.validate(Environment::Development),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_separator_in_catalog_name_rejected() {
        let yaml = r#"
catalog:
  services:
    "jobs/eu": { tools: { search: {} } }
environments:
  development:
    "jobs/eu": { transport: direct }
"#;
        let config = BrokerConfig::from_yaml_str(yaml).unwrap();
        assert!(matches!(
            config.validate(Environment::Development),
            Err(ConfigError::Invalid(msg)) if msg.contains("jobs/eu")
        ));

        let yaml = r#"
catalog:
  services:
    jobs: { tools: { "eu/search": {} } }
environments:
  development:
    jobs: { transport: direct }
"#;
        let config = BrokerConfig::from_yaml_str(yaml).unwrap();
        assert!(matches!(
            config.validate(Environment::Development),
            Err(ConfigError::Invalid(msg)) if msg.contains("eu/search")
        ));
    }

    #[test]
    fn test_enum_on_numeric_param_rejected() {
        let yaml = r#"
catalog:
  services:
    github:
      tools:
        fetch_repos:
          params:
            limit: { type: integer, enum: ["10", "20"] }
environments:
  development:
    github: { transport: direct }
"#;
        let config = BrokerConfig::from_yaml_str(yaml).unwrap();
        assert!(matches!(
            config.validate(Environment::Development),
            Err(ConfigError::Invalid(msg)) if msg.contains("github.fetch_repos")
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = BrokerConfig::from_yaml_str(FULL_YAML).unwrap();
        let prod = config.transports_for(Environment::Production).unwrap();
        let rendered = format!("{:?} {:?}", prod["github"], prod["learning"]);
        assert!(!rendered.contains("ghp_secret"));
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("****"));
    }

    #[test]
    fn test_catalog_ttl_and_validation() {
        let config = BrokerConfig::from_yaml_str(FULL_YAML).unwrap();
        let catalog = ToolCatalog::new(&config.catalog);

        assert_eq!(
            catalog.ttl("github", "fetch_repos"),
            Duration::from_secs(600)
        );
        assert_eq!(catalog.ttl("github", "repo_stats"), Duration::from_secs(30));
        assert_eq!(
            catalog.ttl("learning", "catalog"),
            Duration::from_secs(86_400)
        );
        assert_eq!(catalog.ttl("github", "unknown"), Duration::from_secs(60));

        let ok = ToolCall::new("github", "fetch_repos", params! { "username" => "alice" });
        assert!(catalog.validate(&ok).is_ok());

        let unknown = ToolCall::new("github", "delete_repo", params! {});
        assert!(matches!(
            catalog.validate(&unknown),
            Err(ValidationError::UnknownTool { .. })
        ));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let mut cfg = ServiceTransportConfig::new(TransportKind::Direct);
        cfg.max_retries = 4;
        cfg.timeout_ms = 250;
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.attempt_timeout, Duration::from_millis(250));
        assert_eq!(policy.base_delay, Duration::from_millis(200));
    }
}
