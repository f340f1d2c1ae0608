//! Process and network transports, both speaking MCP.
//!
//! A process service is a worker started from a command and driven over
//! stdio; a network service is a remote MCP server behind a URL. The session
//! is opened on first use and reused afterwards. When the peer goes away the
//! session is dropped and the next attempt reconnects.

use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, ErrorCode},
    service::{RunningService, ServiceError},
    RoleClient, ServiceExt,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::ToolTransport;
use crate::{
    call::ToolCall,
    error::{ConfigError, TransportError},
};

type McpClient = RunningService<RoleClient, ()>;

enum Endpoint {
    Process {
        command: String,
        args: Vec<String>,
        envs: HashMap<String, String>,
    },
    Network {
        url: String,
        client: reqwest::Client,
    },
}

pub struct McpTransport {
    service: String,
    endpoint: Endpoint,
    session: Mutex<Option<Arc<McpClient>>>,
}

impl McpTransport {
    /// Worker process started from `command`. Nothing is spawned until the
    /// first call.
    pub fn process(
        service: impl Into<String>,
        command: String,
        args: Vec<String>,
        envs: HashMap<String, String>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: Endpoint::Process {
                command,
                args,
                envs,
            },
            session: Mutex::new(None),
        }
    }

    /// Remote server at `url`. The HTTP client is built here so malformed
    /// credentials or headers fail at startup.
    pub fn network(
        service: impl Into<String>,
        url: &str,
        token: &Option<String>,
        headers: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let service = service.into();
        let client = build_http_client(token, headers)
            .map_err(|e| ConfigError::Invalid(format!("service '{}': {}", service, e)))?;
        Ok(Self {
            service,
            endpoint: Endpoint::Network {
                url: url.to_string(),
                client,
            },
            session: Mutex::new(None),
        })
    }

    /// Current session, connecting first if there is none.
    async fn session(&self) -> Result<Arc<McpClient>, TransportError> {
        let mut session = self.session.lock().await;
        if let Some(client) = session.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(self.connect().await?);
        *session = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn connect(&self) -> Result<McpClient, TransportError> {
        use rmcp::transport::{
            streamable_http_client::StreamableHttpClientTransportConfig, ConfigureCommandExt,
            StreamableHttpClientTransport, TokioChildProcess,
        };

        match &self.endpoint {
            Endpoint::Process {
                command,
                args,
                envs,
            } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(envs.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| {
                    TransportError::Unavailable(format!("spawn worker '{}': {}", command, e))
                })?;

                let client = ().serve(transport).await.map_err(|e| {
                    TransportError::Unavailable(format!("initialize worker '{}': {}", command, e))
                })?;
                info!(service = %self.service, command = %command, "Started worker process");
                Ok(client)
            }

            Endpoint::Network { url, client } => {
                let cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                let transport = StreamableHttpClientTransport::with_client(client.clone(), cfg);

                let client = ().serve(transport).await.map_err(|e| {
                    TransportError::Unavailable(format!("connect to {}: {}", url, e))
                })?;
                info!(service = %self.service, url = %url, "Connected to remote service");
                Ok(client)
            }
        }
    }

    /// Forget the session so the next call reconnects.
    async fn reset(&self) {
        if self.session.lock().await.take().is_some() {
            warn!(service = %self.service, "Lost connection to service, will reconnect");
        }
    }
}

#[async_trait]
impl ToolTransport for McpTransport {
    fn kind(&self) -> &'static str {
        match self.endpoint {
            Endpoint::Process { .. } => "process",
            Endpoint::Network { .. } => "network",
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<Value, TransportError> {
        let client = self.session().await?;
        let request = CallToolRequestParam {
            name: Cow::Owned(call.tool().to_string()),
            arguments: Some(call.arguments()),
        };

        match client.call_tool(request).await {
            Ok(result) => payload_from_result(result),
            Err(e) => {
                if matches!(
                    e,
                    ServiceError::TransportClosed | ServiceError::TransportSend(_)
                ) {
                    self.reset().await;
                }
                Err(map_service_error(&e))
            }
        }
    }

    async fn close(&self) {
        let Some(client) = self.session.lock().await.take() else {
            return;
        };
        match Arc::try_unwrap(client) {
            Ok(client) => {
                if let Err(e) = client.cancel().await {
                    warn!(service = %self.service, "Error closing session: {}", e);
                }
            }
            Err(_) => {
                warn!(
                    service = %self.service,
                    "Could not close session: client still in use"
                );
            }
        }
    }
}

/// Build request headers from token and custom headers.
fn build_request_headers(
    token: &Option<String>,
    custom_headers: &HashMap<String, String>,
) -> Result<reqwest::header::HeaderMap, String> {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Some(tok) = token {
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", tok)
                .parse()
                .map_err(|e| format!("auth token: {}", e))?,
        );
    }

    for (key, value) in custom_headers {
        headers.insert(
            reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| format!("header name '{}': {}", key, e))?,
            value
                .parse()
                .map_err(|e| format!("header value for '{}': {}", key, e))?,
        );
    }

    Ok(headers)
}

fn build_http_client(
    token: &Option<String>,
    custom_headers: &HashMap<String, String>,
) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

    let req_headers = build_request_headers(token, custom_headers)?;
    if !req_headers.is_empty() {
        builder = builder.default_headers(req_headers);
    }

    builder
        .build()
        .map_err(|e| format!("build HTTP client: {}", e))
}

/// HTTP-style status for an MCP error code. Caller mistakes map to 4xx and
/// are never retried.
fn upstream_status(code: &ErrorCode) -> u16 {
    if *code == ErrorCode::RESOURCE_NOT_FOUND || *code == ErrorCode::METHOD_NOT_FOUND {
        404
    } else if *code == ErrorCode::INVALID_PARAMS
        || *code == ErrorCode::INVALID_REQUEST
        || *code == ErrorCode::PARSE_ERROR
    {
        400
    } else {
        500
    }
}

fn map_service_error(err: &ServiceError) -> TransportError {
    match err {
        ServiceError::McpError(data) => {
            TransportError::upstream(upstream_status(&data.code), data.message.to_string())
        }
        ServiceError::Timeout { timeout } => TransportError::Timeout(*timeout),
        other => TransportError::Unavailable(other.to_string()),
    }
}

/// Extract the payload of a tool result.
///
/// Structured content wins. Otherwise a lone text item holding JSON is
/// decoded, and anything else is returned as the serialized content list.
fn payload_from_result(result: CallToolResult) -> Result<Value, TransportError> {
    let content = serde_json::to_value(&result.content)
        .map_err(|e| TransportError::upstream(500, format!("unreadable tool result: {}", e)))?;

    if result.is_error.unwrap_or(false) {
        let message = single_text(&content).unwrap_or("tool reported an error");
        return Err(TransportError::upstream(500, message));
    }

    if let Some(structured) = result.structured_content {
        return Ok(structured);
    }

    match single_text(&content) {
        Some(text) => {
            Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
        }
        None => {
            debug!("Tool returned non-text content, passing through as-is");
            Ok(content)
        }
    }
}

fn single_text(content: &Value) -> Option<&str> {
    match content.as_array()?.as_slice() {
        [item] if item.get("type").and_then(Value::as_str) == Some("text") => {
            item.get("text").and_then(Value::as_str)
        }
        _ => None,
    }
}
