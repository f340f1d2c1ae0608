//! Broker error types.
//!
//! Defines the transport-level errors raised by tool transports, the
//! validation errors produced before any side effect, the terminal
//! [`BrokerError`] handed back to callers, and startup configuration errors.
//!
//! Every call-path error is `Clone`: one in-flight outcome is fanned out to
//! every caller that joined it.

use std::time::Duration;

use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by a single transport attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Error reported by the tool service. `code` uses HTTP-style semantics:
    /// 4xx is a rejected request, 5xx is a service-side failure.
    #[error("upstream error {code}: {message}")]
    Upstream { code: u16, message: String },
}

impl TransportError {
    pub fn upstream(code: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            code,
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Unavailable(_) | TransportError::Timeout(_) => true,
            TransportError::Upstream { code, .. } => *code >= 500,
        }
    }
}

/// Parameter validation failures. Each variant names the offending parameter
/// (or the unknown tool).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no contract for tool '{service}.{tool}'")]
    UnknownTool { service: String, tool: String },

    #[error("missing required parameter '{parameter}'")]
    MissingParameter { parameter: String },

    #[error("parameter '{parameter}' must be {expected}, got {actual}")]
    TypeMismatch {
        parameter: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("parameter '{parameter}' has length {length}, allowed {min:?}..={max:?}")]
    LengthOutOfRange {
        parameter: String,
        length: usize,
        min: Option<usize>,
        max: Option<usize>,
    },

    #[error("parameter '{parameter}' value '{value}' is not one of {allowed:?}")]
    NotAllowed {
        parameter: String,
        value: String,
        allowed: Vec<String>,
    },
}

impl ValidationError {
    /// Name of the offending parameter, if the failure is about one.
    pub fn parameter(&self) -> Option<&str> {
        match self {
            ValidationError::UnknownTool { .. } => None,
            ValidationError::MissingParameter { parameter }
            | ValidationError::TypeMismatch { parameter, .. }
            | ValidationError::LengthOutOfRange { parameter, .. }
            | ValidationError::NotAllowed { parameter, .. } => Some(parameter),
        }
    }
}

/// What went wrong with a broker call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("validation failed: {0}")]
    ValidationFailed(ValidationError),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream error {code}: {message}")]
    UpstreamError { code: u16, message: String },

    #[error("retries exhausted after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ErrorKind> },
}

impl From<TransportError> for ErrorKind {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(msg) => ErrorKind::TransportUnavailable(msg),
            TransportError::Timeout(after) => ErrorKind::Timeout(after),
            TransportError::Upstream { code, message } => {
                ErrorKind::UpstreamError { code, message }
            }
        }
    }
}

/// How the caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient; the same call may succeed later.
    RetryLater,
    /// The request itself is wrong.
    FixInput,
    /// Will not work without a configuration change.
    Fatal,
}

/// Terminal error of a broker call, tagged with the originating tool and the
/// correlation id of the call that produced it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{service}.{tool} [{correlation_id}]: {kind}")]
pub struct BrokerError {
    pub kind: ErrorKind,
    pub service: String,
    pub tool: String,
    pub correlation_id: String,
}

impl BrokerError {
    pub fn new(
        kind: ErrorKind,
        service: impl Into<String>,
        tool: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            service: service.into(),
            tool: tool.into(),
            correlation_id: correlation_id.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match &self.kind {
            ErrorKind::ValidationFailed(_) => ErrorCategory::FixInput,
            ErrorKind::UpstreamError { code, .. } if *code < 500 => ErrorCategory::FixInput,
            _ => ErrorCategory::RetryLater,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.kind, ErrorKind::ValidationFailed(_))
    }

    pub fn validation_error(&self) -> Option<&ValidationError> {
        match &self.kind {
            ErrorKind::ValidationFailed(err) => Some(err),
            _ => None,
        }
    }
}

/// Startup configuration errors. These prevent the broker from starting and
/// are never returned from a call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no transport configuration for environment '{0}'")]
    MissingEnvironment(String),

    #[error("service '{service}' has no transport configured for environment '{environment}'")]
    MissingService {
        service: String,
        environment: String,
    },

    #[error("service '{0}' uses the direct transport but no in-process handler is registered")]
    MissingDirectHandler(String),

    #[error("unknown environment '{0}' (expected development, test or production)")]
    UnknownEnvironment(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Fatal
    }
}
