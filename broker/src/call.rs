//! Tool call description and cache key derivation.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BrokerError, ErrorKind};

/// Ordered parameter mapping. Ordering makes the serialized form canonical.
pub type Params = BTreeMap<String, ParamValue>;

/// A single parameter value.
///
/// Deserializes from plain JSON/YAML scalars, arrays and objects. `null` is
/// not a valid parameter value; omit the parameter instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// Type name used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Number(_) => "number",
            ParamValue::String(_) => "string",
            ParamValue::List(_) => "list",
            ParamValue::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Empty strings, lists and maps are valid but usually carry no meaning.
    pub fn is_empty(&self) -> bool {
        match self {
            ParamValue::String(s) => s.trim().is_empty(),
            ParamValue::List(items) => items.is_empty(),
            ParamValue::Map(map) => map.is_empty(),
            ParamValue::Bool(_) | ParamValue::Number(_) => false,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Number(n) => number_to_json(*n),
            ParamValue::String(s) => Value::String(s.clone()),
            ParamValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            ParamValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Integral numbers go out as JSON integers so tools receive `10`, not `10.0`.
fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Number(value as f64)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        ParamValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// One logical invocation of a tool on a backend service. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    service: String,
    tool: String,
    params: Params,
}

impl ToolCall {
    pub fn new(service: impl Into<String>, tool: impl Into<String>, params: Params) -> Self {
        Self {
            service: service.into(),
            tool: tool.into(),
            params,
        }
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[inline]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    #[inline]
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// Parameters as a JSON object for the wire.
    pub fn arguments(&self) -> serde_json::Map<String, Value> {
        self.params
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect()
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.service, &self.tool, &self.params)
    }
}

/// Deterministic key for a (service, tool, params) triple.
///
/// Format: `service/tool/<canonical JSON of params>`. Map keys are sorted at
/// every level, so two calls with the same arguments in a different insertion
/// order share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    key: String,
    prefix_len: usize,
}

impl CacheKey {
    /// Separates service, tool and params. Catalog names may not contain it.
    pub const SEPARATOR: char = '/';

    pub fn new(service: &str, tool: &str, params: &Params) -> Self {
        let prefix = Self::tool_prefix(service, tool);
        let canonical = Value::Object(
            params
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json()))
                .collect(),
        );
        let prefix_len = prefix.len();
        Self {
            key: format!("{}{}", prefix, canonical),
            prefix_len,
        }
    }

    /// Shared prefix of every key belonging to one tool.
    pub fn tool_prefix(service: &str, tool: &str) -> String {
        format!("{}{sep}{}{sep}", service, tool, sep = Self::SEPARATOR)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn belongs_to(&self, service: &str, tool: &str) -> bool {
        self.key[..self.prefix_len] == Self::tool_prefix(service, tool)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Identity of one originating call, used to tag logs and errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub correlation_id: String,
    pub service: String,
    pub tool: String,
}

impl CallContext {
    /// New context with a fresh correlation id.
    pub fn new(call: &ToolCall) -> Self {
        Self::with_correlation_id(call, Uuid::new_v4().to_string())
    }

    pub fn with_correlation_id(call: &ToolCall, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            service: call.service().to_string(),
            tool: call.tool().to_string(),
        }
    }

    pub fn error(&self, kind: impl Into<ErrorKind>) -> BrokerError {
        BrokerError::new(
            kind.into(),
            self.service.clone(),
            self.tool.clone(),
            self.correlation_id.clone(),
        )
    }
}

/// Build a [`Params`] map from `name => value` pairs.
///
/// ```
/// use dashboard_broker::params;
///
/// let params = params! { "username" => "alice", "limit" => 10i64 };
/// assert_eq!(params.len(), 2);
/// ```
#[macro_export]
macro_rules! params {
    () => { $crate::Params::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Params::new();
        $( map.insert(::std::string::String::from($name), $crate::ParamValue::from($value)); )+
        map
    }};
}
