//! Parameter contracts and validation.
//!
//! Contracts are declared per tool in the catalog section of the broker
//! configuration and checked before any cache or transport work happens.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    call::{ParamValue, ToolCall},
    error::ValidationError,
};

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
    /// A number with no fractional part.
    Integer,
    Bool,
    List,
    Map,
    #[default]
    Any,
}

impl ParamType {
    fn name(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Bool => "bool",
            ParamType::List => "list",
            ParamType::Map => "map",
            ParamType::Any => "any",
        }
    }

    fn accepts(self, value: &ParamValue) -> bool {
        match (self, value) {
            (ParamType::Any, _) => true,
            (ParamType::String, ParamValue::String(_)) => true,
            (ParamType::Number, ParamValue::Number(_)) => true,
            (ParamType::Integer, ParamValue::Number(n)) => n.fract() == 0.0,
            (ParamType::Bool, ParamValue::Bool(_)) => true,
            (ParamType::List, ParamValue::List(_)) => true,
            (ParamType::Map, ParamValue::Map(_)) => true,
            _ => false,
        }
    }
}

/// Constraint on a single parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamConstraint {
    #[serde(default, rename = "type")]
    pub kind: ParamType,

    #[serde(default)]
    pub required: bool,

    /// Minimum length in characters (strings) or items (lists).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    /// Allowed values for string parameters.
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

impl ParamConstraint {
    pub fn required(kind: ParamType) -> Self {
        Self {
            kind,
            required: true,
            ..Default::default()
        }
    }

    pub fn optional(kind: ParamType) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn with_allowed<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Reject constraint combinations that can never be checked.
    pub fn check_definition(&self) -> Result<(), String> {
        if self.allowed.is_some() && !matches!(self.kind, ParamType::String | ParamType::Any) {
            return Err(format!(
                "enum only applies to string parameters, not {}",
                self.kind.name()
            ));
        }
        Ok(())
    }

    fn check(&self, name: &str, value: &ParamValue) -> Result<(), ValidationError> {
        if !self.kind.accepts(value) {
            return Err(ValidationError::TypeMismatch {
                parameter: name.to_string(),
                expected: self.kind.name(),
                actual: value.type_name(),
            });
        }

        let length = match value {
            ParamValue::String(s) => Some(s.chars().count()),
            ParamValue::List(items) => Some(items.len()),
            _ => None,
        };
        if let Some(length) = length {
            let too_short = self.min_length.is_some_and(|min| length < min);
            let too_long = self.max_length.is_some_and(|max| length > max);
            if too_short || too_long {
                return Err(ValidationError::LengthOutOfRange {
                    parameter: name.to_string(),
                    length,
                    min: self.min_length,
                    max: self.max_length,
                });
            }
        }

        // Only strings can be members; `any` parameters holding something
        // else are rejected rather than skipped.
        if let Some(allowed) = &self.allowed {
            let member = value
                .as_str()
                .is_some_and(|s| allowed.iter().any(|candidate| candidate == s));
            if !member {
                return Err(ValidationError::NotAllowed {
                    parameter: name.to_string(),
                    value: value
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| value.to_json().to_string()),
                    allowed: allowed.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Parameter contract of one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationContract {
    pub params: HashMap<String, ParamConstraint>,
}

impl ValidationContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, name: impl Into<String>, constraint: ParamConstraint) -> Self {
        self.params.insert(name.into(), constraint);
        self
    }

    /// Check every declared constraint with
    /// [`ParamConstraint::check_definition`].
    pub fn check_definition(&self) -> Result<(), String> {
        let mut names: Vec<&String> = self.params.keys().collect();
        names.sort();
        for name in names {
            self.params[name]
                .check_definition()
                .map_err(|e| format!("parameter '{}': {}", name, e))?;
        }
        Ok(())
    }

    /// Check `call` against this contract.
    ///
    /// Parameters are visited in name order so the reported failure is
    /// deterministic when several parameters are wrong. Undeclared
    /// parameters are ignored.
    pub fn validate(&self, call: &ToolCall) -> Result<(), ValidationError> {
        let mut names: Vec<&String> = self.params.keys().collect();
        names.sort();

        for name in names {
            let constraint = &self.params[name];
            match call.param(name) {
                Some(value) => constraint.check(name, value)?,
                None if constraint.required => {
                    return Err(ValidationError::MissingParameter {
                        parameter: name.clone(),
                    })
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Declared parameters whose value is present but empty.
    pub fn empty_params<'a>(&self, call: &'a ToolCall) -> Vec<&'a str> {
        call.params()
            .iter()
            .filter(|(name, value)| self.params.contains_key(*name) && value.is_empty())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    fn repos_contract() -> ValidationContract {
        ValidationContract::new()
            .with_param(
                "username",
                ParamConstraint::required(ParamType::String).with_length(Some(1), Some(39)),
            )
            .with_param(
                "sort",
                ParamConstraint::optional(ParamType::String).with_allowed(["stars", "updated"]),
            )
            .with_param("limit", ParamConstraint::optional(ParamType::Integer))
    }

    #[test]
    fn test_valid_call() {
        let call = ToolCall::new(
            "github",
            "fetch_repos",
            params! { "username" => "alice", "sort" => "stars", "limit" => 5i64 },
        );
        assert!(repos_contract().validate(&call).is_ok());
    }

    #[test]
    fn test_missing_required() {
        let call = ToolCall::new("github", "fetch_repos", params! { "sort" => "stars" });
        let err = repos_contract().validate(&call).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingParameter {
                parameter: "username".into()
            }
        );
    }

    #[test]
    fn test_type_mismatch() {
        let call = ToolCall::new("github", "fetch_repos", params! { "username" => 123i64 });
        let err = repos_contract().validate(&call).unwrap_err();
        assert_eq!(err.parameter(), Some("username"));
        assert!(matches!(
            err,
            ValidationError::TypeMismatch {
                expected: "string",
                actual: "number",
                ..
            }
        ));
    }

    #[test]
    fn test_integer_rejects_fraction() {
        let call = ToolCall::new(
            "github",
            "fetch_repos",
            params! { "username" => "alice", "limit" => 2.5 },
        );
        let err = repos_contract().validate(&call).unwrap_err();
        assert_eq!(err.parameter(), Some("limit"));
    }

    #[test]
    fn test_length_bounds() {
        let too_long = "x".repeat(40);
        let call = ToolCall::new("github", "fetch_repos", params! { "username" => too_long });
        assert!(matches!(
            repos_contract().validate(&call),
            Err(ValidationError::LengthOutOfRange { length: 40, .. })
        ));

        let empty = ToolCall::new("github", "fetch_repos", params! { "username" => "" });
        assert!(matches!(
            repos_contract().validate(&empty),
            Err(ValidationError::LengthOutOfRange { length: 0, .. })
        ));
    }

    #[test]
    fn test_enum_membership() {
        let call = ToolCall::new(
            "github",
            "fetch_repos",
            params! { "username" => "alice", "sort" => "forks" },
        );
        let err = repos_contract().validate(&call).unwrap_err();
        assert!(matches!(err, ValidationError::NotAllowed { ref value, .. } if value == "forks"));
    }

    #[test]
    fn test_enum_on_any_rejects_non_strings() {
        let contract = ValidationContract::new().with_param(
            "region",
            ParamConstraint::optional(ParamType::Any).with_allowed(["eu", "us"]),
        );
        let call = ToolCall::new("jobs", "live_postings", params! { "region" => 7i64 });
        let err = contract.validate(&call).unwrap_err();
        assert!(matches!(err, ValidationError::NotAllowed { ref value, .. } if value == "7"));

        let ok = ToolCall::new("jobs", "live_postings", params! { "region" => "eu" });
        assert!(contract.validate(&ok).is_ok());
    }

    #[test]
    fn test_enum_definition_needs_string_type() {
        let numeric = ValidationContract::new().with_param(
            "limit",
            ParamConstraint::optional(ParamType::Integer).with_allowed(["10", "20"]),
        );
        let err = numeric.check_definition().unwrap_err();
        assert!(err.contains("limit"));
        assert!(err.contains("integer"));

        assert!(repos_contract().check_definition().is_ok());
    }

    #[test]
    fn test_unknown_params_ignored() {
        let call = ToolCall::new(
            "github",
            "fetch_repos",
            params! { "username" => "alice", "include_forks" => true },
        );
        assert!(repos_contract().validate(&call).is_ok());
    }

    #[test]
    fn test_empty_list_is_valid_but_reported() {
        let contract = ValidationContract::new()
            .with_param("skills", ParamConstraint::required(ParamType::List));
        let call = ToolCall::new(
            "roadmap",
            "generate",
            params! { "skills" => Vec::<String>::new() },
        );
        assert!(contract.validate(&call).is_ok());
        assert_eq!(contract.empty_params(&call), vec!["skills"]);
    }

    #[test]
    fn test_contract_from_yaml() {
        let yaml = r#"
username: { type: string, required: true, min_length: 1 }
sort: { type: string, enum: [stars, updated] }
"#;
        let contract: ValidationContract = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(contract.params.len(), 2);
        assert!(contract.params["username"].required);
        assert_eq!(
            contract.params["sort"].allowed.as_deref(),
            Some(&["stars".to_string(), "updated".to_string()][..])
        );
    }
}
