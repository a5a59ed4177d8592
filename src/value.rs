use crate::error::{AgentError, Result};
use serde_json::Value;

/// Outcome of one check: a value, an error, or (rarely) neither.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckResult {
    pub value: Option<String>,
    pub error: Option<String>,
}

impl CheckResult {
    pub fn value(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            value: None,
            error: Some(error.into()),
        }
    }
}

/// Everything a collector may hand back.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckValue {
    Text(String),
    Uint(u64),
    Int(i64),
    Float(f64),
    Prebuilt(CheckResult),
    Error(String),
}

impl CheckValue {
    pub fn into_result(self) -> CheckResult {
        match self {
            Self::Text(s) => CheckResult::value(s),
            Self::Uint(v) => CheckResult::value(v.to_string()),
            Self::Int(v) => CheckResult::value(v.to_string()),
            Self::Float(v) => CheckResult::value(format_float(v)),
            Self::Prebuilt(result) => result,
            Self::Error(e) => CheckResult::error(e),
        }
    }

    /// Convert a plugin export value. `null` means the plugin had nothing to
    /// report.
    pub fn from_json(value: Value) -> Result<Option<Self>> {
        let converted = match value {
            Value::Null => return Ok(None),
            Value::String(s) => Self::Text(s),
            Value::Bool(b) => Self::Uint(u64::from(b)),
            Value::Number(n) => {
                if let Some(v) = n.as_u64() {
                    Self::Uint(v)
                } else if let Some(v) = n.as_i64() {
                    Self::Int(v)
                } else if let Some(v) = n.as_f64() {
                    Self::Float(v)
                } else {
                    return Err(AgentError::application(format!(
                        "Unsupported numeric value {}.",
                        n
                    )));
                }
            }
            Value::Array(_) | Value::Object(_) => {
                return Err(AgentError::application(
                    "Value of type array or object is not supported.",
                ))
            }
        };
        Ok(Some(converted))
    }
}

fn format_float(v: f64) -> String {
    format!("{:.6}", v)
}

impl From<String> for CheckValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for CheckValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<u64> for CheckValue {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<i64> for CheckValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for CheckValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}
