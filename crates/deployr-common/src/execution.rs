use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DeployrError, Result};

/// Normalized result of one function invocation.
///
/// Invariants: `success` implies `status_code < 400`; a failed result
/// always carries an error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionExecutionResult {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub success: bool,
    pub error_message: Option<String>,
}

impl FunctionExecutionResult {
    pub fn success(status_code: u16, headers: HashMap<String, String>, body: Value) -> Result<Self> {
        if status_code >= 400 {
            return Err(DeployrError::BusinessRule(format!(
                "Success result cannot carry error status code: {status_code}"
            )));
        }
        Ok(Self {
            status_code,
            headers,
            body: normalize_body(body),
            success: true,
            error_message: None,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::error_with_status(500, message)
    }

    pub fn error_with_status(status_code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let status_code = status_code.max(400);
        Self {
            status_code,
            headers: HashMap::new(),
            body: serde_json::json!({ "error": message }),
            success: false,
            error_message: Some(message),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.success && self.status_code >= 400 {
            return Err(DeployrError::BusinessRule(format!(
                "Successful result has error status code: {}",
                self.status_code
            )));
        }
        if !self.success && self.error_message.is_none() {
            return Err(DeployrError::BusinessRule(
                "Failed result is missing an error message".into(),
            ));
        }
        Ok(())
    }
}

/// A body that arrived as a JSON-looking string is parsed into structured
/// form; anything else passes through unchanged.
pub fn normalize_body(body: Value) -> Value {
    if let Value::String(s) = &body {
        let trimmed = s.trim();
        let looks_like_json = (trimmed.starts_with('{') && trimmed.ends_with('}'))
            || (trimmed.starts_with('[') && trimmed.ends_with(']'));
        if looks_like_json {
            if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                return parsed;
            }
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_rejects_error_status() {
        assert!(FunctionExecutionResult::success(500, HashMap::new(), Value::Null).is_err());
        assert!(FunctionExecutionResult::success(204, HashMap::new(), Value::Null).is_ok());
    }

    #[test]
    fn error_carries_message_and_floor_status() {
        let result = FunctionExecutionResult::error_with_status(200, "boom");
        assert!(!result.success);
        assert_eq!(result.status_code, 400);
        assert_eq!(result.error_message.as_deref(), Some("boom"));
        assert!(result.validate().is_ok());
    }

    #[test]
    fn json_looking_string_body_is_parsed() {
        let result = FunctionExecutionResult::success(
            200,
            HashMap::new(),
            Value::String("{\"books\": [1, 2]}".into()),
        )
        .unwrap();
        assert_eq!(result.body, json!({ "books": [1, 2] }));
    }

    #[test]
    fn plain_string_body_passes_through() {
        let result = FunctionExecutionResult::success(
            200,
            HashMap::new(),
            Value::String("hello".into()),
        )
        .unwrap();
        assert_eq!(result.body, Value::String("hello".into()));
    }

    #[test]
    fn malformed_json_string_is_kept_verbatim() {
        let body = Value::String("{not json".into());
        assert_eq!(normalize_body(body.clone()), body);
    }
}
