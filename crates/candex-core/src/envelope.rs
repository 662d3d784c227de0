//! Uniform `{success, data | error, message}` result envelope.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Wire shape for every operator-facing result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            message: None,
        }
    }
}

impl<T> From<crate::error::Result<T>> for ApiEnvelope<T> {
    fn from(result: crate::error::Result<T>) -> Self {
        match result {
            Ok(data) => ApiEnvelope::ok(data),
            Err(e) => ApiEnvelope::from_error(&e),
        }
    }
}

impl<T> ApiEnvelope<T> {
    /// Failure envelope with a short machine-friendly message per error kind.
    pub fn from_error(error: &Error) -> Self {
        let message = match error {
            Error::NotFound(_) | Error::CandidateNotFound(_) | Error::JobNotFound(_) => {
                "not_found"
            }
            Error::InvalidInput(_) | Error::Serialization(_) => "invalid_input",
            Error::Conflict(_) | Error::JobNotClaimed(_) => "conflict",
            Error::RateLimited { .. } => "rate_limited",
            Error::Config(_) => "config",
            _ => "internal",
        };
        ApiEnvelope::err(error.to_string()).with_message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_envelope_shape() {
        let env = ApiEnvelope::ok(json!({"scanned": 3})).with_message("done");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"success": true, "data": {"scanned": 3}, "message": "done"})
        );
    }

    #[test]
    fn test_error_envelope_shape() {
        let result: crate::Result<u32> = Err(Error::RateLimited {
            retry_after_ms: 10,
        });
        let env: ApiEnvelope<u32> = result.into();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["message"], "rate_limited");
        assert!(value.get("data").is_none());
    }
}
