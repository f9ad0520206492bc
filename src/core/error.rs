use serde_json::Value;

/// Errors surfaced by the token cache, the desk gateway and the job controller.
///
/// The variants are reported to the operator as-is: every one of them carries a
/// human readable message and, where the provider sent one, the raw payload.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Token refresh failed for profile '{profile}': {detail}")]
    Auth {
        profile: String,
        detail: String,
        payload: Option<Value>,
    },

    #[error("Desk API error (HTTP {status}): {message}")]
    Remote {
        status: u16,
        message: String,
        payload: Value,
    },

    #[error("{0}")]
    Validation(String),

    #[error("A critical server error occurred: {0}")]
    Critical(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl RelayError {
    /// Raw provider payload, when the failure came back from the provider.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            RelayError::Auth { payload, .. } => payload.as_ref(),
            RelayError::Remote { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Short message for per-item results. Remote failures report the provider's
    /// own `message` rather than the formatted error line.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::Remote { message, .. } => message.clone(),
            RelayError::Auth { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }

    /// Payload to hand back to the UI: the provider body if any, otherwise an
    /// `{ "error": ... }` object so the operator always has something to inspect.
    pub fn full_response(&self) -> Value {
        self.payload()
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "error": self.user_message() }))
    }
}

/// Pull the provider's error text out of a JSON error body.
pub(crate) fn provider_message(payload: &Value) -> Option<String> {
    ["message", "error_description", "error", "errorCode"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}
