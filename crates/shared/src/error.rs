use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    #[default]
    #[serde(other)]
    Internal,
}

/// Error body returned by the REST collaborator and carried by `error` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ApiErrorRepr")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

/// Bodies may carry `message`, `error`, or both; `message` wins.
#[derive(Deserialize)]
struct ApiErrorRepr {
    #[serde(default)]
    code: ErrorCode,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<ApiErrorRepr> for ApiError {
    fn from(value: ApiErrorRepr) -> Self {
        let message = [value.message, value.error]
            .into_iter()
            .flatten()
            .find(|message| !message.trim().is_empty())
            .unwrap_or_default();
        ApiError {
            code: value.code,
            message,
        }
    }
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Parses an error response body, keeping only bodies that carry a usable message.
    pub fn from_body(body: &str) -> Option<Self> {
        let parsed = serde_json::from_str::<ApiError>(body).ok()?;
        if parsed.message.trim().is_empty() {
            return None;
        }
        Some(parsed)
    }
}
