use std::time::Duration;

use shared::error::ApiError;
use thiserror::Error;

pub const SEND_FAILED_MESSAGE: &str = "failed to send message";

#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("validation failed: {message}")]
    Validation { message: String, files: Vec<String> },
    #[error("resource not found")]
    NotFound,
    #[error("network error: {0}")]
    Network(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("server error {status}: {}", message.as_deref().unwrap_or("<no message>"))]
    Server { status: u16, message: Option<String> },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid payload: {0}")]
    Decode(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation {
            message: message.into(),
            files: Vec::new(),
        }
    }

    pub fn from_response(status: u16, body: &str) -> Self {
        if status == 404 {
            return ChatError::NotFound;
        }
        ChatError::Server {
            status,
            message: ApiError::from_body(body).map(|err| err.message),
        }
    }

    /// Network stalls and timeouts degrade to cached data instead of failing hard.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            ChatError::Network(_) | ChatError::Timeout { .. } | ChatError::Transport(_)
        )
    }

    /// Text shown to the sender after a failed send attempt.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Validation { message, .. } => message.clone(),
            ChatError::Server {
                message: Some(message),
                ..
            } => message.clone(),
            _ => SEND_FAILED_MESSAGE.to_string(),
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            return ChatError::Decode(value.to_string());
        }
        if let Some(status) = value.status() {
            return ChatError::from_response(status.as_u16(), "");
        }
        ChatError::Network(value.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(value: serde_json::Error) -> Self {
        ChatError::Decode(value.to_string())
    }
}
