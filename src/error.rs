//! Error taxonomy for the device client
//!
//! Each concern has its own error enum; [`ClientError`] folds them together for
//! the operations exposed to the application. Errors raised while handling
//! transport events are logged and dropped, never escalated.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Errors from the persistent key/value collaborator
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Stored value for '{key}' is {len} bytes, capacity is {capacity}")]
    BufferTooSmall {
        key: String,
        len: usize,
        capacity: usize,
    },

    #[error("Storage I/O failure: {0}")]
    IoFailure(String),

    #[error("Storage not initialized")]
    NotInitialized,
}

/// Malformed inbound payloads or topics. The offending message is dropped.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Missing or mistyped field: {0}")]
    MissingField(&'static str),

    #[error("Invalid device token: {0}")]
    InvalidToken(String),

    #[error("Malformed topic: {0}")]
    MalformedTopic(String),
}

/// Transport collaborator failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Publishing to {topic} failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Subscription to {topic} failed")]
    SubscriptionFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Transport handle already stopped")]
    Stopped,
}

/// Errors returned by [`crate::client::DeviceClient`] operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out after {timeout_ms}ms waiting for the session lock")]
    LockTimeout { timeout_ms: u64 },

    #[error("Session not ready for telemetry (connected under the device token required)")]
    NotReady,

    #[error("Client has not been started")]
    NotStarted,

    #[error("Client already started")]
    AlreadyStarted,
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)("?(?:password|token|secret\w*|key|credentialsvalue|provisiondevice\w*)"?\s*[=:]\s*)("[^"]*"|[^\s,}]+)"#)
        .expect("secret pattern is valid")
});

const MAX_LOG_LEN: usize = 256;

/// Mask credential values and truncate long payloads before they reach the logs
pub fn sanitize_for_log(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}***")
        .to_string();

    if sanitized.len() > MAX_LOG_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_LOG_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}
