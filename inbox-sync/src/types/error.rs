//! Unified error types for the sync engine
//!
//! This module defines error types that:
//! - Are serializable for presentation layers
//! - Follow the transport / decode / commit / consistency taxonomy
//! - Map third-party errors to a single enum

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for every fallible operation in the crate
///
/// Transport and decode errors are logged and recovered where they occur.
/// Commit errors are returned to whoever initiated the optimistic mutation.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum InboxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("{operation} failed: {message}")]
    Commit { operation: String, message: String },

    #[error("Inconsistent state: {0}")]
    Consistency(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Illegal connection transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}

impl InboxError {
    /// Wrap any error as a commit failure for the named operation
    pub fn commit(operation: &str, err: impl std::fmt::Display) -> Self {
        InboxError::Commit {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for InboxError {
    fn from(err: std::io::Error) -> Self {
        InboxError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for InboxError {
    fn from(err: toml::de::Error) -> Self {
        InboxError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for InboxError {
    fn from(err: serde_json::Error) -> Self {
        InboxError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for InboxError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            InboxError::Network(format!("request timed out: {}", err))
        } else {
            InboxError::Network(err.to_string())
        }
    }
}

impl From<url::ParseError> for InboxError {
    fn from(err: url::ParseError) -> Self {
        InboxError::Config(format!("Invalid URL: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for InboxError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        InboxError::Transport(err.to_string())
    }
}

impl From<String> for InboxError {
    fn from(err: String) -> Self {
        InboxError::Other(err)
    }
}

impl From<&str> for InboxError {
    fn from(err: &str) -> Self {
        InboxError::Other(err.to_string())
    }
}

/// Result type alias using InboxError
pub type Result<T> = std::result::Result<T, InboxError>;
