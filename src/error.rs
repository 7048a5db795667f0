//! Error definitions for the streaming bridge

use std::path::PathBuf;

use crate::codec::CodecError;

/// Errors raised while loading the dataset, talking to the broker or reading configuration
///
/// `Interrupted` is deliberately absent: an interrupt is an expected way for a run to end
/// and is reported through [`crate::publisher::Outcome`] instead.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The dataset path does not resolve to a file
    #[error("Dataset not found: {}", path.display())]
    DatasetNotFound { path: PathBuf },

    /// The dataset exists but could not be read as a table
    #[error("Dataset {} is malformed: {reason}", path.display())]
    DatasetMalformed { path: PathBuf, reason: String },

    /// The broker session could not be established or was lost
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A single message was not accepted by the broker
    #[error("Publish to {topic} rejected: {reason}")]
    PublishRejected { topic: String, reason: String },

    /// A row could not be turned into a wire payload
    #[error("Encoding failed: {0}")]
    EncodeFailed(#[from] CodecError),

    #[error("Configuration file not found: {}", path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    pub fn rejected(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PublishRejected {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}
