//! Error types for the Pulsar bridge
//!
//! Every variant names the setting, topic or path involved and keeps the
//! underlying cause as its `source`, so misconfiguration can be diagnosed
//! without digging into broker client internals.

use std::path::PathBuf;
use thiserror::Error;

/// Boxed cause from the broker client library
pub type TransportCause = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Credential setting '{setting}' is not a valid JSON file setting: {source}")]
    CredentialDecode {
        setting: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Credential setting '{setting}' is malformed: {message}")]
    CredentialFormat {
        setting: &'static str,
        message: String,
    },

    #[error("Failed to write credential material at {}: {source}", path.display())]
    CredentialIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection '{name}' could not be initialized: {message}")]
    ConnectionInit {
        name: String,
        message: String,
        #[source]
        source: Option<TransportCause>,
    },

    #[error("Publish input carries neither a string nor a structured payload")]
    PayloadMissing,

    #[error("Failed to publish to topic '{topic}': {source}")]
    Publish {
        topic: String,
        #[source]
        source: TransportCause,
    },

    #[error("Failed to subscribe '{subscription}' on topic '{topic}': {source}")]
    Subscribe {
        topic: String,
        subscription: String,
        #[source]
        source: TransportCause,
    },

    #[error("Receive failed on topic '{topic}': {source}")]
    Receive {
        topic: String,
        #[source]
        source: TransportCause,
    },

    #[error("Acknowledgement failed on topic '{topic}': {source}")]
    Ack {
        topic: String,
        #[source]
        source: TransportCause,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl BridgeError {
    /// Create a connection initialization error without an underlying cause
    pub fn connection_init<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self::ConnectionInit {
            name: name.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a credential format error
    pub fn credential_format<M: Into<String>>(setting: &'static str, message: M) -> Self {
        Self::CredentialFormat {
            setting,
            message: message.into(),
        }
    }

    /// Error text safe to write to logs
    pub fn sanitized(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            let cause_text = cause.to_string();
            if !text.contains(&cause_text) {
                text.push_str(": ");
                text.push_str(&cause_text);
            }
            source = cause.source();
        }
        sanitize_error_message(&text)
    }
}

/// Sanitize error messages to prevent token and key leakage in logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    // Remove common secret patterns
    sanitized = regex::Regex::new(r"(?i)(password|token|jwt|key|secret)[=:]\s*\S+")
        .expect("static regex")
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    // Bearer tokens and PEM bodies
    sanitized = regex::Regex::new(r"(?i)bearer\s+\S+")
        .expect("static regex")
        .replace_all(&sanitized, "Bearer ***")
        .to_string();
    sanitized = regex::Regex::new(r"(?s)-----BEGIN [A-Z ]+-----.*?-----END [A-Z ]+-----")
        .expect("static regex")
        .replace_all(&sanitized, "<pem redacted>")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
