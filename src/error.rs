//! Error types for NovaMail.

use std::time::Duration;

/// Configuration-related errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mailbox provider errors (Gmail REST or IMAP/SMTP).
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Authentication failed for mailbox {provider}: {reason}")]
    AuthFailed { provider: String, reason: String },

    #[error("Mailbox {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Mailbox {provider} returned HTTP {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from mailbox {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Message {id} not found")]
    NotFound { id: String },

    #[error("Failed to send reply via {provider}: {reason}")]
    SendFailed { provider: String, reason: String },

    #[error("Mailbox {provider} timed out")]
    Timeout { provider: String },
}

/// Completion backend errors. Never propagated past the completion adapter.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Notification errors. Logged and dropped by the poll loop.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification via {name} failed: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Notification via {name} rejected with HTTP {status}")]
    Rejected { name: String, status: u16 },
}

/// Reply composition errors.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("Invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build reply: {0}")]
    Build(String),
}
