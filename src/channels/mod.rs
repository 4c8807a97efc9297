//! Mailbox and notification abstractions.
//!
//! A `Mailbox` is where mail comes from and where replies go; a `Notifier`
//! is where outcome reports are pushed. Both are trait objects held by the
//! `AppContext`.

pub mod email;
pub mod email_types;
pub mod gmail;
pub mod telegram;

use async_trait::async_trait;

pub use email::{EmailConfig, ImapMailbox};
pub use email_types::{FetchedMessage, HeuristicQuoteSplitter, QuoteSplit, QuoteSplitter};
pub use gmail::{GmailConfig, GmailMailbox};
pub use telegram::{TelegramConfig, TelegramNotifier};

use crate::error::{MailboxError, NotifyError};
use crate::pipeline::types::OutboundReplyPayload;

/// Result of a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentReply {
    /// Provider id of the sent message, when the provider reports one.
    pub provider_id: Option<String>,
}

/// A mail provider: list unread, fetch, reply, mark read.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Short provider name, for logs.
    fn name(&self) -> &str;

    /// The address this mailbox sends as. Called once at startup, where it
    /// also serves as the credential probe.
    async fn own_address(&self) -> Result<String, MailboxError>;

    /// Ids of unread inbox messages, at most `max`.
    async fn list_unread(&self, max: u32) -> Result<Vec<String>, MailboxError>;

    /// Fetch one message. Must not change its read state.
    async fn get_message(&self, id: &str) -> Result<FetchedMessage, MailboxError>;

    /// Send a composed reply.
    async fn send_reply(&self, payload: &OutboundReplyPayload) -> Result<SentReply, MailboxError>;

    /// Mark a message as read.
    async fn mark_read(&self, id: &str) -> Result<(), MailboxError>;
}

/// A destination for Markdown outcome reports.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, markdown: &str) -> Result<(), NotifyError>;
}

/// Notifier used when no notification endpoint is configured.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn name(&self) -> &str {
        "none"
    }

    async fn notify(&self, _markdown: &str) -> Result<(), NotifyError> {
        tracing::warn!("Notification credentials not configured; skipping report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_notifier_always_succeeds() {
        let notifier = NoopNotifier;
        assert_eq!(notifier.name(), "none");
        assert!(notifier.notify("*report*").await.is_ok());
    }
}
