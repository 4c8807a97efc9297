//! Shared types for the reply pipeline.

use base64::Engine;
use chrono::{DateTime, Utc};

use crate::channels::email_types::QuoteSplit;
use crate::error::LlmError;

// ── Inbound message ─────────────────────────────────────────────────

/// A fetched message reduced to what the pipeline needs.
///
/// Built once per loop iteration by the extractor and never mutated.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Provider message id.
    pub id: String,
    /// Provider conversation id.
    pub thread_id: Option<String>,
    /// `From` header as displayed, e.g. `Alice <alice@example.com>`.
    pub sender: String,
    /// Bare address derived from `sender`.
    pub sender_address: String,
    pub subject: String,
    /// Plain-text body (HTML stripped when no text part exists).
    pub body_text: String,
    /// Original `Message-ID`, verbatim.
    pub message_id_header: Option<String>,
    /// Original `References` chain, in order.
    pub references: Vec<String>,
    pub received_at: DateTime<Utc>,
    /// `received_at` is "now" because the `Date` header was missing or bad.
    pub received_at_fallback: bool,
    /// Newest text vs quoted history.
    pub quote: QuoteSplit,
}

// ── Generation ──────────────────────────────────────────────────────

/// Why generation fell back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationFailure {
    /// Backend answered with nothing usable.
    Empty,
    RateLimited,
    Auth,
    Timeout,
    Malformed,
    Backend(String),
}

impl GenerationFailure {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::Malformed => "malformed",
            Self::Backend(_) => "backend",
        }
    }
}

impl From<&LlmError> for GenerationFailure {
    fn from(err: &LlmError) -> Self {
        match err {
            LlmError::RateLimited { .. } => Self::RateLimited,
            LlmError::AuthFailed { .. } => Self::Auth,
            LlmError::Timeout { .. } => Self::Timeout,
            LlmError::InvalidResponse { .. } => Self::Malformed,
            LlmError::RequestFailed { reason, .. } => Self::Backend(reason.clone()),
        }
    }
}

/// Text to send back, and whether it came from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedReply {
    pub text: String,
    pub generation_succeeded: bool,
    pub failure: Option<GenerationFailure>,
}

impl GeneratedReply {
    pub fn generated(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            generation_succeeded: true,
            failure: None,
        }
    }

    pub fn fallback(text: impl Into<String>, failure: GenerationFailure) -> Self {
        Self {
            text: text.into(),
            generation_succeeded: false,
            failure: Some(failure),
        }
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// A fully composed reply, ready for a mailbox to send.
#[derive(Debug, Clone)]
pub struct OutboundReplyPayload {
    /// Provider conversation to file the reply under.
    pub thread_id: Option<String>,
    /// Recipient, as taken from the original `From`.
    pub to: String,
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Serialized RFC 2822 message.
    pub raw: Vec<u8>,
}

impl OutboundReplyPayload {
    /// URL-safe base64 of the serialized message.
    pub fn transport_encoding(&self) -> String {
        base64::engine::general_purpose::URL_SAFE.encode(&self.raw)
    }

    /// `References` header value as sent.
    pub fn references_header(&self) -> Option<String> {
        (!self.references.is_empty()).then(|| self.references.join(" "))
    }
}

// ── Notification ────────────────────────────────────────────────────

/// Delivery state shown in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Sent with model-generated text.
    Sent,
    /// Sent, but with fallback text.
    SentWithFallback,
    /// The send itself failed; message left unread.
    SendFailed,
}

impl ReplyStatus {
    pub fn marker(self) -> &'static str {
        match self {
            Self::Sent => "✅",
            Self::SentWithFallback => "⚠️",
            Self::SendFailed => "❌",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Sent => "Reply sent",
            Self::SentWithFallback => "Fallback reply sent",
            Self::SendFailed => "Reply NOT sent",
        }
    }
}

/// Everything a notification report needs.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub sender: String,
    pub subject: String,
    /// Received time, rendered in the display timezone.
    pub received_display: String,
    /// Original message text (truncated when rendered).
    pub original: String,
    pub reply_text: String,
    pub status: ReplyStatus,
    pub generation_succeeded: bool,
    /// Report time, rendered in the display timezone.
    pub replied_display: String,
}

// ── Outcomes ────────────────────────────────────────────────────────

/// What happened to one listed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Reply sent and message marked read.
    Replied {
        id: String,
        generation_succeeded: bool,
        /// Mark-read failed after a successful send.
        mark_read_failed: bool,
    },
    /// Reply could not be sent; message left unread.
    SendFailed { id: String, reason: String },
    /// Sent by this mailbox; marked read without replying.
    SkippedSelf { id: String },
    /// Sender not allowlisted; left unread.
    SkippedSender { id: String, sender: String },
    /// No usable reply address; left unread without generating.
    Unrepliable { id: String, reason: String },
    /// Message could not be fetched.
    FetchFailed { id: String, reason: String },
    /// Reply could not be built.
    ComposeFailed { id: String, reason: String },
}

impl MessageOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Replied { id, .. }
            | Self::SendFailed { id, .. }
            | Self::SkippedSelf { id }
            | Self::SkippedSender { id, .. }
            | Self::Unrepliable { id, .. }
            | Self::FetchFailed { id, .. }
            | Self::ComposeFailed { id, .. } => id,
        }
    }

    /// What the poll loop should do with this id while it stays unread.
    pub fn follow_up(&self) -> FollowUp {
        match self {
            Self::Replied { .. } | Self::SkippedSelf { .. } => FollowUp::Done,
            Self::SendFailed { .. } | Self::FetchFailed { .. } => FollowUp::Retry,
            Self::SkippedSender { .. } | Self::Unrepliable { .. } | Self::ComposeFailed { .. } => {
                FollowUp::Ignore
            }
        }
    }
}

/// Handling of an id that is still listed as unread in later cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Handled; normally no longer unread.
    Done,
    /// Try again, after any fresh mail.
    Retry,
    /// Never pick up again in this process.
    Ignore,
}

/// Counts for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Unread ids returned by the mailbox.
    pub listed: usize,
    pub replied: usize,
    /// Subset of `replied` that used fallback text.
    pub fallback_replies: usize,
    pub send_failures: usize,
    pub skipped: usize,
    /// Listed ids passed over because an earlier cycle set them aside.
    pub ignored: usize,
    /// Fetch and compose failures.
    pub errors: usize,
}

impl CycleReport {
    pub fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Replied {
                generation_succeeded,
                ..
            } => {
                self.replied += 1;
                if !generation_succeeded {
                    self.fallback_replies += 1;
                }
            }
            MessageOutcome::SendFailed { .. } => self.send_failures += 1,
            MessageOutcome::SkippedSelf { .. }
            | MessageOutcome::SkippedSender { .. }
            | MessageOutcome::Unrepliable { .. } => self.skipped += 1,
            MessageOutcome::FetchFailed { .. } | MessageOutcome::ComposeFailed { .. } => {
                self.errors += 1
            }
        }
    }

    /// Number of outcomes recorded.
    pub fn processed(&self) -> usize {
        self.replied + self.send_failures + self.skipped + self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_encoding_is_url_safe() {
        // Bytes chosen so standard base64 would contain '+' and '/'.
        let payload = OutboundReplyPayload {
            thread_id: None,
            to: "a@x".into(),
            subject: "Re: x".into(),
            body: String::new(),
            in_reply_to: None,
            references: vec![],
            raw: vec![0xfb, 0xff, 0xbf],
        };
        let encoded = payload.transport_encoding();
        assert_eq!(encoded, "-_-_");
        assert!(!encoded.contains('+') && !encoded.contains('/'));
        assert_eq!(payload.references_header(), None);
    }

    #[test]
    fn failure_from_llm_error() {
        let rate = LlmError::RateLimited {
            provider: "anthropic".into(),
        };
        assert_eq!(GenerationFailure::from(&rate), GenerationFailure::RateLimited);

        let other = LlmError::RequestFailed {
            provider: "openai".into(),
            reason: "connection reset".into(),
        };
        assert_eq!(
            GenerationFailure::from(&other),
            GenerationFailure::Backend("connection reset".into())
        );
        assert_eq!(GenerationFailure::Timeout.label(), "timeout");
    }

    #[test]
    fn status_markers() {
        assert_eq!(ReplyStatus::Sent.marker(), "✅");
        assert_eq!(ReplyStatus::SentWithFallback.marker(), "⚠️");
        assert_eq!(ReplyStatus::SendFailed.marker(), "❌");
    }

    #[test]
    fn cycle_report_counts() {
        let mut report = CycleReport {
            listed: 5,
            ..Default::default()
        };
        report.record(&MessageOutcome::Replied {
            id: "1".into(),
            generation_succeeded: true,
            mark_read_failed: false,
        });
        report.record(&MessageOutcome::Replied {
            id: "2".into(),
            generation_succeeded: false,
            mark_read_failed: false,
        });
        report.record(&MessageOutcome::SendFailed {
            id: "3".into(),
            reason: "smtp down".into(),
        });
        report.record(&MessageOutcome::SkippedSelf { id: "4".into() });
        report.record(&MessageOutcome::FetchFailed {
            id: "5".into(),
            reason: "404".into(),
        });

        assert_eq!(report.replied, 2);
        assert_eq!(report.fallback_replies, 1);
        assert_eq!(report.send_failures, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(report.processed(), 5);
    }

    #[test]
    fn follow_up_by_outcome() {
        let id = || "1".to_string();
        assert_eq!(MessageOutcome::SkippedSelf { id: id() }.follow_up(), FollowUp::Done);
        assert_eq!(
            MessageOutcome::SendFailed { id: id(), reason: "x".into() }.follow_up(),
            FollowUp::Retry
        );
        assert_eq!(
            MessageOutcome::SkippedSender { id: id(), sender: "s".into() }.follow_up(),
            FollowUp::Ignore
        );
        assert_eq!(
            MessageOutcome::Unrepliable { id: id(), reason: "x".into() }.follow_up(),
            FollowUp::Ignore
        );
    }
}
