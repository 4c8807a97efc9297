//! Per-message processing: fetch → extract → generate → compose → send →
//! mark read → notify.
//!
//! **Core invariant: a message is marked read iff its reply was sent.**
//! The only exception is self-sent mail, which is marked read without a
//! reply so the loop never answers itself.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::channels::email::is_sender_allowed;
use crate::context::AppContext;
use crate::pipeline::compose::{compose_reply, reply_recipient};
use crate::pipeline::extract::extract;
use crate::pipeline::generate::generate_reply;
use crate::pipeline::notify::{CONSOLE_SNIPPET_CHARS, dispatch, truncate_snippet};
use crate::pipeline::types::{MessageOutcome, NotificationRecord, ReplyStatus};

/// Process one unread message. Never returns an error: every failure is
/// folded into the outcome.
pub async fn process_message(ctx: &AppContext, id: &str) -> MessageOutcome {
    let fetched = match ctx.mailbox.get_message(id).await {
        Ok(fetched) => fetched,
        Err(e) => {
            error!(id = %id, error = %e, "Failed to fetch message");
            return MessageOutcome::FetchFailed {
                id: id.to_string(),
                reason: e.to_string(),
            };
        }
    };

    let message = extract(&fetched, ctx.splitter.as_ref());

    // Self-loop prevention
    if message
        .sender_address
        .eq_ignore_ascii_case(&ctx.own_address)
    {
        debug!(id = %id, sender = %message.sender, "Skipping self-sent email");
        if let Err(e) = ctx.mailbox.mark_read(id).await {
            warn!(id = %id, error = %e, "Failed to mark self-sent email as read");
        }
        return MessageOutcome::SkippedSelf { id: id.to_string() };
    }

    // Allowlist check
    if !is_sender_allowed(&ctx.settings.allowed_senders, &message.sender_address) {
        warn!(id = %id, sender = %message.sender, "Blocked email from sender outside allowlist");
        return MessageOutcome::SkippedSender {
            id: id.to_string(),
            sender: message.sender,
        };
    }

    if let Err(e) = reply_recipient(&message) {
        warn!(id = %id, sender = %message.sender, error = %e, "No usable reply address; skipping");
        return MessageOutcome::Unrepliable {
            id: id.to_string(),
            reason: e.to_string(),
        };
    }

    let received_display = ctx.display_time(message.received_at);
    info!("==================================================");
    info!("📩 NEW EMAIL DETECTED!");
    info!("🕒 Date   : {received_display}");
    info!("👤 From   : {}", message.sender);
    info!("📌 Subject: {}", message.subject);
    info!("💬 Body   : {}", truncate_snippet(&message.body_text, CONSOLE_SNIPPET_CHARS));
    info!("==================================================");

    info!(id = %id, model = ctx.llm.model_name(), "🤖 Generating reply");
    let reply = generate_reply(ctx.llm.as_ref(), &message, &ctx.generate_options()).await;

    let payload = match compose_reply(&message, &reply, &ctx.own_address) {
        Ok(payload) => payload,
        Err(e) => {
            error!(id = %id, sender = %message.sender, error = %e, "Failed to compose reply");
            return MessageOutcome::ComposeFailed {
                id: id.to_string(),
                reason: e.to_string(),
            };
        }
    };

    let (outcome, status) = match ctx.mailbox.send_reply(&payload).await {
        Ok(sent) => {
            let mark_read_failed = match ctx.mailbox.mark_read(id).await {
                Ok(()) => false,
                Err(e) => {
                    // The reply is out; the next cycle may answer again.
                    error!(id = %id, error = %e, "Reply sent but failed to mark email as read");
                    true
                }
            };
            info!(
                id = %id,
                thread_id = payload.thread_id.as_deref().unwrap_or("-"),
                provider_id = sent.provider_id.as_deref().unwrap_or("-"),
                "✅ Email successfully replied and marked as READ"
            );
            let status = if reply.generation_succeeded {
                ReplyStatus::Sent
            } else {
                ReplyStatus::SentWithFallback
            };
            (
                MessageOutcome::Replied {
                    id: id.to_string(),
                    generation_succeeded: reply.generation_succeeded,
                    mark_read_failed,
                },
                status,
            )
        }
        Err(e) => {
            error!(id = %id, sender = %message.sender, error = %e, "❌ Failed to send reply; leaving email unread");
            (
                MessageOutcome::SendFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                },
                ReplyStatus::SendFailed,
            )
        }
    };

    let record = NotificationRecord {
        sender: message.sender.clone(),
        subject: message.subject.clone(),
        received_display,
        original: message.body_text.clone(),
        reply_text: reply.text.clone(),
        status,
        generation_succeeded: reply.generation_succeeded,
        replied_display: ctx.display_time(Utc::now()),
    };
    dispatch(ctx.notifier.as_ref(), &record).await;

    outcome
}
