//! Notification dispatcher: renders outcome reports and hands them to
//! the configured `Notifier`.

use crate::channels::Notifier;
use crate::pipeline::types::NotificationRecord;

/// Snippet length in notification reports.
pub const REPORT_SNIPPET_CHARS: usize = 500;

/// Snippet length in console banners.
pub const CONSOLE_SNIPPET_CHARS: usize = 100;

/// First `max` characters of `text`, with `...` appended when cut.
pub fn truncate_snippet(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Render a Markdown report for one processed message.
pub fn render_report(record: &NotificationRecord) -> String {
    let reply_heading = if record.generation_succeeded {
        "AI Reply"
    } else {
        "Fallback Reply"
    };

    format!(
        "🚨 *NOVAMAIL AI REPORT* 🚨\n\n\
🕒 *Received:* `{}`\n\
👤 *From:* `{}`\n\
📌 *Subject:* {}\n\n\
💬 *Original Message:*\n{}\n\n\
🤖 *{}:*\n_{}_\n\n\
{} *Status:* {}\n\
⏱️ *Replied At:* `{}`",
        record.received_display,
        record.sender,
        record.subject,
        truncate_snippet(&record.original, REPORT_SNIPPET_CHARS),
        reply_heading,
        record.reply_text,
        record.status.marker(),
        record.status.label(),
        record.replied_display,
    )
}

/// Render and send a report. Failures are logged, never returned.
pub async fn dispatch(notifier: &dyn Notifier, record: &NotificationRecord) {
    let report = render_report(record);
    match notifier.notify(&report).await {
        Ok(()) => tracing::info!(notifier = notifier.name(), "Notification sent"),
        Err(e) => tracing::warn!(notifier = notifier.name(), error = %e, "Notification failed"),
    }
}
