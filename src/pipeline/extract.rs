//! Thread context extraction: fetched message → `InboundMessage`.
//!
//! Never fails: missing or malformed fields get safe defaults.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};

use crate::channels::email::strip_html;
use crate::channels::email_types::{
    FetchedMessage, QuoteSplitter, extract_address, msg_id_tokens, unfold_header,
};
use crate::pipeline::types::InboundMessage;

const UNKNOWN_SENDER: &str = "unknown";
const NO_SUBJECT: &str = "(no subject)";

/// Build an `InboundMessage` from a fetched message.
pub fn extract(fetched: &FetchedMessage, splitter: &dyn QuoteSplitter) -> InboundMessage {
    let sender = fetched
        .header("From")
        .map(unfold_header)
        .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
    let subject = fetched
        .header("Subject")
        .map(unfold_header)
        .unwrap_or_else(|| NO_SUBJECT.to_string());

    let body_text = match fetched.body_text.as_deref() {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => fetched.body_html.as_deref().map(strip_html).unwrap_or_default(),
    };

    let message_id_header = fetched.header("Message-ID").map(unfold_header);
    let references = fetched
        .header("References")
        .map(msg_id_tokens)
        .unwrap_or_default();

    let (received_at, received_at_fallback) = match fetched.header("Date") {
        Some(raw) => match parse_timestamp(raw) {
            Some(at) => (at, false),
            None => {
                tracing::warn!(id = %fetched.id, date = raw, "Unparseable Date header; using current time");
                (Utc::now(), true)
            }
        },
        None => {
            tracing::warn!(id = %fetched.id, "Missing Date header; using current time");
            (Utc::now(), true)
        }
    };

    let quote = splitter.split(&body_text);

    InboundMessage {
        id: fetched.id.clone(),
        thread_id: fetched.thread_id.clone(),
        sender_address: extract_address(&sender),
        sender,
        subject,
        body_text,
        message_id_header,
        references,
        received_at,
        received_at_fallback,
        quote,
    }
}

/// Parse a message timestamp into UTC.
///
/// Accepts RFC 2822 (`Sun, 22 Feb 2026 13:45:10 +0700`, with or without a
/// trailing `(zone)` comment), RFC 3339 (`2026-02-22T13:45:10+07:00`) and
/// the space-separated ISO form (`2026-02-22 13:45:10+07:00`). A naive ISO
/// timestamp is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let without_comment = match raw.rfind('(') {
        Some(idx) if raw.ends_with(')') => raw[..idx].trim_end(),
        _ => raw,
    };

    if let Ok(dt) = DateTime::parse_from_rfc2822(without_comment) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S %z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Render an instant in the display timezone, e.g. `2026-02-22 13:45:10 WIB`.
pub fn format_display(at: DateTime<Utc>, offset: FixedOffset, label: &str) -> String {
    format!("{} {label}", at.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S"))
}
