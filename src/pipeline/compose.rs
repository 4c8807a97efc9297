//! Reply composer: builds an RFC 2822 reply that threads under the
//! original message.

use lettre::Message;
use lettre::message::{Mailbox as Address, MultiPart};
use uuid::Uuid;

use crate::error::ComposeError;
use crate::pipeline::types::{GeneratedReply, InboundMessage, OutboundReplyPayload};

/// `Re: ` + subject, with any existing `re:` prefix collapsed to one.
pub fn normalize_subject(subject: &str) -> String {
    let trimmed = subject.trim_start();
    let rest = match trimmed.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("re:") => trimmed[3..].trim_start(),
        _ => trimmed,
    };
    format!("Re: {rest}")
}

/// Outbound `References`: the prior chain with the original `Message-ID`
/// appended unless already present. No `Message-ID` keeps the prior chain.
pub fn reply_references(prior: &[String], message_id: Option<&str>) -> Vec<String> {
    let mut chain = prior.to_vec();
    if let Some(id) = message_id
        && !chain.iter().any(|r| r == id)
    {
        chain.push(id.to_string());
    }
    chain
}

/// Minimal HTML rendering of a plain-text reply.
pub fn html_body(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;");
    escaped.replace("\r\n", "\n").replace('\n', "<br>")
}

/// Parse a `From`-style value, falling back to the bare address when the
/// display name does not parse.
fn parse_address(display: &str, bare: &str) -> Result<Address, ComposeError> {
    display
        .parse::<Address>()
        .or_else(|_| bare.parse::<Address>())
        .map_err(|e| ComposeError::InvalidAddress {
            address: display.to_string(),
            reason: e.to_string(),
        })
}

/// Address the reply goes to. The processor checks it before generating.
pub fn reply_recipient(message: &InboundMessage) -> Result<Address, ComposeError> {
    parse_address(&message.sender, &message.sender_address)
}

/// Build the reply for `message`. Works the same for generated and
/// fallback text.
pub fn compose_reply(
    message: &InboundMessage,
    reply: &GeneratedReply,
    from: &str,
) -> Result<OutboundReplyPayload, ComposeError> {
    let subject = normalize_subject(&message.subject);
    let in_reply_to = message.message_id_header.clone();
    let references = reply_references(&message.references, in_reply_to.as_deref());

    let to = reply_recipient(message)?;
    let from = parse_address(from, from)?;
    let own_message_id = format!("<{}@{}>", Uuid::new_v4(), from.email.domain());

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(subject.clone())
        .message_id(Some(own_message_id));
    if let Some(id) = &in_reply_to {
        builder = builder.in_reply_to(id.clone());
    }
    if !references.is_empty() {
        builder = builder.references(references.join(" "));
    }

    let email = builder
        .multipart(MultiPart::alternative_plain_html(
            reply.text.clone(),
            html_body(&reply.text),
        ))
        .map_err(|e| ComposeError::Build(e.to_string()))?;

    Ok(OutboundReplyPayload {
        thread_id: message.thread_id.clone(),
        to: message.sender.clone(),
        subject,
        body: reply.text.clone(),
        in_reply_to,
        references,
        raw: email.formatted(),
    })
}
