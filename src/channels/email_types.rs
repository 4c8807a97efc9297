//! Email-specific types: provider-neutral fetched message, header helpers,
//! quote boundary detection, address extraction.

use std::sync::LazyLock;

use regex::Regex;

/// A single raw header as it appeared on the wire (unfolded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

impl MessageHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A message as returned by a mailbox's get-by-id call.
///
/// Mailbox implementations fill this from their native format; the
/// extractor turns it into an `InboundMessage`.
#[derive(Debug, Clone, Default)]
pub struct FetchedMessage {
    /// Provider message id (Gmail id or IMAP UID).
    pub id: String,
    /// Provider conversation id, when the provider has one.
    pub thread_id: Option<String>,
    /// Headers in wire order.
    pub headers: Vec<MessageHeader>,
    /// Decoded `text/plain` body.
    pub body_text: Option<String>,
    /// Decoded `text/html` body.
    pub body_html: Option<String>,
}

impl FetchedMessage {
    /// First header named `name`, compared case-insensitively, trimmed.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Collapse RFC 5322 folding whitespace into single spaces.
pub fn unfold_header(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a raw header block (everything before the first blank line).
///
/// Continuation lines (leading space or tab) are folded into the previous
/// header. Lines without a colon are ignored.
pub fn parse_header_block(raw: &str) -> Vec<MessageHeader> {
    let mut headers: Vec<MessageHeader> = Vec::new();

    for line in raw.lines() {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push(MessageHeader::new(name.trim(), value.trim()));
        }
    }

    for header in &mut headers {
        header.value = unfold_header(&header.value);
    }
    headers
}

/// Split a `References`-style header into its message ids, in order.
///
/// Angle-bracketed ids are extracted verbatim; a value with no brackets
/// falls back to whitespace splitting.
pub fn msg_id_tokens(raw: &str) -> Vec<String> {
    static MSG_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^<>\s]+>").unwrap());

    let bracketed: Vec<String> = MSG_ID
        .find_iter(raw)
        .map(|m| m.as_str().to_string())
        .collect();
    if !bracketed.is_empty() {
        return bracketed;
    }
    raw.split_whitespace().map(str::to_string).collect()
}

/// Bare address from a `From`-style value.
///
/// `"Alice <alice@example.com>"` → `alice@example.com`; a value with no
/// angle brackets is returned trimmed.
pub fn extract_address(from: &str) -> String {
    let from = from.trim();
    if let (Some(start), Some(end)) = (from.rfind('<'), from.rfind('>'))
        && start < end
    {
        return from[start + 1..end].trim().to_string();
    }
    from.trim_matches('"').to_string()
}

// ── Quote boundary detection ────────────────────────────────────────

/// Newest text vs quoted history, as best guessed by a splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteSplit {
    /// Text the sender wrote in this message.
    pub latest: String,
    /// Quoted conversation history (empty when none was found).
    pub quoted: String,
    /// Whether a boundary was actually detected.
    pub confident: bool,
}

impl QuoteSplit {
    /// No boundary found: the whole body is treated as the newest text.
    pub fn whole(body: &str) -> Self {
        Self {
            latest: body.trim_end().to_string(),
            quoted: String::new(),
            confident: false,
        }
    }
}

/// Pluggable quote boundary detection. Best effort.
pub trait QuoteSplitter: Send + Sync {
    fn split(&self, body: &str) -> QuoteSplit;
}

/// Default splitter based on common reply conventions.
///
/// Boundaries:
/// - lines starting with `>` (quoted reply lines)
/// - `On ... wrote:` attribution lines (possibly wrapped over two lines)
/// - `-----Original Message-----` style separators
/// - Outlook header blocks (`From:` followed by `Sent:`/`Date:`/`To:`/`Subject:`)
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicQuoteSplitter;

static ATTRIBUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^on\s.+\swrote:$").unwrap());
static ORIGINAL_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[-_=\s]*original message[-_=\s]*$").unwrap());
static OUTLOOK_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(sent|date|to|subject|cc):\s").unwrap());

fn has_prefix_ignore_case(s: &str, prefix: &str) -> bool {
    s.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

impl HeuristicQuoteSplitter {
    fn boundary(lines: &[&str]) -> Option<usize> {
        for (i, line) in lines.iter().enumerate() {
            let trimmed = line.trim();

            if trimmed.starts_with('>') || ORIGINAL_SEPARATOR.is_match(trimmed) {
                return Some(i);
            }

            if has_prefix_ignore_case(trimmed, "on ") {
                if ATTRIBUTION.is_match(trimmed) {
                    return Some(i);
                }
                if let Some(next) = lines.get(i + 1) {
                    let joined = format!("{trimmed} {}", next.trim());
                    if ATTRIBUTION.is_match(&joined) {
                        return Some(i);
                    }
                }
            }

            if has_prefix_ignore_case(trimmed, "from:")
                && lines
                    .iter()
                    .skip(i + 1)
                    .take(3)
                    .any(|l| OUTLOOK_FIELD.is_match(l.trim()))
            {
                return Some(i);
            }
        }
        None
    }
}

impl QuoteSplitter for HeuristicQuoteSplitter {
    fn split(&self, body: &str) -> QuoteSplit {
        let lines: Vec<&str> = body.lines().collect();

        let Some(idx) = Self::boundary(&lines) else {
            return QuoteSplit::whole(body);
        };

        let mut latest: Vec<&str> = lines[..idx].to_vec();
        // Trim trailing blank lines
        while latest.last().is_some_and(|l| l.trim().is_empty()) {
            latest.pop();
        }

        // Nothing above the boundary: the detection is not useful.
        if latest.iter().all(|l| l.trim().is_empty()) {
            return QuoteSplit::whole(body);
        }

        QuoteSplit {
            latest: latest.join("\n"),
            quoted: lines[idx..].join("\n").trim_end().to_string(),
            confident: true,
        }
    }
}
