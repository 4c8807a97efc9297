//! IMAP/SMTP mailbox: IMAP over TLS for inbound, SMTP via lettre for outbound.
//!
//! Every operation opens its own short IMAP session (blocking, run on the
//! blocking pool). Fetches use `BODY.PEEK[]` so reading a message never sets
//! `\Seen`; only `mark_read` does.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, SmtpTransport, Transport};
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::email_types::{
    FetchedMessage, MessageHeader, extract_address, parse_header_block, unfold_header,
};
use crate::channels::{Mailbox, SentReply};
use crate::config::{EnvLookup, parse_var, require_var};
use crate::error::{ConfigError, MailboxError};
use crate::pipeline::types::OutboundReplyPayload;

const PROVIDER: &str = "imap";

// ── Configuration ───────────────────────────────────────────────────

/// IMAP/SMTP mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Socket timeout for IMAP reads and SMTP commands.
    pub timeout: Duration,
}

impl EmailConfig {
    /// Build config from environment variables. `EMAIL_IMAP_HOST`,
    /// `EMAIL_USERNAME` and `EMAIL_PASSWORD` are required.
    pub fn from_vars(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let imap_host = require_var(lookup, "EMAIL_IMAP_HOST")?;
        let imap_port: u16 = parse_var(lookup, "EMAIL_IMAP_PORT", 993)?;

        let smtp_host = lookup("EMAIL_SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let smtp_port: u16 = parse_var(lookup, "EMAIL_SMTP_PORT", 587)?;

        let username = require_var(lookup, "EMAIL_USERNAME")?;
        let password = SecretString::from(require_var(lookup, "EMAIL_PASSWORD")?);
        let from_address = lookup("EMAIL_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        let timeout_secs: u64 = parse_var(lookup, "NOVAMAIL_HTTP_TIMEOUT_SECS", 30)?;

        Ok(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// Mailbox backed by an IMAP server (read side) and an SMTP relay (send side).
pub struct ImapMailbox {
    config: Arc<EmailConfig>,
}

impl ImapMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Run a blocking IMAP session closure on the blocking pool.
    async fn with_session<T, F>(&self, f: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, MailboxError> + Send + 'static,
    {
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.login(&config.username, config.password.expose_secret())?;
            session.command("SELECT \"INBOX\"")?;
            let result = f(&mut session);
            session.logout();
            result
        })
        .await
        .map_err(|e| MailboxError::RequestFailed {
            provider: PROVIDER.into(),
            reason: format!("IMAP task panicked: {e}"),
        })?
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn own_address(&self) -> Result<String, MailboxError> {
        // A login round-trip doubles as the startup credential probe.
        self.with_session(|_| Ok(())).await?;
        Ok(self.config.from_address.clone())
    }

    async fn list_unread(&self, max: u32) -> Result<Vec<String>, MailboxError> {
        let limit = max as usize;
        self.with_session(move |session| {
            let response = session.command("UID SEARCH UNSEEN")?;
            let mut uids = parse_search_ids(&response.lines);
            uids.truncate(limit);
            Ok(uids)
        })
        .await
    }

    async fn get_message(&self, id: &str) -> Result<FetchedMessage, MailboxError> {
        validate_uid(id)?;
        let uid = id.to_string();
        let raw = self
            .with_session({
                let uid = uid.clone();
                move |session| {
                    let mut response = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
                    response
                        .literals
                        .pop()
                        .ok_or_else(|| MailboxError::NotFound { id: uid.clone() })
                }
            })
            .await?;

        Ok(fetched_from_raw(&uid, &raw))
    }

    async fn send_reply(&self, payload: &OutboundReplyPayload) -> Result<SentReply, MailboxError> {
        let config = Arc::clone(&self.config);
        let to = extract_address(&payload.to);
        let raw = payload.raw.clone();

        tokio::task::spawn_blocking(move || send_raw_smtp(&config, &to, &raw))
            .await
            .map_err(|e| MailboxError::SendFailed {
                provider: "smtp".into(),
                reason: format!("SMTP task panicked: {e}"),
            })??;

        tracing::info!(to = %payload.to, "Reply sent via SMTP");
        Ok(SentReply { provider_id: None })
    }

    async fn mark_read(&self, id: &str) -> Result<(), MailboxError> {
        validate_uid(id)?;
        let uid = id.to_string();
        self.with_session(move |session| {
            session.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
            Ok(())
        })
        .await
    }
}

/// Send pre-serialized RFC 2822 bytes through the configured SMTP relay.
fn send_raw_smtp(config: &EmailConfig, to: &str, raw: &[u8]) -> Result<(), MailboxError> {
    let send_err = |reason: String| MailboxError::SendFailed {
        provider: "smtp".into(),
        reason,
    };

    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    // Port 465 is implicit TLS; anything else negotiates STARTTLS.
    let builder = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    }
    .map_err(|e| send_err(format!("SMTP relay error: {e}")))?;

    let transport = builder
        .port(config.smtp_port)
        .credentials(creds)
        .timeout(Some(config.timeout))
        .build();

    let from: Address = config
        .from_address
        .parse()
        .map_err(|e| send_err(format!("Invalid from address: {e}")))?;
    let to: Address = to
        .parse()
        .map_err(|e| send_err(format!("Invalid to address: {e}")))?;
    let envelope =
        Envelope::new(Some(from), vec![to]).map_err(|e| send_err(format!("Invalid envelope: {e}")))?;

    transport
        .send_raw(&envelope, raw)
        .map_err(|e| send_err(format!("SMTP send failed: {e}")))?;
    Ok(())
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Check if a sender email is in the allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            // "@example.com" → domain match
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            // "user@example.com" → exact email match
            a.eq_ignore_ascii_case(email)
        } else {
            // "example.com" → domain match
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build a `FetchedMessage` from a raw RFC 822 message.
///
/// Headers are taken verbatim from the header block so threading ids stay
/// byte-exact. `Subject` and `From` are replaced by their RFC 2047 decoded
/// forms; bodies go through mail-parser for MIME and transfer decoding.
pub fn fetched_from_raw(uid: &str, raw: &[u8]) -> FetchedMessage {
    let text = String::from_utf8_lossy(raw);
    let header_end = text
        .find("\r\n\r\n")
        .or_else(|| text.find("\n\n"))
        .unwrap_or(text.len());
    let mut headers = parse_header_block(&text[..header_end]);

    let (body_text, body_html) = match MessageParser::default().parse(raw) {
        Some(parsed) => {
            if let Some(subject) = parsed.subject() {
                replace_header(&mut headers, "Subject", subject);
            }
            if let Some(from) = parsed.from().and_then(|a| a.first()).and_then(display_addr) {
                replace_header(&mut headers, "From", &from);
            }
            (
                parsed.body_text(0).map(|t| t.to_string()),
                parsed.body_html(0).map(|h| h.to_string()),
            )
        }
        None => (None, None),
    };

    FetchedMessage {
        id: uid.to_string(),
        thread_id: None,
        headers,
        body_text,
        body_html,
    }
}

fn replace_header(headers: &mut [MessageHeader], name: &str, value: &str) {
    if let Some(header) = headers.iter_mut().find(|h| h.name.eq_ignore_ascii_case(name)) {
        header.value = unfold_header(value);
    }
}

/// `Name <addr>` from a decoded address, quoting names with specials.
fn display_addr(addr: &mail_parser::Addr<'_>) -> Option<String> {
    let address = addr.address()?;
    match addr.name().map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) if name.contains([',', ';', ':', '<', '>', '@', '"', '(', ')']) => {
            let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
            Some(format!("\"{escaped}\" <{address}>"))
        }
        Some(name) => Some(format!("{name} <{address}>")),
        None => Some(address.to_string()),
    }
}

/// UIDs from `* SEARCH ...` untagged responses.
pub fn parse_search_ids(lines: &[String]) -> Vec<String> {
    let mut ids = Vec::new();
    for line in lines {
        if let Some(rest) = line.strip_prefix("* SEARCH") {
            ids.extend(rest.split_whitespace().map(str::to_string));
        }
    }
    ids
}

/// Length of a trailing `{n}` literal marker on a response line.
pub fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end_matches(['\r', '\n']);
    let open = line.rfind('{')?;
    let inner = line[open + 1..].strip_suffix('}')?;
    inner.parse().ok()
}

/// Quote a string for use in an IMAP command.
pub fn imap_quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn validate_uid(id: &str) -> Result<(), MailboxError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(MailboxError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: format!("invalid IMAP UID: {id:?}"),
        });
    }
    Ok(())
}

// ── IMAP session ────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Untagged lines and literals collected for one tagged command.
#[derive(Debug, Default)]
struct ImapResponse {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// A minimal synchronous IMAP client over rustls.
struct ImapSession {
    stream: BufReader<TlsStream>,
    next_tag: u32,
}

fn imap_err(reason: impl Into<String>) -> MailboxError {
    MailboxError::RequestFailed {
        provider: PROVIDER.into(),
        reason: reason.into(),
    }
}

/// TCP connect bounded by `timeout` per resolved address.
fn connect_with_timeout(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, MailboxError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| imap_err(format!("resolve {host}: {e}")))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) if matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock) => {
            MailboxError::Timeout {
                provider: PROVIDER.into(),
            }
        }
        Some(e) => imap_err(format!("connect to {host}: {e}")),
        None => imap_err(format!("resolve {host}: no addresses")),
    })
}

impl ImapSession {
    fn connect(config: &EmailConfig) -> Result<Self, MailboxError> {
        let tcp = connect_with_timeout(&config.imap_host, config.imap_port, config.timeout)?;
        tcp.set_read_timeout(Some(config.timeout))
            .and_then(|_| tcp.set_write_timeout(Some(config.timeout)))
            .map_err(|e| imap_err(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| imap_err(format!("invalid IMAP host name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| imap_err(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };

        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(imap_err(format!("unexpected greeting: {}", greeting.trim_end())));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        let n = self
            .stream
            .read_until(b'\n', &mut buf)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                    MailboxError::Timeout {
                        provider: PROVIDER.into(),
                    }
                }
                _ => imap_err(e.to_string()),
            })?;
        if n == 0 {
            return Err(imap_err("IMAP connection closed"));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send one tagged command and collect its response. A tagged `NO` or
    /// `BAD` is an error.
    fn command(&mut self, cmd: &str) -> Result<ImapResponse, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let full = format!("{tag} {cmd}\r\n");
        let stream = self.stream.get_mut();
        stream
            .write_all(full.as_bytes())
            .and_then(|_| stream.flush())
            .map_err(|e| imap_err(e.to_string()))?;

        let mut response = ImapResponse::default();
        loop {
            let line = self.read_line()?;

            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.stream
                    .read_exact(&mut literal)
                    .map_err(|e| imap_err(format!("short literal read: {e}")))?;
                response.literals.push(literal);
                response.lines.push(line);
                continue;
            }

            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                let reason = status.trim_end().to_string();
                return Err(if cmd.starts_with("LOGIN") {
                    MailboxError::AuthFailed {
                        provider: PROVIDER.into(),
                        reason,
                    }
                } else {
                    imap_err(reason)
                });
            }

            response.lines.push(line);
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        self.command(&format!("LOGIN {} {}", imap_quote(username), imap_quote(password)))
            .map(|_| ())
    }

    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            tracing::debug!("IMAP logout failed: {e}");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
