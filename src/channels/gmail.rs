//! Gmail REST mailbox.
//!
//! Talks to `gmail.googleapis.com/gmail/v1/users/me` with a bearer token.
//! The token is either a static access token or minted from a refresh token
//! at Google's OAuth endpoint and cached until shortly before it expires.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::channels::email_types::{FetchedMessage, MessageHeader};
use crate::channels::{Mailbox, SentReply};
use crate::config::{EnvLookup, parse_var};
use crate::error::{ConfigError, MailboxError};
use crate::pipeline::types::OutboundReplyPayload;

const PROVIDER: &str = "gmail";

/// Gmail API base URL.
pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Google OAuth2 token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Search query for messages the loop should answer.
const UNREAD_QUERY: &str = "is:unread in:inbox";

/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Gmail's upper bound for `maxResults`.
const MAX_PAGE_SIZE: u32 = 500;

// ── Configuration ───────────────────────────────────────────────────

/// How the mailbox obtains bearer tokens.
#[derive(Debug, Clone)]
pub enum GmailAuth {
    /// Pre-issued access token, used as-is.
    AccessToken(SecretString),
    /// OAuth client credentials plus a long-lived refresh token.
    Refresh {
        client_id: String,
        client_secret: SecretString,
        refresh_token: SecretString,
    },
}

#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub auth: GmailAuth,
    pub api_base: String,
    pub token_url: String,
    pub timeout: Duration,
}

impl GmailConfig {
    /// Build config from environment variables.
    ///
    /// `GMAIL_ACCESS_TOKEN` wins when set; otherwise all of
    /// `GOOGLE_CLIENT_ID`, `GOOGLE_CLIENT_SECRET` and `GOOGLE_REFRESH_TOKEN`
    /// are required.
    pub fn from_vars(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let auth = if let Some(token) = lookup("GMAIL_ACCESS_TOKEN") {
            GmailAuth::AccessToken(SecretString::from(token))
        } else {
            match (
                lookup("GOOGLE_CLIENT_ID"),
                lookup("GOOGLE_CLIENT_SECRET"),
                lookup("GOOGLE_REFRESH_TOKEN"),
            ) {
                (Some(client_id), Some(secret), Some(refresh)) => GmailAuth::Refresh {
                    client_id,
                    client_secret: SecretString::from(secret),
                    refresh_token: SecretString::from(refresh),
                },
                _ => {
                    return Err(ConfigError::MissingRequired {
                        key: "GMAIL_ACCESS_TOKEN".into(),
                        hint: "Set GMAIL_ACCESS_TOKEN, or GOOGLE_CLIENT_ID + GOOGLE_CLIENT_SECRET + GOOGLE_REFRESH_TOKEN".into(),
                    });
                }
            }
        };

        let timeout_secs: u64 = parse_var(lookup, "NOVAMAIL_HTTP_TIMEOUT_SECS", 30)?;

        Ok(Self {
            auth,
            api_base: GMAIL_API_BASE.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Point the client at different endpoints (for testing).
    pub fn with_endpoints(mut self, api_base: &str, token_url: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.token_url = token_url.to_string();
        self
    }
}

// ── Token source ────────────────────────────────────────────────────

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Hands out bearer tokens, refreshing when the cached one is near expiry.
struct GoogleAuth {
    auth: GmailAuth,
    token_url: String,
    cache: Mutex<Option<CachedToken>>,
}

impl GoogleAuth {
    fn new(auth: GmailAuth, token_url: String) -> Self {
        Self {
            auth,
            token_url,
            cache: Mutex::new(None),
        }
    }

    fn can_refresh(&self) -> bool {
        matches!(self.auth, GmailAuth::Refresh { .. })
    }

    async fn access_token(&self, client: &Client) -> Result<String, MailboxError> {
        let (client_id, client_secret, refresh_token) = match &self.auth {
            GmailAuth::AccessToken(token) => return Ok(token.expose_secret().to_string()),
            GmailAuth::Refresh {
                client_id,
                client_secret,
                refresh_token,
            } => (client_id, client_secret, refresh_token),
        };

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.expires_at > Instant::now() + EXPIRY_MARGIN
        {
            return Ok(cached.access_token.clone());
        }

        tracing::debug!("Refreshing Gmail access token");
        let resp = client
            .post(&self.token_url)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose_secret()),
                ("refresh_token", refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(request_err)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailboxError::AuthFailed {
                provider: PROVIDER.into(),
                reason: format!("token refresh returned {status}: {body}"),
            });
        }

        let token: TokenResponse = resp.json().await.map_err(|e| MailboxError::AuthFailed {
            provider: PROVIDER.into(),
            reason: format!("malformed token response: {}", e.without_url()),
        })?;

        let expires_at = Instant::now() + Duration::from_secs(token.expires_in.unwrap_or(3600));
        let access_token = token.access_token.clone();
        *cache = Some(CachedToken {
            access_token: token.access_token,
            expires_at,
        });
        Ok(access_token)
    }

    async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}

// ── API response shapes ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    payload: Option<GmailPart>,
}

/// The payload and every nested MIME part share this shape.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    #[serde(default)]
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: String,
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// Gmail REST API mailbox.
pub struct GmailMailbox {
    client: Client,
    auth: GoogleAuth,
    base_url: String,
}

impl GmailMailbox {
    pub fn new(config: GmailConfig) -> Result<Self, MailboxError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(request_err)?;

        Ok(Self {
            client,
            auth: GoogleAuth::new(config.auth, config.token_url),
            base_url: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Send an authorized request. A 401 with refreshable credentials drops
    /// the cached token and retries once.
    async fn send<F>(&self, build: F) -> Result<Response, MailboxError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.auth.access_token(&self.client).await?;
        let resp = build(&self.client)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(request_err)?;

        let resp = if resp.status() == StatusCode::UNAUTHORIZED && self.auth.can_refresh() {
            tracing::debug!("Gmail returned 401; refreshing token and retrying");
            self.auth.invalidate().await;
            let token = self.auth.access_token(&self.client).await?;
            build(&self.client)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(request_err)?
        } else {
            resp
        };

        check_status(resp).await
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, MailboxError> {
        resp.json().await.map_err(|e| MailboxError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: e.without_url().to_string(),
        })
    }
}

#[async_trait]
impl Mailbox for GmailMailbox {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn own_address(&self) -> Result<String, MailboxError> {
        let url = self.url("profile");
        let resp = self.send(|c| c.get(&url)).await?;
        let profile: ProfileResponse = Self::json(resp).await?;
        Ok(profile.email_address)
    }

    async fn list_unread(&self, max: u32) -> Result<Vec<String>, MailboxError> {
        let url = self.url("messages");
        let mut ids: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;

        while (ids.len() as u32) < max {
            let page_size = (max - ids.len() as u32).min(MAX_PAGE_SIZE).to_string();
            let resp = self
                .send(|c| {
                    let mut req = c
                        .get(&url)
                        .query(&[("q", UNREAD_QUERY), ("maxResults", page_size.as_str())]);
                    if let Some(token) = &page_token {
                        req = req.query(&[("pageToken", token.as_str())]);
                    }
                    req
                })
                .await?;

            let page: ListResponse = Self::json(resp).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        ids.truncate(max as usize);
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<FetchedMessage, MailboxError> {
        validate_message_id(id)?;
        let url = self.url(&format!("messages/{id}"));
        let resp = self
            .send(|c| c.get(&url).query(&[("format", "full")]))
            .await
            .map_err(|e| match e {
                MailboxError::Api { status: 404, .. } => MailboxError::NotFound { id: id.into() },
                other => other,
            })?;

        let raw: MessageResponse = Self::json(resp).await?;
        Ok(fetched_from_response(raw))
    }

    async fn send_reply(&self, payload: &OutboundReplyPayload) -> Result<SentReply, MailboxError> {
        let url = self.url("messages/send");
        let mut body = serde_json::json!({ "raw": payload.transport_encoding() });
        if let Some(thread_id) = &payload.thread_id {
            body["threadId"] = serde_json::Value::String(thread_id.clone());
        }

        let resp = self
            .send(|c| c.post(&url).json(&body))
            .await
            .map_err(|e| MailboxError::SendFailed {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;
        // The status already says the reply went out; an unreadable body
        // only loses the provider id.
        let provider_id = match Self::json::<SendResponse>(resp).await {
            Ok(sent) => Some(sent.id),
            Err(e) => {
                tracing::warn!(error = %e, "Gmail reply sent but response was unreadable");
                None
            }
        };

        tracing::debug!(id = provider_id.as_deref().unwrap_or("-"), "Gmail reply sent");
        Ok(SentReply { provider_id })
    }

    async fn mark_read(&self, id: &str) -> Result<(), MailboxError> {
        validate_message_id(id)?;
        let url = self.url(&format!("messages/{id}/modify"));
        let body = serde_json::json!({ "removeLabelIds": ["UNREAD"] });
        self.send(|c| c.post(&url).json(&body)).await?;
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn request_err(e: reqwest::Error) -> MailboxError {
    if e.is_timeout() {
        MailboxError::Timeout {
            provider: PROVIDER.into(),
        }
    } else {
        MailboxError::RequestFailed {
            provider: PROVIDER.into(),
            reason: e.without_url().to_string(),
        }
    }
}

async fn check_status(resp: Response) -> Result<Response, MailboxError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(MailboxError::AuthFailed {
            provider: PROVIDER.into(),
            reason: format!("{status}: {body}"),
        });
    }
    Err(MailboxError::Api {
        provider: PROVIDER.into(),
        status: status.as_u16(),
        body,
    })
}

/// Reject ids that could escape the `messages/{id}` path.
fn validate_message_id(id: &str) -> Result<(), MailboxError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(MailboxError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: format!("invalid message id: {id:?}"),
        });
    }
    Ok(())
}

fn fetched_from_response(raw: MessageResponse) -> FetchedMessage {
    let payload = raw.payload.unwrap_or_default();
    let headers = payload
        .headers
        .iter()
        .map(|h| MessageHeader::new(h.name.clone(), h.value.clone()))
        .collect();

    FetchedMessage {
        id: raw.id,
        thread_id: raw.thread_id,
        headers,
        body_text: find_part_body(&payload, "text/plain"),
        body_html: find_part_body(&payload, "text/html"),
    }
}

/// Depth-first search for the first part of `mime_type` with body data.
fn find_part_body(part: &GmailPart, mime_type: &str) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case(mime_type)
        && let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref())
    {
        return decode_base64url(data);
    }
    part.parts.iter().find_map(|p| find_part_body(p, mime_type))
}

/// Decode Gmail's base64url body data (padding optional).
fn decode_base64url(encoded: &str) -> Option<String> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

// ── Tests ───────────────────────────────────────────────────────────
