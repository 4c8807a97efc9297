//! Telegram notifier: pushes outcome reports via the Bot API `sendMessage`.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::Notifier;
use crate::config::EnvLookup;
use crate::error::NotifyError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Telegram Bot API base URL.
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
    pub api_base: String,
}

impl TelegramConfig {
    /// Both `TELEGRAM_TOKEN` and `TELEGRAM_CHAT_ID` must be set; otherwise
    /// notifications are disabled.
    pub fn from_vars(lookup: EnvLookup<'_>) -> Option<Self> {
        let bot_token = lookup("TELEGRAM_TOKEN")?;
        let chat_id = lookup("TELEGRAM_CHAT_ID")?;
        Some(Self {
            bot_token: SecretString::from(bot_token),
            chat_id,
            api_base: TELEGRAM_API_BASE.to_string(),
        })
    }
}

/// Notifier that posts to a single Telegram chat.
pub struct TelegramNotifier {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(send_err)?;
        Ok(Self { config, client })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token.expose_secret()
        )
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, text: &str) -> Result<(), NotifyError> {
        // Try Markdown first
        let markdown_body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(send_err)?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        // Retry without parse_mode
        let plain_body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(send_err)?;

        if !plain_resp.status().is_success() {
            return Err(NotifyError::Rejected {
                name: "telegram".into(),
                status: plain_resp.status().as_u16(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    /// Splits long reports that exceed Telegram's 4096 char limit.
    async fn notify(&self, markdown: &str) -> Result<(), NotifyError> {
        for chunk in split_message(markdown, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(&chunk).await?;
        }
        Ok(())
    }
}

/// The request URL embeds the bot token, so it is stripped from errors.
fn send_err(e: reqwest::Error) -> NotifyError {
    NotifyError::SendFailed {
        name: "telegram".into(),
        reason: e.without_url().to_string(),
    }
}

/// Largest char boundary in `s` that is `<= index`.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    (0..=index).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let hard_cut = floor_char_boundary(remaining, max_len).max(
            // A single char wider than max_len still has to make progress.
            remaining.chars().next().map_or(1, char::len_utf8),
        );
        let chunk = &remaining[..hard_cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(hard_cut);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { hard_cut } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
