//! Configuration types.
//!
//! Everything is read from the process environment (optionally seeded from
//! a `.env` file by the binary). Parsing goes through an [`EnvLookup`] so the
//! rules can be exercised without touching the real environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use crate::channels::email::EmailConfig;
use crate::channels::gmail::GmailConfig;
use crate::channels::telegram::TelegramConfig;
use crate::error::ConfigError;
use crate::llm::LlmConfig;

/// Default persona / system instruction handed to the completion backend.
pub const DEFAULT_PERSONA: &str = "You are an intelligent and highly professional email assistant. \
Your task is to draft a polite, concise, and contextually appropriate reply to the following incoming email.";

/// Variable lookup used by every `from_vars` constructor.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Read a variable from the process environment, treating empty values as unset.
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an optional variable, falling back to `default` when unset.
pub(crate) fn parse_var<T>(lookup: EnvLookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Fetch a variable that must be present.
pub(crate) fn require_var(lookup: EnvLookup<'_>, key: &str) -> Result<String, ConfigError> {
    lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Loop and presentation settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Sleep between poll cycles.
    pub poll_interval: Duration,
    /// Upper bound on unread messages handled per cycle.
    pub max_per_cycle: u32,
    /// Timeout applied to every mailbox/notification HTTP call.
    pub http_timeout: Duration,
    /// Timeout for a single completion call.
    pub llm_timeout: Duration,
    /// Offset used when rendering timestamps for humans.
    pub display_offset: FixedOffset,
    /// Label appended to rendered timestamps (e.g. "WIB").
    pub display_label: String,
    /// Persona / system instruction for the completion backend.
    pub persona: String,
    /// Sender allowlist (`*`, `user@x`, `@domain`, `domain`).
    pub allowed_senders: Vec<String>,
    /// Directory for the rolling log file, if any.
    pub log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_per_cycle: 50,
            http_timeout: Duration::from_secs(30),
            llm_timeout: Duration::from_secs(60),
            display_offset: FixedOffset::east_opt(7 * 3600).expect("valid offset"),
            display_label: "WIB".to_string(),
            persona: DEFAULT_PERSONA.to_string(),
            allowed_senders: vec!["*".to_string()],
            log_dir: None,
        }
    }
}

impl Settings {
    pub fn from_vars(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let poll_secs: u64 = parse_var(lookup, "NOVAMAIL_POLL_INTERVAL_SECS", 30)?;
        if poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NOVAMAIL_POLL_INTERVAL_SECS".into(),
                message: "must be at least 1".into(),
            });
        }
        let http_secs: u64 = parse_var(lookup, "NOVAMAIL_HTTP_TIMEOUT_SECS", 30)?;
        let llm_secs: u64 = parse_var(lookup, "NOVAMAIL_LLM_TIMEOUT_SECS", 60)?;

        let display_offset = match lookup("NOVAMAIL_DISPLAY_UTC_OFFSET") {
            Some(raw) => parse_utc_offset(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "NOVAMAIL_DISPLAY_UTC_OFFSET".into(),
                message: format!("expected +HH:MM or -HH:MM, got {raw:?}"),
            })?,
            None => defaults.display_offset,
        };

        let allowed_senders = lookup("NOVAMAIL_ALLOWED_SENDERS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.allowed_senders);

        Ok(Self {
            poll_interval: Duration::from_secs(poll_secs),
            max_per_cycle: parse_var(lookup, "NOVAMAIL_MAX_PER_CYCLE", defaults.max_per_cycle)?,
            http_timeout: Duration::from_secs(http_secs),
            llm_timeout: Duration::from_secs(llm_secs),
            display_offset,
            display_label: lookup("NOVAMAIL_DISPLAY_TZ_LABEL").unwrap_or(defaults.display_label),
            persona: lookup("NOVAMAIL_PERSONA").unwrap_or(defaults.persona),
            allowed_senders,
            log_dir: lookup("NOVAMAIL_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Parse `+HH:MM`, `-HH:MM`, `+HHMM` or `+HH` into a fixed offset.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = if digits.len() <= 2 {
        (digits.parse::<i32>().ok()?, 0)
    } else {
        let split = digits.len() - 2;
        (
            digits[..split].parse::<i32>().ok()?,
            digits[split..].parse::<i32>().ok()?,
        )
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Which mailbox backend to drive.
#[derive(Debug, Clone)]
pub enum MailboxConfig {
    Gmail(GmailConfig),
    Imap(EmailConfig),
}

impl MailboxConfig {
    pub fn from_vars(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let kind = lookup("NOVAMAIL_MAILBOX").unwrap_or_else(|| "gmail".to_string());
        match kind.to_ascii_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail(GmailConfig::from_vars(lookup)?)),
            "imap" => Ok(Self::Imap(EmailConfig::from_vars(lookup)?)),
            other => Err(ConfigError::InvalidValue {
                key: "NOVAMAIL_MAILBOX".into(),
                message: format!("unknown mailbox kind {other:?} (expected gmail or imap)"),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Gmail(_) => "gmail",
            Self::Imap(_) => "imap",
        }
    }
}

/// Full process configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub settings: Settings,
    pub llm: LlmConfig,
    pub mailbox: MailboxConfig,
    /// `None` disables notifications.
    pub telegram: Option<TelegramConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env_lookup)
    }

    pub fn from_vars(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            settings: Settings::from_vars(lookup)?,
            llm: LlmConfig::from_vars(lookup)?,
            mailbox: MailboxConfig::from_vars(lookup)?,
            telegram: TelegramConfig::from_vars(lookup),
        })
    }
}
