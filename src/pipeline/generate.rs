//! Completion client adapter: prompt construction and one-shot generation
//! with deterministic fallbacks.

use std::time::Duration;

use chrono::FixedOffset;

use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::extract::format_display;
use crate::pipeline::types::{GeneratedReply, GenerationFailure, InboundMessage};

/// Max tokens for a drafted reply.
pub const REPLY_MAX_TOKENS: u32 = 1024;

/// Temperature for drafting.
const REPLY_TEMPERATURE: f32 = 0.7;

/// Sent when the backend answers with nothing.
pub const EMPTY_FALLBACK: &str =
    "Apologies, I received your email but the AI failed to generate a response at this time.";

/// Sent when the backend call fails.
pub const UNAVAILABLE_FALLBACK: &str = "System Notice: The AI assistant is currently unavailable to process this request. We will get back to you manually.";

const INSTRUCTIONS: &str = "\
1. Reply to the NEWEST MESSAGE. Use the quoted history, if any, purely as context.
2. Acknowledge the sender's latest message gracefully.
3. Provide a clear, relevant, and helpful response based on the context of their message.
4. Maintain a warm yet professional tone.
5. Output ONLY the email body text. Do not include subject lines or conversational filler like 'Here is your draft'.";

/// Build the user prompt for one message.
pub fn build_prompt(message: &InboundMessage, offset: FixedOffset, label: &str) -> String {
    let received = format_display(message.received_at, offset, label);

    let mut prompt = format!(
        "--- EMAIL DETAILS ---\n\
Date Received: {received}\n\
From: {}\n\
Subject: {}\n\n\
--- NEWEST MESSAGE ---\n{}\n",
        message.sender, message.subject, message.quote.latest
    );

    if !message.quote.quoted.is_empty() {
        prompt.push_str(&format!(
            "\n--- QUOTED HISTORY (context only, do not reply to it) ---\n{}\n",
            message.quote.quoted
        ));
    }

    prompt.push_str("\n--- INSTRUCTIONS ---\n");
    prompt.push_str(INSTRUCTIONS);
    prompt
}

/// Parameters for a single generation.
#[derive(Debug, Clone)]
pub struct GenerateOptions<'a> {
    pub persona: &'a str,
    pub timeout: Duration,
    pub display_offset: FixedOffset,
    pub display_label: &'a str,
}

/// Draft a reply. Exactly one backend attempt; never fails.
pub async fn generate_reply(
    llm: &dyn LlmProvider,
    message: &InboundMessage,
    options: &GenerateOptions<'_>,
) -> GeneratedReply {
    let request = CompletionRequest::new(vec![
        ChatMessage::system(options.persona),
        ChatMessage::user(build_prompt(message, options.display_offset, options.display_label)),
    ])
    .with_max_tokens(REPLY_MAX_TOKENS)
    .with_temperature(REPLY_TEMPERATURE);

    let result = match tokio::time::timeout(options.timeout, llm.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout {
            provider: llm.model_name().to_string(),
            timeout: options.timeout,
        }),
    };

    match result {
        Ok(response) => {
            let text = response.content.trim();
            if text.is_empty() {
                tracing::warn!(id = %message.id, "Completion was empty; using fallback text");
                GeneratedReply::fallback(EMPTY_FALLBACK, GenerationFailure::Empty)
            } else {
                GeneratedReply::generated(text)
            }
        }
        Err(e) => {
            let failure = GenerationFailure::from(&e);
            match failure {
                GenerationFailure::RateLimited => {
                    tracing::error!(id = %message.id, "AI error: quota exceeded or rate limited")
                }
                GenerationFailure::Auth => {
                    tracing::error!(id = %message.id, "AI error: API key invalid or expired")
                }
                _ => tracing::error!(id = %message.id, error = %e, "AI error: failed to generate content"),
            }
            GeneratedReply::fallback(UNAVAILABLE_FALLBACK, failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::channels::email_types::QuoteSplit;
    use crate::llm::{CompletionResponse, Role};

    /// Returns a canned result and remembers every request.
    struct StubLlm {
        reply: Result<String, fn() -> LlmError>,
        delay: Duration,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl StubLlm {
        fn ok(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn err(make: fn() -> LlmError) -> Self {
            Self {
                reply: Err(make),
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().unwrap().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.reply {
                Ok(text) => Ok(CompletionResponse {
                    content: text.clone(),
                }),
                Err(make) => Err(make()),
            }
        }
    }

    fn message(quoted: &str) -> InboundMessage {
        InboundMessage {
            id: "m1".into(),
            thread_id: None,
            sender: "Alice <alice@example.com>".into(),
            sender_address: "alice@example.com".into(),
            subject: "Quote request".into(),
            body_text: "Can we get a quote?".into(),
            message_id_header: Some("<abc@x>".into()),
            references: vec![],
            received_at: Utc.with_ymd_and_hms(2026, 2, 22, 6, 45, 10).unwrap(),
            received_at_fallback: false,
            quote: QuoteSplit {
                latest: "Can we get a quote?".into(),
                quoted: quoted.into(),
                confident: !quoted.is_empty(),
            },
        }
    }

    fn options() -> GenerateOptions<'static> {
        GenerateOptions {
            persona: "You are terse.",
            timeout: Duration::from_secs(5),
            display_offset: FixedOffset::east_opt(7 * 3600).unwrap(),
            display_label: "WIB",
        }
    }

    #[test]
    fn prompt_contains_context() {
        let prompt = build_prompt(
            &message("> old thread"),
            FixedOffset::east_opt(7 * 3600).unwrap(),
            "WIB",
        );
        assert!(prompt.contains("Date Received: 2026-02-22 13:45:10 WIB"));
        assert!(prompt.contains("From: Alice <alice@example.com>"));
        assert!(prompt.contains("Subject: Quote request"));
        assert!(prompt.contains("--- NEWEST MESSAGE ---\nCan we get a quote?"));
        assert!(prompt.contains("context only"));
        assert!(prompt.contains("> old thread"));
        assert!(prompt.contains("Output ONLY the email body text"));
    }

    #[test]
    fn prompt_omits_empty_history() {
        let prompt = build_prompt(&message(""), FixedOffset::east_opt(0).unwrap(), "UTC");
        assert!(!prompt.contains("QUOTED HISTORY"));
        assert!(prompt.contains("2026-02-22 06:45:10 UTC"));
    }

    #[tokio::test]
    async fn success_is_trimmed() {
        let llm = StubLlm::ok("  Thanks, here is our quote...\n");
        let reply = generate_reply(&llm, &message(""), &options()).await;
        assert_eq!(reply, GeneratedReply::generated("Thanks, here is our quote..."));

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].messages[0].role, Role::System);
        assert_eq!(seen[0].messages[0].content, "You are terse.");
        assert_eq!(seen[0].max_tokens, Some(REPLY_MAX_TOKENS));
    }

    #[tokio::test]
    async fn empty_completion_uses_empty_fallback() {
        let llm = StubLlm::ok("   ");
        let reply = generate_reply(&llm, &message(""), &options()).await;
        assert!(!reply.generation_succeeded);
        assert_eq!(reply.text, EMPTY_FALLBACK);
        assert_eq!(reply.failure, Some(GenerationFailure::Empty));
    }

    #[tokio::test]
    async fn backend_error_uses_unavailable_fallback_once() {
        let llm = StubLlm::err(|| LlmError::RateLimited {
            provider: "stub".into(),
        });
        let reply = generate_reply(&llm, &message(""), &options()).await;
        assert!(!reply.generation_succeeded);
        assert_eq!(reply.text, UNAVAILABLE_FALLBACK);
        assert_eq!(reply.failure, Some(GenerationFailure::RateLimited));
        assert_eq!(llm.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let mut llm = StubLlm::ok("too late");
        llm.delay = Duration::from_secs(30);
        let opts = GenerateOptions {
            timeout: Duration::from_millis(50),
            ..options()
        };
        let reply = generate_reply(&llm, &message(""), &opts).await;
        assert_eq!(reply.failure, Some(GenerationFailure::Timeout));
        assert_eq!(reply.text, UNAVAILABLE_FALLBACK);
    }
}
