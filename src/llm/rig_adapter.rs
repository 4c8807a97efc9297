//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{CompletionModel, Prompt};

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Adapter that runs each request as a single-turn rig agent prompt.
pub struct RigAdapter<M> {
    model: M,
    provider: &'static str,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, provider: &'static str, model_name: &str) -> Self {
        Self {
            model,
            provider,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let preamble = request.system_text();
        let prompt = request.user_text();

        let mut builder = AgentBuilder::new(self.model.clone()).preamble(&preamble);
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        let agent = builder.build();

        let content = agent
            .prompt(prompt.as_str())
            .await
            .map_err(|e| classify_provider_error(self.provider, &e.to_string()))?;

        Ok(CompletionResponse { content })
    }
}

/// Map a provider error message onto an `LlmError` category.
///
/// rig surfaces HTTP failures as strings, so the status code and provider
/// wording are the only signal available.
pub fn classify_provider_error(provider: &str, message: &str) -> LlmError {
    let lower = message.to_lowercase();
    let provider = provider.to_string();

    if lower.contains("429") || lower.contains("rate limit") || lower.contains("quota") {
        LlmError::RateLimited { provider }
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("api_key")
        || lower.contains("api key")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
    {
        LlmError::AuthFailed { provider }
    } else if lower.contains("deserializ") || lower.contains("json") || lower.contains("parse") {
        LlmError::InvalidResponse {
            provider,
            reason: message.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider,
            reason: message.to_string(),
        }
    }
}
