//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::message::{AssistantContent, Message};
use rig::completion::{CompletionError, CompletionModel};

use super::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role};
use crate::error::LlmError;

const PROVIDER: &str = "rig";
const DEFAULT_MAX_TOKENS: u64 = 2048;

/// An `LlmProvider` backed by any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }
}

/// Split chat messages into rig's shape: joined system preamble, history,
/// and the final prompt.
fn split_messages(
    messages: &[ChatMessage],
) -> Result<(Option<String>, Vec<Message>, Message), LlmError> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let preamble = (!system.is_empty()).then(|| system.join("\n\n"));

    let mut history: Vec<Message> = messages
        .iter()
        .filter_map(|m| match m.role {
            Role::System => None,
            Role::User => Some(Message::user(m.content.clone())),
            Role::Assistant => Some(Message::assistant(m.content.clone())),
        })
        .collect();
    let prompt = history.pop().ok_or_else(|| LlmError::InvalidResponse {
        provider: PROVIDER.to_string(),
        reason: "request has no user message".to_string(),
    })?;

    Ok((preamble, history, prompt))
}

/// rig hands back provider error bodies as text; recover the error class
/// from the Anthropic error type it carries.
fn classify_provider_error(body: String) -> LlmError {
    let provider = PROVIDER.to_string();
    if body.contains("rate_limit_error") {
        LlmError::RateLimited {
            provider,
            retry_after: None,
        }
    } else if body.contains("authentication_error") || body.contains("permission_error") {
        LlmError::AuthFailed { provider }
    } else if body.contains("overloaded_error") || body.contains("api_error") {
        LlmError::RequestFailed {
            provider,
            reason: body,
        }
    } else {
        LlmError::InvalidResponse {
            provider,
            reason: body,
        }
    }
}

fn map_completion_error(e: CompletionError) -> LlmError {
    match e {
        CompletionError::ProviderError(body) => classify_provider_error(body),
        CompletionError::ResponseError(reason) => LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason,
        },
        CompletionError::JsonError(e) => LlmError::Json(e),
        // Transport-level failures.
        other => LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: other.to_string(),
        },
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
        let (preamble, history, prompt) = split_messages(&request.messages)?;

        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .max_tokens(request.max_tokens.map_or(DEFAULT_MAX_TOKENS, u64::from));
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder.send().await.map_err(map_completion_error)?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        })
    }
}
