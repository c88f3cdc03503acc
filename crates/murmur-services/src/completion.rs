//! OpenAI chat-completion backend for response generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{CompletionService, Result, ServiceError, check_status};

const COMPLETION_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Configuration for the OpenAI completion client.
#[derive(Debug, Clone)]
pub struct OpenAiCompletionConfig {
    /// OpenAI API key
    pub api_key: String,

    /// Model to use (defaults to gpt-4o-mini)
    pub model: Option<String>,
}

impl OpenAiCompletionConfig {
    /// Create a new config with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: None,
        }
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Get the model name, using default if not set.
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

/// OpenAI chat-completions API client.
#[derive(Debug, Clone)]
pub struct OpenAiCompletion {
    client: reqwest::Client,
    config: OpenAiCompletionConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl OpenAiCompletion {
    /// Create a new client with the given configuration.
    pub fn new(config: OpenAiCompletionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Create a client from just an API key with default settings.
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        Self::new(OpenAiCompletionConfig::new(api_key))
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        debug!(
            model = self.config.model(),
            prompt_chars = prompt.len(),
            "Sending completion request to OpenAI"
        );

        let request = ChatRequest {
            model: self.config.model(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(COMPLETION_ENDPOINT)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        let response = check_status(response).await?;

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                ServiceError::InvalidResponse("completion contained no choices".to_string())
            })
    }

    fn name(&self) -> &str {
        "openai-completion"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_falls_back_to_default() {
        let config = OpenAiCompletionConfig::new("key");
        assert_eq!(config.model(), DEFAULT_MODEL);

        let config = config.with_model("gpt-4o");
        assert_eq!(config.model(), "gpt-4o");
    }

    #[test]
    fn response_payload_parses() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"HELLO"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let content = parsed.choices[0].message.content.as_deref();
        assert_eq!(content, Some("HELLO"));
    }

    #[test]
    fn empty_choices_is_invalid() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(parsed.choices.is_empty());
    }
}
