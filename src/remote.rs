//! Client for a hosted chat-completion API (OpenAI wire format).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    backend::CompletionBackend, config::AppConfig, error::ServiceError, model::GenerationParams,
};

pub const SYSTEM_PROMPT: &str = "You are a helpful coding assistant.";

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub temperature: f64,
    pub max_tokens: usize,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl<'a> ChatCompletionRequest<'a> {
    /// Fixed system message plus the user prompt. `max_length` becomes the
    /// completion token budget.
    pub fn new(model: &'a str, params: &'a GenerationParams) -> Self {
        Self {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &params.prompt,
                },
            ],
            temperature: params.randomness,
            max_tokens: params.max_length,
        }
    }
}

pub struct OpenAiClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        }
    }

    /// `None` when no credential is configured; the remote path is then
    /// unreachable.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        config.openai_api_key.as_ref().map(|key| {
            Self::new(
                key.clone(),
                config.openai_model.clone(),
                &config.openai_base_url,
            )
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, params: GenerationParams) -> Result<String, ServiceError> {
        let body = ChatCompletionRequest::new(&self.model, &params);
        debug!(model = %self.model, max_tokens = body.max_tokens, "calling remote completion");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Remote(format!("{status}: {text}")));
        }

        let completion: ChatCompletionResponse = response.json().await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Remote("response contained no choices".into()))?;
        Ok(choice.message.content.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_system_and_user_messages() {
        let params = GenerationParams {
            prompt: "write fizzbuzz".into(),
            max_length: 256,
            randomness: 0.2,
        };
        let body = serde_json::to_value(ChatCompletionRequest::new("gpt-3.5-turbo", &params)).unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "model": "gpt-3.5-turbo",
                "messages": [
                    {"role": "system", "content": "You are a helpful coding assistant."},
                    {"role": "user", "content": "write fizzbuzz"}
                ],
                "temperature": 0.2,
                "max_tokens": 256
            })
        );
    }

    #[test]
    fn null_content_is_tolerated() {
        let parsed: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices": [{"index": 0, "message": {"role": "assistant", "content": null}}]}"#)
                .unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }

    #[test]
    fn endpoint_is_derived_from_base_url() {
        let client = OpenAiClient::new("k".into(), "m".into(), "http://localhost:9/v1/");
        assert_eq!(client.endpoint, "http://localhost:9/v1/chat/completions");
    }
}
