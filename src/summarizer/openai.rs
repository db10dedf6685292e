//! OpenAI-compatible chat completions summarizer

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::Summarizer;
use crate::config::SummarizerConfig;
use crate::{Error, Result};

/// Summarizer backed by a `/chat/completions` endpoint
pub struct OpenAiSummarizer {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiSummarizer {
    /// Create a new summarizer
    #[must_use]
    pub fn new(api_key: String, config: &SummarizerConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            endpoint: format!("{}/chat/completions", config.api_url.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Endpoint requests are sent to
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, instruction: &str, content: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: instruction,
                },
                ChatMessage {
                    role: "user",
                    content,
                },
            ],
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Summarizer(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Summarizer(format!("API error: {status} - {body}")));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Summarizer(format!("failed to parse response: {e}")))?;

        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| Error::Summarizer("empty completion".to_string()))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base_url() {
        let config = SummarizerConfig {
            api_url: "http://localhost:8080/v1/".to_string(),
            ..SummarizerConfig::default()
        };
        let summarizer = OpenAiSummarizer::new("key".to_string(), &config);
        assert_eq!(summarizer.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn request_serializes_system_and_user_messages() {
        let request = ChatCompletionRequest {
            model: "gpt-4o-mini",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "summarize",
                },
                ChatMessage {
                    role: "user",
                    content: "User: hi",
                },
            ],
            temperature: Some(0.2),
            max_tokens: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "User: hi");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn response_parses_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":" A summary. "}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some(" A summary. ")
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_summarizer_error() {
        let config = SummarizerConfig {
            api_url: "http://127.0.0.1:9".to_string(),
            ..SummarizerConfig::default()
        };
        let summarizer = OpenAiSummarizer::new("key".to_string(), &config);

        let result = summarizer.summarize("summarize", "User: hi").await;
        assert!(matches!(result, Err(Error::Summarizer(_))));
    }
}
