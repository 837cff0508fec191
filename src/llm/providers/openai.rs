//! OpenAI-compatible chat-completions client

use crate::config::LlmSection;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, Message,
    MessageRole, ResponseFormat, TokenUsage,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// OpenAI provider configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl OpenAiConfig {
    pub fn from_section(section: &LlmSection, api_key: String) -> Self {
        Self {
            api_key,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(section.timeout_secs),
        }
    }
}

/// OpenAI provider implementation
pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiProvider {
    /// Create a new OpenAI provider
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::NotConfigured(
                "OpenAI API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Convert completion request to OpenAI format (pure function)
    fn convert_request(request: &CompletionRequest) -> OpenAiCompletionRequest {
        let response_format = request.response_format.as_ref().map(|rf| OpenAiResponseFormat {
            format_type: match rf {
                ResponseFormat::Text => "text",
                ResponseFormat::Json => "json_object",
            }
            .to_string(),
        });

        OpenAiCompletionRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format,
        }
    }

    fn convert_message(message: &Message) -> OpenAiMessage {
        OpenAiMessage {
            role: match message.role {
                MessageRole::System => "system".to_string(),
                MessageRole::User => "user".to_string(),
                MessageRole::Assistant => "assistant".to_string(),
            },
            content: Some(message.content.clone()),
        }
    }

    /// Parse OpenAI completion response (pure function)
    fn parse_response(response: OpenAiCompletionResponse) -> Result<CompletionResponse, LlmError> {
        let Some(choice) = response.choices.into_iter().next() else {
            return Err(LlmError::ApiError(
                "No choices returned from OpenAI".to_string(),
            ));
        };

        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content,
            model: response.model,
            usage,
            finish_reason: Self::convert_finish_reason(choice.finish_reason.as_deref()),
        })
    }

    fn convert_finish_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        }
    }

    /// Map a non-success HTTP status to an error (pure function)
    fn status_error(status: StatusCode, body: &str) -> LlmError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                LlmError::AuthenticationFailed(format!("OpenAI API error: {status}"))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                LlmError::RateLimitExceeded(format!("OpenAI API error: {status} - {body}"))
            }
            s if s.is_server_error() => {
                LlmError::ApiError(format!("OpenAI API server error: {status} - {body}"))
            }
            _ => LlmError::ApiError(format!("OpenAI API error: {status} - {body}")),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let openai_request = Self::convert_request(&request);
        debug!(
            model = %openai_request.model,
            messages = openai_request.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&openai_request)
            .send()
            .await
            .map_err(|e| {
                warn!(
                    is_connect = e.is_connect(),
                    is_timeout = e.is_timeout(),
                    "OpenAI network error: {}",
                    e
                );
                LlmError::NetworkError(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = Self::status_error(status, &body);
            warn!("OpenAI request failed: {}", error);
            return Err(error);
        }

        let body: OpenAiCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let parsed = Self::parse_response(body)?;
        debug!(
            total_tokens = parsed.usage.total_tokens,
            finish_reason = ?parsed.finish_reason,
            "OpenAI response received"
        );
        Ok(parsed)
    }
}

#[derive(Debug, Serialize)]
struct OpenAiCompletionRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAiResponseFormat>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
