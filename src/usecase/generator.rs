//! LLM-backed draft generator

use super::{DraftRequest, GenerateDrafts, LlmResponseError, UseCaseError};
use crate::config::LlmSection;
use crate::jobs::Draft;
use crate::llm::{CompletionRequest, LlmProvider, Message, ResponseFormat};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct DraftsReply {
    drafts: Option<Vec<DraftReply>>,
}

#[derive(Debug, Deserialize)]
struct DraftReply {
    #[serde(default)]
    content: String,
}

pub struct LlmDraftGenerator {
    provider: Arc<dyn LlmProvider>,
    model: String,
    system_prompt: String,
    prompt_template: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl LlmDraftGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, section: &LlmSection) -> Self {
        Self {
            provider,
            model: section.model.clone(),
            system_prompt: section.system_prompt.clone(),
            prompt_template: section.prompt_template.clone(),
            temperature: section.temperature,
            max_tokens: section.max_tokens,
        }
    }

    /// Substitute `{user_id}` and `{idea_id}` into the template
    pub fn render_prompt(template: &str, request: &DraftRequest) -> String {
        template
            .replace("{user_id}", &request.user_id)
            .replace("{idea_id}", &request.idea_id)
    }

    /// Turn the raw model reply into drafts, preserving order
    pub fn parse_drafts(
        raw: &str,
        request: &DraftRequest,
        prompt: &str,
    ) -> Result<Vec<Draft>, LlmResponseError> {
        let invalid = |reason: &str| LlmResponseError {
            reason: reason.to_string(),
            prompt: prompt.to_string(),
            raw_response: raw.to_string(),
        };

        let reply: DraftsReply =
            serde_json::from_str(strip_code_fence(raw)).map_err(|_| invalid("invalid json"))?;
        let drafts = reply.drafts.ok_or_else(|| invalid("missing drafts field"))?;

        let drafts: Vec<Draft> = drafts
            .into_iter()
            .map(|d| d.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .map(|content| Draft::new(&request.user_id, &request.idea_id, content))
            .collect();

        if drafts.is_empty() {
            return Err(invalid("no drafts generated"));
        }
        Ok(drafts)
    }
}

/// Models sometimes wrap JSON in a markdown fence
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[async_trait]
impl GenerateDrafts for LlmDraftGenerator {
    async fn execute(&self, request: DraftRequest) -> Result<Vec<Draft>, UseCaseError> {
        let prompt = Self::render_prompt(&self.prompt_template, &request);

        let completion = CompletionRequest {
            messages: vec![
                Message::system(self.system_prompt.clone()),
                Message::user(prompt.clone()),
            ],
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            response_format: Some(ResponseFormat::Json),
        };

        debug!(
            provider = self.provider.name(),
            user_id = %request.user_id,
            idea_id = %request.idea_id,
            "Requesting drafts"
        );
        let response = self.provider.complete(completion).await?;

        let raw = response.content.unwrap_or_default();
        if raw.trim().is_empty() {
            return Err(LlmResponseError {
                reason: "empty response".to_string(),
                prompt,
                raw_response: raw,
            }
            .into());
        }

        let drafts = Self::parse_drafts(&raw, &request, &prompt)?;
        info!(
            idea_id = %request.idea_id,
            drafts = drafts.len(),
            tokens = response.usage.total_tokens,
            "Drafts generated"
        );
        Ok(drafts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::testing::mocks::MockLlmProvider;

    fn request() -> DraftRequest {
        DraftRequest {
            user_id: "user-1".into(),
            idea_id: "idea-9".into(),
        }
    }

    fn section() -> LlmSection {
        crate::config::WorkerConfig::test_config().llm
    }

    #[test]
    fn test_render_prompt() {
        let rendered =
            LlmDraftGenerator::render_prompt("idea {idea_id} for {user_id} ({idea_id})", &request());
        assert_eq!(rendered, "idea idea-9 for user-1 (idea-9)");
    }

    #[test]
    fn test_parse_drafts_preserves_order() {
        let raw = r#"{"drafts":[{"content":"first"},{"content":"  "},{"content":"second"}]}"#;
        let drafts = LlmDraftGenerator::parse_drafts(raw, &request(), "p").unwrap();

        let contents: Vec<_> = drafts.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert!(drafts.iter().all(|d| d.idea_id == "idea-9"));
    }

    #[test]
    fn test_parse_drafts_accepts_code_fence() {
        let raw = "```json\n{\"drafts\":[{\"content\":\"x\"}]}\n```";
        assert_eq!(
            LlmDraftGenerator::parse_drafts(raw, &request(), "p")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_parse_drafts_reasons() {
        let cases = [
            ("not json", "invalid json"),
            (r#"{"posts":[]}"#, "missing drafts field"),
            (r#"{"drafts":[]}"#, "no drafts generated"),
        ];
        for (raw, reason) in cases {
            let error = LlmDraftGenerator::parse_drafts(raw, &request(), "the prompt").unwrap_err();
            assert_eq!(error.reason, reason);
            assert_eq!(error.raw_response, raw);
            assert_eq!(error.prompt, "the prompt");
        }
    }

    #[tokio::test]
    async fn test_execute_with_mock_provider() {
        // Arrange
        let provider = Arc::new(MockLlmProvider::single_response(
            r#"{"drafts":[{"content":"Hello LinkedIn"}]}"#,
        ));
        let generator = LlmDraftGenerator::new(provider.clone(), &section());

        // Act
        let drafts = generator.execute(request()).await.unwrap();

        // Assert
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].content, "Hello LinkedIn");
        let calls = provider.get_calls().await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].messages[1].content.contains("idea-9"));
        assert_eq!(calls[0].response_format, Some(ResponseFormat::Json));
    }

    #[tokio::test]
    async fn test_execute_maps_provider_errors() {
        let provider = Arc::new(MockLlmProvider::with_failure());
        let generator = LlmDraftGenerator::new(provider, &section());

        let error = generator.execute(request()).await.unwrap_err();

        assert!(matches!(error, UseCaseError::Llm(LlmError::RequestFailed(_))));
    }

    #[tokio::test]
    async fn test_execute_empty_content_is_structured_error() {
        let provider = Arc::new(MockLlmProvider::single_response(String::new()));
        let generator = LlmDraftGenerator::new(provider, &section());

        let error = generator.execute(request()).await.unwrap_err();

        assert_eq!(error.as_llm_response().unwrap().reason, "empty response");
    }
}
