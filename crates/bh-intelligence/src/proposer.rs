use std::sync::Arc;

use async_trait::async_trait;
use bh_core::collaborators::{CollaboratorError, FixProposer};
use bh_core::types::{CandidateLocation, ErrorReport};
use tracing::{info, warn};

use crate::llm::{CompletionConfig, LlmMessage, LlmProvider};
use crate::prompts;

/// Drafts a fix with a model. The raw answer is returned untouched.
pub struct LlmFixProposer {
    provider: Arc<dyn LlmProvider>,
    config: CompletionConfig,
}

impl LlmFixProposer {
    pub fn new(provider: Arc<dyn LlmProvider>, config: CompletionConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl FixProposer for LlmFixProposer {
    async fn propose(
        &self,
        report: &ErrorReport,
        candidates: &[CandidateLocation],
        locator_summary: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        let messages = [
            LlmMessage::system(prompts::FIX_SYSTEM),
            LlmMessage::user(prompts::fix_prompt(report, candidates, locator_summary)),
        ];
        let response = self
            .provider
            .complete(&messages, &self.config)
            .await
            .map_err(|e| {
                warn!(error = %e, "fix proposal model call failed");
                CollaboratorError::from(e)
            })?;

        if response.content.trim().is_empty() {
            return Err(CollaboratorError::InvalidResponse(
                "model returned an empty answer".into(),
            ));
        }
        info!(
            model = %response.model,
            output_tokens = response.output_tokens,
            "fix proposal drafted"
        );
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockProvider};

    #[tokio::test]
    async fn returns_raw_model_output() {
        let mock = Arc::new(MockProvider::new().with_text("**File to Fix:** app.py"));
        let proposer = LlmFixProposer::new(mock.clone(), CompletionConfig::default());
        let report = ErrorReport::new("1", "KeyError", "'foo'");
        let out = proposer
            .propose(&report, &[CandidateLocation::new("app.py", "r")], Some("s"))
            .await
            .unwrap();
        assert_eq!(out, "**File to Fix:** app.py");

        let captured = mock.captured_requests();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].0[1].content.contains("- app.py: r"));
    }

    #[tokio::test]
    async fn maps_rate_limit_to_api_error() {
        let mock = Arc::new(MockProvider::new().with_error(LlmError::RateLimited {
            retry_after_secs: Some(3),
        }));
        let proposer = LlmFixProposer::new(mock, CompletionConfig::default());
        let err = proposer
            .propose(&ErrorReport::new("1", "E", "m"), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Api { status: 429, .. }));
    }

    #[tokio::test]
    async fn empty_answer_is_an_error() {
        let mock = Arc::new(MockProvider::new().with_text("   "));
        let proposer = LlmFixProposer::new(mock, CompletionConfig::default());
        let err = proposer
            .propose(&ErrorReport::new("1", "E", "m"), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::InvalidResponse(_)));
    }
}
