pub mod llm;
pub mod locator;
pub mod prompts;
pub mod proposer;

// Re-export canonical LLM types for convenience.
pub use llm::{
    provider_from_config, AnthropicProvider, CompletionConfig, GeminiProvider, LlmError,
    LlmMessage, LlmProvider, LlmResponse, LlmRole, MockProvider as LlmMockProvider,
};
pub use locator::{LlmCodeLocator, StackTraceLocator};
pub use proposer::LlmFixProposer;
