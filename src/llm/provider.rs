use async_trait::async_trait;

use crate::errors::PilotResult;
use crate::llm::types::{CallConfig, ChatMessage, LlmResponse};

/// Chat-completion backend. Providers are registered by their config.toml key.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, messages: Vec<ChatMessage>, cfg: &CallConfig) -> PilotResult<LlmResponse>;
}
