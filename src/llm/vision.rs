use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::PilotResult;
use crate::llm::registry::{ProviderRegistry, Role};
use crate::llm::types::ChatMessage;
use crate::perception::screenshot::Screenshot;

/// The model collaborator as the engine sees it: free text in, free text out.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Prompt about a screenshot.
    async fn analyze(&self, screenshot: &Screenshot, prompt: &str, system: &str) -> PilotResult<String>;

    /// Text-only prompt.
    async fn reason(&self, prompt: &str, system: &str) -> PilotResult<String>;
}

/// [`VisionModel`] backed by the provider registry: screenshots go to the
/// vision role, text-only prompts to the reasoning role.
pub struct RoleModel {
    registry: Arc<ProviderRegistry>,
}

impl RoleModel {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    async fn call(&self, role: Role, messages: Vec<ChatMessage>) -> PilotResult<String> {
        let (provider, cfg) = self.registry.call_config_for_role(role)?;
        let response = provider.chat(messages, &cfg).await?;
        Ok(response.content)
    }
}

#[async_trait]
impl VisionModel for RoleModel {
    async fn analyze(&self, screenshot: &Screenshot, prompt: &str, system: &str) -> PilotResult<String> {
        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user_with_image(prompt, screenshot.data_url()),
        ];
        self.call(Role::Vision, messages).await
    }

    async fn reason(&self, prompt: &str, system: &str) -> PilotResult<String> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];
        self.call(Role::Reasoning, messages).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::LlmConfig;
    use crate::llm::provider::LlmProvider;
    use crate::llm::types::{CallConfig, LlmResponse, MessageContent};

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl LlmProvider for Recording {
        fn name(&self) -> &str {
            "rec"
        }

        async fn chat(&self, messages: Vec<ChatMessage>, _cfg: &CallConfig) -> PilotResult<LlmResponse> {
            self.seen.lock().unwrap().push(messages);
            Ok(LlmResponse {
                content: "ok".into(),
                reasoning: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn analyze_attaches_screenshot() {
        let provider = Arc::new(Recording::default());
        let mut registry = ProviderRegistry::with_config(LlmConfig {
            active_provider: "rec".into(),
            ..LlmConfig::default()
        });
        registry.register(provider.clone());
        let model = RoleModel::new(Arc::new(registry));

        let shot = Screenshot::blank(4, 4).unwrap();
        assert_eq!(model.analyze(&shot, "describe", "sys").await.unwrap(), "ok");
        assert_eq!(model.reason("plan", "sys").await.unwrap(), "ok");

        let seen = provider.seen.lock().unwrap();
        assert!(matches!(seen[0][1].content, MessageContent::Parts(ref p) if p.len() == 2));
        assert!(matches!(seen[1][1].content, MessageContent::Text(ref t) if t == "plan"));
    }
}
