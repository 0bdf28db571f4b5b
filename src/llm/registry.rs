use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, LlmConfig, RoleEntry};
use crate::errors::{PilotError, PilotResult};
use crate::llm::provider::LlmProvider;
use crate::llm::providers::openai_compatible::OpenAiCompatibleProvider;
use crate::llm::types::CallConfig;

/// Model roles the engine calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Vision,
    Reasoning,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Vision => "vision",
            Role::Reasoning => "reasoning",
        }
    }
}

/// Providers keyed by their config.toml identifier.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    active: String,
    llm_config: LlmConfig,
}

impl ProviderRegistry {
    pub fn new(active: String) -> Self {
        Self {
            providers: HashMap::new(),
            active,
            llm_config: LlmConfig::default(),
        }
    }

    pub fn with_config(llm_config: LlmConfig) -> Self {
        Self {
            providers: HashMap::new(),
            active: llm_config.active_provider.clone(),
            llm_config,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get_active(&self) -> PilotResult<Arc<dyn LlmProvider>> {
        self.providers
            .get(&self.active)
            .cloned()
            .ok_or_else(|| PilotError::Config(format!("Active provider '{}' not found in registry", self.active)))
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    fn role_entry(&self, role: Role) -> Option<&RoleEntry> {
        match role {
            Role::Vision => self.llm_config.roles.vision.as_ref(),
            Role::Reasoning => self.llm_config.roles.reasoning.as_ref(),
        }
    }

    /// Provider and call settings for `role`: `[llm.roles.<role>]` when
    /// present, otherwise the active provider with its defaults.
    pub fn call_config_for_role(&self, role: Role) -> PilotResult<(Arc<dyn LlmProvider>, CallConfig)> {
        if let Some(entry) = self.role_entry(role) {
            let provider = self.providers.get(&entry.provider).cloned().ok_or_else(|| {
                PilotError::Config(format!(
                    "Role '{}' references unknown provider '{}'",
                    role.as_str(),
                    entry.provider
                ))
            })?;
            let temperature = entry.temperature.unwrap_or_else(|| {
                self.llm_config
                    .providers
                    .get(&entry.provider)
                    .map(|p| p.temperature)
                    .unwrap_or(0.1)
            });
            tracing::debug!(
                role = role.as_str(),
                provider = %entry.provider,
                model = %entry.model,
                "resolved role config"
            );
            return Ok((
                provider,
                CallConfig {
                    model: entry.model.clone(),
                    stream: entry.stream,
                    temperature,
                },
            ));
        }

        let provider = self.get_active()?;
        let (model, temperature) = self
            .llm_config
            .providers
            .get(&self.active)
            .map(|p| (p.model.clone(), p.temperature))
            .unwrap_or_else(|| (String::new(), 0.1));
        tracing::debug!(role = role.as_str(), provider = %self.active, model = %model, "role not configured, using active provider");
        Ok((
            provider,
            CallConfig {
                model,
                stream: false,
                temperature,
            },
        ))
    }

    /// Builds OpenAI-compatible providers for every configured entry. API
    /// keys come from `SCREENPILOT_<ID>_API_KEY`, then from the config file.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::with_config(config.llm.clone());
        let timeout = (config.llm.request_timeout_secs > 0)
            .then(|| Duration::from_secs(config.llm.request_timeout_secs));
        for (id, entry) in &config.llm.providers {
            let api_key = std::env::var(format!("SCREENPILOT_{}_API_KEY", id.to_uppercase()))
                .unwrap_or_else(|_| entry.api_key.clone().unwrap_or_default());
            let provider = OpenAiCompatibleProvider::new(id.clone(), entry.api_base.clone(), api_key, timeout);
            registry.register(Arc::new(provider));
        }
        tracing::info!(providers = ?registry.list_names(), active = %registry.active, "provider registry built");
        registry
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::config::{ProviderEntry, RoleEntry};
    use crate::llm::types::{ChatMessage, LlmResponse};

    struct Named(&'static str);

    #[async_trait]
    impl LlmProvider for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn chat(&self, _messages: Vec<ChatMessage>, _cfg: &CallConfig) -> PilotResult<LlmResponse> {
            Ok(LlmResponse::default())
        }
    }

    fn entry(model: &str) -> ProviderEntry {
        ProviderEntry {
            display_name: model.into(),
            api_base: "http://localhost".into(),
            model: model.into(),
            temperature: 0.3,
            api_key: None,
        }
    }

    #[test]
    fn role_entry_overrides_active_provider() {
        let mut llm = LlmConfig {
            active_provider: "local".into(),
            ..LlmConfig::default()
        };
        llm.providers.insert("local".into(), entry("small"));
        llm.providers.insert("cloud".into(), entry("large"));
        llm.roles.vision = Some(RoleEntry {
            provider: "cloud".into(),
            model: "large-vl".into(),
            stream: true,
            temperature: None,
        });
        let mut reg = ProviderRegistry::with_config(llm);
        reg.register(Arc::new(Named("local")));
        reg.register(Arc::new(Named("cloud")));

        let (p, cfg) = reg.call_config_for_role(Role::Vision).unwrap();
        assert_eq!(p.name(), "cloud");
        assert_eq!(cfg.model, "large-vl");
        assert!(cfg.stream);
        assert!((cfg.temperature - 0.3).abs() < f64::EPSILON);

        let (p, cfg) = reg.call_config_for_role(Role::Reasoning).unwrap();
        assert_eq!(p.name(), "local");
        assert_eq!(cfg.model, "small");
        assert!(!cfg.stream);
    }

    #[test]
    fn missing_active_provider_is_config_error() {
        let reg = ProviderRegistry::new("nowhere".into());
        assert!(matches!(reg.call_config_for_role(Role::Vision), Err(PilotError::Config(_))));
    }
}
