use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AppConfig, LlmConfig, RoleEntry};
use crate::errors::{WebClawError, WebClawResult};
use crate::llm::provider::LlmProvider;
use crate::llm::providers::openai_compatible::OpenAiCompatibleProvider;
use crate::llm::types::{CallConfig, ModelTier};

/// Registry of all available LLM providers, keyed by their config.toml identifier.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    active: String,
    /// Kept for tier-to-model lookups.
    llm_config: LlmConfig,
}

impl ProviderRegistry {
    /// Registry over an explicit config, with providers registered by the caller.
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

    pub fn get_active(&self) -> WebClawResult<Arc<dyn LlmProvider>> {
        self.providers
            .get(&self.active)
            .cloned()
            .ok_or_else(|| WebClawError::Config(format!("Active provider '{}' not found in registry", self.active)))
    }

    pub fn list_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Return the provider and call configuration for a routing tier.
    ///
    /// Resolution order:
    /// 1. `[llm.roles.<tier>]` in config.toml
    /// 2. Fallback: active provider with its default model / temperature
    pub fn call_config_for_tier(&self, tier: ModelTier) -> WebClawResult<(Arc<dyn LlmProvider>, CallConfig)> {
        let role_entry: Option<&RoleEntry> = match tier {
            ModelTier::Reasoning => self.llm_config.roles.reasoning.as_ref(),
            ModelTier::Fast => self.llm_config.roles.fast.as_ref(),
        };

        if let Some(entry) = role_entry {
            let provider = self.providers.get(&entry.provider).cloned().ok_or_else(|| {
                WebClawError::Config(format!(
                    "Role '{}' references unknown provider '{}'",
                    tier.role_name(),
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
                tier = tier.role_name(),
                provider = %entry.provider,
                model = %entry.model,
                stream = entry.stream,
                temperature = temperature,
                "resolved tier config"
            );
            return Ok((provider, CallConfig {
                model: entry.model.clone(),
                stream: entry.stream,
                temperature,
            }));
        }

        // Fallback: active provider, provider-level defaults
        let provider = self.get_active()?;
        let entry = self.llm_config.providers.get(&self.active);
        let (model, temperature) = entry
            .map(|p| (p.model.clone(), p.temperature))
            .unwrap_or_else(|| (String::new(), 0.1));
        tracing::debug!(
            tier = tier.role_name(),
            provider = %self.active,
            model = %model,
            "tier not configured, using active provider fallback"
        );
        Ok((provider, CallConfig { model, stream: false, temperature }))
    }

    /// Build a registry from the loaded app config.
    /// API keys are read from environment variables named `WEBCLAW_<ID>_API_KEY`.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::with_config(config.llm.clone());
        for (id, entry) in &config.llm.providers {
            let api_key = std::env::var(format!("WEBCLAW_{}_API_KEY", id.to_uppercase()))
                .unwrap_or_else(|_| entry.api_key.clone().unwrap_or_default());
            match OpenAiCompatibleProvider::new(id.clone(), entry.api_base.clone(), api_key) {
                Ok(provider) => registry.register(Arc::new(provider)),
                Err(e) => tracing::warn!(provider = %id, error = %e, "provider skipped"),
            }
        }
        registry
    }
}
