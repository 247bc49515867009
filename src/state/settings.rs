//! Provider settings aggregate (spec §3 "ProviderSetting").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSetting {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: u64,
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    pub store: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ProviderSetting {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: None,
            headers: HashMap::new(),
            timeout_ms: 0,
            reasoning_effort: None,
            model_aliases: HashMap::new(),
            store: None,
        }
    }
}

impl ProviderSetting {
    /// Normalize as specified: provider id lower-cased/trimmed is handled by
    /// the caller (it's the map key, not a field); nil maps materialize to
    /// empty maps — serde's `#[serde(default)]` above already guarantees that
    /// on deserialize, this just re-asserts it for values built in memory.
    pub fn normalize(&mut self) {
        // headers/model_aliases are never Option, so there is nothing to
        // materialize here beyond what serde already guarantees; kept as an
        // explicit no-op hook so callers have one place to extend.
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveLlm {
    pub provider_id: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SettingsAggregate {
    pub providers: HashMap<String, ProviderSetting>,
    pub active_llm: Option<ActiveLlm>,
}

impl SettingsAggregate {
    /// Normalizes a raw provider id the way spec requires: lower-cased,
    /// trimmed. Called at every write boundary before use as a map key.
    pub fn normalize_id(id: &str) -> String {
        id.trim().to_lowercase()
    }

    pub fn set_provider(&mut self, id: &str, mut setting: ProviderSetting) {
        setting.normalize();
        self.providers.insert(Self::normalize_id(id), setting);
    }

    pub fn remove_provider(&mut self, id: &str) -> Option<ProviderSetting> {
        let removed = self.providers.remove(&Self::normalize_id(id));
        // Mutation engine §4.4: "if the active provider id disappeared, reset
        // active_llm to zero" after a provider_config write.
        if let Some(active) = &self.active_llm {
            if !self.providers.contains_key(&active.provider_id) {
                self.active_llm = None;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_id_lowercases_and_trims() {
        assert_eq!(SettingsAggregate::normalize_id("  OpenAI  "), "openai");
    }

    #[test]
    fn removing_active_provider_resets_active_llm() {
        let mut agg = SettingsAggregate::default();
        agg.set_provider("openai", ProviderSetting::default());
        agg.active_llm = Some(ActiveLlm {
            provider_id: "openai".to_string(),
            model: "gpt".to_string(),
        });
        agg.remove_provider("openai");
        assert!(agg.active_llm.is_none());
    }
}
