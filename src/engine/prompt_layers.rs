//! System prompt layering (spec §4.8). Grounded in the teacher's
//! `engine::prompt` assembly shape, extended with per-layer SHA-256 hashing
//! and a token estimate so `/agent/system-layers` can introspect without
//! leaking provider secrets.

use crate::registry::prompt_sources::PromptSourceRegistry;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, serde::Serialize)]
pub struct Layer {
    pub name: String,
    pub role: String,
    pub source: String,
    pub content: String,
    pub hash: String,
    pub estimated_tokens: u32,
}

impl Layer {
    fn new(name: &str, role: &str, source: &str, content: String) -> Self {
        let hash = hex::encode(Sha256::digest(normalize_for_hash(&content).as_bytes()));
        let estimated_tokens = estimate_tokens(&content);
        Self {
            name: name.to_string(),
            role: role.to_string(),
            source: source.to_string(),
            content,
            hash,
            estimated_tokens,
        }
    }
}

fn normalize_for_hash(content: &str) -> String {
    content.trim().to_string()
}

/// Coarse token estimate (~4 chars/token), adequate for introspection and
/// budget display — not a tokenizer.
fn estimate_tokens(content: &str) -> u32 {
    ((content.chars().count() as f64) / 4.0).ceil() as u32
}

/// Default ordering (spec §4.8): `base_system, tool_guide_system,
/// workspace_policy_system, session_policy_system`. When plan-mode is
/// enabled, `tool_guide_system` is replaced by `plan_system, plan_ai_tools`.
pub async fn assemble(
    registry: &PromptSourceRegistry,
    plan_mode_enabled: bool,
    workspace_policy: &str,
    session_policy: &str,
) -> anyhow::Result<Vec<Layer>> {
    let mut layers = Vec::new();

    let base = crate::registry::prompt_sources::resolve(registry, "base_system").await?;
    layers.push(Layer::new("base_system", "system", "base_system", base));

    if plan_mode_enabled {
        let plan_system = crate::registry::prompt_sources::resolve(registry, "plan_system").await?;
        layers.push(Layer::new("plan_system", "system", "plan_system", plan_system));
        let plan_tools = crate::registry::prompt_sources::resolve(registry, "plan_ai_tools").await?;
        layers.push(Layer::new("plan_ai_tools", "system", "plan_ai_tools", plan_tools));
    } else {
        let tool_guide = crate::registry::prompt_sources::resolve(registry, "tool_guide_system").await?;
        layers.push(Layer::new("tool_guide_system", "system", "tool_guide_system", tool_guide));
    }

    if !workspace_policy.is_empty() {
        layers.push(Layer::new(
            "workspace_policy_system",
            "system",
            "inline",
            workspace_policy.to_string(),
        ));
    }
    if !session_policy.is_empty() {
        layers.push(Layer::new(
            "session_policy_system",
            "system",
            "inline",
            session_policy.to_string(),
        ));
    }

    Ok(layers)
}

pub fn total_estimated_tokens(layers: &[Layer]) -> u32 {
    layers.iter().map(|l| l.estimated_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::prompt_sources::default_prompt_source_registry;

    #[tokio::test]
    async fn default_assembly_uses_tool_guide_layer() {
        let registry = default_prompt_source_registry();
        let layers = assemble(&registry, false, "", "").await.unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[1].name, "tool_guide_system");
    }

    #[tokio::test]
    async fn plan_mode_swaps_tool_guide_for_plan_layers() {
        let registry = default_prompt_source_registry();
        let layers = assemble(&registry, true, "", "").await.unwrap();
        let names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
        assert!(names.contains(&"plan_system"));
        assert!(names.contains(&"plan_ai_tools"));
        assert!(!names.contains(&"tool_guide_system"));
    }

    #[tokio::test]
    async fn policy_layers_are_appended_when_non_empty() {
        let registry = default_prompt_source_registry();
        let layers = assemble(&registry, false, "workspace rules", "session rules").await.unwrap();
        assert_eq!(layers.len(), 4);
        assert_eq!(layers[2].name, "workspace_policy_system");
        assert_eq!(layers[3].name, "session_policy_system");
    }
}
