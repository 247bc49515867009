//! Named prompt-source registry backing system prompt layering (spec §4.8).
//! Each layer's `source` names an entry here; resolution is by name only —
//! concrete prompt authoring/content is out of scope (spec §1).

use super::Registry;
use crate::errors::{GatewayError, GatewayResult};
use async_trait::async_trait;

#[async_trait]
pub trait PromptSource: Send + Sync {
    async fn content(&self) -> GatewayResult<String>;
}

/// A prompt source whose content is fixed at registration time — covers the
/// built-in `base_system`/`tool_guide_system`/`plan_system`/`plan_ai_tools`
/// layers, none of which depend on request-time state.
pub struct StaticPrompt(pub String);

#[async_trait]
impl PromptSource for StaticPrompt {
    async fn content(&self) -> GatewayResult<String> {
        Ok(self.0.clone())
    }
}

pub type PromptSourceRegistry = Registry<Box<dyn PromptSource>>;

const BASE_SYSTEM: &str = "You are NextAI, a control-plane agent. Use tools when they materially help; otherwise answer directly.";
const TOOL_GUIDE_SYSTEM: &str =
    "Tools are invoked by name with a JSON arguments object. Prefer the narrowest tool that satisfies the request.";
const PLAN_SYSTEM: &str =
    "You are in plan mode. Do not take destructive actions; gather requirements and produce a PlanSpec before executing.";
const PLAN_AI_TOOLS: &str =
    "While planning, only read-only and clarification tools are available. Task execution tools unlock after the plan is approved.";

pub fn default_prompt_source_registry() -> PromptSourceRegistry {
    let mut registry = PromptSourceRegistry::new();
    registry.register("base_system", Box::new(StaticPrompt(BASE_SYSTEM.to_string())));
    registry.register("tool_guide_system", Box::new(StaticPrompt(TOOL_GUIDE_SYSTEM.to_string())));
    registry.register("plan_system", Box::new(StaticPrompt(PLAN_SYSTEM.to_string())));
    registry.register("plan_ai_tools", Box::new(StaticPrompt(PLAN_AI_TOOLS.to_string())));
    registry
}

pub async fn resolve(registry: &PromptSourceRegistry, source: &str) -> GatewayResult<String> {
    let entry = registry
        .get(source)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown prompt source: {source}")))?;
    entry.content().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_builtin_sources() {
        let registry = default_prompt_source_registry();
        let content = resolve(&registry, "base_system").await.unwrap();
        assert!(content.contains("NextAI"));
    }

    #[tokio::test]
    async fn unknown_source_is_rejected() {
        let registry = default_prompt_source_registry();
        assert!(resolve(&registry, "does_not_exist").await.is_err());
    }
}
