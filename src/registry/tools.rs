//! Tool registry (spec §4.6). Concrete tool implementations are out of scope
//! (spec §1) — only the `Tool` interface, its capability declarations, and the
//! capability-based router are specified. Grounded directly in the teacher's
//! `engine::tool_registry::ToolRegistry` (`execute`/`canonical_tool_name`
//! dispatch shape) generalized from a fixed builtin+skill split into the
//! generic [`Registry`].

use super::Registry;
use crate::errors::{GatewayError, GatewayResult};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Capability declarations (spec §4.6): the router maps by capability, with
/// legacy name-based routing retained only for `view`/`browser` back-compat.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCapabilities {
    pub open_local: bool,
    pub open_url: bool,
    pub approx_click: bool,
    pub approx_screenshot: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities::default()
    }
    /// Tools MUST produce JSON-serializable output; the caller maps a
    /// non-serializable result to `tool_invalid_result` (spec §4.1 step 4).
    async fn execute(&self, items: JsonValue) -> GatewayResult<JsonValue>;
}

pub type ToolRegistry = Registry<Box<dyn Tool>>;

/// Canonical names the router understands for capability-based legacy
/// back-compat (spec §4.6: "legacy name-based routing is retained only for
/// view/browser back-compat").
pub fn route_by_capability(registry: &ToolRegistry, requested: &str, target: Option<&str>) -> String {
    match requested {
        "open" => {
            if let Some(t) = target {
                if t.starts_with("http://") || t.starts_with("https://") {
                    return "browser".to_string();
                }
                if t.starts_with('/') {
                    return "view".to_string();
                }
            }
            requested.to_string()
        }
        "click" | "screenshot" => "browser".to_string(),
        other => {
            let _ = registry;
            other.to_string()
        }
    }
}

/// Tool definitions to hand a `tool_call`-capable provider (spec §4.6: a
/// `tool_call=false` adapter never sees these; `tool_call=true` gets every
/// registered tool). Concrete tool implementations are out of scope (spec
/// §1), so the definition is just the name the provider can call back with.
pub fn tool_definitions(registry: &ToolRegistry) -> Vec<JsonValue> {
    registry.keys().map(|name| serde_json::json!({ "name": name })).collect()
}

pub async fn dispatch(
    registry: &ToolRegistry,
    disabled_tools: &std::collections::HashSet<String>,
    tool_name: &str,
    items: JsonValue,
) -> GatewayResult<JsonValue> {
    if disabled_tools.contains(tool_name) {
        return Err(GatewayError::ToolDisabled(tool_name.to_string()));
    }
    let tool = registry
        .get(tool_name)
        .ok_or_else(|| GatewayError::ToolNotFound(tool_name.to_string()))?;
    tool.execute(items)
        .await
        .map_err(|e| GatewayError::ToolError(e.to_string()))
}

/// Demo `echo` tool kept registered by default so the turn engine and the
/// scenario tests in §8 have at least one real dispatch target.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, items: JsonValue) -> GatewayResult<JsonValue> {
        Ok(serde_json::json!({ "echoed": items }))
    }
}

pub fn default_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register("echo", Box::new(EchoTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_routes_local_path_to_view_and_url_to_browser() {
        let registry = default_tool_registry();
        assert_eq!(route_by_capability(&registry, "open", Some("/tmp/x")), "view");
        assert_eq!(
            route_by_capability(&registry, "open", Some("https://example.com")),
            "browser"
        );
    }

    #[test]
    fn click_and_screenshot_route_to_browser() {
        let registry = default_tool_registry();
        assert_eq!(route_by_capability(&registry, "click", None), "browser");
        assert_eq!(route_by_capability(&registry, "screenshot", None), "browser");
    }

    #[tokio::test]
    async fn disabled_tool_is_rejected_before_lookup() {
        let registry = default_tool_registry();
        let mut disabled = std::collections::HashSet::new();
        disabled.insert("echo".to_string());
        let result = dispatch(&registry, &disabled, "echo", serde_json::json!({})).await;
        assert!(matches!(result, Err(GatewayError::ToolDisabled(_))));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = default_tool_registry();
        let disabled = std::collections::HashSet::new();
        let result = dispatch(&registry, &disabled, "nope", serde_json::json!({})).await;
        assert!(matches!(result, Err(GatewayError::ToolNotFound(_))));
    }

    #[test]
    fn tool_definitions_lists_every_registered_tool() {
        let registry = default_tool_registry();
        let defs = tool_definitions(&registry);
        assert_eq!(defs.len(), registry.len());
        assert!(defs.iter().any(|d| d["name"] == "echo"));
    }
}
