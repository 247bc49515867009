//! Workflow node-handler registry (spec §4.3). Each DAG node's `type` is
//! resolved against this registry; an unresolved type is rejected at validate
//! time with `unsupported type="<t>"`. Grounded in the retrieved workflow
//! executor's worker/state shape (`other_examples` workflow engine) combined
//! with the teacher's registry idiom — the teacher has no direct analog for a
//! node-typed DAG executor.

use super::Registry;
use crate::errors::{GatewayError, GatewayResult};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Frozen context a node evaluates against: the triggering job's static
/// fields (spec §4.3 `if_event` whitelist) plus any upstream node outputs.
#[derive(Debug, Clone, Default)]
pub struct NodeContext {
    pub job_id: String,
    pub job_name: String,
    pub channel: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub task_type: String,
    pub node_outputs: HashMap<String, JsonValue>,
    /// Per-execution cancellation (spec §4.3 `delay`: "context-cancellable").
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "job_id" => Some(self.job_id.clone()),
            "job_name" => Some(self.job_name.clone()),
            "channel" => self.channel.clone(),
            "user_id" => self.user_id.clone(),
            "session_id" => self.session_id.clone(),
            "task_type" => Some(self.task_type.clone()),
            _ => None,
        }
    }
}

/// Outcome of running one node (spec §4.3 execution: "per-node Stop/skip/
/// continue_on_error").
pub struct NodeOutcome {
    pub output: JsonValue,
    /// When true, execution halts after this node without visiting its
    /// successors — used by `if_event` when its condition evaluates false.
    pub stop: bool,
}

impl NodeOutcome {
    pub fn cont(output: JsonValue) -> Self {
        Self { output, stop: false }
    }

    pub fn halt() -> Self {
        Self {
            output: JsonValue::Null,
            stop: true,
        }
    }
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Validate a node's static config at DAG-build time (spec §4.3: reject
    /// negative `delay`, malformed `if_event` conditions, before execution).
    fn validate(&self, config: &JsonValue) -> GatewayResult<()> {
        let _ = config;
        Ok(())
    }

    async fn run(&self, config: &JsonValue, ctx: &NodeContext) -> GatewayResult<NodeOutcome>;
}

pub type NodeHandlerRegistry = Registry<Box<dyn NodeHandler>>;

pub fn resolve(registry: &NodeHandlerRegistry, node_type: &str) -> GatewayResult<&dyn NodeHandler> {
    registry
        .get(node_type)
        .map(|b| b.as_ref())
        .ok_or_else(|| GatewayError::InvalidCronWorkflow(format!("unsupported type=\"{node_type}\"")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl NodeHandler for NoopHandler {
        async fn run(&self, _config: &JsonValue, _ctx: &NodeContext) -> GatewayResult<NodeOutcome> {
            Ok(NodeOutcome::cont(JsonValue::Null))
        }
    }

    #[test]
    fn resolve_reports_unsupported_type() {
        let mut registry = NodeHandlerRegistry::new();
        registry.register("noop", Box::new(NoopHandler));
        assert!(resolve(&registry, "noop").is_ok());
        let err = resolve(&registry, "mystery").unwrap_err();
        assert!(err.to_string().contains("unsupported type=\"mystery\""));
    }

    #[test]
    fn context_field_lookup_matches_whitelist() {
        let ctx = NodeContext {
            job_id: "j1".to_string(),
            job_name: "nightly".to_string(),
            channel: Some("console".to_string()),
            user_id: None,
            session_id: None,
            task_type: "text".to_string(),
            node_outputs: HashMap::new(),
            cancel: CancellationToken::new(),
        };
        assert_eq!(ctx.field("job_name"), Some("nightly".to_string()));
        assert_eq!(ctx.field("user_id"), None);
        assert_eq!(ctx.field("not_a_field"), None);
    }
}
