//! Built-in workflow node handlers (spec §4.3 "Built-in node handlers").

use crate::errors::{GatewayError, GatewayResult};
use crate::registry::channels::ChannelRegistry;
use crate::registry::node_handlers::{NodeContext, NodeHandler, NodeOutcome};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Dispatches `node.text` through the channel registry, using the job's
/// dispatch channel/target carried on [`NodeContext`].
pub struct TextEventHandler {
    pub channels: Arc<ChannelRegistry>,
}

#[async_trait]
impl NodeHandler for TextEventHandler {
    async fn run(&self, config: &JsonValue, ctx: &NodeContext) -> GatewayResult<NodeOutcome> {
        let text = config.get("text").and_then(|v| v.as_str()).unwrap_or_default();
        let channel = ctx.channel.as_deref().unwrap_or("console");
        crate::registry::channels::dispatch_text(&self.channels, channel, ctx.user_id.as_deref(), ctx.session_id.as_deref(), text)
            .await?;
        Ok(NodeOutcome::cont(JsonValue::String(text.to_string())))
    }
}

/// Sleeps `delay_seconds`; `0` is a no-op, negative seconds rejected at
/// validate time, cancellable via `ctx.cancel`.
pub struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    fn validate(&self, config: &JsonValue) -> GatewayResult<()> {
        let seconds = config.get("delay_seconds").and_then(|v| v.as_i64()).unwrap_or(0);
        if seconds < 0 {
            return Err(GatewayError::InvalidCronWorkflow("delay_seconds must not be negative".to_string()));
        }
        Ok(())
    }

    async fn run(&self, config: &JsonValue, ctx: &NodeContext) -> GatewayResult<NodeOutcome> {
        let seconds = config.get("delay_seconds").and_then(|v| v.as_i64()).unwrap_or(0).max(0) as u64;
        if seconds == 0 {
            return Ok(NodeOutcome::cont(JsonValue::Null));
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
            _ = ctx.cancel.cancelled() => {}
        }
        Ok(NodeOutcome::cont(JsonValue::Null))
    }
}

/// Evaluates `if_condition` against the frozen job context; `Stop=true` when
/// the condition is false. Syntax: `<field> (==|!=) <"value"|'value'|bareword>`.
pub struct IfEventHandler;

const ALLOWED_FIELDS: &[&str] = &["job_id", "job_name", "channel", "user_id", "session_id", "task_type"];

fn parse_condition(condition: &str) -> GatewayResult<(String, bool, String)> {
    let (field, op, rest) = if let Some(idx) = condition.find("==") {
        (condition[..idx].trim(), true, condition[idx + 2..].trim())
    } else if let Some(idx) = condition.find("!=") {
        (condition[..idx].trim(), false, condition[idx + 2..].trim())
    } else {
        return Err(GatewayError::InvalidCronWorkflow(format!("malformed if_condition: {condition}")));
    };
    if !ALLOWED_FIELDS.contains(&field) {
        return Err(GatewayError::InvalidCronWorkflow(format!("if_condition references unknown field: {field}")));
    }
    let value = rest
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(rest)
        .to_string();
    if value.is_empty() {
        return Err(GatewayError::InvalidCronWorkflow(format!("malformed if_condition: {condition}")));
    }
    Ok((field.to_string(), op, value))
}

#[async_trait]
impl NodeHandler for IfEventHandler {
    fn validate(&self, config: &JsonValue) -> GatewayResult<()> {
        let condition = config
            .get("if_condition")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidCronWorkflow("if_event node requires if_condition".to_string()))?;
        parse_condition(condition).map(|_| ())
    }

    async fn run(&self, config: &JsonValue, ctx: &NodeContext) -> GatewayResult<NodeOutcome> {
        let condition = config.get("if_condition").and_then(|v| v.as_str()).unwrap_or_default();
        let (field, equals, expected) = parse_condition(condition)?;
        let actual = ctx.field(&field).unwrap_or_default();
        let matched = if equals { actual == expected } else { actual != expected };
        if matched {
            Ok(NodeOutcome::cont(JsonValue::Bool(true)))
        } else {
            Ok(NodeOutcome::halt())
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub struct AlwaysFailHandler;

    #[async_trait]
    impl NodeHandler for AlwaysFailHandler {
        async fn run(&self, _config: &JsonValue, _ctx: &NodeContext) -> GatewayResult<NodeOutcome> {
            Err(GatewayError::ToolError("simulated node failure".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::node_handlers::NodeContext;
    use serde_json::json;

    #[test]
    fn delay_rejects_negative_seconds_at_validate_time() {
        let handler = DelayHandler;
        assert!(handler.validate(&json!({ "delay_seconds": -1 })).is_err());
        assert!(handler.validate(&json!({ "delay_seconds": 0 })).is_ok());
    }

    #[tokio::test]
    async fn delay_zero_is_a_no_op() {
        let handler = DelayHandler;
        let outcome = handler.run(&json!({ "delay_seconds": 0 }), &NodeContext::default()).await.unwrap();
        assert!(!outcome.stop);
    }

    #[test]
    fn if_event_rejects_unknown_field() {
        let handler = IfEventHandler;
        let err = handler.validate(&json!({ "if_condition": "color == \"red\"" })).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[tokio::test]
    async fn if_event_stops_when_condition_is_false() {
        let handler = IfEventHandler;
        let ctx = NodeContext {
            channel: Some("console".to_string()),
            ..NodeContext::default()
        };
        let outcome = handler
            .run(&json!({ "if_condition": "channel == \"qq\"" }), &ctx)
            .await
            .unwrap();
        assert!(outcome.stop);
    }

    #[tokio::test]
    async fn if_event_continues_when_condition_is_true() {
        let handler = IfEventHandler;
        let ctx = NodeContext {
            channel: Some("console".to_string()),
            ..NodeContext::default()
        };
        let outcome = handler
            .run(&json!({ "if_condition": "channel == \"console\"" }), &ctx)
            .await
            .unwrap();
        assert!(!outcome.stop);
    }
}
