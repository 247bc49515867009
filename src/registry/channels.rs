//! Channel dispatcher registry (spec §4.6, §4.2 "dispatch by task_type: text").
//! Concrete channel implementations are out of scope (spec §1) — only the
//! dispatcher contract and a console (stdout/log) implementation used by the
//! default cron job and as the scheduler's fallback dispatch channel.

use super::Registry;
use crate::errors::{GatewayError, GatewayResult};
use async_trait::async_trait;

#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }

    async fn send_text(&self, user_id: Option<&str>, session_id: Option<&str>, text: &str) -> GatewayResult<()>;
}

/// Logs the message via `tracing` — stands in for an operator console.
pub struct ConsoleChannel;

#[async_trait]
impl ChannelDispatcher for ConsoleChannel {
    async fn send_text(&self, user_id: Option<&str>, session_id: Option<&str>, text: &str) -> GatewayResult<()> {
        tracing::info!(
            user_id = user_id.unwrap_or("-"),
            session_id = session_id.unwrap_or("-"),
            "console dispatch: {text}"
        );
        Ok(())
    }
}

pub type ChannelRegistry = Registry<Box<dyn ChannelDispatcher>>;

pub fn default_channel_registry() -> ChannelRegistry {
    let mut registry = ChannelRegistry::new();
    registry.register("console", Box::new(ConsoleChannel));
    registry
}

/// `qq` is inbound-only and forbidden as a dispatch target (spec §4.2
/// execution: "forbid qq as a dispatch target").
pub fn validate_dispatch_channel(channel: &str) -> GatewayResult<()> {
    if channel.eq_ignore_ascii_case("qq") {
        return Err(GatewayError::ChannelNotSupported(
            "qq is inbound-only and cannot be used as a dispatch target".to_string(),
        ));
    }
    Ok(())
}

pub async fn dispatch_text(
    registry: &ChannelRegistry,
    channel: &str,
    user_id: Option<&str>,
    session_id: Option<&str>,
    text: &str,
) -> GatewayResult<()> {
    validate_dispatch_channel(channel)?;
    let dispatcher = registry
        .get(channel)
        .ok_or_else(|| GatewayError::ChannelNotSupported(channel.to_string()))?;
    if !dispatcher.enabled() {
        return Err(GatewayError::ChannelDisabled(channel.to_string()));
    }
    dispatcher
        .send_text(user_id, session_id, text)
        .await
        .map_err(|e| GatewayError::ChannelDispatchFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qq_is_rejected_as_dispatch_target() {
        assert!(validate_dispatch_channel("qq").is_err());
        assert!(validate_dispatch_channel("console").is_ok());
    }

    #[tokio::test]
    async fn dispatch_text_routes_to_console() {
        let registry = default_channel_registry();
        let result = dispatch_text(&registry, "console", Some("u1"), None, "hi").await;
        assert!(result.is_ok());
    }
}
