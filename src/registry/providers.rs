//! Model-provider adapter registry (spec §4.6). Concrete provider HTTP clients
//! (OpenAI-compatible wire format) are explicitly out of scope (spec §1) — only
//! the adapter trait and capability contract are specified here, plus a single
//! `demo` adapter so `/agent/process` has something to call when no provider
//! is configured (spec §4.1 step 2 default: `demo/demo-chat`).

use super::Registry;
use crate::errors::{GatewayError, GatewayResult};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value as JsonValue;

/// Capability declarations consulted by the turn engine to choose a code path
/// (spec §4.6) rather than branching on adapter type identity.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ProviderCapabilities {
    pub stream: bool,
    pub tool_call: bool,
    pub attachments: bool,
    pub reasoning: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderToolCall {
    pub id: String,
    pub name: String,
    pub arguments: JsonValue,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub tool_calls: Vec<ProviderToolCall>,
    /// True once the provider signals end-of-turn (`stop_reason=end_turn` or
    /// equivalent) — spec §4.1 step 6.
    pub end_turn: bool,
}

#[derive(Debug, Clone)]
pub enum ProviderStreamEvent {
    TextDelta(String),
    ToolCall(ProviderToolCall),
    End { end_turn: bool },
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<ProviderMessage>,
    pub tools: Vec<JsonValue>,
    pub reasoning_effort: Option<String>,
    pub stream: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderMessage {
    pub role: String,
    pub content: String,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn capabilities(&self) -> ProviderCapabilities;

    async fn complete(&self, request: ProviderRequest) -> GatewayResult<ProviderResponse>;

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> GatewayResult<BoxStream<'static, GatewayResult<ProviderStreamEvent>>>;
}

/// Deterministic non-networked adapter for the built-in `demo/demo-chat`
/// default and for tests — echoes the last user message back, never requests
/// tool calls, declares every capability so it never triggers a downgrade path.
pub struct DemoAdapter;

#[async_trait]
impl ProviderAdapter for DemoAdapter {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            stream: true,
            tool_call: true,
            attachments: true,
            reasoning: true,
        }
    }

    async fn complete(&self, request: ProviderRequest) -> GatewayResult<ProviderResponse> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ProviderResponse {
            text: format!("demo-chat received: {last_user}"),
            tool_calls: Vec::new(),
            end_turn: true,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> GatewayResult<BoxStream<'static, GatewayResult<ProviderStreamEvent>>> {
        let response = self.complete(request).await?;
        let events = vec![
            Ok(ProviderStreamEvent::TextDelta(response.text)),
            Ok(ProviderStreamEvent::End { end_turn: true }),
        ];
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}

pub type ProviderRegistry = Registry<Box<dyn ProviderAdapter>>;

pub fn default_provider_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(crate::config::DEFAULT_PROVIDER_ID, Box::new(DemoAdapter));
    registry
}

pub fn resolve(registry: &ProviderRegistry, provider_id: &str) -> GatewayResult<&dyn ProviderAdapter> {
    registry
        .get(provider_id)
        .map(|b| b.as_ref())
        .ok_or_else(|| GatewayError::ProviderDisabled(provider_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn demo_adapter_echoes_last_user_message() {
        let adapter = DemoAdapter;
        let resp = adapter
            .complete(ProviderRequest {
                model: "demo-chat".to_string(),
                messages: vec![ProviderMessage {
                    role: "user".to_string(),
                    content: "hello".to_string(),
                }],
                tools: vec![],
                reasoning_effort: None,
                stream: false,
            })
            .await
            .unwrap();
        assert!(resp.text.contains("hello"));
        assert!(resp.end_turn);
    }

    #[tokio::test]
    async fn demo_adapter_stream_ends_with_end_turn() {
        let adapter = DemoAdapter;
        let mut stream = adapter
            .stream(ProviderRequest {
                model: "demo-chat".to_string(),
                messages: vec![],
                tools: vec![],
                reasoning_effort: None,
                stream: true,
            })
            .await
            .unwrap();
        let mut saw_end = false;
        while let Some(event) = stream.next().await {
            if let Ok(ProviderStreamEvent::End { end_turn }) = event {
                saw_end = end_turn;
            }
        }
        assert!(saw_end);
    }
}
