//! Chat + History aggregate (spec §3 "Chat", "History").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

pub const DEFAULT_CHAT_ID: &str = "chat-default";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// One entry in a chat's history. `order` lets the UI interleave text and tool
/// entries deterministically even though tool_call/tool_result notices and
/// assistant text are appended as separate records (spec §3 "History").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub order: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Typed view over `chat.meta.active_llm_override` (spec §9 "Deep nesting of
/// metadata maps": derive a typed view lazily on read, re-serialize on write,
/// never retain a reference into the map across a writer closure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveLlmOverride {
    pub provider_id: String,
    pub model: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Chat {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub channel: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Free-form mapping holding `prompt_mode`, `plan_*` fields, and
    /// `active_llm_override`. Accessed only through the typed helpers below.
    #[serde(default)]
    pub meta: HashMap<String, JsonValue>,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(default)]
    next_order: u64,
}

impl Chat {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, user_id: impl Into<String>, channel: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            channel: channel.into(),
            name: String::new(),
            created_at: Some(now),
            updated_at: Some(now),
            meta: HashMap::new(),
            history: Vec::new(),
            next_order: 0,
        }
    }

    pub fn is_protected(&self) -> bool {
        self.id == DEFAULT_CHAT_ID
    }

    pub fn append(&mut self, role: MessageRole, content: impl Into<String>, tool_name: Option<String>, tool_call_id: Option<String>) {
        let order = self.next_order;
        self.next_order += 1;
        self.history.push(HistoryMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            order,
            created_at: Utc::now(),
            tool_name,
            tool_call_id,
        });
        self.updated_at = Some(Utc::now());
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.next_order = 0;
        self.updated_at = Some(Utc::now());
    }

    pub fn active_llm_override(&self) -> Option<ActiveLlmOverride> {
        self.meta
            .get("active_llm_override")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set_active_llm_override(&mut self, provider_id: String, model: String) {
        let value = ActiveLlmOverride {
            provider_id,
            model,
            updated_at: Utc::now(),
        };
        self.meta.insert(
            "active_llm_override".to_string(),
            serde_json::to_value(value).expect("ActiveLlmOverride serializes"),
        );
        self.updated_at = Some(Utc::now());
    }

    pub fn prompt_mode(&self) -> Option<String> {
        self.meta
            .get("prompt_mode")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Plan-mode FSM state (spec §3 "PlanModeState"); absent/unparsable meta
    /// defaults to `off`.
    pub fn plan_mode_state(&self) -> crate::state::plan::PlanModeState {
        self.meta
            .get("plan_mode_state")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn set_plan_mode_state(&mut self, state: crate::state::plan::PlanModeState) {
        self.meta.insert(
            "plan_mode_state".to_string(),
            serde_json::to_value(state).expect("PlanModeState serializes"),
        );
        self.updated_at = Some(Utc::now());
    }

    pub fn plan_spec(&self) -> Option<crate::state::plan::PlanSpec> {
        self.meta
            .get("plan_spec")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set_plan_spec(&mut self, spec: crate::state::plan::PlanSpec) {
        self.meta
            .insert("plan_spec".to_string(), serde_json::to_value(spec).expect("PlanSpec serializes"));
        self.updated_at = Some(Utc::now());
    }

    pub fn clarify_asked_count(&self) -> u32 {
        self.meta.get("plan_clarify_asked_count").and_then(|v| v.as_u64()).unwrap_or(0) as u32
    }

    pub fn set_clarify_asked_count(&mut self, count: u32) {
        self.meta
            .insert("plan_clarify_asked_count".to_string(), serde_json::json!(count));
        self.updated_at = Some(Utc::now());
    }

    pub fn plan_execution_session_id(&self) -> Option<String> {
        self.meta
            .get("plan_execution_session_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn set_plan_execution_session_id(&mut self, session_id: String) {
        self.meta
            .insert("plan_execution_session_id".to_string(), serde_json::json!(session_id));
        self.updated_at = Some(Utc::now());
    }

    /// Pending clarifying questions recorded during `planning_clarify` (spec
    /// §4.5): free-form strings the client surfaces to the user.
    pub fn plan_pending_questions(&self) -> Vec<String> {
        self.meta
            .get("plan_pending_questions")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn set_plan_pending_questions(&mut self, questions: Vec<String>) {
        self.meta
            .insert("plan_pending_questions".to_string(), serde_json::json!(questions));
        self.updated_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatsAggregate {
    pub chats: HashMap<String, Chat>,
}

impl ChatsAggregate {
    /// Canonical lookup key per spec §4.7: `(session_id, user_id, channel)`,
    /// not the chat id itself.
    pub fn find_by_session(&self, session_id: &str, user_id: &str, channel: &str) -> Option<&Chat> {
        self.chats.values().find(|c| {
            c.session_id == session_id && c.user_id == user_id && c.channel == channel
        })
    }

    pub fn find_by_session_mut(&mut self, session_id: &str, user_id: &str, channel: &str) -> Option<&mut Chat> {
        self.chats.values_mut().find(|c| {
            c.session_id == session_id && c.user_id == user_id && c.channel == channel
        })
    }

    pub fn ensure_default_chat(&mut self) {
        self.chats
            .entry(DEFAULT_CHAT_ID.to_string())
            .or_insert_with(|| Chat::new(DEFAULT_CHAT_ID, "default", "default", "console"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chat_is_protected() {
        let chat = Chat::new(DEFAULT_CHAT_ID, "s", "u", "console");
        assert!(chat.is_protected());
    }

    #[test]
    fn append_assigns_monotonic_order() {
        let mut chat = Chat::new("c1", "s", "u", "console");
        chat.append(MessageRole::User, "hi", None, None);
        chat.append(MessageRole::Assistant, "hello", None, None);
        assert_eq!(chat.history[0].order, 0);
        assert_eq!(chat.history[1].order, 1);
    }

    #[test]
    fn find_by_session_uses_triple_key() {
        let mut agg = ChatsAggregate::default();
        let chat = Chat::new("c1", "s1", "u1", "console");
        agg.chats.insert(chat.id.clone(), chat);
        assert!(agg.find_by_session("s1", "u1", "console").is_some());
        assert!(agg.find_by_session("s1", "u1", "qq").is_none());
    }
}
