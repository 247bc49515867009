//! Session / chat authority (spec §4.7). Grounded in the teacher's
//! `project_store::ProjectStore` chat-lookup idiom, regrounded from
//! project-root keying onto the spec's `(session_id, user_id, channel)` triple.

use crate::config::{DEFAULT_MODEL, DEFAULT_PROVIDER_ID};
use crate::state::chats::{ActiveLlmOverride, Chat, ChatsAggregate};
use crate::state::settings::SettingsAggregate;
use crate::state::Dependencies;
use anyhow::Result;

/// The resolved model to invoke for a turn: override → global active → demo
/// default (spec §4.1 step 2, §4.7 resolution order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub provider_id: String,
    pub model: String,
}

impl ResolvedModel {
    fn demo() -> Self {
        Self {
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Finds or creates the chat for `(session_id, user_id, channel)`. Does not
/// persist; callers wrap this in a `deps.chats.write(...)` closure.
pub fn resolve_or_create_chat<'a>(
    aggregate: &'a mut ChatsAggregate,
    session_id: &str,
    user_id: &str,
    channel: &str,
) -> &'a mut Chat {
    if aggregate.find_by_session(session_id, user_id, channel).is_none() {
        let chat = Chat::new(uuid::Uuid::new_v4().to_string(), session_id, user_id, channel);
        aggregate.chats.insert(chat.id.clone(), chat);
    }
    aggregate
        .find_by_session_mut(session_id, user_id, channel)
        .expect("chat was just inserted")
}

/// Resolution order per spec §4.1 step 2 / §4.7: chat-meta override → global
/// `active_llm` → demo default.
pub fn resolve_model(chat: &Chat, settings: &SettingsAggregate) -> ResolvedModel {
    if let Some(ActiveLlmOverride { provider_id, model, .. }) = chat.active_llm_override() {
        return ResolvedModel { provider_id, model };
    }
    if let Some(active) = &settings.active_llm {
        return ResolvedModel {
            provider_id: active.provider_id.clone(),
            model: active.model.clone(),
        };
    }
    ResolvedModel::demo()
}

/// `/new`: trims to the special command, clears history, keeps the chat
/// (spec §4.1 "Special command").
pub fn is_new_command(latest_user_text: &str) -> bool {
    latest_user_text.trim() == "/new"
}

/// SelfOps bootstrap (spec §4.7): create-if-absent only. The caller drives
/// one turn against the returned chat id with the first message as input —
/// `Engine::run_turn` appends it to history itself, so bootstrapping must not
/// append it a second time.
pub async fn bootstrap_self_session(
    deps: &Dependencies,
    session_id: &str,
    user_id: &str,
    channel: &str,
) -> Result<String> {
    deps.chats
        .write(|agg| {
            let chat = resolve_or_create_chat(agg, session_id, user_id, channel);
            Ok(chat.id.clone())
        })
        .await
}

/// Applies a per-chat model override (`PUT /agent/self/sessions/{id}/model`).
pub async fn set_session_model(
    deps: &Dependencies,
    session_id: &str,
    user_id: &str,
    channel: &str,
    provider_id: String,
    model: String,
) -> Result<()> {
    deps.chats
        .write(|agg| {
            let chat = resolve_or_create_chat(agg, session_id, user_id, channel);
            chat.set_active_llm_override(provider_id, model);
            Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::settings::ActiveLlm;

    #[test]
    fn is_new_command_ignores_surrounding_whitespace() {
        assert!(is_new_command("  /new  "));
        assert!(!is_new_command("/new please"));
    }

    #[test]
    fn resolve_model_prefers_chat_override_over_global_active() {
        let mut chat = Chat::new("c1", "s1", "u1", "console");
        chat.set_active_llm_override("anthropic".to_string(), "claude".to_string());
        let mut settings = SettingsAggregate::default();
        settings.active_llm = Some(ActiveLlm {
            provider_id: "openai".to_string(),
            model: "gpt".to_string(),
        });
        let resolved = resolve_model(&chat, &settings);
        assert_eq!(resolved.provider_id, "anthropic");
    }

    #[test]
    fn resolve_model_falls_back_to_demo_default() {
        let chat = Chat::new("c1", "s1", "u1", "console");
        let settings = SettingsAggregate::default();
        let resolved = resolve_model(&chat, &settings);
        assert_eq!(resolved.provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(resolved.model, DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn bootstrap_creates_chat_without_appending() {
        let dir = tempfile::tempdir().unwrap();
        let deps = Dependencies::open_temp(dir.path());
        let chat_id = bootstrap_self_session(&deps, "s1", "u1", "console").await.unwrap();
        let history_len = deps
            .chats
            .read(|agg| agg.chats.get(&chat_id).map(|c| c.history.len()).unwrap_or(0))
            .await;
        assert_eq!(history_len, 0, "run_turn appends the first message, bootstrap must not");
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent_for_same_session_triple() {
        let dir = tempfile::tempdir().unwrap();
        let deps = Dependencies::open_temp(dir.path());
        let first = bootstrap_self_session(&deps, "s1", "u1", "console").await.unwrap();
        let second = bootstrap_self_session(&deps, "s1", "u1", "console").await.unwrap();
        assert_eq!(first, second);
    }
}
