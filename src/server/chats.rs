//! `/chats/*` routes (spec §6): CRUD over the chat aggregate. The default
//! chat (`DEFAULT_CHAT_ID`) is protected from deletion the same way the
//! default cron job is protected in `server::cron`.

use super::ServerState;
use crate::errors::{GatewayError, GatewayResult};
use crate::state::chats::Chat;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;

fn default_channel() -> String {
    "console".to_string()
}

pub async fn list_chats(State(state): State<Arc<ServerState>>) -> Json<Vec<Chat>> {
    let chats = state
        .deps
        .chats
        .read(|agg| {
            let mut chats: Vec<Chat> = agg.chats.values().cloned().collect();
            chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            chats
        })
        .await;
    Json(chats)
}

#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    pub session_id: String,
    pub user_id: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub name: String,
}

pub async fn create_chat(State(state): State<Arc<ServerState>>, Json(body): Json<CreateChatRequest>) -> GatewayResult<Json<Chat>> {
    let chat = state
        .deps
        .chats
        .write(|agg| {
            let id = uuid::Uuid::new_v4().to_string();
            let mut chat = Chat::new(id.clone(), body.session_id.clone(), body.user_id.clone(), body.channel.clone());
            chat.name = body.name.clone();
            agg.chats.insert(id.clone(), chat.clone());
            Ok(chat)
        })
        .await
        .map_err(GatewayError::Internal)?;
    Ok(Json(chat))
}

pub async fn get_chat(State(state): State<Arc<ServerState>>, Path(chat_id): Path<String>) -> GatewayResult<Json<Chat>> {
    state
        .deps
        .chats
        .read(|agg| agg.chats.get(&chat_id).cloned().ok_or_else(|| GatewayError::ChatNotFound(chat_id.clone())))
        .await
        .map(Json)
}

pub async fn delete_chat(State(state): State<Arc<ServerState>>, Path(chat_id): Path<String>) -> GatewayResult<Json<JsonValue>> {
    state
        .deps
        .chats
        .write(|agg| {
            let chat = match agg.chats.get(&chat_id) {
                Some(chat) => chat,
                None => return Ok(Err(GatewayError::ChatNotFound(chat_id.clone()))),
            };
            if chat.is_protected() {
                return Ok(Err(GatewayError::DefaultChatProtected));
            }
            agg.chats.remove(&chat_id);
            Ok(Ok(()))
        })
        .await
        .map_err(GatewayError::Internal)??;
    Ok(Json(serde_json::json!({ "deleted": chat_id })))
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    pub chat_ids: Vec<String>,
}

/// `POST /chats/batch-delete`. Best-effort: protected or missing ids are
/// skipped rather than failing the whole batch (spec §6 batch semantics).
pub async fn batch_delete(State(state): State<Arc<ServerState>>, Json(body): Json<BatchDeleteRequest>) -> GatewayResult<Json<JsonValue>> {
    let deleted = state
        .deps
        .chats
        .write(|agg| {
            let mut deleted = Vec::new();
            for chat_id in &body.chat_ids {
                let protected = agg.chats.get(chat_id).map(|c| c.is_protected()).unwrap_or(true);
                if !protected && agg.chats.remove(chat_id).is_some() {
                    deleted.push(chat_id.clone());
                }
            }
            Ok(deleted)
        })
        .await
        .map_err(GatewayError::Internal)?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
