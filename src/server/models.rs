//! `/models/*` routes (spec §6, §4.6): provider configuration CRUD plus the
//! active-llm pointer, backed by `SettingsAggregate` and the read-only
//! provider adapter registry built at startup.

use super::ServerState;
use crate::errors::{GatewayError, GatewayResult};
use crate::registry::providers::ProviderCapabilities;
use crate::state::settings::{ActiveLlm, ProviderSetting, SettingsAggregate};
use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct ConfiguredProvider {
    provider_id: String,
    setting: ProviderSetting,
}

pub async fn list_models(State(state): State<Arc<ServerState>>) -> Json<Vec<ConfiguredProvider>> {
    let providers = state
        .deps
        .settings
        .read(|agg: &SettingsAggregate| {
            let mut providers: Vec<ConfiguredProvider> = agg
                .providers
                .iter()
                .map(|(provider_id, setting)| ConfiguredProvider { provider_id: provider_id.clone(), setting: setting.clone() })
                .collect();
            providers.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
            providers
        })
        .await;
    Json(providers)
}

#[derive(Serialize)]
struct CatalogEntry {
    provider_id: String,
    capabilities: ProviderCapabilities,
}

/// `GET /models/catalog`. The adapters the registry knows how to talk to,
/// independent of whether any are configured — a provider can appear here
/// and be absent from `/models` if no credentials have been set yet.
pub async fn catalog(State(state): State<Arc<ServerState>>) -> Json<Vec<CatalogEntry>> {
    let mut entries: Vec<CatalogEntry> = state
        .registries
        .providers
        .keys()
        .filter_map(|provider_id| {
            crate::registry::providers::resolve(&state.registries.providers, provider_id)
                .ok()
                .map(|adapter| CatalogEntry { provider_id: provider_id.clone(), capabilities: adapter.capabilities() })
        })
        .collect();
    entries.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
    Json(entries)
}

pub async fn set_provider_config(
    State(state): State<Arc<ServerState>>,
    Path(provider_id): Path<String>,
    Json(setting): Json<ProviderSetting>,
) -> GatewayResult<Json<ProviderSetting>> {
    state
        .deps
        .settings
        .write(|agg| {
            agg.set_provider(&provider_id, setting.clone());
            Ok(())
        })
        .await
        .map_err(GatewayError::Internal)?;
    Ok(Json(setting))
}

pub async fn remove_provider(State(state): State<Arc<ServerState>>, Path(provider_id): Path<String>) -> GatewayResult<Json<serde_json::Value>> {
    let removed = state
        .deps
        .settings
        .write(|agg| Ok(agg.remove_provider(&provider_id).is_some()))
        .await
        .map_err(GatewayError::Internal)?;
    if !removed {
        return Err(GatewayError::ModelNotFound(provider_id));
    }
    Ok(Json(serde_json::json!({ "removed": provider_id })))
}

pub async fn get_active(State(state): State<Arc<ServerState>>) -> Json<Option<ActiveLlm>> {
    Json(state.deps.settings.read(|agg| agg.active_llm.clone()).await)
}

#[derive(serde::Deserialize)]
pub struct SetActiveRequest {
    pub provider_id: String,
    pub model: String,
}

pub async fn set_active(State(state): State<Arc<ServerState>>, Json(body): Json<SetActiveRequest>) -> GatewayResult<Json<ActiveLlm>> {
    let provider_id = SettingsAggregate::normalize_id(&body.provider_id);
    let active = state
        .deps
        .settings
        .write(|agg| {
            if !agg.providers.contains_key(&provider_id) {
                return Ok(Err(GatewayError::ModelNotFound(provider_id.clone())));
            }
            let active = ActiveLlm { provider_id: provider_id.clone(), model: body.model.clone() };
            agg.active_llm = Some(active.clone());
            Ok(Ok(active))
        })
        .await
        .map_err(GatewayError::Internal)??;
    Ok(Json(active))
}
