//! `/version`, `/healthz`, `/runtime-config` (spec §6 "Operational routes").

use super::ServerState;
use axum::extract::State;
use axum::Json;
use serde_json::Value as JsonValue;
use std::sync::Arc;

pub async fn version() -> Json<JsonValue> {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn healthz() -> Json<JsonValue> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Mirrors the running `Config`, minus secrets (`api_key`, search provider
/// keys) — a client-facing introspection endpoint, not a credentials API.
pub async fn runtime_config(State(state): State<Arc<ServerState>>) -> Json<JsonValue> {
    let config = &state.config;
    Json(serde_json::json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "data_dir": config.server.data_dir,
        },
        "http": config.http,
        "disabled_tools": config.disabled_tools,
        "features": config.features,
        "started_at": state.started_at,
    }))
}
