//! HTTP + SSE surface (spec §6). Grounded in the teacher's flat
//! `Router::new().route(...)` assembly and `Arc<ServerState>` injection
//! (`server/mod.rs` in the teacher), regrounded from a single
//! `AgentManager` collaborator onto this gateway's
//! `Dependencies`/`Registries`/`Engine`/`MutationStore` quartet. Unlike the
//! teacher, there is no embedded UI to serve — every route here answers
//! JSON or SSE directly, no `static_handler`/`RustEmbed` fallback.

mod agent;
mod chats;
mod cron;
mod meta;
mod models;
mod workspace;

use crate::config::Config;
use crate::cron::ConcurrencySlots;
use crate::engine::Engine;
use crate::mutation::MutationStore;
use crate::registry::Registries;
use crate::state::Dependencies;
use axum::routing::{delete, get, post, put};
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared dependency bundle handed to every handler via `State` (spec §9
/// "Global mutable state": never a static, always injected).
pub struct ServerState {
    pub deps: Arc<Dependencies>,
    pub registries: Arc<Registries>,
    pub engine: Arc<Engine>,
    pub mutation_store: Arc<MutationStore>,
    pub cron_slots: Arc<ConcurrencySlots>,
    pub config: Config,
    pub started_at: DateTime<Utc>,
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/agent/process", post(agent::process))
        .route("/agent/system-layers", get(agent::system_layers))
        .route("/agent/plan/toggle", post(agent::plan_toggle))
        .route("/agent/plan/compile", post(agent::plan_compile))
        .route("/agent/plan/clarify/answer", post(agent::plan_clarify_answer))
        .route("/agent/plan/revise", post(agent::plan_revise))
        .route("/agent/plan/execute", post(agent::plan_execute))
        .route("/agent/plan/{chat_id}", get(agent::plan_get))
        .route("/agent/tool-input-answer", post(agent::tool_input_answer))
        .route("/agent/self/sessions/bootstrap", post(agent::bootstrap_session))
        .route("/agent/self/sessions/{session_id}/model", put(agent::set_session_model))
        .route("/agent/self/config-mutations/preview", post(agent::config_mutation_preview))
        .route("/agent/self/config-mutations/apply", post(agent::config_mutation_apply))
        .route("/chats", get(chats::list_chats))
        .route("/chats", post(chats::create_chat))
        .route("/chats/{chat_id}", get(chats::get_chat))
        .route("/chats/{chat_id}", delete(chats::delete_chat))
        .route("/chats/batch-delete", post(chats::batch_delete))
        .route("/cron/jobs", get(cron::list_jobs))
        .route("/cron/jobs", post(cron::create_job))
        .route("/cron/jobs/{job_id}", get(cron::get_job))
        .route("/cron/jobs/{job_id}", put(cron::update_job))
        .route("/cron/jobs/{job_id}", delete(cron::delete_job))
        .route("/cron/jobs/{job_id}/pause", post(cron::pause_job))
        .route("/cron/jobs/{job_id}/resume", post(cron::resume_job))
        .route("/cron/jobs/{job_id}/run", post(cron::run_job))
        .route("/cron/jobs/{job_id}/state", get(cron::job_state))
        .route("/models", get(models::list_models))
        .route("/models/catalog", get(models::catalog))
        .route("/models/{provider_id}/config", put(models::set_provider_config))
        .route("/models/{provider_id}", delete(models::remove_provider))
        .route("/models/active", get(models::get_active))
        .route("/models/active", put(models::set_active))
        .route("/workspace/files/{*path}", get(workspace::read_file))
        .route("/workspace/files/{*path}", put(workspace::write_file))
        .route("/workspace/files/{*path}", delete(workspace::delete_file))
        .route("/workspace/uploads", post(workspace::upload))
        .route("/workspace/export", get(workspace::export))
        .route("/workspace/import", post(workspace::import))
        .route("/workspace/download", get(workspace::download))
        .route("/version", get(meta::version))
        .route("/healthz", get(meta::healthz))
        .route("/runtime-config", get(meta::runtime_config))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
