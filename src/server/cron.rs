//! `/cron/jobs/*` routes (spec §6): CRUD plus manual run/pause/resume over
//! the cron aggregate. The default job (`DEFAULT_CRON_JOB_ID`) is protected
//! from deletion the same way the default chat is protected in
//! `server::chats`.

use super::ServerState;
use crate::errors::{GatewayError, GatewayResult};
use crate::state::cron::{CronJobEntry, CronJobSpec, CronJobState, TaskType};
use axum::extract::{Path, State};
use axum::Json;
use serde_json::Value as JsonValue;
use std::sync::Arc;

pub async fn list_jobs(State(state): State<Arc<ServerState>>) -> Json<Vec<CronJobEntry>> {
    let jobs = state
        .deps
        .cron
        .read(|agg| {
            let mut jobs: Vec<CronJobEntry> = agg.jobs.values().cloned().collect();
            for entry in &mut jobs {
                entry.state.normalize();
            }
            jobs.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
            jobs
        })
        .await;
    Json(jobs)
}

/// Validates that a workflow-typed job spec actually compiles to a plan
/// (topological sort succeeds, node types resolve) before it is persisted.
fn validate_spec(spec: &CronJobSpec, node_handlers: &crate::registry::node_handlers::NodeHandlerRegistry) -> GatewayResult<()> {
    if spec.task_type == TaskType::Workflow {
        let workflow = spec.workflow.as_ref().ok_or(GatewayError::InvalidCronTaskType)?;
        crate::workflow::build_plan(workflow, node_handlers)?;
    }
    Ok(())
}

pub async fn create_job(State(state): State<Arc<ServerState>>, Json(mut spec): Json<CronJobSpec>) -> GatewayResult<Json<CronJobEntry>> {
    validate_spec(&spec, &state.registries.node_handlers)?;
    if spec.id.trim().is_empty() {
        spec.id = uuid::Uuid::new_v4().to_string();
    }
    let entry = state
        .deps
        .cron
        .write(|agg| {
            let entry = CronJobEntry { spec: spec.clone(), state: CronJobState::default() };
            agg.jobs.insert(spec.id.clone(), entry.clone());
            Ok(entry)
        })
        .await
        .map_err(GatewayError::Internal)?;
    Ok(Json(entry))
}

pub async fn get_job(State(state): State<Arc<ServerState>>, Path(job_id): Path<String>) -> GatewayResult<Json<CronJobEntry>> {
    state
        .deps
        .cron
        .read(|agg| {
            agg.jobs.get(&job_id).cloned().map(|mut entry| {
                entry.state.normalize();
                entry
            })
        })
        .await
        .ok_or_else(|| GatewayError::CronJobNotFound(job_id.clone()))
        .map(Json)
}

pub async fn update_job(
    State(state): State<Arc<ServerState>>,
    Path(job_id): Path<String>,
    Json(mut spec): Json<CronJobSpec>,
) -> GatewayResult<Json<CronJobEntry>> {
    validate_spec(&spec, &state.registries.node_handlers)?;
    spec.id = job_id.clone();
    let mut entry = state
        .deps
        .cron
        .write(|agg| {
            let entry = match agg.jobs.get_mut(&job_id) {
                Some(entry) => entry,
                None => return Ok(Err(GatewayError::CronJobNotFound(job_id.clone()))),
            };
            entry.spec = spec.clone();
            Ok(Ok(entry.clone()))
        })
        .await
        .map_err(GatewayError::Internal)??;
    entry.state.normalize();
    Ok(Json(entry))
}

pub async fn delete_job(State(state): State<Arc<ServerState>>, Path(job_id): Path<String>) -> GatewayResult<Json<JsonValue>> {
    state
        .deps
        .cron
        .write(|agg| {
            let entry = match agg.jobs.get(&job_id) {
                Some(entry) => entry,
                None => return Ok(Err(GatewayError::CronJobNotFound(job_id.clone()))),
            };
            if entry.spec.is_protected() {
                return Ok(Err(GatewayError::DefaultCronProtected));
            }
            agg.jobs.remove(&job_id);
            Ok(Ok(()))
        })
        .await
        .map_err(GatewayError::Internal)??;
    Ok(Json(serde_json::json!({ "deleted": job_id })))
}

pub async fn pause_job(State(state): State<Arc<ServerState>>, Path(job_id): Path<String>) -> GatewayResult<Json<CronJobEntry>> {
    set_paused(&state, job_id, true).await
}

pub async fn resume_job(State(state): State<Arc<ServerState>>, Path(job_id): Path<String>) -> GatewayResult<Json<CronJobEntry>> {
    set_paused(&state, job_id, false).await
}

async fn set_paused(state: &Arc<ServerState>, job_id: String, paused: bool) -> GatewayResult<Json<CronJobEntry>> {
    let mut entry = state
        .deps
        .cron
        .write(|agg| {
            let entry = match agg.jobs.get_mut(&job_id) {
                Some(entry) => entry,
                None => return Ok(Err(GatewayError::CronJobNotFound(job_id.clone()))),
            };
            entry.state.paused = paused;
            Ok(Ok(entry.clone()))
        })
        .await
        .map_err(GatewayError::Internal)??;
    entry.state.normalize();
    Ok(Json(entry))
}

/// `POST /cron/jobs/{job_id}/run`. Runs the job immediately through the same
/// `execute_job` path the tick loop uses, regardless of its schedule/pause
/// state (spec §4.2 "manual run bypasses schedule, not concurrency limits").
pub async fn run_job(State(state): State<Arc<ServerState>>, Path(job_id): Path<String>) -> GatewayResult<Json<JsonValue>> {
    crate::cron::execute_job(&state.deps, &state.registries.channels, &state.registries.node_handlers, &state.cron_slots, &job_id).await?;
    Ok(Json(serde_json::json!({ "executed": job_id })))
}

pub async fn job_state(State(state): State<Arc<ServerState>>, Path(job_id): Path<String>) -> GatewayResult<Json<CronJobState>> {
    state
        .deps
        .cron
        .read(|agg| {
            agg.jobs.get(&job_id).map(|entry| {
                let mut s = entry.state.clone();
                s.normalize();
                s
            })
        })
        .await
        .ok_or_else(|| GatewayError::CronJobNotFound(job_id.clone()))
        .map(Json)
}
