//! `/agent/*` routes (spec §6): the turn engine, plan-mode FSM, SelfOps
//! session bootstrap, and the two-phase config-mutation engine. The
//! streaming path (`stream: true`) is the one deliberate departure from the
//! teacher's `events_handler`/`broadcast::Sender` shape, noted in
//! `crate::engine`'s module doc.

use super::ServerState;
use crate::engine::events::{to_sse_data, TurnEvent, SSE_DONE};
use crate::engine::{self, ProcessRequest};
use crate::errors::{GatewayError, GatewayResult};
use crate::mutation::{ApplyRequest, ApplyResponse, PreviewRequest, PreviewResponse};
use crate::plan::{self, CompileRequest};
use crate::state::chats::MessageRole;
use crate::state::plan::PlanTask;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

fn default_channel() -> String {
    "console".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ProcessRequestBody {
    pub input: Vec<String>,
    pub session_id: String,
    pub user_id: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

#[derive(Serialize)]
struct ProcessResponseBody {
    reply: String,
    events: Vec<TurnEvent>,
}

/// `POST /agent/process`. Non-streaming requests run to completion and
/// return the full transcript; `stream: true` switches to the SSE contract
/// (spec §6: `data: {json}\n\n` frames ending with `data: [DONE]`).
pub async fn process(State(state): State<Arc<ServerState>>, Json(body): Json<ProcessRequestBody>) -> Response {
    let req = ProcessRequest {
        input: body.input,
        session_id: body.session_id,
        user_id: body.user_id,
        channel: body.channel,
        stream: body.stream,
        max_turns: body.max_turns,
    };

    if !req.stream {
        return match state.engine.run_turn(req, CancellationToken::new(), None).await {
            Ok(outcome) => Json(ProcessResponseBody { reply: outcome.reply, events: outcome.events }).into_response(),
            Err(err) => err.into_response(),
        };
    }

    stream_process(state, req).await
}

/// Drives one turn through a per-request `mpsc` channel and relays every
/// [`TurnEvent`] onto the HTTP body as it is produced. A `CancellationToken`
/// dropped with the body (client disconnect) stops the turn in flight.
async fn stream_process(state: Arc<ServerState>, req: ProcessRequest) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    let cancel = CancellationToken::new();

    tokio::spawn(run_stream_producer(Arc::clone(&state.engine), req, tx, cancel.clone()));

    struct CancelOnDrop(CancellationToken);
    impl Drop for CancelOnDrop {
        fn drop(&mut self) {
            self.0.cancel();
        }
    }
    let guard = CancelOnDrop(cancel);

    let stream = UnboundedReceiverStream::new(rx).map(move |chunk| {
        let _keep_alive = &guard;
        Ok::<_, Infallible>(chunk)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .expect("static SSE response headers are valid")
}

async fn run_stream_producer(
    engine: Arc<engine::Engine>,
    req: ProcessRequest,
    tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
) {
    let mut retries = 0u32;
    loop {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TurnEvent>();
        let mut any_emitted = false;

        let engine_task = Arc::clone(&engine);
        let req_task = req.clone();
        let cancel_task = cancel.clone();
        let handle = tokio::spawn(async move { engine_task.run_turn(req_task, cancel_task, Some(event_tx)).await });

        while let Some(event) = event_rx.recv().await {
            any_emitted = true;
            if tx.send(Bytes::from(to_sse_data(&event))).is_err() {
                cancel.cancel();
                handle.abort();
                return;
            }
        }

        match handle.await {
            Ok(Ok(_outcome)) => {
                let _ = tx.send(Bytes::from(SSE_DONE));
                return;
            }
            Ok(Err(err)) => {
                if !any_emitted && retries < engine::SSE_MAX_RETRIES && engine::is_retryable_network_error(&err.to_string()) {
                    retries += 1;
                    tokio::time::sleep(Duration::from_secs(engine::SSE_RETRY_WAIT_SECS)).await;
                    continue;
                }
                let error_event = TurnEvent::Error { code: err.code().to_string(), message: err.to_string() };
                let _ = tx.send(Bytes::from(to_sse_data(&error_event)));
                let _ = tx.send(Bytes::from(SSE_DONE));
                return;
            }
            Err(_join_error) => return,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SystemLayersQuery {
    pub chat_id: Option<String>,
}

/// `GET /agent/system-layers`. Assembles the same layer stack a turn would
/// see, without running one — useful for introspection/debugging clients.
pub async fn system_layers(State(state): State<Arc<ServerState>>, Query(query): Query<SystemLayersQuery>) -> GatewayResult<Json<JsonValue>> {
    let plan_mode_enabled = match &query.chat_id {
        Some(chat_id) => {
            state
                .deps
                .chats
                .read(|agg| agg.chats.get(chat_id).map(|c| !c.plan_mode_state().is_off()).unwrap_or(false))
                .await
        }
        None => false,
    };

    let layers = crate::engine::prompt_layers::assemble(&state.registries.prompt_sources, plan_mode_enabled, "", "")
        .await
        .map_err(GatewayError::Internal)?;
    let total = crate::engine::prompt_layers::total_estimated_tokens(&layers);
    Ok(Json(serde_json::json!({ "layers": layers, "total_estimated_tokens": total })))
}

#[derive(Debug, Deserialize)]
pub struct PlanToggleRequest {
    pub chat_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub confirm: bool,
}

pub async fn plan_toggle(State(state): State<Arc<ServerState>>, Json(body): Json<PlanToggleRequest>) -> GatewayResult<Json<JsonValue>> {
    let new_state = plan::toggle(&state.deps, &body.chat_id, body.enabled, body.confirm).await?;
    Ok(Json(serde_json::json!({ "state": new_state })))
}

#[derive(Debug, Deserialize, Default)]
pub struct PlanCompileRequestBody {
    pub chat_id: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub scope_in: Vec<String>,
    #[serde(default)]
    pub scope_out: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

pub async fn plan_compile(State(state): State<Arc<ServerState>>, Json(body): Json<PlanCompileRequestBody>) -> GatewayResult<Json<JsonValue>> {
    let req = CompileRequest {
        goal: body.goal,
        scope_in: body.scope_in,
        scope_out: body.scope_out,
        constraints: body.constraints,
        tasks: body.tasks,
        acceptance_criteria: body.acceptance_criteria,
        risks: body.risks,
    };
    let outcome = plan::compile(&state.deps, &body.chat_id, req).await?;
    Ok(Json(serde_json::json!({
        "state": outcome.state,
        "pending_questions": outcome.pending_questions,
        "plan_spec": outcome.plan_spec,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PlanClarifyAnswerRequest {
    pub chat_id: String,
    pub answers: Vec<String>,
}

pub async fn plan_clarify_answer(State(state): State<Arc<ServerState>>, Json(body): Json<PlanClarifyAnswerRequest>) -> GatewayResult<Json<JsonValue>> {
    let outcome = plan::clarify_answer(&state.deps, &body.chat_id, body.answers).await?;
    Ok(Json(serde_json::json!({
        "state": outcome.state,
        "pending_questions": outcome.pending_questions,
        "clarify_asked_count": outcome.clarify_asked_count,
        "plan_spec": outcome.plan_spec,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PlanReviseRequest {
    pub chat_id: String,
    pub feedback: String,
}

pub async fn plan_revise(State(state): State<Arc<ServerState>>, Json(body): Json<PlanReviseRequest>) -> GatewayResult<Json<JsonValue>> {
    let plan_spec = plan::revise(&state.deps, &body.chat_id, &body.feedback).await?;
    Ok(Json(serde_json::json!({ "plan_spec": plan_spec })))
}

#[derive(Debug, Deserialize)]
pub struct PlanExecuteRequest {
    pub chat_id: String,
}

pub async fn plan_execute(State(state): State<Arc<ServerState>>, Json(body): Json<PlanExecuteRequest>) -> GatewayResult<Json<JsonValue>> {
    let outcome = plan::execute(&state.deps, &body.chat_id).await?;
    Ok(Json(serde_json::json!({
        "execution_session_id": outcome.execution_session_id,
        "execution_chat_id": outcome.execution_chat_id,
    })))
}

pub async fn plan_get(State(state): State<Arc<ServerState>>, Path(chat_id): Path<String>) -> GatewayResult<Json<JsonValue>> {
    state
        .deps
        .chats
        .read(|agg| {
            let chat = agg.chats.get(&chat_id).ok_or_else(|| GatewayError::ChatNotFound(chat_id.clone()))?;
            Ok(Json(serde_json::json!({
                "state": chat.plan_mode_state(),
                "pending_questions": chat.plan_pending_questions(),
                "clarify_asked_count": chat.clarify_asked_count(),
                "plan_spec": chat.plan_spec(),
            })))
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct ToolInputAnswerRequest {
    pub chat_id: String,
    pub tool_call_id: String,
    pub answer: String,
}

/// `POST /agent/tool-input-answer`. Records a human-supplied answer as a
/// `tool`-role history entry keyed by the originating `tool_call_id`, so the
/// next turn can pick it back up from history the same way any other tool
/// result is read.
pub async fn tool_input_answer(State(state): State<Arc<ServerState>>, Json(body): Json<ToolInputAnswerRequest>) -> GatewayResult<Json<JsonValue>> {
    state
        .deps
        .chats
        .write(|agg| {
            let chat = match agg.chats.get_mut(&body.chat_id) {
                Some(chat) => chat,
                None => return Ok(Err(GatewayError::ChatNotFound(body.chat_id.clone()))),
            };
            chat.append(MessageRole::Tool, body.answer.clone(), None, Some(body.tool_call_id.clone()));
            Ok(Ok(()))
        })
        .await
        .map_err(GatewayError::Internal)??;
    Ok(Json(serde_json::json!({ "accepted": true })))
}

#[derive(Debug, Deserialize)]
pub struct BootstrapSessionRequest {
    pub session_id: String,
    pub user_id: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub first_message: String,
}

/// `POST /agent/self/sessions/bootstrap` (spec §4.7): a single round-trip
/// replacement for "create chat, append message, process" — atomically
/// resolves the chat, drives one turn with `first_message` as input, and
/// reports the model the turn actually ran against.
pub async fn bootstrap_session(State(state): State<Arc<ServerState>>, Json(body): Json<BootstrapSessionRequest>) -> GatewayResult<Json<JsonValue>> {
    let chat_id = crate::engine::session::bootstrap_self_session(&state.deps, &body.session_id, &body.user_id, &body.channel)
        .await
        .map_err(GatewayError::Internal)?;

    let req = ProcessRequest {
        input: vec![body.first_message.clone()],
        session_id: body.session_id.clone(),
        user_id: body.user_id.clone(),
        channel: body.channel.clone(),
        stream: false,
        max_turns: None,
    };
    let outcome = state.engine.run_turn(req, CancellationToken::new(), None).await?;

    let settings_snapshot = state.deps.settings.read(|s| s.clone()).await;
    let model = state
        .deps
        .chats
        .read(|agg| {
            agg.chats
                .get(&chat_id)
                .map(|chat| crate::engine::session::resolve_model(chat, &settings_snapshot))
        })
        .await;

    Ok(Json(serde_json::json!({
        "chat_id": chat_id,
        "reply": outcome.reply,
        "events": outcome.events,
        "model": model.map(|m| serde_json::json!({ "provider_id": m.provider_id, "model": m.model })),
    })))
}

#[derive(Debug, Deserialize)]
pub struct SetSessionModelRequest {
    pub user_id: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub provider_id: String,
    pub model: String,
}

pub async fn set_session_model(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(body): Json<SetSessionModelRequest>,
) -> GatewayResult<Json<JsonValue>> {
    crate::engine::session::set_session_model(
        &state.deps,
        &session_id,
        &body.user_id,
        &body.channel,
        body.provider_id.clone(),
        body.model.clone(),
    )
    .await
    .map_err(GatewayError::Internal)?;
    Ok(Json(serde_json::json!({ "provider_id": body.provider_id, "model": body.model })))
}

pub async fn config_mutation_preview(State(state): State<Arc<ServerState>>, Json(body): Json<PreviewRequest>) -> GatewayResult<Json<PreviewResponse>> {
    let response = crate::mutation::preview(&state.deps, &state.mutation_store, body).await?;
    Ok(Json(response))
}

pub async fn config_mutation_apply(State(state): State<Arc<ServerState>>, Json(body): Json<ApplyRequest>) -> GatewayResult<Json<ApplyResponse>> {
    let response = crate::mutation::apply(&state.deps, &state.mutation_store, body).await?;
    Ok(Json(response))
}
