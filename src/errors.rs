//! Gateway-wide error taxonomy (spec §7). One variant per user-visible `code`;
//! `IntoResponse` renders the `{error:{code,message,details}}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid cron task_type")]
    InvalidCronTaskType,
    #[error("invalid cron workflow: {0}")]
    InvalidCronWorkflow(String),
    #[error("invalid plan spec: {0}")]
    InvalidPlanSpec(String),
    #[error("default chat is protected")]
    DefaultChatProtected,
    #[error("default cron job is protected")]
    DefaultCronProtected,

    #[error("chat not found: {0}")]
    ChatNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("cron job not found: {0}")]
    CronJobNotFound(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("provider disabled: {0}")]
    ProviderDisabled(String),
    #[error("invalid session model: {0}")]
    SessionModelInvalid(String),

    #[error("cron max concurrency reached for job {0}")]
    CronMaxConcurrencyReached(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("tool disabled: {0}")]
    ToolDisabled(String),
    #[error("tool forbidden path: {0}")]
    ToolForbiddenPath(String),
    #[error("tool conflict: {0}")]
    ToolConflict(String),
    #[error("tool produced a non-serializable result: {0}")]
    ToolInvalidResult(String),
    #[error("tool error: {0}")]
    ToolError(String),

    #[error("provider request failed: {0}")]
    ProviderRequestFailed(String),
    #[error("provider does not support this operation: {0}")]
    ProviderNotSupported(String),

    #[error("mutation record not found")]
    MutationNotFound,
    #[error("mutation record expired")]
    MutationExpired,
    #[error("confirm_hash mismatch")]
    MutationHashMismatch,
    #[error("mutation touches sensitive fields without allow_sensitive")]
    MutationSensitiveDenied,
    #[error("mutation touches a path outside the whitelist")]
    MutationPathDenied,
    #[error("mutation target changed since preview")]
    MutationApplyConflict,

    #[error("chat is not in planning_clarify state")]
    PlanNotInClarify,
    #[error("chat is not in planning_ready state")]
    PlanNotReady,
    #[error("plan revision requires feedback text")]
    PlanFeedbackRequired,
    #[error("disabling plan mode requires confirm=true")]
    PlanToggleConfirmationRequired,

    #[error("channel not supported: {0}")]
    ChannelNotSupported(String),
    #[error("channel disabled: {0}")]
    ChannelDisabled(String),
    #[error("channel dispatch failed: {0}")]
    ChannelDispatchFailed(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        use GatewayError::*;
        match self {
            Unauthorized => "unauthorized",
            InvalidRequest(_) => "invalid_request",
            InvalidCronTaskType => "invalid_cron_task_type",
            InvalidCronWorkflow(_) => "invalid_cron_workflow",
            InvalidPlanSpec(_) => "invalid_plan_spec",
            DefaultChatProtected => "default_chat_protected",
            DefaultCronProtected => "default_cron_protected",
            ChatNotFound(_) => "chat_not_found",
            SessionNotFound(_) => "session_not_found",
            CronJobNotFound(_) => "cron_job_not_found",
            ModelNotFound(_) => "model_not_found",
            ProviderDisabled(_) => "provider_disabled",
            SessionModelInvalid(_) => "session_model_invalid",
            CronMaxConcurrencyReached(_) => "cron_max_concurrency_reached",
            ToolNotFound(_) => "tool_not_found",
            ToolDisabled(_) => "tool_disabled",
            ToolForbiddenPath(_) => "tool_forbidden_path",
            ToolConflict(_) => "tool_conflict",
            ToolInvalidResult(_) => "tool_invalid_result",
            ToolError(_) => "tool_error",
            ProviderRequestFailed(_) => "provider_request_failed",
            ProviderNotSupported(_) => "provider_not_supported",
            MutationNotFound => "mutation_not_found",
            MutationExpired => "mutation_expired",
            MutationHashMismatch => "mutation_hash_mismatch",
            MutationSensitiveDenied => "mutation_sensitive_denied",
            MutationPathDenied => "mutation_path_denied",
            MutationApplyConflict => "mutation_apply_conflict",
            PlanNotInClarify => "plan_not_in_clarify",
            PlanNotReady => "plan_not_ready",
            PlanFeedbackRequired => "plan_feedback_required",
            PlanToggleConfirmationRequired => "plan_toggle_confirmation_required",
            ChannelNotSupported(_) => "channel_not_supported",
            ChannelDisabled(_) => "channel_disabled",
            ChannelDispatchFailed(_) => "channel_dispatch_failed",
            Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        use GatewayError::*;
        match self {
            Unauthorized => StatusCode::UNAUTHORIZED,
            InvalidRequest(_) | InvalidCronTaskType | InvalidCronWorkflow(_)
            | InvalidPlanSpec(_) | DefaultChatProtected | DefaultCronProtected
            | SessionModelInvalid(_) => StatusCode::BAD_REQUEST,
            ChatNotFound(_) | SessionNotFound(_) | CronJobNotFound(_) | ModelNotFound(_)
            | MutationNotFound => StatusCode::NOT_FOUND,
            ToolDisabled(_) | ToolForbiddenPath(_) | ProviderDisabled(_)
            | PlanToggleConfirmationRequired | ChannelDisabled(_) => StatusCode::FORBIDDEN,
            ToolConflict(_) | MutationApplyConflict | MutationHashMismatch
            | MutationExpired | MutationSensitiveDenied | MutationPathDenied => {
                StatusCode::CONFLICT
            }
            CronMaxConcurrencyReached(_) => StatusCode::CONFLICT,
            ToolNotFound(_) => StatusCode::NOT_FOUND,
            ToolInvalidResult(_) | ToolError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProviderRequestFailed(_) | ChannelDispatchFailed(_) => StatusCode::BAD_GATEWAY,
            ProviderNotSupported(_) | ChannelNotSupported(_) => StatusCode::BAD_REQUEST,
            PlanNotInClarify | PlanNotReady | PlanFeedbackRequired => StatusCode::CONFLICT,
            Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn details(&self) -> Option<JsonValue> {
        None
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorPayload,
}

#[derive(Serialize)]
struct ErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<JsonValue>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if matches!(self, GatewayError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }
        let body = ErrorBody {
            error: ErrorPayload {
                code: self.code(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
