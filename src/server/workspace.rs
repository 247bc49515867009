//! `/workspace/*` routes (spec §6): a general-purpose file surface over
//! `WorkspaceStore`. Unlike the mutation engine's `workspace_file` target
//! (spec §4.4), these routes do not enforce the prompts/docs whitelist —
//! that restriction is specific to config mutations, not to file access.

use super::ServerState;
use crate::errors::{GatewayError, GatewayResult};
use crate::state::workspace::WorkspaceStore;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;

fn normalized(raw: &str) -> GatewayResult<String> {
    WorkspaceStore::normalize_path(raw).map_err(|e| GatewayError::InvalidRequest(e.to_string()))
}

pub async fn read_file(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> GatewayResult<String> {
    let normalized = normalized(&path)?;
    state.deps.workspace.read(&normalized).await.map_err(GatewayError::Internal)
}

#[derive(Debug, Deserialize)]
pub struct WriteFileRequest {
    pub content: String,
}

pub async fn write_file(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    Json(body): Json<WriteFileRequest>,
) -> GatewayResult<Json<JsonValue>> {
    let normalized = normalized(&path)?;
    state.deps.workspace.write(&normalized, &body.content).await.map_err(GatewayError::Internal)?;
    Ok(Json(serde_json::json!({ "path": normalized })))
}

pub async fn delete_file(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> GatewayResult<Json<JsonValue>> {
    let normalized = normalized(&path)?;
    state.deps.workspace.delete(&normalized).await.map_err(GatewayError::Internal)?;
    Ok(Json(serde_json::json!({ "deleted": normalized })))
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub path: String,
    pub content: String,
}

pub async fn upload(State(state): State<Arc<ServerState>>, Json(body): Json<UploadRequest>) -> GatewayResult<Json<JsonValue>> {
    let normalized = normalized(&body.path)?;
    state.deps.workspace.write(&normalized, &body.content).await.map_err(GatewayError::Internal)?;
    Ok(Json(serde_json::json!({ "path": normalized })))
}

#[derive(Serialize)]
struct ExportBundle {
    files: HashMap<String, String>,
}

/// Walks the whole workspace tree and returns every readable text file as a
/// `path -> content` map. Runs on the blocking pool since it's a plain
/// synchronous directory walk, not an async-native operation.
pub async fn export(State(state): State<Arc<ServerState>>) -> GatewayResult<Json<ExportBundle>> {
    let root = state.deps.workspace.root().to_path_buf();
    let files = tokio::task::spawn_blocking(move || walk_text_files(&root, &root))
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?
        .map_err(GatewayError::Internal)?;
    Ok(Json(ExportBundle { files }))
}

fn walk_text_files(root: &StdPath, dir: &StdPath) -> anyhow::Result<HashMap<String, String>> {
    let mut files = HashMap::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            files.extend(walk_text_files(root, &path)?);
        } else if let Ok(content) = std::fs::read_to_string(&path) {
            let relative = path.strip_prefix(root)?.to_string_lossy().replace('\\', "/");
            files.insert(relative, content);
        }
    }
    Ok(files)
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub files: HashMap<String, String>,
}

pub async fn import(State(state): State<Arc<ServerState>>, Json(body): Json<ImportRequest>) -> GatewayResult<Json<JsonValue>> {
    let mut imported = Vec::new();
    for (path, content) in body.files {
        let normalized = normalized(&path)?;
        state.deps.workspace.write(&normalized, &content).await.map_err(GatewayError::Internal)?;
        imported.push(normalized);
    }
    Ok(Json(serde_json::json!({ "imported": imported })))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub path: String,
}

/// `GET /workspace/download?path=...`. Same content as `read_file` but with
/// `Content-Disposition: attachment` so browser clients save it directly.
pub async fn download(State(state): State<Arc<ServerState>>, Query(query): Query<DownloadQuery>) -> GatewayResult<Response> {
    let normalized = normalized(&query.path)?;
    let content = state.deps.workspace.read(&normalized).await.map_err(GatewayError::Internal)?;
    let filename = PathBuf::from(&normalized)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| normalized.clone());
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\""))
        .body(axum::body::Body::from(Bytes::from(content)))
        .expect("static download response headers are valid")
        .into_response())
}
