//! Two-phase mutation engine (spec §4.4): `preview` computes a cryptographically
//! bound diff against the current state without touching it; `apply` re-verifies
//! that binding and the target's optimistic-concurrency hash before writing.
//!
//! Grounded in the teacher's `server::config_api` strip/migrate/validate/apply
//! pipeline for the guard-ordering discipline and in
//! `swedishembedded-sven/crates/sven-tools/src/builtin/edit_file.rs` for
//! `similar`-based diffing. No corpus example applies an RFC-6902-like JSON
//! patch, so the pointer-navigation code below is hand-written against the
//! spec rather than lifted from a reference (see DESIGN.md).

use crate::errors::{GatewayError, GatewayResult};
use crate::state::settings::{ActiveLlm, ProviderSetting};
use crate::state::Dependencies;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use similar::TextDiff;
use std::collections::HashMap;
use tokio::sync::Mutex;

const DEFAULT_TTL_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationTarget {
    WorkspaceFile,
    ProviderConfig,
    ActiveLlm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Replace,
    JsonPatch,
    TextRewrite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonPatchOp {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: Option<JsonValue>,
}

/// One edit within a preview request. `path` only applies to `workspace_file`
/// operations (one file per op); `provider_config`/`active_llm` operations act
/// on the single current value as a whole (spec §4.4 step 3).
#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub value: Option<JsonValue>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub replace: Option<String>,
    #[serde(default)]
    pub patch: Option<Vec<JsonPatchOp>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewRequest {
    pub target: MutationTarget,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub allow_sensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct Checks {
    pub path_whitelist_passed: bool,
    pub structure_valid: bool,
    pub risk_level: RiskLevel,
    pub sensitive_fields: Vec<String>,
    pub denied_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffEntry {
    pub path: String,
    pub before_hash: String,
    pub after_hash: String,
    pub changed: bool,
}

#[derive(Debug, Clone)]
enum PreparedWrites {
    WorkspaceFiles(Vec<(String, String)>),
    ProviderConfig(HashMap<String, ProviderSetting>),
    ActiveLlm(Option<ActiveLlm>),
}

/// Ephemeral record produced by preview and consumed by apply (spec §3
/// "MutationRecord"). Deleted on successful apply or expiry; never reapplied.
#[derive(Debug, Clone)]
struct MutationRecord {
    id: String,
    target: MutationTarget,
    expires_at: DateTime<Utc>,
    confirm_hash: String,
    allow_sensitive: bool,
    requires_sensitive_allow: bool,
    checks: Checks,
    diff_summary: Vec<DiffEntry>,
    unified_diff: String,
    base_hashes: HashMap<String, String>,
    writes: PreparedWrites,
    applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResponse {
    pub mutation_id: String,
    pub target: MutationTarget,
    pub checks: Checks,
    pub diff_summary: Vec<DiffEntry>,
    pub unified_diff: String,
    pub base_hashes: HashMap<String, String>,
    pub confirm_hash: String,
    pub requires_sensitive_allow: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyRequest {
    pub mutation_id: String,
    pub confirm_hash: String,
    #[serde(default)]
    pub allow_sensitive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyResponse {
    pub applied: bool,
    pub applied_targets: Vec<String>,
    pub audit_id: String,
}

/// In-memory store of pending previews, keyed by `mutation_id` (spec §5: the
/// mutation record lives only in process memory, never on disk — a process
/// restart discards in-flight previews, which is acceptable because apply
/// always re-verifies the underlying state anyway).
#[derive(Default)]
pub struct MutationStore {
    records: Mutex<HashMap<String, MutationRecord>>,
}

impl MutationStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn purge_expired(&self) {
        let now = Utc::now();
        let mut guard = self.records.lock().await;
        guard.retain(|_, r| r.expires_at > now);
    }

    async fn insert(&self, record: MutationRecord) {
        let mut guard = self.records.lock().await;
        guard.insert(record.id.clone(), record);
    }
}

fn sha256_hex(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recursively re-sorts object keys so the same logical document always
/// serializes to the same bytes regardless of insertion order (spec §4.4
/// step 4 "stable JSON"); the crate's `serde_json` carries `preserve_order`,
/// which preserves insertion order but not sort order, so this has to walk
/// the tree explicitly.
fn sort_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_value(&map[key]));
            }
            JsonValue::Object(sorted)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

fn stable_json_string(value: &JsonValue) -> String {
    serde_json::to_string_pretty(&sort_value(value)).expect("json serializes")
}

fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_uppercase();
    upper == "API_KEY" || upper.ends_with("_KEY") || upper.ends_with("_TOKEN") || upper.ends_with("_SECRET")
}

fn collect_sensitive_keys(value: &JsonValue, prefix: &str, out: &mut Vec<String>) {
    match value {
        JsonValue::Object(map) => {
            for (key, v) in map {
                let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                if is_sensitive_key(key) && !out.contains(&path) {
                    out.push(path.clone());
                }
                collect_sensitive_keys(v, &path, out);
            }
        }
        JsonValue::Array(items) => {
            for (idx, v) in items.iter().enumerate() {
                collect_sensitive_keys(v, &format!("{prefix}[{idx}]"), out);
            }
        }
        _ => {}
    }
}

fn collect_sensitive_in_text(text: &str, out: &mut Vec<String>) {
    const MARKERS: &[&str] = &["API_KEY", "_KEY", "_TOKEN", "_SECRET"];
    let upper = text.to_uppercase();
    for marker in MARKERS {
        if upper.contains(marker) && !out.iter().any(|m| m == marker) {
            out.push((*marker).to_string());
        }
    }
}

fn pointer_parts(path: &str) -> GatewayResult<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    if !path.starts_with('/') {
        return Err(GatewayError::InvalidRequest(format!("invalid json pointer: {path}")));
    }
    Ok(path[1..].split('/').map(|p| p.replace("~1", "/").replace("~0", "~")).collect())
}

fn navigate<'a>(doc: &'a JsonValue, parts: &[String]) -> GatewayResult<&'a JsonValue> {
    let mut current = doc;
    for part in parts {
        current = match current {
            JsonValue::Object(map) => map
                .get(part)
                .ok_or_else(|| GatewayError::InvalidRequest(format!("json_patch path segment not found: {part}")))?,
            JsonValue::Array(items) => {
                let idx: usize = part
                    .parse()
                    .map_err(|_| GatewayError::InvalidRequest(format!("invalid json_patch array index: {part}")))?;
                items
                    .get(idx)
                    .ok_or_else(|| GatewayError::InvalidRequest("json_patch array index out of range".to_string()))?
            }
            _ => return Err(GatewayError::InvalidRequest("json_patch path traverses a scalar".to_string())),
        };
    }
    Ok(current)
}

fn navigate_mut_create<'a>(doc: &'a mut JsonValue, parts: &[String]) -> GatewayResult<&'a mut JsonValue> {
    let mut current = doc;
    for part in parts {
        if current.is_object() {
            let map = current.as_object_mut().expect("checked is_object");
            current = map.entry(part.clone()).or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
        } else if current.is_array() {
            let idx: usize = part
                .parse()
                .map_err(|_| GatewayError::InvalidRequest(format!("invalid json_patch array index: {part}")))?;
            current = current
                .as_array_mut()
                .expect("checked is_array")
                .get_mut(idx)
                .ok_or_else(|| GatewayError::InvalidRequest("json_patch array index out of range".to_string()))?;
        } else {
            return Err(GatewayError::InvalidRequest("json_patch path traverses a scalar".to_string()));
        }
    }
    Ok(current)
}

fn set_at_pointer(doc: &mut JsonValue, parts: &[String], value: JsonValue) -> GatewayResult<()> {
    if parts.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (last, prefix) = parts.split_last().expect("checked non-empty above");
    let parent = navigate_mut_create(doc, prefix)?;
    match parent {
        JsonValue::Object(map) => {
            map.insert(last.clone(), value);
        }
        JsonValue::Array(items) => {
            if last == "-" {
                items.push(value);
            } else {
                let idx: usize = last
                    .parse()
                    .map_err(|_| GatewayError::InvalidRequest(format!("invalid json_patch array index: {last}")))?;
                if idx > items.len() {
                    return Err(GatewayError::InvalidRequest("json_patch array index out of range".to_string()));
                }
                items.insert(idx, value);
            }
        }
        _ => return Err(GatewayError::InvalidRequest("json_patch path traverses a scalar".to_string())),
    }
    Ok(())
}

fn remove_at_pointer(doc: &mut JsonValue, parts: &[String]) -> GatewayResult<()> {
    if parts.is_empty() {
        *doc = JsonValue::Null;
        return Ok(());
    }
    let (last, prefix) = parts.split_last().expect("checked non-empty above");
    let parent = navigate_mut_create(doc, prefix)?;
    match parent {
        JsonValue::Object(map) => {
            map.remove(last)
                .ok_or_else(|| GatewayError::InvalidRequest(format!("json_patch remove: key not found: {last}")))?;
        }
        JsonValue::Array(items) => {
            let idx: usize = last
                .parse()
                .map_err(|_| GatewayError::InvalidRequest(format!("invalid json_patch array index: {last}")))?;
            if idx >= items.len() {
                return Err(GatewayError::InvalidRequest("json_patch array index out of range".to_string()));
            }
            items.remove(idx);
        }
        _ => return Err(GatewayError::InvalidRequest("json_patch path traverses a scalar".to_string())),
    }
    Ok(())
}

fn apply_json_patch(doc: &mut JsonValue, ops: &[JsonPatchOp]) -> GatewayResult<()> {
    for op in ops {
        let parts = pointer_parts(&op.path)?;
        match op.op.as_str() {
            "add" | "replace" => {
                let value = op
                    .value
                    .clone()
                    .ok_or_else(|| GatewayError::InvalidRequest(format!("json_patch {} requires value", op.op)))?;
                set_at_pointer(doc, &parts, value)?;
            }
            "remove" => remove_at_pointer(doc, &parts)?,
            "test" => {
                let expected = op.value.clone().unwrap_or(JsonValue::Null);
                let actual = navigate(doc, &parts)?;
                if actual != &expected {
                    return Err(GatewayError::InvalidRequest("json_patch test failed".to_string()));
                }
            }
            other => return Err(GatewayError::InvalidRequest(format!("unsupported json_patch op: {other}"))),
        }
    }
    Ok(())
}

fn extract_text_or_json(value: JsonValue) -> String {
    if let JsonValue::Object(map) = &value {
        if map.len() == 1 {
            if let Some(JsonValue::String(content)) = map.get("content") {
                return content.clone();
            }
        }
    }
    serde_json::to_string_pretty(&value).expect("json serializes")
}

fn apply_workspace_operation(current_text: &str, op: &Operation) -> GatewayResult<String> {
    match op.kind {
        OperationKind::Replace => {
            let value = op.value.clone().ok_or_else(|| GatewayError::InvalidRequest("replace requires value".to_string()))?;
            Ok(extract_text_or_json(value))
        }
        OperationKind::TextRewrite => {
            let search = op
                .search
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| GatewayError::InvalidRequest("text_rewrite requires a non-empty search".to_string()))?;
            let replace_with = op.replace.as_deref().unwrap_or("");
            Ok(current_text.replace(search, replace_with))
        }
        OperationKind::JsonPatch => {
            let mut doc: JsonValue = if current_text.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(current_text)
                    .map_err(|e| GatewayError::InvalidRequest(format!("current document is not valid JSON: {e}")))?
            };
            let patch = op.patch.as_deref().unwrap_or(&[]);
            apply_json_patch(&mut doc, patch)?;
            Ok(serde_json::to_string_pretty(&doc).expect("json serializes"))
        }
    }
}

fn apply_structured_operation(doc: &mut JsonValue, op: &Operation, target_name: &str) -> GatewayResult<()> {
    match op.kind {
        OperationKind::Replace => {
            *doc = op.value.clone().ok_or_else(|| GatewayError::InvalidRequest("replace requires value".to_string()))?;
            Ok(())
        }
        OperationKind::JsonPatch => {
            let patch = op.patch.as_deref().unwrap_or(&[]);
            apply_json_patch(doc, patch)
        }
        OperationKind::TextRewrite => Err(GatewayError::InvalidRequest(format!(
            "text_rewrite is not supported for target {target_name}"
        ))),
    }
}

struct PreviewComputation {
    base_hashes: HashMap<String, String>,
    diff_summary: Vec<DiffEntry>,
    unified_diff: String,
    denied_paths: Vec<String>,
    sensitive_fields: Vec<String>,
    writes: PreparedWrites,
}

async fn preview_workspace_file(deps: &Dependencies, operations: &[Operation]) -> GatewayResult<PreviewComputation> {
    let mut base_hashes = HashMap::new();
    let mut diff_summary = Vec::new();
    let mut unified_diff = String::new();
    let mut denied_paths = Vec::new();
    let mut sensitive_fields = Vec::new();
    let mut writes = Vec::new();

    for op in operations {
        let raw_path = op
            .path
            .as_deref()
            .ok_or_else(|| GatewayError::InvalidRequest("workspace_file operation requires path".to_string()))?;
        let path = crate::state::workspace::WorkspaceStore::normalize_path(raw_path)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        if !crate::state::workspace::WorkspaceStore::is_whitelisted(&path) {
            denied_paths.push(path.clone());
        }

        let current_text = if deps.workspace.exists(&path).await {
            deps.workspace.read(&path).await.map_err(GatewayError::Internal)?
        } else {
            String::new()
        };
        let before_hash = sha256_hex(&current_text);
        base_hashes.insert(path.clone(), before_hash.clone());

        let new_text = apply_workspace_operation(&current_text, op)?;
        let after_hash = sha256_hex(&new_text);
        let changed = before_hash != after_hash;

        collect_sensitive_in_text(&new_text, &mut sensitive_fields);

        if changed {
            let diff = TextDiff::from_lines(&current_text, &new_text)
                .unified_diff()
                .header(&format!("a/{path}"), &format!("b/{path}"))
                .to_string();
            unified_diff.push_str(&diff);
        }

        diff_summary.push(DiffEntry { path: path.clone(), before_hash, after_hash, changed });
        writes.push((path, new_text));
    }

    Ok(PreviewComputation {
        base_hashes,
        diff_summary,
        unified_diff,
        denied_paths,
        sensitive_fields,
        writes: PreparedWrites::WorkspaceFiles(writes),
    })
}

async fn preview_provider_config(deps: &Dependencies, operations: &[Operation]) -> GatewayResult<PreviewComputation> {
    let current = deps
        .settings
        .read(|s| serde_json::to_value(&s.providers).expect("providers serialize"))
        .await;
    let before_hash = sha256_hex(&stable_json_string(&current));

    let mut doc = current.clone();
    for op in operations {
        apply_structured_operation(&mut doc, op, "provider_config")?;
    }

    let decoded: HashMap<String, ProviderSetting> =
        serde_json::from_value(doc.clone()).map_err(|e| GatewayError::InvalidRequest(format!("provider_config does not decode: {e}")))?;

    let after_hash = sha256_hex(&stable_json_string(&doc));
    let changed = before_hash != after_hash;

    let mut sensitive_fields = Vec::new();
    collect_sensitive_keys(&doc, "", &mut sensitive_fields);

    let mut unified_diff = String::new();
    if changed {
        let before_text = stable_json_string(&current);
        let after_text = stable_json_string(&doc);
        unified_diff = TextDiff::from_lines(&before_text, &after_text)
            .unified_diff()
            .header("a/provider_config", "b/provider_config")
            .to_string();
    }

    let mut base_hashes = HashMap::new();
    base_hashes.insert("provider_config".to_string(), before_hash.clone());

    Ok(PreviewComputation {
        base_hashes,
        diff_summary: vec![DiffEntry { path: "provider_config".to_string(), before_hash, after_hash, changed }],
        unified_diff,
        denied_paths: Vec::new(),
        sensitive_fields,
        writes: PreparedWrites::ProviderConfig(decoded),
    })
}

async fn preview_active_llm(deps: &Dependencies, operations: &[Operation]) -> GatewayResult<PreviewComputation> {
    let (current, known_providers) = deps
        .settings
        .read(|s| {
            (
                serde_json::to_value(&s.active_llm).expect("active_llm serializes"),
                s.providers.keys().cloned().collect::<Vec<_>>(),
            )
        })
        .await;
    let before_hash = sha256_hex(&stable_json_string(&current));

    let mut doc = current.clone();
    for op in operations {
        apply_structured_operation(&mut doc, op, "active_llm")?;
    }

    let decoded: Option<ActiveLlm> =
        serde_json::from_value(doc.clone()).map_err(|e| GatewayError::InvalidRequest(format!("active_llm does not decode: {e}")))?;

    if let Some(active) = &decoded {
        if active.provider_id.trim().is_empty() || active.model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("active_llm requires provider_id and model".to_string()));
        }
        if !known_providers.is_empty() && !known_providers.contains(&active.provider_id) {
            return Err(GatewayError::InvalidRequest(format!(
                "active_llm.provider_id {} is not a configured provider",
                active.provider_id
            )));
        }
    }

    let after_hash = sha256_hex(&stable_json_string(&doc));
    let changed = before_hash != after_hash;

    let mut sensitive_fields = Vec::new();
    collect_sensitive_keys(&doc, "", &mut sensitive_fields);

    let mut unified_diff = String::new();
    if changed {
        let before_text = stable_json_string(&current);
        let after_text = stable_json_string(&doc);
        unified_diff = TextDiff::from_lines(&before_text, &after_text)
            .unified_diff()
            .header("a/active_llm", "b/active_llm")
            .to_string();
    }

    let mut base_hashes = HashMap::new();
    base_hashes.insert("active_llm".to_string(), before_hash.clone());

    Ok(PreviewComputation {
        base_hashes,
        diff_summary: vec![DiffEntry { path: "active_llm".to_string(), before_hash, after_hash, changed }],
        unified_diff,
        denied_paths: Vec::new(),
        sensitive_fields,
        writes: PreparedWrites::ActiveLlm(decoded),
    })
}

/// `POST /agent/self/config-mutations/preview`.
pub async fn preview(deps: &Dependencies, store: &MutationStore, req: PreviewRequest) -> GatewayResult<PreviewResponse> {
    store.purge_expired().await;

    let computation = match req.target {
        MutationTarget::WorkspaceFile => preview_workspace_file(deps, &req.operations).await?,
        MutationTarget::ProviderConfig => preview_provider_config(deps, &req.operations).await?,
        MutationTarget::ActiveLlm => preview_active_llm(deps, &req.operations).await?,
    };

    let path_whitelist_passed = computation.denied_paths.is_empty();
    let has_changes = computation.diff_summary.iter().any(|d| d.changed);
    let requires_sensitive_allow = !computation.sensitive_fields.is_empty();

    let risk_level = if !path_whitelist_passed || requires_sensitive_allow {
        RiskLevel::High
    } else if has_changes {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    let checks = Checks {
        path_whitelist_passed,
        structure_valid: true,
        risk_level,
        sensitive_fields: computation.sensitive_fields.clone(),
        denied_paths: computation.denied_paths.clone(),
    };

    let confirm_payload = serde_json::json!({
        "target": req.target,
        "checks": checks,
        "diff_summary": computation.diff_summary,
        "base_hashes": computation.base_hashes,
        "allow_sensitive": req.allow_sensitive,
        "requires_sensitive_allow": requires_sensitive_allow,
    });
    let confirm_hash = sha256_hex(&stable_json_string(&confirm_payload));

    let id = uuid::Uuid::new_v4().to_string();
    let expires_at = Utc::now() + ChronoDuration::minutes(DEFAULT_TTL_MINUTES);

    let record = MutationRecord {
        id: id.clone(),
        target: req.target,
        expires_at,
        confirm_hash: confirm_hash.clone(),
        allow_sensitive: req.allow_sensitive,
        requires_sensitive_allow,
        checks: checks.clone(),
        diff_summary: computation.diff_summary.clone(),
        unified_diff: computation.unified_diff.clone(),
        base_hashes: computation.base_hashes.clone(),
        writes: computation.writes,
        applied: false,
    };
    store.insert(record).await;

    Ok(PreviewResponse {
        mutation_id: id,
        target: req.target,
        checks,
        diff_summary: computation.diff_summary,
        unified_diff: computation.unified_diff,
        base_hashes: computation.base_hashes,
        confirm_hash,
        requires_sensitive_allow,
        expires_at,
    })
}

/// `POST /agent/self/config-mutations/apply`. Guards run in the order fixed
/// by spec §4.4; a guard failure leaves the record untouched so a client can
/// retry with a corrected request before the TTL expires.
pub async fn apply(deps: &Dependencies, store: &MutationStore, req: ApplyRequest) -> GatewayResult<ApplyResponse> {
    store.purge_expired().await;

    let snapshot = {
        let guard = store.records.lock().await;
        let record = guard.get(&req.mutation_id).ok_or(GatewayError::MutationNotFound)?;
        if record.expires_at <= Utc::now() {
            return Err(GatewayError::MutationExpired);
        }
        if record.applied {
            return Err(GatewayError::MutationNotFound);
        }
        if record.confirm_hash != req.confirm_hash {
            return Err(GatewayError::MutationHashMismatch);
        }
        if record.allow_sensitive != req.allow_sensitive {
            return Err(GatewayError::MutationHashMismatch);
        }
        if record.requires_sensitive_allow && !record.allow_sensitive {
            return Err(GatewayError::MutationSensitiveDenied);
        }
        if !record.checks.path_whitelist_passed {
            return Err(GatewayError::MutationPathDenied);
        }
        record.clone()
    };

    match &snapshot.writes {
        PreparedWrites::WorkspaceFiles(writes) => {
            for (path, _) in writes {
                let current_text = if deps.workspace.exists(path).await {
                    deps.workspace.read(path).await.map_err(GatewayError::Internal)?
                } else {
                    String::new()
                };
                let current_hash = sha256_hex(&current_text);
                let expected = snapshot.base_hashes.get(path).cloned().unwrap_or_default();
                if current_hash != expected {
                    return Err(GatewayError::MutationApplyConflict);
                }
            }
        }
        PreparedWrites::ProviderConfig(_) => {
            let current = deps
                .settings
                .read(|s| serde_json::to_value(&s.providers).expect("providers serialize"))
                .await;
            let current_hash = sha256_hex(&stable_json_string(&current));
            let expected = snapshot.base_hashes.get("provider_config").cloned().unwrap_or_default();
            if current_hash != expected {
                return Err(GatewayError::MutationApplyConflict);
            }
        }
        PreparedWrites::ActiveLlm(_) => {
            let current = deps
                .settings
                .read(|s| serde_json::to_value(&s.active_llm).expect("active_llm serializes"))
                .await;
            let current_hash = sha256_hex(&stable_json_string(&current));
            let expected = snapshot.base_hashes.get("active_llm").cloned().unwrap_or_default();
            if current_hash != expected {
                return Err(GatewayError::MutationApplyConflict);
            }
        }
    }

    let mut applied_targets = Vec::new();
    match snapshot.writes {
        PreparedWrites::WorkspaceFiles(writes) => {
            for (path, content) in writes {
                deps.workspace.write(&path, &content).await.map_err(GatewayError::Internal)?;
                applied_targets.push(path);
            }
        }
        PreparedWrites::ProviderConfig(providers) => {
            deps.settings
                .write(|s| {
                    s.providers = providers;
                    if let Some(active) = &s.active_llm {
                        if !s.providers.contains_key(&active.provider_id) {
                            s.active_llm = None;
                        }
                    }
                    Ok(())
                })
                .await
                .map_err(GatewayError::Internal)?;
            applied_targets.push("provider_config".to_string());
        }
        PreparedWrites::ActiveLlm(active) => {
            deps.settings
                .write(|s| {
                    s.active_llm = active;
                    Ok(())
                })
                .await
                .map_err(GatewayError::Internal)?;
            applied_targets.push("active_llm".to_string());
        }
    }

    {
        let mut guard = store.records.lock().await;
        guard.remove(&req.mutation_id);
    }

    Ok(ApplyResponse {
        applied: true,
        applied_targets,
        audit_id: uuid::Uuid::new_v4().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps_with_file(dir: &std::path::Path, path: &str, content: &str) -> std::sync::Arc<Dependencies> {
        let deps = Dependencies::open_temp(dir);
        let target = dir.join("workspace").join(path);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, content).unwrap();
        deps
    }

    #[tokio::test]
    async fn preview_then_apply_replaces_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps_with_file(dir.path(), "prompts/selfops-test.md", "before");
        let store = MutationStore::new();

        let preview_resp = preview(
            &deps,
            &store,
            PreviewRequest {
                target: MutationTarget::WorkspaceFile,
                operations: vec![Operation {
                    kind: OperationKind::Replace,
                    path: Some("prompts/selfops-test.md".to_string()),
                    value: Some(serde_json::json!({"content": "after"})),
                    search: None,
                    replace: None,
                    patch: None,
                }],
                allow_sensitive: false,
            },
        )
        .await
        .unwrap();

        let apply_resp = apply(
            &deps,
            &store,
            ApplyRequest {
                mutation_id: preview_resp.mutation_id,
                confirm_hash: preview_resp.confirm_hash,
                allow_sensitive: false,
            },
        )
        .await
        .unwrap();

        assert!(apply_resp.applied);
        assert!(apply_resp.applied_targets.contains(&"prompts/selfops-test.md".to_string()));
        let content = deps.workspace.read("prompts/selfops-test.md").await.unwrap();
        assert_eq!(content, "after");
    }

    #[tokio::test]
    async fn sensitive_field_requires_allow_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let deps = Dependencies::open_temp(dir.path());
        deps.settings
            .write(|s| {
                s.set_provider("openai", ProviderSetting::default());
                Ok(())
            })
            .await
            .unwrap();
        let store = MutationStore::new();

        let preview_resp = preview(
            &deps,
            &store,
            PreviewRequest {
                target: MutationTarget::ProviderConfig,
                operations: vec![Operation {
                    kind: OperationKind::JsonPatch,
                    path: None,
                    value: None,
                    search: None,
                    replace: None,
                    patch: Some(vec![JsonPatchOp {
                        op: "add".to_string(),
                        path: "/openai/api_key".to_string(),
                        value: Some(serde_json::json!("sk-test-123")),
                    }]),
                }],
                allow_sensitive: false,
            },
        )
        .await
        .unwrap();
        assert!(preview_resp.requires_sensitive_allow);

        let err = apply(
            &deps,
            &store,
            ApplyRequest {
                mutation_id: preview_resp.mutation_id,
                confirm_hash: preview_resp.confirm_hash,
                allow_sensitive: false,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::MutationSensitiveDenied));
    }

    #[tokio::test]
    async fn stale_base_hash_triggers_apply_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps_with_file(dir.path(), "prompts/a.md", "v1");
        let store = MutationStore::new();

        let preview_resp = preview(
            &deps,
            &store,
            PreviewRequest {
                target: MutationTarget::WorkspaceFile,
                operations: vec![Operation {
                    kind: OperationKind::Replace,
                    path: Some("prompts/a.md".to_string()),
                    value: Some(serde_json::json!({"content": "v2"})),
                    search: None,
                    replace: None,
                    patch: None,
                }],
                allow_sensitive: false,
            },
        )
        .await
        .unwrap();

        deps.workspace.write("prompts/a.md", "concurrent-edit").await.unwrap();

        let err = apply(
            &deps,
            &store,
            ApplyRequest {
                mutation_id: preview_resp.mutation_id,
                confirm_hash: preview_resp.confirm_hash,
                allow_sensitive: false,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::MutationApplyConflict));
    }

    #[tokio::test]
    async fn repeated_preview_on_unchanged_state_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps_with_file(dir.path(), "prompts/a.md", "v1");
        let store = MutationStore::new();

        let req = || PreviewRequest {
            target: MutationTarget::WorkspaceFile,
            operations: vec![Operation {
                kind: OperationKind::Replace,
                path: Some("prompts/a.md".to_string()),
                value: Some(serde_json::json!({"content": "v2"})),
                search: None,
                replace: None,
                patch: None,
            }],
            allow_sensitive: false,
        };

        let first = preview(&deps, &store, req()).await.unwrap();
        let second = preview(&deps, &store, req()).await.unwrap();
        assert_eq!(first.confirm_hash, second.confirm_hash);
    }

    #[tokio::test]
    async fn removing_active_provider_resets_active_llm_on_apply() {
        let dir = tempfile::tempdir().unwrap();
        let deps = Dependencies::open_temp(dir.path());
        deps.settings
            .write(|s| {
                s.set_provider("openai", ProviderSetting::default());
                s.active_llm = Some(ActiveLlm { provider_id: "openai".to_string(), model: "gpt".to_string() });
                Ok(())
            })
            .await
            .unwrap();
        let store = MutationStore::new();

        let preview_resp = preview(
            &deps,
            &store,
            PreviewRequest {
                target: MutationTarget::ProviderConfig,
                operations: vec![Operation {
                    kind: OperationKind::JsonPatch,
                    path: None,
                    value: None,
                    search: None,
                    replace: None,
                    patch: Some(vec![JsonPatchOp {
                        op: "remove".to_string(),
                        path: "/openai".to_string(),
                        value: None,
                    }]),
                }],
                allow_sensitive: false,
            },
        )
        .await
        .unwrap();

        apply(
            &deps,
            &store,
            ApplyRequest {
                mutation_id: preview_resp.mutation_id,
                confirm_hash: preview_resp.confirm_hash,
                allow_sensitive: false,
            },
        )
        .await
        .unwrap();

        let active = deps.settings.read(|s| s.active_llm.clone()).await;
        assert!(active.is_none());
    }
}
