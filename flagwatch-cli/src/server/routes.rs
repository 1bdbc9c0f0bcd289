use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flagwatch_lib::{FeatureError, Flag, Parameters, Value};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub names_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetRequest {
    pub feature: Flag,
}

#[derive(Debug, Serialize)]
struct FeaturesResponse {
    names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flags: Option<Vec<Flag>>,
}

#[derive(Debug, Serialize)]
struct SetResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<Flag>,
    after: Flag,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    flag: Option<Flag>,
}

fn error_response(err: &FeatureError) -> Response {
    let status = match err {
        FeatureError::NotFound(_) => StatusCode::NOT_FOUND,
        FeatureError::Evaluation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        e if e.is_invalid() => StatusCode::UNPROCESSABLE_ENTITY,
        e => {
            error!(error = %e, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

// ── Health ───────────────────────────────────────────────────

pub async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "flags_loaded": state.registry.len(),
        "watching": state.registry.watched_path(),
    }))
}

// ── GET /v1/features/{name} ──────────────────────────────────

pub async fn handle_get_feature(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.registry.get(&name) {
        Ok(flag) => Json(serde_json::json!({"feature": flag})).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── GET /v1/features ─────────────────────────────────────────

pub async fn handle_list_features(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let list = state.registry.list(query.names_only);
    Json(FeaturesResponse {
        names: list.names,
        flags: list.flags,
    })
    .into_response()
}

// ── POST /v1/features ────────────────────────────────────────

pub async fn handle_set_feature(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetRequest>,
) -> Response {
    match state.registry.set(request.feature) {
        Ok(outcome) => Json(SetResponse {
            before: outcome.before,
            after: outcome.after,
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, "rejected feature update");
            error_response(&e)
        }
    }
}

// ── DELETE /v1/features/{name} ───────────────────────────────

pub async fn handle_delete_feature(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    Json(DeleteResponse {
        flag: state.registry.delete(&name),
    })
    .into_response()
}

// ── GET /v1/eval/{name} ──────────────────────────────────────

pub async fn handle_eval(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let params: Parameters = query
        .iter()
        .map(|(k, v)| (k.clone(), Value::infer(v)))
        .collect();

    match state.registry.is_enabled(&name, &params) {
        Ok(enabled) => Json(serde_json::json!({"flag": name, "enabled": enabled})).into_response(),
        Err(e) => error_response(&e),
    }
}
