//! Moderation administration routes
//!
//! Auth-gated via `X-Admin-Token` header matching the configured admin
//! token. No token configured means every admin route answers 401 — the
//! surface is disabled, not open.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

use crate::models::{CreatePhraseRequest, CreateRangeRequest, CreateRuleRequest, ErrorResponse};
use crate::state::SharedState;
use crate::validation::CidrBlock;

type AdminResult = Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)>;

fn validate_admin_token(state: &SharedState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return false;
    };
    headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

fn unauthorized() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "Invalid or missing admin token".into(),
            code: 401,
        }),
    )
}

fn store_error(err: anyhow::Error) -> (StatusCode, Json<ErrorResponse>) {
    tracing::error!("admin store operation failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Store operation failed".into(),
            code: 500,
        }),
    )
}

/// Live operational stats
pub async fn admin_stats_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> AdminResult {
    if !validate_admin_token(&state, &headers) {
        return Err(unauthorized());
    }

    Ok(Json(json!({
        "online": state.online_count().await,
        "waiting": state.matchmaking.queue_len().await,
        "active_pairs": state.matchmaking.active_pairs().await,
        "pending_violations": state.moderation.pending_len().await,
        "uptime_seconds": state.uptime(),
    })))
}

// ── Filter rules ──

pub async fn list_rules_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> AdminResult {
    if !validate_admin_token(&state, &headers) {
        return Err(unauthorized());
    }
    let rules = state.db.get_filter_rules().await.map_err(store_error)?;
    Ok(Json(json!({ "rules": rules })))
}

pub async fn create_rule_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CreateRuleRequest>,
) -> AdminResult {
    if !validate_admin_token(&state, &headers) {
        return Err(unauthorized());
    }
    if request.pattern.trim().is_empty() || !(1..=3).contains(&request.severity) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Pattern must be non-empty and severity 1-3".into(),
                code: 400,
            }),
        ));
    }
    if request.is_regex && regex::Regex::new(&request.pattern).is_err() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Invalid regex pattern".into(),
                code: 400,
            }),
        ));
    }

    let id = state
        .db
        .add_filter_rule(&request.pattern, request.is_regex, request.severity)
        .await
        .map_err(store_error)?;
    state.moderation.invalidate_rules().await;
    info!(id, pattern = %request.pattern, "filter rule added");
    Ok(Json(json!({ "id": id })))
}

pub async fn delete_rule_handler(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> AdminResult {
    if !validate_admin_token(&state, &headers) {
        return Err(unauthorized());
    }
    let removed = state.db.remove_filter_rule(id).await.map_err(store_error)?;
    if !removed {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Rule not found".into(),
                code: 404,
            }),
        ));
    }
    state.moderation.invalidate_rules().await;
    info!(id, "filter rule removed");
    Ok(Json(json!({ "status": "removed", "id": id })))
}

// ── Whitelist ──

pub async fn list_whitelist_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> AdminResult {
    if !validate_admin_token(&state, &headers) {
        return Err(unauthorized());
    }
    let phrases = state.db.get_whitelist().await.map_err(store_error)?;
    Ok(Json(json!({ "phrases": phrases })))
}

pub async fn add_whitelist_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CreatePhraseRequest>,
) -> AdminResult {
    if !validate_admin_token(&state, &headers) {
        return Err(unauthorized());
    }
    if request.phrase.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Phrase cannot be empty".into(),
                code: 400,
            }),
        ));
    }
    state
        .db
        .add_whitelist_phrase(request.phrase.trim())
        .await
        .map_err(store_error)?;
    state.moderation.invalidate_rules().await;
    Ok(Json(json!({ "status": "added" })))
}

// ── Blocked ranges ──

pub async fn list_ranges_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> AdminResult {
    if !validate_admin_token(&state, &headers) {
        return Err(unauthorized());
    }
    let ranges = state.db.get_banned_ranges().await.map_err(store_error)?;
    Ok(Json(json!({ "ranges": ranges })))
}

pub async fn add_range_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CreateRangeRequest>,
) -> AdminResult {
    if !validate_admin_token(&state, &headers) {
        return Err(unauthorized());
    }
    if let Err(err) = CidrBlock::parse(&request.cidr) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: err,
                code: 400,
            }),
        ));
    }
    state
        .db
        .add_banned_range(&request.cidr)
        .await
        .map_err(store_error)?;
    info!(cidr = %request.cidr, "range blocked");
    Ok(Json(json!({ "status": "added", "cidr": request.cidr })))
}

/// Remove a blocked range, passed as `?cidr=` because CIDRs contain slashes.
pub async fn remove_range_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> AdminResult {
    if !validate_admin_token(&state, &headers) {
        return Err(unauthorized());
    }
    let Some(cidr) = params.get("cidr") else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Missing cidr parameter".into(),
                code: 400,
            }),
        ));
    };
    let removed = state.db.remove_banned_range(cidr).await.map_err(store_error)?;
    Ok(Json(json!({ "status": if removed { "removed" } else { "not_found" } })))
}

// ── Bans ──

/// Lift a ban. The one rehabilitation path: reputation returns to the
/// configured default.
pub async fn lift_ban_handler(
    State(state): State<SharedState>,
    Path(identity): Path<String>,
    headers: HeaderMap,
) -> AdminResult {
    if !validate_admin_token(&state, &headers) {
        return Err(unauthorized());
    }
    let lifted = state
        .db
        .remove_ban(&identity, state.config.reputation_default)
        .await
        .map_err(store_error)?;
    if !lifted {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "No record for identity".into(),
                code: 404,
            }),
        ));
    }
    state.ban_cache.invalidate(&identity).await;
    info!(identity = %identity, "ban lifted");
    Ok(Json(json!({ "status": "lifted", "identity": identity })))
}
