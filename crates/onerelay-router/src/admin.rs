use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use onerelay_common::RelaySettings;
use onerelay_core::{
    AppState, Bootstrap, ChannelTester, RelayEngine, SweepError, TopUpOutcome, TopUpService,
};
use onerelay_provider_core::{Channel, ChannelStatus, RelayError};
use onerelay_storage::{Storage, StorageError, TagUpdate};

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub storage: Arc<dyn Storage>,
    pub engine: Arc<RelayEngine>,
    pub tester: Arc<ChannelTester>,
    pub top_ups: Arc<TopUpService>,
}

impl From<&Bootstrap> for AdminState {
    fn from(boot: &Bootstrap) -> Self {
        Self {
            app: boot.state.clone(),
            storage: boot.storage.clone(),
            engine: boot.engine.clone(),
            tester: boot.tester.clone(),
            top_ups: boot.top_ups.clone(),
        }
    }
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/channel", post(create_channel))
        .route("/api/channel/{id}", put(update_channel).delete(delete_channel))
        .route("/api/channel/test", get(test_all_channels))
        .route("/api/channel/test/{id}", get(test_channel))
        .route("/api/channel/fix", post(fix_abilities))
        .route("/api/channel/tag/disabled", post(disable_tag))
        .route("/api/channel/tag/enabled", post(enable_tag))
        .route("/api/channel/tag", put(update_tag))
        .route("/api/topup/notify", post(top_up_notify))
        .route("/api/ledger/flush", post(flush_ledger))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = extract_admin_key(&headers, req.uri()).ok_or(StatusCode::UNAUTHORIZED)?;
    let key_hash = blake3::hash(key.as_bytes()).to_hex().to_string();
    if key_hash != state.app.global.load().admin_key_hash {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn extract_admin_key(headers: &HeaderMap, uri: &axum::http::Uri) -> Option<String> {
    if let Some(value) = headers.get("x-admin-key")
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }

    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(auth) = value.to_str()
    {
        let auth = auth.trim();
        let prefix = "Bearer ";
        if auth.len() > prefix.len() && auth[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = auth[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    let query = uri.query()?;
    let parsed: std::collections::HashMap<String, String> =
        serde_urlencoded::from_str(query).ok()?;
    let key = parsed.get("admin_key")?.trim();
    if key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "ok": true })))
}

async fn get_settings(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.app.global.load().settings.clone())
}

/// Replaces the relay tunables; keyword and filter automata are rebuilt on apply.
async fn put_settings(
    State(state): State<AdminState>,
    Json(settings): Json<RelaySettings>,
) -> Response {
    // DB commit -> in-memory apply.
    let mut next = state.app.global.load().as_ref().clone();
    next.settings = settings;
    if let Err(err) = state.storage.upsert_global_config(&next).await {
        return storage_error(err).into_response();
    }
    state.app.apply_global_config(next);
    info!(event = "settings_updated");
    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

fn validate_channel(channel: &Channel, require_key: bool) -> Result<(), Response> {
    let reject = |code: &str| {
        (StatusCode::BAD_REQUEST, Json(json!({ "error": code }))).into_response()
    };
    if channel.name.trim().is_empty() {
        return Err(reject("channel_name_required"));
    }
    if channel.model_list().is_empty() {
        return Err(reject("channel_models_required"));
    }
    if require_key && channel.keys().is_empty() {
        return Err(reject("channel_key_required"));
    }
    Ok(())
}

async fn create_channel(
    State(state): State<AdminState>,
    Json(mut channel): Json<Channel>,
) -> Response {
    if let Err(resp) = validate_channel(&channel, true) {
        return resp;
    }
    channel.id = 0;
    let id = match state.storage.insert_channel(&channel).await {
        Ok(id) => id,
        Err(err) => return storage_error(err).into_response(),
    };
    if let Err(resp) = refresh(&state).await {
        return resp;
    }
    info!(event = "channel_created", channel_id = id, name = %channel.name);
    (StatusCode::OK, Json(json!({ "ok": true, "id": id }))).into_response()
}

/// Full replacement; an empty key keeps the stored one, test stats are preserved.
async fn update_channel(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(mut channel): Json<Channel>,
) -> Response {
    let current = match state.storage.get_channel(id).await {
        Ok(Some(current)) => current,
        Ok(None) => return channel_not_found(),
        Err(err) => return storage_error(err).into_response(),
    };
    if let Err(resp) = validate_channel(&channel, false) {
        return resp;
    }
    channel.id = id;
    if channel.keys().is_empty() {
        channel.key = current.key;
    }
    channel.response_time_ms = current.response_time_ms;
    channel.test_time = current.test_time;
    channel.used_quota = current.used_quota;
    channel.created_at = current.created_at;

    if let Err(err) = state.storage.update_channel(&channel).await {
        return storage_error(err).into_response();
    }
    if let Err(resp) = refresh(&state).await {
        return resp;
    }
    info!(event = "channel_updated", channel_id = id);
    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

async fn delete_channel(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    match state.storage.get_channel(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return channel_not_found(),
        Err(err) => return storage_error(err).into_response(),
    }
    if let Err(err) = state.storage.delete_channel(id).await {
        return storage_error(err).into_response();
    }
    if let Err(resp) = refresh(&state).await {
        return resp;
    }
    info!(event = "channel_deleted", channel_id = id);
    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

async fn test_all_channels(State(state): State<AdminState>) -> Response {
    match state.tester.test_all_channels(true) {
        Ok(_) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(err @ SweepError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "channel_test_running", "detail": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TestQuery {
    model: Option<String>,
}

async fn test_channel(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Query(query): Query<TestQuery>,
) -> Response {
    let model = query.model.as_deref().map(str::trim).filter(|m| !m.is_empty());
    match state.tester.test_channel(id, model).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "ok": outcome.is_success(),
                "channel_id": outcome.channel_id,
                "model": outcome.model,
                "time": outcome.elapsed.as_secs_f64(),
                "message": outcome
                    .error
                    .as_ref()
                    .map(|err| err.message.clone())
                    .unwrap_or_default(),
            })),
        )
            .into_response(),
        Err(err) => relay_error(&err),
    }
}

async fn fix_abilities(State(state): State<AdminState>) -> Response {
    let fixed = match state.storage.fix_abilities().await {
        Ok(fixed) => fixed,
        Err(err) => return storage_error(err).into_response(),
    };
    if let Err(resp) = refresh(&state).await {
        return resp;
    }
    info!(event = "abilities_fixed", fixed);
    (StatusCode::OK, Json(json!({ "ok": true, "fixed": fixed }))).into_response()
}

#[derive(Debug, Deserialize)]
struct TagBody {
    tag: String,
}

async fn disable_tag(State(state): State<AdminState>, Json(body): Json<TagBody>) -> Response {
    set_tag_status(&state, &body.tag, ChannelStatus::ManuallyDisabled).await
}

async fn enable_tag(State(state): State<AdminState>, Json(body): Json<TagBody>) -> Response {
    set_tag_status(&state, &body.tag, ChannelStatus::Enabled).await
}

async fn set_tag_status(state: &AdminState, tag: &str, status: ChannelStatus) -> Response {
    let tag = tag.trim();
    if tag.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "tag_required" }))).into_response();
    }
    let updated = match state.storage.set_status_by_tag(tag, status).await {
        Ok(updated) => updated,
        Err(err) => return storage_error(err).into_response(),
    };
    if let Err(resp) = refresh(state).await {
        return resp;
    }
    info!(event = "tag_status_changed", tag = %tag, status = ?status, updated);
    (StatusCode::OK, Json(json!({ "ok": true, "updated": updated }))).into_response()
}

#[derive(Debug, Deserialize)]
struct TagUpdateBody {
    tag: String,
    new_tag: Option<String>,
    priority: Option<i64>,
    weight: Option<u32>,
}

async fn update_tag(State(state): State<AdminState>, Json(body): Json<TagUpdateBody>) -> Response {
    let tag = body.tag.trim();
    if tag.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "tag_required" }))).into_response();
    }
    let update = TagUpdate {
        new_tag: body.new_tag,
        priority: body.priority,
        weight: body.weight,
    };
    let updated = match state.storage.update_channels_by_tag(tag, &update).await {
        Ok(updated) => updated,
        Err(err) => return storage_error(err).into_response(),
    };
    if let Err(resp) = refresh(&state).await {
        return resp;
    }
    info!(event = "tag_updated", tag = %tag, updated);
    (StatusCode::OK, Json(json!({ "ok": true, "updated": updated }))).into_response()
}

#[derive(Debug, Deserialize)]
struct TopUpNotifyBody {
    trade_no: String,
}

/// Payment callback; repeated deliveries of one trade are acknowledged without crediting again.
async fn top_up_notify(
    State(state): State<AdminState>,
    Json(body): Json<TopUpNotifyBody>,
) -> Response {
    match state.top_ups.complete(body.trade_no.trim()).await {
        Ok(TopUpOutcome::Credited) => {
            (StatusCode::OK, Json(json!({ "ok": true, "credited": true }))).into_response()
        }
        Ok(TopUpOutcome::AlreadyProcessed) => {
            (StatusCode::OK, Json(json!({ "ok": true, "credited": false }))).into_response()
        }
        Ok(TopUpOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "top_up_not_found" })),
        )
            .into_response(),
        Err(err) => storage_error(err).into_response(),
    }
}

async fn flush_ledger(State(state): State<AdminState>) -> Response {
    match state.engine.ledger().flush().await {
        Ok(flushed) => {
            (StatusCode::OK, Json(json!({ "ok": true, "flushed": flushed }))).into_response()
        }
        Err(err) => storage_error(err).into_response(),
    }
}

/// Admin writes are visible to the selector as soon as the handler returns.
async fn refresh(state: &AdminState) -> Result<(), Response> {
    state
        .app
        .refresh_channels(state.storage.as_ref())
        .await
        .map_err(|err| storage_error(err).into_response())
}

fn channel_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "channel_not_found" })),
    )
        .into_response()
}

fn relay_error(err: &RelayError) -> Response {
    let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": err.code.clone().unwrap_or_else(|| err.error_type.clone()),
            "detail": err.message,
        })),
    )
        .into_response()
}

fn storage_error(err: StorageError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": "storage_error", "detail": err.to_string() })),
    )
}
