use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Extension, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use onerelay_core::{Caller, RelayEngine, RelayRequest, RelayResponse};
use onerelay_protocol::claude::messages::CreateMessageRequest;
use onerelay_protocol::gemini::generate_content::GenerateContentRequest;
use onerelay_protocol::openai::audio::SpeechRequest;
use onerelay_protocol::openai::chat::ChatCompletionRequest;
use onerelay_protocol::openai::embeddings::EmbeddingRequest;
use onerelay_protocol::openai::images::ImageGenerationRequest;
use onerelay_protocol::openai::models::ModelList;
use onerelay_protocol::openai::rerank::RerankRequest;
use onerelay_provider_core::{AudioRequest, ImageRequest, RelayError, RelayFormat, RelayMode};
use onerelay_transform::gemini2openai::request::transform_request;

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<RelayEngine>,
}

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";
const SSE_BUFFER: usize = 32;
/// Image edits and audio uploads arrive here whole.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;
const REQUEST_ID_HEADER: &str = "x-onerelay-request-id";

pub fn proxy_router(engine: Arc<RelayEngine>) -> Router {
    let state = ProxyState { engine };

    Router::new()
        // OpenAI family
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(image_generations))
        .route("/v1/images/edits", post(image_edits))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/audio/transcriptions", post(audio_transcriptions))
        .route("/v1/audio/translations", post(audio_translations))
        .route("/v1/rerank", post(rerank))
        .route("/v1/models", get(list_models))
        // Claude
        .route("/v1/messages", post(claude_messages))
        // Gemini: `{model}:generateContent` / `{model}:streamGenerateContent`
        .route("/v1beta/models/{*name}", post(gemini_post))
        .layer(middleware::from_fn_with_state(state.clone(), proxy_auth))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

async fn proxy_auth(
    State(state): State<ProxyState>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let request_id = uuid::Uuid::new_v4().simple().to_string();
    let format = format_for_path(req.uri().path());

    // Extract before stripping.
    let key = extract_user_key(req.headers(), req.uri().query());
    // Caller credentials never travel past this point.
    strip_downstream_auth_headers(req.headers_mut());
    strip_downstream_auth_query(req.uri_mut());

    let Some(key) = key else {
        let err = RelayError::local(401, "missing_api_key", "no api key provided");
        return error_response(&err, format);
    };
    let caller = match state.engine.authenticate(&key).await {
        Ok(caller) => caller,
        Err(err) => {
            debug!(event = "caller_rejected", request_id = %request_id, status = err.status);
            return error_response(&err, format);
        }
    };

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user_id = caller.info.user_id;
    req.extensions_mut().insert(caller);

    let started = Instant::now();
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    info!(
        event = "relay_request",
        request_id = %request_id,
        method = %method,
        path = %path,
        user_id,
        status = resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64
    );
    resp
}

fn format_for_path(path: &str) -> RelayFormat {
    if path.starts_with("/v1/messages") {
        RelayFormat::Claude
    } else if path.starts_with("/v1beta/") {
        RelayFormat::Gemini
    } else {
        RelayFormat::OpenAI
    }
}

fn strip_downstream_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove("x-goog-api-key");
}

fn strip_downstream_auth_query(uri: &mut axum::http::Uri) {
    let Some(q) = uri.query() else { return };

    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(q) else {
        return;
    };

    let filtered: Vec<(String, String)> = pairs.into_iter().filter(|(k, _)| k != "key").collect();

    let new_q = match serde_urlencoded::to_string(&filtered) {
        Ok(s) => s,
        Err(_) => return,
    };

    let path = uri.path();
    let new_uri_str = if new_q.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{new_q}")
    };
    if let Ok(new_uri) = new_uri_str.parse() {
        *uri = new_uri;
    }
}

/// Caller key lookup order: `Authorization: Bearer`, `x-api-key`,
/// `x-goog-api-key`, then `?key=`.
fn extract_user_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        let prefix = "Bearer ";
        if s.len() > prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = s[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name)
            && let Ok(s) = value.to_str()
        {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }

    let q = query?;
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok()?;
    pairs
        .into_iter()
        .find(|(k, _)| k == "key")
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ---- OpenAI family ----

async fn chat_completions(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    relay_json(
        &state,
        &caller,
        &body,
        RelayMode::ChatCompletions,
        RelayFormat::OpenAI,
        RelayRequest::Chat,
    )
    .await
}

/// Legacy completions share the chat shape; `prompt` rides along untouched.
async fn completions(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    relay_json(
        &state,
        &caller,
        &body,
        RelayMode::Completions,
        RelayFormat::OpenAI,
        RelayRequest::Chat,
    )
    .await
}

async fn embeddings(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    relay_json(
        &state,
        &caller,
        &body,
        RelayMode::Embeddings,
        RelayFormat::OpenAI,
        RelayRequest::Embedding,
    )
    .await
}

async fn image_generations(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    relay_json(
        &state,
        &caller,
        &body,
        RelayMode::ImagesGenerations,
        RelayFormat::OpenAI,
        |req: ImageGenerationRequest| RelayRequest::Image(ImageRequest::Generation(req)),
    )
    .await
}

async fn image_edits(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = RelayRequest::Image(ImageRequest::Edit {
        content_type: content_type(&headers),
        body,
    });
    dispatch(&state, &caller, request, RelayMode::ImagesEdits, RelayFormat::OpenAI).await
}

async fn audio_speech(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    relay_json(
        &state,
        &caller,
        &body,
        RelayMode::AudioSpeech,
        RelayFormat::OpenAI,
        |req: SpeechRequest| RelayRequest::Audio(AudioRequest::Speech(req)),
    )
    .await
}

async fn audio_transcriptions(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = RelayRequest::Audio(AudioRequest::Form {
        content_type: content_type(&headers),
        body,
    });
    dispatch(&state, &caller, request, RelayMode::AudioTranscription, RelayFormat::OpenAI).await
}

async fn audio_translations(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = RelayRequest::Audio(AudioRequest::Form {
        content_type: content_type(&headers),
        body,
    });
    dispatch(&state, &caller, request, RelayMode::AudioTranslation, RelayFormat::OpenAI).await
}

async fn rerank(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    relay_json(
        &state,
        &caller,
        &body,
        RelayMode::Rerank,
        RelayFormat::OpenAI,
        |req: RerankRequest| RelayRequest::Rerank(req),
    )
    .await
}

async fn list_models(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
) -> Response {
    let models = state.engine.models(&caller);
    (StatusCode::OK, axum::Json(ModelList::from_ids(models, "onerelay"))).into_response()
}

// ---- Claude ----

async fn claude_messages(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    relay_json(
        &state,
        &caller,
        &body,
        RelayMode::ClaudeMessages,
        RelayFormat::Claude,
        |req: CreateMessageRequest| RelayRequest::Claude(req),
    )
    .await
}

// ---- Gemini ----

async fn gemini_post(
    State(state): State<ProxyState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let format = RelayFormat::Gemini;
    let Some((model, stream)) = gemini_action(&name) else {
        let err = RelayError::local(
            404,
            "unsupported_action",
            format!("unsupported model action {name}"),
        );
        return error_response(&err, format);
    };
    let request: GenerateContentRequest = match parse_body(&body, format) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    let chat = match transform_request(model, request, stream) {
        Ok(chat) => chat,
        Err(err) => {
            let err = RelayError::local(400, "invalid_request", err.to_string());
            return error_response(&err, format);
        }
    };
    dispatch(&state, &caller, RelayRequest::Chat(chat), RelayMode::GeminiGenerate, format).await
}

/// Splits `gemini-2.0-flash:streamGenerateContent` into model and stream flag.
fn gemini_action(name: &str) -> Option<(&str, bool)> {
    let name = name.trim_start_matches('/');
    let name = name.strip_prefix("models/").unwrap_or(name);
    let (model, action) = name.rsplit_once(':')?;
    if model.is_empty() {
        return None;
    }
    match action {
        "generateContent" => Some((model, false)),
        "streamGenerateContent" => Some((model, true)),
        _ => None,
    }
}

// ---- shared plumbing ----

async fn relay_json<T, F>(
    state: &ProxyState,
    caller: &Caller,
    body: &[u8],
    mode: RelayMode,
    format: RelayFormat,
    wrap: F,
) -> Response
where
    T: DeserializeOwned,
    F: FnOnce(T) -> RelayRequest,
{
    match parse_body::<T>(body, format) {
        Ok(request) => dispatch(state, caller, wrap(request), mode, format).await,
        Err(resp) => resp,
    }
}

async fn dispatch(
    state: &ProxyState,
    caller: &Caller,
    request: RelayRequest,
    mode: RelayMode,
    format: RelayFormat,
) -> Response {
    let meta = match request.meta(mode, format) {
        Ok(meta) => meta,
        Err(err) => return error_response(&err, format),
    };
    match state.engine.relay(caller, request, meta).await {
        Ok(RelayResponse::Batch {
            status,
            content_type,
            body,
        }) => batch_response(status, &content_type, body),
        Ok(RelayResponse::Stream { rx }) => sse_response(rx),
        Err(err) => error_response(&err, format),
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8], format: RelayFormat) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|err| {
        let err = RelayError::local(400, "invalid_request", format!("invalid request body: {err}"));
        error_response(&err, format)
    })
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Claude callers get the Claude envelope; everyone else the OpenAI one.
fn error_response(err: &RelayError, format: RelayFormat) -> Response {
    let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = err.to_json_bytes(format == RelayFormat::Claude);
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

fn batch_response(status: u16, content_type: &str, body: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    if let Ok(value) = HeaderValue::from_str(content_type) {
        builder = builder.header(header::CONTENT_TYPE, value);
    }
    builder.body(Body::from(body)).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(wrap_sse_stream_with_heartbeat(rx)).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        // Hint common reverse proxies to avoid buffering SSE responses.
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
        })
}

fn wrap_sse_stream_with_heartbeat(mut upstream_rx: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(SSE_BUFFER);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate tick; first heartbeat should be sent after the interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn user_key_sources_in_order() {
        let all = headers(&[
            ("authorization", "Bearer sk-bearer"),
            ("x-api-key", "sk-claude"),
            ("x-goog-api-key", "sk-goog"),
        ]);
        assert_eq!(extract_user_key(&all, Some("key=sk-query")).as_deref(), Some("sk-bearer"));

        let claude = headers(&[("x-api-key", " sk-claude "), ("x-goog-api-key", "sk-goog")]);
        assert_eq!(extract_user_key(&claude, None).as_deref(), Some("sk-claude"));

        let goog = headers(&[("authorization", "Basic abc"), ("x-goog-api-key", "sk-goog")]);
        assert_eq!(extract_user_key(&goog, None).as_deref(), Some("sk-goog"));

        let none = HeaderMap::new();
        assert_eq!(
            extract_user_key(&none, Some("alt=sse&key=sk-query")).as_deref(),
            Some("sk-query")
        );
        assert_eq!(extract_user_key(&none, Some("key=")), None);
        assert_eq!(extract_user_key(&none, None), None);
    }

    #[test]
    fn key_is_removed_from_query() {
        let mut uri: axum::http::Uri = "/v1beta/models/g:streamGenerateContent?alt=sse&key=sk-1"
            .parse()
            .unwrap();
        strip_downstream_auth_query(&mut uri);
        assert_eq!(uri.to_string(), "/v1beta/models/g:streamGenerateContent?alt=sse");

        let mut uri: axum::http::Uri = "/v1/models?key=sk-1".parse().unwrap();
        strip_downstream_auth_query(&mut uri);
        assert_eq!(uri.to_string(), "/v1/models");
    }

    #[test]
    fn gemini_actions() {
        assert_eq!(
            gemini_action("gemini-2.0-flash:generateContent"),
            Some(("gemini-2.0-flash", false))
        );
        assert_eq!(
            gemini_action("models/gemini-2.0-flash:streamGenerateContent"),
            Some(("gemini-2.0-flash", true))
        );
        assert_eq!(gemini_action("gemini-2.0-flash:countTokens"), None);
        assert_eq!(gemini_action(":generateContent"), None);
        assert_eq!(gemini_action("gemini-2.0-flash"), None);
    }

    #[test]
    fn error_envelope_follows_caller_family() {
        assert_eq!(format_for_path("/v1/messages"), RelayFormat::Claude);
        assert_eq!(format_for_path("/v1beta/models/x:generateContent"), RelayFormat::Gemini);
        assert_eq!(format_for_path("/v1/chat/completions"), RelayFormat::OpenAI);

        let err = RelayError::local(403, "model_not_allowed", "no");
        let resp = error_response(&err, RelayFormat::Claude);
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn heartbeat_wrapper_forwards_until_close() {
        let (tx, rx) = mpsc::channel(4);
        let mut wrapped = wrap_sse_stream_with_heartbeat(rx);
        tx.send(Bytes::from_static(b"data: 1\n\n")).await.unwrap();
        tx.send(Bytes::from_static(b"data: 2\n\n")).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        while let Some(chunk) = wrapped.recv().await {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"data: 1\n\ndata: 2\n\n");
    }
}
