//! Request Front-End (spec §4.J): exactly the four routes spec.md §6 names.
//! Grounded on `gproxy-router::proxy::proxy_router`'s axum `Router` shape and
//! its `wrap_sse_stream_with_heartbeat` idiom, narrowed to the single Kiro
//! upstream family — no provider path prefix, no Gemini, no OAuth/admin
//! surface here (the OAuth loopback listener is wired separately, in the
//! gateway binary).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use kiro_core::ProxyEngine;
use kiro_protocol::canonical::CanonicalStreamEvent;
use kiro_protocol::claude::MessagesRequest;
use kiro_protocol::openai::{ChatCompletionRequest, ModelEntry, ModelListResponse};
use kiro_store::Store;
use kiro_transform::{claude_to_canonical, openai_to_canonical};
use kiro_transform::outbound_claude::ClaudeStreamEncoder;
use kiro_transform::outbound_openai::OpenAiStreamEncoder;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::error::{Dialect, RequestError, render};

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";

#[derive(Clone)]
pub struct RouterState {
    pub engine: Arc<ProxyEngine>,
    pub store: Store,
}

pub fn build_router(engine: Arc<ProxyEngine>, store: Store) -> Router {
    let state = RouterState { engine, store };
    Router::new()
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/messages", post(claude_messages))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ApiKeyQuery {
    api_key: Option<String>,
}

fn extract_key(headers: &HeaderMap, query: &ApiKeyQuery) -> Option<String> {
    if let Some(v) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = v.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    if let Some(v) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    query.api_key.clone()
}

/// Authenticates, checks the daily limit, and records usage on success
/// (spec §4.J steps 1-2, 5). Returns the validated row id; the caller still
/// owns model validation and translation.
async fn authenticate(state: &RouterState, headers: &HeaderMap, query: &ApiKeyQuery) -> Result<i64, RequestError> {
    let Some(key) = extract_key(headers, query) else {
        return Err(RequestError::MissingApiKey);
    };
    let (row, exceeded) = state
        .store
        .validate_api_key(&key)
        .await
        .map_err(|e| RequestError::Gateway(e.into()))?
        .ok_or(RequestError::InvalidApiKey)?;
    if exceeded {
        return Err(RequestError::DailyLimitExceeded);
    }
    Ok(row.id)
}

async fn openai_chat_completions(
    State(state): State<RouterState>,
    headers: HeaderMap,
    Query(query): Query<ApiKeyQuery>,
    Json(body): Json<ChatCompletionRequest>,
) -> Response {
    let key_id = match authenticate(&state, &headers, &query).await {
        Ok(id) => id,
        Err(err) => return render(Dialect::OpenAi, err),
    };
    if !kiro_upstream::is_supported(&body.model) {
        return render(Dialect::OpenAi, RequestError::UnsupportedModel(body.model));
    }
    let canonical = openai_to_canonical(&body);
    if let Err(err) = state.store.record_api_key_usage(key_id).await {
        warn!(error = %err, "failed to record api key usage");
    }

    if canonical.stream {
        stream_response(Dialect::OpenAi, state.engine, canonical, body.model).await
    } else {
        match state.engine.execute_nonstream(&canonical).await {
            Ok(result) => {
                let encoder = OpenAiStreamEncoder::new(
                    format!("chatcmpl-{}", uuid::Uuid::new_v4()),
                    body.model,
                    time::OffsetDateTime::now_utc().unix_timestamp(),
                );
                Json(encoder.into_response(result.text, result.tool_calls, result.usage)).into_response()
            }
            Err(err) => render(Dialect::OpenAi, err.into()),
        }
    }
}

async fn claude_messages(
    State(state): State<RouterState>,
    headers: HeaderMap,
    Query(query): Query<ApiKeyQuery>,
    Json(body): Json<MessagesRequest>,
) -> Response {
    let key_id = match authenticate(&state, &headers, &query).await {
        Ok(id) => id,
        Err(err) => return render(Dialect::Claude, err),
    };
    if !kiro_upstream::is_supported(&body.model) {
        return render(Dialect::Claude, RequestError::UnsupportedModel(body.model));
    }
    let canonical = claude_to_canonical(&body);
    if let Err(err) = state.store.record_api_key_usage(key_id).await {
        warn!(error = %err, "failed to record api key usage");
    }

    if canonical.stream {
        stream_response(Dialect::Claude, state.engine, canonical, body.model).await
    } else {
        match state.engine.execute_nonstream(&canonical).await {
            Ok(result) => {
                let encoder = ClaudeStreamEncoder::new(format!("msg_{}", uuid::Uuid::new_v4()), body.model);
                Json(encoder.into_response(result.text, result.tool_calls, result.usage)).into_response()
            }
            Err(err) => render(Dialect::Claude, err.into()),
        }
    }
}

async fn stream_response(
    dialect: Dialect,
    engine: Arc<ProxyEngine>,
    canonical: kiro_protocol::canonical::CanonicalRequest,
    model: String,
) -> Response {
    let mut inner = match engine.execute_stream(canonical).await {
        Ok(stream) => stream,
        Err(err) => return render(dialect, err.into()),
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        match dialect {
            Dialect::OpenAi => {
                let mut encoder = OpenAiStreamEncoder::new(
                    format!("chatcmpl-{}", uuid::Uuid::new_v4()),
                    model,
                    time::OffsetDateTime::now_utc().unix_timestamp(),
                );
                drive_stream(&mut inner, &tx, |event| encoder.push(event)).await;
            }
            Dialect::Claude => {
                let mut encoder = ClaudeStreamEncoder::new(format!("msg_{}", uuid::Uuid::new_v4()), model);
                for event in encoder.start() {
                    if tx.send(render_sse(&event)).await.is_err() {
                        return;
                    }
                }
                drive_stream(&mut inner, &tx, |event| encoder.push(event)).await;
            }
        }
    });

    let rx = wrap_sse_stream_with_heartbeat(rx);
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response())
}

async fn drive_stream(
    inner: &mut kiro_upstream::CanonicalEventStream,
    tx: &tokio::sync::mpsc::Sender<Bytes>,
    mut push: impl FnMut(CanonicalStreamEvent) -> Vec<kiro_protocol::sse::SseEvent>,
) {
    while let Some(event) = inner.next().await {
        let is_terminal = matches!(event, CanonicalStreamEvent::Done { .. } | CanonicalStreamEvent::Error(_));
        for sse in push(event) {
            if tx.send(render_sse(&sse)).await.is_err() {
                return;
            }
        }
        if is_terminal {
            return;
        }
    }
}

fn render_sse(event: &kiro_protocol::sse::SseEvent) -> Bytes {
    let mut out = String::new();
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    out.push_str("data: ");
    out.push_str(&event.data);
    out.push_str("\n\n");
    Bytes::from(out)
}

fn wrap_sse_stream_with_heartbeat(mut upstream_rx: tokio::sync::mpsc::Receiver<Bytes>) -> tokio::sync::mpsc::Receiver<Bytes> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else { break };
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

async fn list_models() -> Json<ModelListResponse> {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    Json(ModelListResponse {
        object: "list",
        data: kiro_upstream::SUPPORTED_MODELS
            .iter()
            .map(|id| ModelEntry {
                id: id.to_string(),
                object: "model",
                created: now,
                owned_by: "kiro",
            })
            .collect(),
    })
}

#[derive(serde::Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: i64,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
    })
}
