use crate::aggregator::{AggregateOutcome, StreamTarget};
use crate::constants::{STREAM_ID_HEADER, WIRE_CHANNEL_CAPACITY};
use crate::health;
use crate::ingress::ChatRequest;
use crate::logging::request_id_middleware;
use crate::main_helper::AppState;
use crate::types::*;
use crate::wire::{encode_line, WireEvent};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::Instrument;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(STREAM_ID_HEADER)]);

    Router::new()
        .route("/api/chat", post(post_chat).get(resume_chat))
        .route("/api/chat/:stream_id/cancel", post(cancel_chat))
        .route("/api/messages/:message_id", get(get_message))
        .route("/api/messages/:message_id/watch", get(watch_message))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .nest_service("/api/files", ServeDir::new(&state.args.upload_dir))
        .layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state)
}

fn event_stream_response(stream_id: &StreamId, body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(stream_id.as_str()) {
        headers.insert(STREAM_ID_HEADER, value);
    }
    response
}

async fn post_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response> {
    request.validate()?;
    let thread_id = request.thread_metadata.thread_id.clone();
    let stream_id = request.stream_id.clone();
    let message_id = request.response_message_id.clone();

    tracing::info!(
        "[🌐 -> ⚙️ ] Chat request: thread {} | response {} | stream {} | model {}{}",
        thread_id.short(),
        message_id.short(),
        stream_id.short(),
        request.model,
        if request.is_regeneration { " | regeneration" } else { "" }
    );

    let previous_stream = claim_response_message(&state, &request).await?;

    // Publishing reserves the stream id, so a concurrent duplicate stops here.
    let (wire_tx, wire_rx) = mpsc::channel(WIRE_CHANNEL_CAPACITY);
    state.registry.publish(
        stream_id.clone(),
        ReceiverStream::new(wire_rx).map(|event| encode_line(&event)),
    )?;

    if !request.is_regeneration {
        if let Some(user) = request.latest_user_message() {
            state
                .store
                .upsert(Message::new(
                    user.id.clone(),
                    thread_id.clone(),
                    Role::User,
                    MessageStatus::Done,
                    user.parts.clone(),
                    request.model.clone(),
                ))
                .await?;
        }
    }
    let mut placeholder = Message::new(
        message_id.clone(),
        thread_id,
        Role::Assistant,
        MessageStatus::Pending,
        Vec::new(),
        request.model.clone(),
    );
    placeholder.resumable_stream_id = Some(stream_id.clone());
    state.store.upsert(placeholder).await?;

    if let Some(previous) = previous_stream {
        if state.active.cancel(&previous) {
            tracing::info!(
                "[🌐 -> ⚙️ ] Stream {} superseded by {}",
                previous.short(),
                stream_id.short()
            );
        }
    }

    let cancel = CancellationToken::new();
    let generation = request.to_generation_request();
    let provider_stream = match state.provider.stream(&generation, cancel.clone()).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("[⚙️  -> ☁️ ] Provider {} refused the request: {}", state.provider.name(), e);
            let patch = MessagePatch {
                status: Some(MessageStatus::Error),
                server_error: Some(ServerError {
                    kind: ServerErrorKind::Provider,
                    message: e.inner.to_string(),
                }),
                resumable_stream_id: Some(None),
                expected_stream_id: Some(stream_id.clone()),
                ..MessagePatch::default()
            };
            if let Err(write_err) = state.store.patch(&message_id, patch).await {
                tracing::error!("[⚙️  -> 💾] Could not record provider failure: {}", write_err);
            }
            let _ = wire_tx.send(WireEvent::Error(e.inner.to_string())).await;
            return Err(e);
        }
    };

    state.active.register(stream_id.clone(), cancel.clone());

    let span = tracing::info_span!(
        "stream",
        stream_id = %stream_id.short(),
        message_id = %message_id.short()
    );
    let target = StreamTarget {
        message_id,
        stream_id: stream_id.clone(),
        owner: request.owner(),
    };
    let task_state = state.clone();
    let max_duration = Duration::from_secs(state.args.max_stream_secs);
    state.tasks.spawn(
        async move {
            let run = task_state
                .aggregator
                .run(target, provider_stream, wire_tx, cancel.clone());
            tokio::pin!(run);
            let report = tokio::select! {
                report = &mut run => report,
                _ = tokio::time::sleep(max_duration) => {
                    tracing::warn!("Stream exceeded {:?}; cancelling", max_duration);
                    cancel.cancel();
                    run.await
                }
            };
            task_state.active.remove(&stream_id);
            if report.outcome != AggregateOutcome::Completed {
                tracing::warn!("Stream ended early: {}", report.outcome.as_str());
            }
        }
        .instrument(span),
    );

    match state.registry.resume(&request.stream_id, 0) {
        Some(body) => Ok(event_stream_response(&request.stream_id, Body::from_stream(body))),
        None => Err(ChatwireError::internal("stream vanished before the first read").into()),
    }
}

/// Refuses a request that would overwrite a response it has no claim on.
/// Returns the stream the response message is currently attached to.
async fn claim_response_message(state: &AppState, request: &ChatRequest) -> Result<Option<StreamId>> {
    let existing = match state.store.get(&request.response_message_id).await? {
        Some(m) => m,
        None => return Ok(None),
    };
    if existing.resumable_stream_id.as_ref() == Some(&request.stream_id) {
        return Err(ChatwireError::Conflict(format!(
            "stream {} already started",
            request.stream_id
        ))
        .into());
    }
    if existing.status.is_terminal() && !request.is_regeneration {
        return Err(ChatwireError::Conflict(format!(
            "message {} is already {}",
            request.response_message_id,
            existing.status.as_str()
        ))
        .into());
    }
    Ok(existing.resumable_stream_id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeQuery {
    stream_id: Option<String>,
    #[serde(default)]
    offset: usize,
}

async fn resume_chat(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResumeQuery>,
) -> Result<Response> {
    let stream_id = match query.stream_id {
        Some(id) if !id.is_empty() => StreamId::from(id),
        _ => return Err(ChatwireError::InvalidRequest("streamId is required".to_string()).into()),
    };
    match state.registry.resume(&stream_id, query.offset) {
        Some(body) => {
            tracing::info!(
                "[🌐 -> 🖥️ ] Resuming stream {} at byte {}",
                stream_id.short(),
                query.offset
            );
            Ok(event_stream_response(&stream_id, Body::from_stream(body)))
        }
        None => Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "Stream is already done" })),
        )
            .into_response()),
    }
}

async fn cancel_chat(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let stream_id = StreamId::from(stream_id);
    if !state.active.cancel(&stream_id) {
        return Err(ChatwireError::NotFound(format!("no active stream {}", stream_id)).into());
    }
    tracing::info!("[🖥️  -> ⚙️ ] Client cancelled stream {}", stream_id.short());
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
) -> Result<Json<Message>> {
    let message_id = MessageId::from(message_id);
    match state.store.get(&message_id).await? {
        Some(message) => Ok(Json(message)),
        None => Err(ChatwireError::NotFound(format!("message {}", message_id)).into()),
    }
}

/// Server-sent events carrying the persisted record each time it changes.
async fn watch_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
) -> Result<Response> {
    let rx = state.store.subscribe(&MessageId::from(message_id)).await?;
    let events = WatchStream::new(rx).filter_map(|message| async move {
        message.map(|m| Event::default().event("message").json_data(&m))
    });
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}
