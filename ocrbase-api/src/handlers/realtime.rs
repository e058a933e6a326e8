//! `GET /v1/realtime?job_id=…`: the Realtime Gateway. SSE is the default
//! transport; `GET /v1/realtime/ws` offers the same subscription over a
//! WebSocket, mirroring how `feature-flags::api::sse_endpoint` and
//! `agent-sync`'s streaming handlers sit side by side over one subscribe
//! primitive in the pack this crate is grounded on.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::Stream;
use serde::Deserialize;

use ocrbase_common::bus::{subscribe_and_reconcile, Subscription};
use ocrbase_common::job::JobId;
use ocrbase_common::store::JobStore as _;

use crate::auth::{credential_from_headers, AuthContext};
use crate::error::{ApiError, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RealtimeQuery {
    pub job_id: JobId,
    /// Alternative to header auth — a long-lived SSE/WS connection can't
    /// always carry an Authorization header (e.g. `EventSource` from a
    /// browser).
    pub api_key: Option<String>,
}

async fn authorize(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    query: &RealtimeQuery,
) -> Result<AuthContext> {
    let credential = query
        .api_key
        .clone()
        .or_else(|| credential_from_headers(headers))
        .ok_or(ApiError::Unauthorized)?;
    let auth = state.auth.authenticate(&credential).await?;

    let job = state.store.get(&query.job_id).await?;
    if job.tenant_id != auth.tenant_id {
        return Err(ApiError::NotFound(query.job_id.0.clone()));
    }
    Ok(auth)
}

/// `GET /v1/realtime`.
pub async fn sse(
    State(state): State<AppState>,
    Query(query): Query<RealtimeQuery>,
    headers: axum::http::HeaderMap,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>> {
    authorize(&state, &headers, &query).await?;

    let job_id = query.job_id.clone();
    let keepalive = state.sse_keepalive;
    let bus = state.bus.clone();
    let store = state.store.clone();

    let outcome = subscribe_and_reconcile(&bus, store.as_ref(), &job_id).await?;

    let stream = async_stream::stream! {
        let mut receiver = match outcome {
            Subscription::AlreadyTerminal(event) => {
                yield Ok(to_sse_event(&event));
                return;
            }
            Subscription::Live { receiver, initial } => {
                yield Ok(to_sse_event(&initial));
                receiver
            }
        };

        loop {
            tokio::select! {
                received = receiver.recv() => {
                    match received {
                        Some(event) => {
                            let terminal = event.is_terminal();
                            yield Ok(to_sse_event(&event));
                            if terminal {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(keepalive) => {
                    yield Ok(SseEvent::default().comment("keepalive"));
                }
            }
        }

        bus.cleanup_closed(&job_id);
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive).text("keepalive")))
}

fn to_sse_event(event: &ocrbase_common::job::Event) -> SseEvent {
    SseEvent::default()
        .event(event.type_name())
        .data(serde_json::to_string(event).unwrap_or_default())
}

/// `GET /v1/realtime/ws`.
pub async fn ws(
    State(state): State<AppState>,
    Query(query): Query<RealtimeQuery>,
    headers: axum::http::HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<impl IntoResponse> {
    authorize(&state, &headers, &query).await?;

    let job_id = query.job_id.clone();
    let bus = state.bus.clone();
    let store = state.store.clone();

    Ok(upgrade.on_upgrade(move |socket| async move {
        if let Err(error) = run_ws(socket, bus.clone(), store.as_ref(), job_id.clone()).await {
            tracing::warn!(job_id = %job_id, %error, "realtime websocket closed with an error");
        }
        bus.cleanup_closed(&job_id);
    }))
}

async fn run_ws(
    mut socket: WebSocket,
    bus: std::sync::Arc<ocrbase_common::bus::EventBus>,
    store: &dyn ocrbase_common::store::JobStore,
    job_id: JobId,
) -> std::result::Result<(), ocrbase_common::error::StoreError> {
    let outcome = subscribe_and_reconcile(&bus, store, &job_id).await?;

    let mut receiver = match outcome {
        Subscription::AlreadyTerminal(event) => {
            let _ = socket.send(to_ws_message(&event)).await;
            let _ = socket.close().await;
            return Ok(());
        }
        Subscription::Live { receiver, initial } => {
            if socket.send(to_ws_message(&initial)).await.is_err() {
                return Ok(());
            }
            receiver
        }
    };

    loop {
        tokio::select! {
            received = receiver.recv() => {
                match received {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        if socket.send(to_ws_message(&event)).await.is_err() {
                            break;
                        }
                        if terminal {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(&text) {
                            let pong = ocrbase_common::job::Event::Pong { job_id: job_id.clone() };
                            if socket.send(to_ws_message(&pong)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(25)) => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = socket.close().await;
    Ok(())
}

fn to_ws_message(event: &ocrbase_common::job::Event) -> Message {
    Message::Text(serde_json::to_string(event).unwrap_or_default())
}

/// Client keepalive frames look like `{"type":"ping"}`; anything else on the
/// inbound side is ignored (this channel is otherwise read-only for clients).
fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|s| s.to_owned()))
        .is_some_and(|t| t == "ping")
}
