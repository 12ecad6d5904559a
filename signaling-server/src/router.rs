//! HTTP and WebSocket surface.
//!
//! REST endpoints carry request/response bodies as JSON; the WebSocket
//! endpoint is a read-only push channel onto a mailbox's message stream
//! (clients still `POST /connection/send` to write — writes and the
//! live-push path stay separate so a dropped socket never loses a message).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, Request, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::SignalingError;
use crate::hub::CloseReason;
use crate::mailbox::Message as MailboxMessage;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/session/close", post(session_close))
        .route("/connection/init", post(connection_init))
        .route("/connection/join", post(connection_join))
        .route("/connection/send", post(connection_send))
        .route("/connection/recv", post(connection_recv))
        .route("/ws/{mailbox_id}", get(ws_upgrade))
        .layer(axum::extract::DefaultBodyLimit::max(state.config.max_message_size_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(state.clone(), enforce_request_deadline))
        .layer(middleware::from_fn_with_state(state.clone(), tally_error_status))
        .with_state(state)
}

/// Server-side request deadline (§5): the `/ws/*` handler itself returns
/// as soon as the upgrade completes — the long-lived socket loop runs in
/// its own spawned task afterward — so this bounds every route's initial
/// response, subscribe loops included, without cutting a live WebSocket
/// connection short.
async fn enforce_request_deadline(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let deadline = Duration::from_secs(state.config.request_timeout_secs);
    match tokio::time::timeout(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => SignalingError::RequestTimeout.into_response(),
    }
}

/// Records every non-2xx response status for the shutdown tally
/// (`AppState::log_error_counts`) — ambient observability, not a new
/// feature surface (there is no `/metrics` endpoint).
async fn tally_error_status(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    state.record_status(response.status().as_u16());
    response
}

fn client_ip(addr: SocketAddr) -> String {
    addr.ip().to_string()
}

// ── /health ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions_backend: &'static str,
    /// Approximate live-session gauge; see `SessionRegistry::active_count`.
    sessions: u64,
    /// Approximate live-mailbox gauge; see `MailboxStore::active_count`.
    mailboxes: u64,
    /// Live WebSocket subscribers, summed across all mailboxes.
    subscribers: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions_backend: if state.config.redis_url.is_some() { "redis" } else { "memory" },
        sessions: state.sessions.active_count(),
        mailboxes: state.mailboxes.active_count(),
        subscribers: state.hub.total_subscribers(),
    })
}

// ── /register ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    device_label: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    client_id: Uuid,
    session_token: String,
    display_name: String,
    heartbeat_interval_secs: u64,
}

async fn register(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, SignalingError> {
    state
        .register_limiter
        .check("register", &client_ip(addr), state.config.register_rate_per_min)
        .map_err(|retry_after_secs| SignalingError::RateLimited { retry_after_secs })?;

    if req.device_label.len() > 128 {
        return Err(SignalingError::Validation("device_label too long".into()));
    }

    let registered = state.sessions.register(req.device_label).await?;
    Ok(Json(RegisterResponse {
        client_id: registered.client_id,
        session_token: registered.session_token,
        display_name: registered.display_name,
        heartbeat_interval_secs: registered.heartbeat_interval_secs,
    }))
}

// ── auth header shared by every other endpoint ───────────────────────────

#[derive(Deserialize)]
struct AuthedRequest<T> {
    client_id: Uuid,
    session_token: String,
    #[serde(flatten)]
    body: T,
}

async fn require_rate(state: &AppState, client_id: Uuid) -> Result<(), SignalingError> {
    state
        .connection_limiter
        .check("connection", &client_id.to_string(), state.config.connection_rate_per_sec)
        .map_err(|retry_after_secs| SignalingError::RateLimited { retry_after_secs })
}

fn map_auth_err(_: crate::session::AuthError) -> SignalingError {
    SignalingError::AuthFailed
}

// ── /heartbeat ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HeartbeatRequest {}

#[derive(Serialize)]
struct HeartbeatResponse {
    next_heartbeat_secs: u64,
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthedRequest<HeartbeatRequest>>,
) -> Result<Json<HeartbeatResponse>, SignalingError> {
    require_rate(&state, req.client_id).await?;
    let next_heartbeat_secs = state
        .sessions
        .heartbeat(req.client_id, &req.session_token)
        .await
        .map_err(map_auth_err)?;
    Ok(Json(HeartbeatResponse { next_heartbeat_secs }))
}

// ── /session/close ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SessionCloseRequest {}

async fn session_close(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthedRequest<SessionCloseRequest>>,
) -> Result<StatusCode, SignalingError> {
    state
        .sessions
        .close(req.client_id, &req.session_token)
        .await
        .map_err(map_auth_err)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── /connection/init ─────────────────────────────────────────────────────
//
// The initiator generates `rendezvous_id_b64` and the pairing secret
// entirely on its own side (see `crypto` module docs) and only ever
// hands this server the public id — never the secret, never a derived
// key, never the SAS. This server's job is just to bind that id to a
// fresh mailbox so a peer holding the id can find it.

#[derive(Deserialize)]
struct ConnectionInitRequest {
    rendezvous_id_b64: String,
}

#[derive(Serialize)]
struct ConnectionInitResponse {
    mailbox_id: Uuid,
}

async fn connection_init(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthedRequest<ConnectionInitRequest>>,
) -> Result<Json<ConnectionInitResponse>, SignalingError> {
    require_rate(&state, req.client_id).await?;
    state
        .sessions
        .authenticate(req.client_id, &req.session_token)
        .await
        .map_err(map_auth_err)?;

    let mailbox_id = state.mailboxes.create(req.client_id).await?;
    state
        .rendezvous
        .create(req.client_id, mailbox_id, &req.body.rendezvous_id_b64)
        .await?;

    Ok(Json(ConnectionInitResponse { mailbox_id }))
}

// ── /connection/join ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ConnectionJoinRequest {
    token_b64: String,
}

#[derive(Serialize)]
struct ConnectionJoinResponse {
    mailbox_id: Uuid,
}

async fn connection_join(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthedRequest<ConnectionJoinRequest>>,
) -> Result<Json<ConnectionJoinResponse>, SignalingError> {
    require_rate(&state, req.client_id).await?;
    state
        .sessions
        .authenticate(req.client_id, &req.session_token)
        .await
        .map_err(map_auth_err)?;

    let joined = state.rendezvous.claim(&req.body.token_b64).await?;
    state.mailboxes.add_participant(joined.mailbox_id, req.client_id).await?;

    Ok(Json(ConnectionJoinResponse { mailbox_id: joined.mailbox_id }))
}

// ── /connection/send ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ConnectionSendRequest {
    mailbox_id: Uuid,
    ciphertext_b64: String,
}

async fn connection_send(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthedRequest<ConnectionSendRequest>>,
) -> Result<StatusCode, SignalingError> {
    require_rate(&state, req.client_id).await?;
    state
        .sessions
        .authenticate(req.client_id, &req.session_token)
        .await
        .map_err(map_auth_err)?;

    if req.body.ciphertext_b64.len() > state.config.max_message_size_bytes {
        return Err(SignalingError::PayloadTooLarge);
    }

    let message = state
        .mailboxes
        .append(req.body.mailbox_id, req.client_id, req.body.ciphertext_b64.clone())
        .await?;

    state.hub.publish(req.body.mailbox_id, message);

    Ok(StatusCode::ACCEPTED)
}

// ── /connection/recv ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ConnectionRecvRequest {
    mailbox_id: Uuid,
    /// Omit (or send `null`) to fetch the full backlog. `seq` is
    /// zero-indexed, so `0` can't double as an "everything" sentinel the
    /// way it could if messages were numbered from 1.
    #[serde(default)]
    after_seq: Option<u64>,
}

#[derive(Serialize)]
struct ConnectionRecvResponse {
    messages: Vec<MailboxMessage>,
}

async fn connection_recv(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthedRequest<ConnectionRecvRequest>>,
) -> Result<Json<ConnectionRecvResponse>, SignalingError> {
    require_rate(&state, req.client_id).await?;
    state
        .sessions
        .authenticate(req.client_id, &req.session_token)
        .await
        .map_err(map_auth_err)?;

    let messages = state.mailboxes.read_since(req.body.mailbox_id, req.body.after_seq).await?;
    Ok(Json(ConnectionRecvResponse { messages }))
}

// ── /ws/{mailbox_id} ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WsAuthQuery {
    client_id: Uuid,
    session_token: String,
}

async fn ws_upgrade(
    Path(mailbox_id): Path<Uuid>,
    Query(auth): Query<WsAuthQuery>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, SignalingError> {
    require_rate(&state, auth.client_id).await?;
    state
        .sessions
        .authenticate(auth.client_id, &auth.session_token)
        .await
        .map_err(map_auth_err)?;
    if !state.mailboxes.exists(mailbox_id).await {
        return Err(SignalingError::MailboxGone);
    }

    let rx = state
        .hub
        .subscribe(
            mailbox_id,
            auth.client_id,
            state.config.subscriber_channel_capacity,
            state.config.max_subscribers_per_mailbox,
        )
        .map_err(|_| SignalingError::ParticipantLimitExceeded)?;

    Ok(ws.on_upgrade(move |socket| push_mailbox_updates(socket, state, mailbox_id, auth.client_id, rx)))
}

/// `ws.close` reason a client should see when the server ends the
/// subscription itself — `1000` for a plain shutdown, 4000/4001 for the
/// two server-initiated reasons the hub can report.
fn close_frame(reason: Option<CloseReason>) -> WsMessage {
    match reason {
        Some(reason) => WsMessage::Close(Some(CloseFrame {
            code: reason.code(),
            reason: reason.reason().into(),
        })),
        None => WsMessage::Close(Some(CloseFrame {
            code: 1000,
            reason: "normal".into(),
        })),
    }
}

/// Send one mailbox message as a text frame, if it encodes. Returns
/// whether the socket is still usable afterward.
async fn send_message(socket: &mut WebSocket, message: &MailboxMessage) -> bool {
    let Ok(encoded) = serde_json::to_string(message) else { return true };
    socket.send(WsMessage::Text(encoded.into())).await.is_ok()
}

async fn push_mailbox_updates(
    mut socket: WebSocket,
    state: Arc<AppState>,
    mailbox_id: Uuid,
    client_id: Uuid,
    mut rx: tokio::sync::mpsc::Receiver<MailboxMessage>,
) {
    // §4.4: "Hub snapshots current messages with seq > last_delivered
    // (initially 0) and pushes them in order before accepting fan-out."
    // We're already registered with the hub by this point (subscribe
    // happened in `ws_upgrade`, before the snapshot read), so a message
    // appended in between can legitimately show up in both the snapshot
    // and the live channel — `last_seq_sent` dedupes that overlap instead
    // of ever missing or doubling a message.
    let mut last_seq_sent: Option<u64> = None;
    if let Ok(backlog) = state.mailboxes.read_since(mailbox_id, None).await {
        for message in &backlog {
            if !send_message(&mut socket, message).await {
                state.hub.unsubscribe(mailbox_id, client_id);
                return;
            }
            last_seq_sent = Some(message.seq);
        }
    }

    let close_reason = loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(message) => {
                        if last_seq_sent.is_some_and(|last| message.seq <= last) {
                            continue;
                        }
                        if !send_message(&mut socket, &message).await {
                            break None;
                        }
                        last_seq_sent = Some(message.seq);
                    }
                    // The hub dropped our sender — either this mailbox
                    // closed out from under us, or we fell behind and got
                    // evicted. Either way it recorded why.
                    None => break state.hub.take_close_reason(mailbox_id, client_id),
                }
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break None,
                    Some(Ok(_)) => {}
                }
            }
        }
    };
    state.hub.unsubscribe(mailbox_id, client_id);
    let _ = socket.send(close_frame(close_reason)).await;
}
