//! HTTP router and WebSocket endpoint handlers.
//!
//! Three WebSocket endpoints terminate here: the terminal bridge, presence
//! fan-out, and the per-project session list. All of them resolve the
//! caller's identity from the connection's cookie before upgrading; a
//! failed check still completes the upgrade so the policy-violation close
//! code reaches the browser.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use log::warn;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::AppContext;
use crate::auth::Identity;
use crate::bridge::{CLOSE_POLICY_VIOLATION, HubEvent, protocol};

type AppState = Arc<AppContext>;

/// Create the application router.
pub fn create_router(ctx: Arc<AppContext>) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let cors = build_cors_layer(&ctx.config.auth.allowed_origins);

    Router::new()
        .route("/healthz", get(health))
        .route("/terminal/{session_id}", get(terminal_handler))
        .route("/presence/{project_id}", get(presence_handler))
        .route("/sessions/{project_id}", get(sessions_handler))
        .layer(trace_layer)
        .layer(cors)
        .with_state(ctx)
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}

async fn health() -> &'static str {
    "ok"
}

fn cookie_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::COOKIE)?.to_str().ok()
}

/// Terminal bridge endpoint.
async fn terminal_handler(
    State(ctx): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ws = ws.protocols([protocol::SUBPROTOCOL]);
    match ctx.auth.identify(cookie_header(&headers)) {
        Ok(identity) => ws.on_upgrade(move |socket| async move {
            ctx.bridge
                .handle(socket, &identity.user_id, &session_id)
                .await;
        }),
        Err(err) => ws.on_upgrade(move |socket| reject_socket(socket, err.to_string())),
    }
}

/// Presence fan-out endpoint.
async fn presence_handler(
    State(ctx): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match ctx.auth.identify(cookie_header(&headers)) {
        Ok(identity) => identity,
        Err(err) => return ws.on_upgrade(move |socket| reject_socket(socket, err.to_string())),
    };

    match project_access(&ctx, &project_id, &identity).await {
        Ok(()) => ws.on_upgrade(move |socket| run_presence(ctx, socket, project_id, identity)),
        Err(reason) => ws.on_upgrade(move |socket| reject_socket(socket, reason)),
    }
}

/// Per-project session list endpoint.
async fn sessions_handler(
    State(ctx): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match ctx.auth.identify(cookie_header(&headers)) {
        Ok(identity) => identity,
        Err(err) => return ws.on_upgrade(move |socket| reject_socket(socket, err.to_string())),
    };

    match project_access(&ctx, &project_id, &identity).await {
        Ok(()) => ws.on_upgrade(move |socket| run_sessions(ctx, socket, project_id)),
        Err(reason) => ws.on_upgrade(move |socket| reject_socket(socket, reason)),
    }
}

async fn project_access(
    ctx: &AppContext,
    project_id: &str,
    identity: &Identity,
) -> Result<(), String> {
    match ctx
        .sessions
        .repository()
        .is_project_member(project_id, &identity.user_id)
        .await
    {
        Ok(true) => Ok(()),
        Ok(false) => Err("access denied".to_string()),
        Err(err) => {
            warn!("membership check for project {project_id} failed: {err:#}");
            Err("access check failed".to_string())
        }
    }
}

async fn run_presence(ctx: AppState, socket: WebSocket, project_id: String, identity: Identity) {
    let mut subscription = ctx.hub.subscribe(&project_id);
    ctx.hub.broadcast(
        &project_id,
        HubEvent::Joined {
            user_id: identity.user_id.clone(),
        },
    );

    pump_hub_events(socket, &mut subscription.rx).await;

    ctx.hub.unsubscribe(&project_id, subscription.id);
    ctx.hub.broadcast(
        &project_id,
        HubEvent::Left {
            user_id: identity.user_id,
        },
    );
}

async fn run_sessions(ctx: AppState, mut socket: WebSocket, project_id: String) {
    // Snapshot first, then live updates from the hub.
    match ctx.sessions.repository().list_for_project(&project_id).await {
        Ok(sessions) => {
            let event = HubEvent::Sessions { sessions };
            if let Ok(json) = serde_json::to_string(&event)
                && socket.send(Message::Text(json.into())).await.is_err()
            {
                return;
            }
        }
        Err(err) => warn!("session list for project {project_id} failed: {err:#}"),
    }

    let mut subscription = ctx.hub.subscribe(&project_id);
    pump_hub_events(socket, &mut subscription.rx).await;
    ctx.hub.unsubscribe(&project_id, subscription.id);
}

/// Forward hub events to the client until either side goes away.
async fn pump_hub_events(
    socket: WebSocket,
    events: &mut tokio::sync::mpsc::Receiver<HubEvent>,
) {
    let (mut tx, mut rx) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            msg = rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                // Client frames on these sockets are only keepalives.
                _ => {}
            },
        }
    }
}

async fn reject_socket(mut socket: WebSocket, reason: String) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}
