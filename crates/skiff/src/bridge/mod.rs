//! Terminal WebSocket bridge.
//!
//! Per connection: `authenticating -> resolving -> buffering -> bridging ->
//! closed`. Authentication happens in the HTTP layer before the upgrade;
//! everything after lives here. Client frames that arrive while the
//! upstream connection is still being established are buffered and replayed
//! in order — the browser sends its handshake the instant the socket opens,
//! and that frame must not be lost.

mod buffer;
mod hub;
pub mod protocol;
mod upstream;

pub use buffer::PendingBuffer;
pub use hub::{Hub, HubEvent, Subscription};
pub use upstream::{UpstreamResolver, UpstreamStream};

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

use crate::config::BridgeConfig;
use crate::session::{SessionRepository, SessionStatus, agent_container_name};

/// Close code for failed authentication or authorization.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code when every upstream strategy is exhausted.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Bridges browser terminal sockets to in-container terminal servers.
#[derive(Clone)]
pub struct TerminalBridge {
    repo: SessionRepository,
    resolver: UpstreamResolver,
    buffer_capacity: usize,
}

impl TerminalBridge {
    pub fn new(repo: SessionRepository, resolver: UpstreamResolver, config: &BridgeConfig) -> Self {
        Self {
            repo,
            resolver,
            buffer_capacity: config.buffer_capacity,
        }
    }

    /// Drive one browser connection to completion. The caller has already
    /// authenticated `user_id`.
    pub async fn handle(&self, mut socket: WebSocket, user_id: &str, session_id: &str) {
        let container_name = match self.resolve(user_id, session_id).await {
            Ok(name) => name,
            Err(reason) => {
                debug!("terminal connection rejected for {session_id}: {reason}");
                close_socket(&mut socket, CLOSE_POLICY_VIOLATION, &reason).await;
                return;
            }
        };

        let (mut client_tx, mut client_rx) = socket.split();

        // Buffer inbound frames while the upstream connection is set up.
        let mut pending = PendingBuffer::new(self.buffer_capacity);
        let connect = self.resolver.connect(&container_name);
        tokio::pin!(connect);

        let upstream = loop {
            tokio::select! {
                result = &mut connect => break result,
                msg = client_rx.next() => match msg {
                    Some(Ok(frame @ (ClientMessage::Text(_) | ClientMessage::Binary(_)))) => {
                        if !pending.push(frame) {
                            warn!("terminal {session_id}: pre-connect buffer full, dropping frame");
                        }
                    }
                    Some(Ok(ClientMessage::Close(_))) | None => {
                        debug!("terminal {session_id}: client left during connect");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("terminal {session_id}: client error during connect: {err}");
                        return;
                    }
                },
            }
        };

        let upstream = match upstream {
            Ok(stream) => stream,
            Err(err) => {
                warn!("terminal {session_id}: upstream unreachable: {err:#}");
                let _ = client_tx
                    .send(close_message(
                        CLOSE_ABNORMAL,
                        "terminal upstream unreachable",
                    ))
                    .await;
                return;
            }
        };

        let (mut upstream_tx, mut upstream_rx) = upstream.split();

        // Replay buffered frames in original order before relaying live.
        let buffered = pending.len();
        for frame in pending.drain() {
            if upstream_tx.send(client_to_upstream(frame)).await.is_err() {
                warn!("terminal {session_id}: upstream closed during replay");
                return;
            }
        }
        if buffered > 0 {
            debug!("terminal {session_id}: replayed {buffered} buffered frames");
        }

        let session = session_id.to_string();
        let client_to_upstream_relay = async {
            while let Some(msg) = client_rx.next().await {
                match msg {
                    Ok(frame @ (ClientMessage::Text(_) | ClientMessage::Binary(_))) => {
                        if upstream_tx.send(client_to_upstream(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(ClientMessage::Ping(data)) => {
                        if upstream_tx
                            .send(UpstreamMessage::Ping(data))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(ClientMessage::Pong(data)) => {
                        if upstream_tx
                            .send(UpstreamMessage::Pong(data))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(ClientMessage::Close(_)) => break,
                    Err(_) => break,
                }
            }
        };

        let upstream_to_client_relay = async {
            while let Some(msg) = upstream_rx.next().await {
                match msg {
                    Ok(UpstreamMessage::Text(text)) => {
                        if protocol::is_exit_notice(text.as_bytes()) {
                            info!("terminal {session}: remote session ended");
                        }
                        if client_tx
                            .send(ClientMessage::Text(text.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(UpstreamMessage::Binary(data)) => {
                        if protocol::is_exit_notice(&data) {
                            info!("terminal {session}: remote session ended");
                        }
                        if client_tx.send(ClientMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(UpstreamMessage::Ping(data)) => {
                        if client_tx.send(ClientMessage::Ping(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(UpstreamMessage::Pong(data)) => {
                        if client_tx.send(ClientMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(UpstreamMessage::Close(_)) => break,
                    Ok(UpstreamMessage::Frame(_)) => continue,
                    Err(_) => break,
                }
            }
        };

        // Either side closing or erroring terminates the other.
        tokio::select! {
            _ = client_to_upstream_relay => {}
            _ = upstream_to_client_relay => {}
        }
        debug!("terminal {session_id}: bridge closed");
    }

    /// Resolve a session to its agent container, enforcing state and
    /// ownership/share access.
    async fn resolve(&self, user_id: &str, session_id: &str) -> Result<String, String> {
        let session = match self.repo.get(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return Err("session not found".to_string()),
            Err(err) => {
                warn!("terminal {session_id}: session lookup failed: {err:#}");
                return Err("session lookup failed".to_string());
            }
        };

        if session.status != SessionStatus::Running {
            return Err(format!("session is {}", session.status));
        }

        match self.repo.user_has_access(&session, user_id).await {
            Ok(true) => {}
            Ok(false) => return Err("access denied".to_string()),
            Err(err) => {
                warn!("terminal {session_id}: access check failed: {err:#}");
                return Err("access check failed".to_string());
            }
        }

        Ok(session
            .container_name
            .unwrap_or_else(|| agent_container_name(session_id)))
    }
}

/// Convert a client frame to its upstream counterpart, preserving the
/// text/binary flag and frame boundary.
fn client_to_upstream(frame: ClientMessage) -> UpstreamMessage {
    match frame {
        ClientMessage::Text(text) => UpstreamMessage::Text(text.to_string().into()),
        ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
        ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
        ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
        ClientMessage::Close(_) => UpstreamMessage::Close(None),
    }
}

fn close_message(code: u16, reason: &str) -> ClientMessage {
    ClientMessage::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

async fn close_socket(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket.send(close_message(code, reason)).await;
}
