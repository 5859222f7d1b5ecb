//! Upstream connection strategies for the terminal bridge.
//!
//! Container DNS and IP reachability from the bridge process depend on the
//! host's networking mode, and under nested container-in-container setups
//! either can be transiently or structurally broken. Three strategies are
//! tried per round, cheapest first:
//!
//! 1. WebSocket to the container by name (bridge shares the container network).
//! 2. WebSocket to the container's resolved network address (name resolution
//!    gaps).
//! 3. A one-shot local TCP listener piped into `engine exec <name> nc`, then
//!    a WebSocket to that listener (neither name nor address reachable).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::debug;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::BridgeConfig;
use crate::container::EngineGateway;
use crate::retry::{self, Schedule};

use super::protocol::SUBPROTOCOL;

/// Upstream WebSocket stream type shared by all strategies.
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Resolves and opens upstream terminal connections.
#[derive(Clone)]
pub struct UpstreamResolver {
    engine: Arc<EngineGateway>,
    internal_network: String,
    terminal_port: u16,
    attempts: u32,
    attempt_timeout: Duration,
    retry_delay: Duration,
}

impl UpstreamResolver {
    pub fn new(
        engine: Arc<EngineGateway>,
        config: &BridgeConfig,
        internal_network: String,
        terminal_port: u16,
    ) -> Self {
        Self {
            engine,
            internal_network,
            terminal_port,
            attempts: config.connect_attempts,
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Open a WebSocket to the terminal server inside `container_name`,
    /// trying all strategies for up to the configured number of rounds with
    /// a fixed delay between rounds.
    pub async fn connect(&self, container_name: &str) -> Result<UpstreamStream> {
        retry::with_backoff(
            Schedule::fixed(self.attempts, self.retry_delay),
            |_err: &anyhow::Error| true,
            || self.connect_once(container_name),
        )
        .await
    }

    /// One round through the three strategies.
    async fn connect_once(&self, container_name: &str) -> Result<UpstreamStream> {
        let mut failures: Vec<String> = Vec::with_capacity(3);

        let authority = format!("{container_name}:{}", self.terminal_port);
        match self.connect_ws(&authority).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!("upstream by name {authority} failed: {err:#}");
                failures.push(format!("name: {err:#}"));
            }
        }

        match self
            .engine
            .network_address(container_name, &self.internal_network)
            .await
        {
            Ok(Some(addr)) => {
                let authority = format!("{addr}:{}", self.terminal_port);
                match self.connect_ws(&authority).await {
                    Ok(stream) => return Ok(stream),
                    Err(err) => {
                        debug!("upstream by address {authority} failed: {err:#}");
                        failures.push(format!("address: {err:#}"));
                    }
                }
            }
            Ok(None) => failures.push("address: container has no internal address".to_string()),
            Err(err) => failures.push(format!("address: {err}")),
        }

        match self.connect_via_exec(container_name).await {
            Ok(stream) => Ok(stream),
            Err(err) => {
                debug!("upstream via exec relay failed: {err:#}");
                failures.push(format!("exec: {err:#}"));
                Err(anyhow!(
                    "all upstream strategies failed for {container_name}: {}",
                    failures.join("; ")
                ))
            }
        }
    }

    /// Direct WebSocket with the terminal sub-protocol and a per-attempt
    /// open timeout.
    async fn connect_ws(&self, authority: &str) -> Result<UpstreamStream> {
        let url = format!("ws://{authority}/ws");
        let mut request = url
            .clone()
            .into_client_request()
            .context("building upstream request")?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (stream, _response) = tokio::time::timeout(self.attempt_timeout, connect_async(request))
            .await
            .map_err(|_| anyhow!("open of {url} timed out after {:?}", self.attempt_timeout))?
            .with_context(|| format!("opening {url}"))?;
        Ok(stream)
    }

    /// Last resort: a one-shot loopback listener piped into a relay process
    /// executed inside the container.
    async fn connect_via_exec(&self, container_name: &str) -> Result<UpstreamStream> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("binding relay listener")?;
        let local_port = listener.local_addr().context("reading relay address")?.port();

        let engine = self.engine.clone();
        let container = container_name.to_string();
        let terminal_port = self.terminal_port;
        tokio::spawn(async move {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if let Err(err) =
                        pump_through_exec(engine, &container, terminal_port, stream).await
                    {
                        debug!("exec relay for {container} ended: {err:#}");
                    }
                }
                Err(err) => debug!("exec relay accept failed: {err}"),
            }
        });

        self.connect_ws(&format!("127.0.0.1:{local_port}")).await
    }
}

/// Bridge one TCP connection through `exec -i <container> nc` to the
/// terminal port on the container's loopback.
async fn pump_through_exec(
    engine: Arc<EngineGateway>,
    container: &str,
    terminal_port: u16,
    stream: TcpStream,
) -> Result<()> {
    let port = terminal_port.to_string();
    let mut child = engine
        .exec_piped(container, &["nc", "127.0.0.1", port.as_str()])
        .context("spawning relay process")?;

    let mut stdin = child.stdin.take().context("relay stdin unavailable")?;
    let mut stdout = child.stdout.take().context("relay stdout unavailable")?;
    let (mut read_half, mut write_half) = stream.into_split();

    // Either direction ending means the conversation is over; the child is
    // killed rather than waited so a half-closed nc cannot strand the task.
    tokio::select! {
        _ = tokio::io::copy(&mut read_half, &mut stdin) => {}
        _ = tokio::io::copy(&mut stdout, &mut write_half) => {}
    }
    let _ = child.kill().await;
    Ok(())
}
