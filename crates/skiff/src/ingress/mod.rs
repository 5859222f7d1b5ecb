//! Per-session ingress (reverse-proxy) containers.
//!
//! Each running session gets an nginx container that terminates the terminal
//! WebSocket protocol and forwards to the agent container's address on the
//! internal network. The agent's address can change across restarts, which
//! silently orphans an old proxy config, so `run` probes the existing
//! container and rebuilds it whenever the bound port or the target address is
//! stale, rather than creating once and handling failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};

use crate::config::IngressConfig;
use crate::container::{EngineGateway, RunSpec};
use crate::retry::{self, Schedule};
use crate::session::{agent_container_name, ingress_container_name};

/// Port nginx listens on inside the ingress container.
const INGRESS_LISTEN_PORT: u16 = 80;

/// Attempts made to resolve the engine-assigned host port after a rebuild.
const PORT_RESOLVE_ATTEMPTS: u32 = 3;
const PORT_RESOLVE_DELAY: Duration = Duration::from_millis(500);

/// Manages reverse-proxy containers in front of agent containers.
#[derive(Clone)]
pub struct IngressGateway {
    engine: Arc<EngineGateway>,
    config: IngressConfig,
    conf_dir: PathBuf,
    terminal_port: u16,
}

impl IngressGateway {
    pub fn new(
        engine: Arc<EngineGateway>,
        config: IngressConfig,
        conf_dir: PathBuf,
        terminal_port: u16,
    ) -> Self {
        Self {
            engine,
            config,
            conf_dir,
            terminal_port,
        }
    }

    /// Name of the internal network agent containers join.
    pub fn internal_network(&self) -> &str {
        &self.config.internal_network
    }

    /// Ensure the internal (non-externally-routable) network and the
    /// ingress-facing network exist. Idempotent.
    pub async fn setup(&self) -> Result<()> {
        self.engine
            .network_create(&self.config.internal_network, true)
            .await
            .context("creating internal network")?;
        self.engine
            .network_create(&self.config.ingress_network, false)
            .await
            .context("creating ingress network")?;
        Ok(())
    }

    /// Path of the generated nginx config for a session.
    pub fn conf_path(&self, session_id: &str) -> PathBuf {
        self.conf_dir
            .join(format!("{}.conf", ingress_container_name(session_id)))
    }

    /// Ensure a working ingress container for the session and return its
    /// bound host port. Reuses a healthy container; force-removes and
    /// recreates when the container is down, the port is unresolvable, or
    /// the proxy config no longer points at the agent's current address.
    pub async fn run(&self, session_id: &str) -> Result<u16> {
        let agent_name = agent_container_name(session_id);
        let ingress_name = ingress_container_name(session_id);

        let agent_addr = self
            .engine
            .network_address(&agent_name, &self.config.internal_network)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "cannot resolve address of {} on network {}",
                    agent_name,
                    self.config.internal_network
                )
            })?;

        let rendered = render_config(&agent_addr, self.terminal_port);
        let conf_path = self.conf_path(session_id);

        if self.engine.is_running(&ingress_name).await? == Some(true)
            && let Some(port) = self
                .engine
                .resolved_host_port(&ingress_name, INGRESS_LISTEN_PORT)
                .await?
            && std::fs::read_to_string(&conf_path)
                .map(|existing| existing == rendered)
                .unwrap_or(false)
        {
            debug!("reusing ingress {ingress_name} on port {port}");
            return Ok(port);
        }

        info!("rebuilding ingress {ingress_name} -> {agent_addr}:{}", self.terminal_port);
        self.engine.safe_remove(&ingress_name).await?;

        std::fs::create_dir_all(&self.conf_dir)
            .with_context(|| format!("creating ingress conf dir {}", self.conf_dir.display()))?;
        std::fs::write(&conf_path, &rendered)
            .with_context(|| format!("writing ingress config {}", conf_path.display()))?;

        let spec = RunSpec::new(&self.config.image)
            .name(&ingress_name)
            .network(&self.config.ingress_network)
            .auto_port(INGRESS_LISTEN_PORT)
            .mount(
                conf_path.display().to_string(),
                "/etc/nginx/conf.d/default.conf",
                true,
            );
        self.engine.run(&spec).await.context("running ingress container")?;
        self.engine
            .network_connect(&self.config.internal_network, &ingress_name)
            .await
            .context("connecting ingress to internal network")?;

        let port = self.bound_port(&ingress_name).await?;
        info!("ingress {ingress_name} bound on host port {port}");
        Ok(port)
    }

    /// Remove a session's ingress container and its generated config.
    pub async fn remove(&self, session_id: &str) -> Result<()> {
        let ingress_name = ingress_container_name(session_id);
        self.engine.safe_remove(&ingress_name).await?;

        let conf_path = self.conf_path(session_id);
        if let Err(err) = std::fs::remove_file(&conf_path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!("could not delete {}: {err}", conf_path.display());
        }
        Ok(())
    }

    /// The engine may take a moment to report the ephemeral binding after
    /// `run` returns, so resolution is retried on a short schedule.
    async fn bound_port(&self, name: &str) -> Result<u16> {
        retry::with_backoff(
            Schedule::fixed(PORT_RESOLVE_ATTEMPTS, PORT_RESOLVE_DELAY),
            |_err: &anyhow::Error| true,
            || async {
                match self.engine.resolved_host_port(name, INGRESS_LISTEN_PORT).await? {
                    Some(port) => Ok(port),
                    None => Err(anyhow!("no host port bound yet for {name}")),
                }
            },
        )
        .await
    }
}

/// Render the nginx config forwarding to the agent's terminal server, with
/// protocol-upgrade headers wired for the WebSocket handshake.
fn render_config(agent_addr: &str, terminal_port: u16) -> String {
    format!(
        r#"server {{
    listen {INGRESS_LISTEN_PORT};

    location / {{
        proxy_pass http://{agent_addr}:{terminal_port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_set_header Host $host;
        proxy_read_timeout 86400s;
        proxy_send_timeout 86400s;
    }}
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_targets_agent_address() {
        let conf = render_config("10.89.0.7", 7681);
        assert!(conf.contains("proxy_pass http://10.89.0.7:7681;"));
        assert!(conf.contains("listen 80;"));
    }

    #[test]
    fn config_wires_upgrade_headers() {
        let conf = render_config("10.0.0.2", 7681);
        assert!(conf.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(conf.contains(r#"proxy_set_header Connection "upgrade";"#));
    }

    #[test]
    fn rendered_config_changes_with_address() {
        assert_ne!(render_config("10.0.0.2", 7681), render_config("10.0.0.3", 7681));
    }
}
