//! Session orchestration: agent container lifecycle.
//!
//! The orchestrator owns create-or-resume for the per-session agent
//! container and hands off to the ingress gateway once the agent is
//! confirmed live. All engine operations are idempotent and the container
//! names are deterministic, so concurrent or repeated starts converge on one
//! container instead of erroring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use log::{info, warn};

use crate::config::SessionConfig;
use crate::container::{EngineGateway, RunSpec};
use crate::ingress::IngressGateway;

use super::models::{
    Session, SessionStatus, StopOutcome, agent_container_name, ingress_container_name,
};
use super::repository::SessionRepository;

/// Path of the terminal WebSocket endpoint behind the ingress.
const WS_PATH: &str = "/ws";

/// Workspace mount point inside the agent container.
const WORKSPACE_TARGET: &str = "/workspace";

/// Options for a session start.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Restart the container process even if the container exists stopped.
    pub reset: bool,
    /// Sub-directory of the configured workspace root to mount.
    pub workspace_suffix: Option<String>,
}

/// What a caller needs to reach the started session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StartResult {
    pub port: u16,
    pub ws_path: String,
    pub container_name: String,
}

/// Orchestrates agent containers for sessions.
#[derive(Clone)]
pub struct SessionOrchestrator {
    engine: Arc<EngineGateway>,
    ingress: IngressGateway,
    repo: SessionRepository,
    config: SessionConfig,
    state_dir: PathBuf,
}

impl SessionOrchestrator {
    pub fn new(
        engine: Arc<EngineGateway>,
        ingress: IngressGateway,
        repo: SessionRepository,
        config: SessionConfig,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            engine,
            ingress,
            repo,
            config,
            state_dir,
        }
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    /// Start (or resume) the session's agent container and its ingress.
    pub async fn start(
        &self,
        user_id: &str,
        session_id: &str,
        opts: StartOptions,
    ) -> Result<StartResult> {
        let session = self
            .repo
            .get(session_id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or_else(|| anyhow!("session not found: {session_id}"))?;

        // Idempotency fast path for duplicate UI-triggered starts: an active
        // session returns its cached resolution without touching the engine.
        if session.is_active()
            && let (Some(port), Some(container_name)) = (session.port, session.container_name.clone())
        {
            return Ok(StartResult {
                port: port as u16,
                ws_path: session.ws_path.unwrap_or_else(|| WS_PATH.to_string()),
                container_name,
            });
        }

        self.repo
            .update_status(session_id, SessionStatus::Starting)
            .await?;

        match self.start_inner(session_id, &opts).await {
            Ok(result) => Ok(result),
            Err(err) => {
                let _ = self.repo.mark_failed(session_id, &err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn start_inner(&self, session_id: &str, opts: &StartOptions) -> Result<StartResult> {
        let workspace = resolve_workspace(
            self.config.workspace_root.as_deref(),
            opts.workspace_suffix.as_deref(),
        )?;

        let agent_name = agent_container_name(session_id);

        match self.engine.is_running(&agent_name).await? {
            None => {
                self.create_agent_container(session_id, &agent_name, workspace.as_deref())
                    .await?
            }
            Some(false) if opts.reset => {
                // A reset means the caller wants a fresh process inside the
                // same container.
                self.engine.restart(&agent_name).await?;
            }
            Some(false) => {
                self.engine.start(&agent_name).await?;
            }
            Some(true) => {}
        }

        if self.engine.is_running(&agent_name).await? != Some(true) {
            bail!("agent container {agent_name} did not reach running state");
        }

        // The ingress rebuild involves an ephemeral port bind that can lag
        // behind container creation; one retry covers it.
        let port = match self.ingress.run(session_id).await {
            Ok(port) => port,
            Err(err) => {
                warn!("ingress setup for {session_id} failed, retrying once: {err:#}");
                self.ingress.run(session_id).await?
            }
        };

        self.repo
            .mark_running(session_id, port, WS_PATH, &agent_name)
            .await?;

        info!("session {session_id} running: {agent_name} behind port {port}");
        Ok(StartResult {
            port,
            ws_path: WS_PATH.to_string(),
            container_name: agent_name,
        })
    }

    /// Create the agent container from scratch, with conflict fallback.
    ///
    /// "Name already in use" can mean either "healthy but stopped" or
    /// "broken leftover"; the orchestrator assumes neither. It first tries
    /// to start the existing container, then force-removes and re-runs.
    async fn create_agent_container(
        &self,
        session_id: &str,
        agent_name: &str,
        workspace: Option<&Path>,
    ) -> Result<()> {
        let dirs = self.ensure_state_dirs(session_id)?;
        self.ingress.setup().await?;

        let spec = self.agent_spec(agent_name, &dirs, workspace);

        match self.engine.run(&spec).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => {
                warn!("agent container {agent_name} already exists, trying start: {err}");
                if let Err(start_err) = self.engine.start(agent_name).await {
                    warn!("start of existing {agent_name} failed, recreating: {start_err}");
                    self.engine.safe_remove(agent_name).await?;
                    self.engine
                        .run(&spec)
                        .await
                        .context("recreating agent container after removal")?;
                }
                Ok(())
            }
            Err(err) => Err(err).context("creating agent container"),
        }
    }

    fn agent_spec(&self, agent_name: &str, dirs: &StateDirs, workspace: Option<&Path>) -> RunSpec {
        let mut spec = RunSpec::new(&self.config.image)
            .name(agent_name)
            // The agent joins the same internal network the ingress forwards on.
            .network(self.ingress.internal_network())
            .env("TERMINAL_PORT", self.config.terminal_port.to_string())
            // Engine-in-engine: the agent can drive the host engine.
            .env("DOCKER_HOST", "unix:///var/run/docker.sock")
            .mount(self.config.engine_socket.clone(), "/var/run/docker.sock", false)
            .mount(dirs.state.display().to_string(), "/var/lib/skiff", false)
            .mount(dirs.config.display().to_string(), "/etc/skiff", true)
            .mount(dirs.certs.display().to_string(), "/usr/local/share/skiff-certs", true);

        if let Some(ref proxy) = self.config.egress_proxy_url {
            spec = spec
                .env("HTTP_PROXY", proxy)
                .env("HTTPS_PROXY", proxy)
                .env("NO_PROXY", "localhost,127.0.0.1");
        }
        if let Some(ref token) = self.config.git_token {
            spec = spec.env("GIT_TOKEN", token);
        }
        if let Some(workspace) = workspace {
            spec = spec.mount(workspace.display().to_string(), WORKSPACE_TARGET, false);
        }
        spec
    }

    fn ensure_state_dirs(&self, session_id: &str) -> Result<StateDirs> {
        let base = self.state_dir.join(session_id);
        let dirs = StateDirs {
            state: base.join("state"),
            config: base.join("config"),
            certs: base.join("certs"),
        };
        for dir in [&dirs.state, &dirs.config, &dirs.certs] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating state dir {}", dir.display()))?;
        }
        Ok(dirs)
    }

    /// Tear down a session's containers. Failures are reported in the
    /// outcome rather than thrown, so the caller can update the UI.
    pub async fn stop(&self, session_id: &str) -> Result<StopOutcome> {
        let mut problems = Vec::new();

        if let Err(err) = self.ingress.remove(session_id).await {
            problems.push(format!(
                "removing {}: {err:#}",
                ingress_container_name(session_id)
            ));
        }

        let agent_name = agent_container_name(session_id);
        if let Err(err) = self.engine.safe_remove(&agent_name).await {
            problems.push(format!("removing {agent_name}: {err}"));
        }

        if problems.is_empty() {
            self.repo.mark_stopped(session_id).await?;
            info!("session {session_id} stopped");
            Ok(StopOutcome {
                removed: true,
                detail: None,
            })
        } else {
            let detail = problems.join("; ");
            warn!("session {session_id} teardown incomplete: {detail}");
            Ok(StopOutcome {
                removed: false,
                detail: Some(detail),
            })
        }
    }

    /// List a user's sessions, reconciling `running` rows against live
    /// engine state. A row whose container died is reported (and persisted)
    /// as stopped instead of lying to the caller.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions = self.repo.list_for_user(user_id).await?;
        let mut reconciled = Vec::with_capacity(sessions.len());
        for mut session in sessions {
            if session.status == SessionStatus::Running {
                let agent_name = agent_container_name(&session.id);
                match self.engine.is_running(&agent_name).await {
                    Ok(Some(true)) => {}
                    Ok(_) => {
                        warn!(
                            "session {} marked running but {agent_name} is gone; reconciling",
                            session.id
                        );
                        let _ = self.repo.mark_stopped(&session.id).await;
                        session.status = SessionStatus::Stopped;
                    }
                    Err(err) => warn!("could not reconcile session {}: {err}", session.id),
                }
            }
            reconciled.push(session);
        }
        Ok(reconciled)
    }
}

struct StateDirs {
    state: PathBuf,
    config: PathBuf,
    certs: PathBuf,
}

/// Reject workspace suffixes that could escape the root.
///
/// Traversal segments and separators are always rejected, even when the
/// joined path would still land inside the root.
pub fn validate_workspace_suffix(suffix: &str) -> Result<()> {
    if suffix.is_empty() {
        bail!("workspace suffix cannot be empty");
    }
    if suffix.contains("..") || suffix.contains('/') || suffix.contains('\\') {
        bail!("workspace suffix '{suffix}' contains path traversal or separators");
    }
    Ok(())
}

/// Resolve the workspace mount for a session. No configured root means no
/// workspace mount at all.
fn resolve_workspace(root: Option<&Path>, suffix: Option<&str>) -> Result<Option<PathBuf>> {
    let Some(root) = root else {
        return Ok(None);
    };
    let Some(suffix) = suffix.filter(|s| !s.is_empty()) else {
        return Ok(Some(root.to_path_buf()));
    };
    validate_workspace_suffix(suffix)?;
    let resolved = root.join(suffix);
    if !resolved.is_dir() {
        bail!("workspace {} is not a directory", resolved.display());
    }
    Ok(Some(resolved))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_traversal_is_always_rejected() {
        for bad in ["..", "../x", "a/../b", "a/b", "a\\b", "..\\up"] {
            assert!(validate_workspace_suffix(bad).is_err(), "accepted {bad:?}");
        }
        assert!(validate_workspace_suffix("project-1").is_ok());
        assert!(validate_workspace_suffix("my_dir.v2").is_ok());
    }

    #[test]
    fn no_root_means_no_mount() {
        assert_eq!(resolve_workspace(None, Some("anything")).unwrap(), None);
    }

    #[test]
    fn bare_root_is_mounted_without_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_workspace(Some(dir.path()), None).unwrap();
        assert_eq!(resolved.as_deref(), Some(dir.path()));
    }

    #[test]
    fn suffix_resolves_against_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("proj")).unwrap();
        let resolved = resolve_workspace(Some(dir.path()), Some("proj")).unwrap();
        assert_eq!(resolved.unwrap(), dir.path().join("proj"));
    }

    #[test]
    fn missing_suffix_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_workspace(Some(dir.path()), Some("absent")).is_err());
    }

    #[test]
    fn traversal_rejected_even_if_it_would_resolve_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        // "a/../a" lands inside the root but must still be rejected.
        assert!(resolve_workspace(Some(dir.path()), Some("a/../a")).is_err());
    }
}
