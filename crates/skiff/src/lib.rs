//! Skiff: per-user containerized agent sessions, a browser terminal bridge,
//! and a task scheduler running agent tasks in ephemeral containers.

pub mod api;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod container;
pub mod db;
pub mod ingress;
pub mod portproxy;
pub mod retry;
pub mod session;
pub mod tasks;

use std::sync::Arc;

use anyhow::Result;
use log::warn;

use crate::auth::Authenticator;
use crate::bridge::{Hub, TerminalBridge, UpstreamResolver};
use crate::config::AppConfig;
use crate::container::EngineGateway;
use crate::db::Database;
use crate::ingress::IngressGateway;
use crate::portproxy::PortProxyManager;
use crate::session::{SessionOrchestrator, SessionRepository};
use crate::tasks::{TaskRepository, TaskScheduler};

/// Process-lifetime context owning every service, with explicit start and
/// shutdown. Constructed once in `main`.
pub struct AppContext {
    pub config: AppConfig,
    pub db: Database,
    pub engine: Arc<EngineGateway>,
    pub sessions: SessionOrchestrator,
    pub port_proxy: PortProxyManager,
    pub tasks: TaskScheduler,
    pub bridge: TerminalBridge,
    pub hub: Arc<Hub>,
    pub auth: Authenticator,
}

impl AppContext {
    /// Wire up the database, engine gateway, and services.
    pub async fn initialize(config: AppConfig) -> Result<Self> {
        let db = Database::new(&config.database_path()).await?;
        let engine = Arc::new(EngineGateway::new(&config.engine));

        let session_repo = SessionRepository::new(db.pool().clone());
        let ingress = IngressGateway::new(
            engine.clone(),
            config.ingress.clone(),
            config.ingress_conf_dir(),
            config.session.terminal_port,
        );
        let sessions = SessionOrchestrator::new(
            engine.clone(),
            ingress,
            session_repo.clone(),
            config.session.clone(),
            config.session_state_dir(),
        );

        let port_proxy = PortProxyManager::new(
            engine.clone(),
            config.port_proxy.clone(),
            config.ingress.internal_network.clone(),
        );

        let tasks = TaskScheduler::new(
            TaskRepository::new(db.pool().clone()),
            engine.clone(),
            config.tasks.clone(),
            config.session.workspace_root.clone(),
        );

        let resolver = UpstreamResolver::new(
            engine.clone(),
            &config.bridge,
            config.ingress.internal_network.clone(),
            config.session.terminal_port,
        );
        let bridge = TerminalBridge::new(session_repo, resolver, &config.bridge);

        let auth = Authenticator::new(&config.auth)?;

        Ok(Self {
            config,
            db,
            engine,
            sessions,
            port_proxy,
            tasks,
            bridge,
            hub: Arc::new(Hub::new()),
            auth,
        })
    }

    /// Start background work: the task scheduler loops.
    pub fn start(&self) {
        self.tasks.start();
    }

    /// Stop background work. In-flight task containers finish on their own.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }
}

/// Best-effort warning when the engine binary looks unusable at startup.
pub async fn check_engine(engine: &EngineGateway) {
    if let Err(err) = engine.list_names(&[]).await {
        warn!("container engine not reachable at startup: {err}");
    }
}
