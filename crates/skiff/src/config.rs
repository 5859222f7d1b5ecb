//! Application configuration.
//!
//! Layered: built-in defaults, then an optional TOML file, then `SKIFF_*`
//! environment variables (`SKIFF_TASKS__CEILING=4` style nesting).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub bind_addr: String,
    /// Base directory for the database, session state, and generated files.
    pub data_dir: PathBuf,
    /// Database file override. Defaults to `{data_dir}/skiff.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    pub engine: EngineConfig,
    pub session: SessionConfig,
    pub ingress: IngressConfig,
    pub port_proxy: PortProxyConfig,
    pub bridge: BridgeConfig,
    pub tasks: TaskConfig,
    pub auth: AuthConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4600".to_string(),
            data_dir: PathBuf::from("./data"),
            database_path: None,
            engine: EngineConfig::default(),
            session: SessionConfig::default(),
            ingress: IngressConfig::default(),
            port_proxy: PortProxyConfig::default(),
            bridge: BridgeConfig::default(),
            tasks: TaskConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration, merging defaults, an optional TOML file, and
    /// `SKIFF_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        } else if let Some(default_path) = Self::default_config_path()
            && default_path.exists()
        {
            builder = builder.add_source(File::from(default_path).format(FileFormat::Toml));
        }

        builder = builder.add_source(Environment::with_prefix("SKIFF").separator("__"));

        let config = builder.build().context("building configuration")?;
        let mut app: AppConfig = config
            .try_deserialize()
            .context("deserializing configuration")?;
        app.tasks.ceiling = app.tasks.ceiling.max(1);
        Ok(app)
    }

    fn default_config_path() -> Option<PathBuf> {
        let local = PathBuf::from("./skiff.toml");
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir().map(|dir| dir.join("skiff").join("config.toml"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("skiff.db"))
    }

    /// Per-session state directories live under `{data_dir}/sessions`.
    pub fn session_state_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Generated ingress configs live under `{data_dir}/ingress`.
    pub fn ingress_conf_dir(&self) -> PathBuf {
        self.data_dir.join("ingress")
    }
}

/// Container engine CLI settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine binary (`docker` or `podman`).
    pub binary: String,
    /// Fixed timeout for every CLI invocation, in seconds.
    pub command_timeout_secs: u64,
    /// Retry budget for "removal already in progress".
    pub remove_retries: u32,
    /// First retry delay; grows linearly per attempt.
    pub remove_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            command_timeout_secs: 20,
            remove_retries: 5,
            remove_backoff_ms: 200,
        }
    }
}

/// Agent container settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Image for the long-lived agent container.
    pub image: String,
    /// Root under which per-session workspace suffixes resolve. No root
    /// means no workspace mount.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
    /// Egress proxy URL injected as HTTP(S)_PROXY into agent containers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress_proxy_url: Option<String>,
    /// Source-control token injected as GIT_TOKEN when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_token: Option<String>,
    /// Engine socket mounted into agent containers for engine-in-engine use.
    pub engine_socket: String,
    /// Port the in-container terminal server listens on.
    pub terminal_port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image: "skiff-agent:latest".to_string(),
            workspace_root: None,
            egress_proxy_url: None,
            git_token: None,
            engine_socket: "/var/run/docker.sock".to_string(),
            terminal_port: 7681,
        }
    }
}

/// Reverse-proxy (ingress) container settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub image: String,
    /// Internal (non-externally-routable) network shared with agent containers.
    pub internal_network: String,
    /// Network the ingress containers publish ports from.
    pub ingress_network: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            image: "nginx:alpine".to_string(),
            internal_network: "skiff-internal".to_string(),
            ingress_network: "skiff-ingress".to_string(),
        }
    }
}

/// Port-forwarder container settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortProxyConfig {
    pub image: String,
}

impl Default for PortProxyConfig {
    fn default() -> Self {
        Self {
            image: "alpine/socat:latest".to_string(),
        }
    }
}

/// Terminal bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Rounds of upstream connection attempts before giving up.
    pub connect_attempts: u32,
    /// Open-timeout per individual attempt, in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Fixed delay between rounds, in milliseconds.
    pub retry_delay_ms: u64,
    /// Client frames buffered while the upstream connection is being set up.
    pub buffer_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            attempt_timeout_ms: 3000,
            retry_delay_ms: 1000,
            buffer_capacity: 64,
        }
    }
}

/// Task scheduler settings.
///
/// `ceiling` bounds both the admission check and the worker concurrency;
/// a single value so the two cannot drift apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Image for ephemeral task containers.
    pub image: String,
    /// Maximum concurrently running task executions, system-wide.
    pub ceiling: usize,
    /// Seconds between admission ticks.
    pub admission_interval_secs: u64,
    /// Milliseconds between container liveness polls.
    pub poll_interval_ms: u64,
    /// Seconds a task container may run before it is force-removed.
    pub run_timeout_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            image: "skiff-task:latest".to_string(),
            ceiling: 10,
            admission_interval_secs: 60,
            poll_interval_ms: 2000,
            run_timeout_secs: 3600,
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept every connection as a fixed development user.
    pub dev_mode: bool,
    /// HS256 secret for session cookies. Supports `env:VAR_NAME` indirection.
    /// Required when dev_mode is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Cookie carrying the session token.
    pub cookie_name: String,
    /// Allowed CORS origins.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            jwt_secret: None,
            cookie_name: "skiff_session".to_string(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:4600".to_string(),
            ],
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` indirection.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>> {
        match &self.jwt_secret {
            None => Ok(None),
            Some(value) => {
                if let Some(var) = value.strip_prefix("env:") {
                    let secret = std::env::var(var)
                        .with_context(|| format!("reading jwt secret from ${var}"))?;
                    anyhow::ensure!(!secret.is_empty(), "jwt secret ${var} is empty");
                    Ok(Some(secret))
                } else {
                    Ok(Some(value.clone()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.engine.binary, "docker");
        assert_eq!(config.engine.command_timeout_secs, 20);
        assert_eq!(config.tasks.ceiling, 10);
        assert_eq!(config.tasks.poll_interval_ms, 2000);
        assert_eq!(config.bridge.buffer_capacity, 64);
        assert_eq!(config.session.terminal_port, 7681);
        assert_eq!(config.database_path(), PathBuf::from("./data/skiff.db"));
    }

    #[test]
    fn loads_toml_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
bind_addr = "0.0.0.0:9000"

[engine]
binary = "podman"

[tasks]
ceiling = 3
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.engine.binary, "podman");
        assert_eq!(config.tasks.ceiling, 3);
        // Untouched sections keep their defaults.
        assert_eq!(config.ingress.internal_network, "skiff-internal");
    }

    #[test]
    fn jwt_secret_env_indirection() {
        unsafe { std::env::set_var("SKIFF_TEST_SECRET", "s3cret") };
        let auth = AuthConfig {
            jwt_secret: Some("env:SKIFF_TEST_SECRET".to_string()),
            ..Default::default()
        };
        assert_eq!(auth.resolve_jwt_secret().unwrap().as_deref(), Some("s3cret"));
    }
}
