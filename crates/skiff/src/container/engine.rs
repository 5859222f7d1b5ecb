//! Thin, idempotent wrapper over the container engine CLI.
//!
//! Every mutating operation is a single CLI invocation with a fixed timeout.
//! The engine (docker or podman) is the only source of truth for container
//! state; callers resolve races with retried idempotent operations, never
//! with locks on this side.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tokio::process::{Child, Command};

use super::error::{classify, EngineError, EngineResult};
use super::spec::RunSpec;
use crate::config::EngineConfig;
use crate::retry::{self, Schedule};

/// Gateway to the container engine CLI.
#[derive(Debug, Clone)]
pub struct EngineGateway {
    binary: String,
    command_timeout: Duration,
    remove_retries: u32,
    remove_backoff: Duration,
}

impl EngineGateway {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            remove_retries: config.remove_retries,
            remove_backoff: Duration::from_millis(config.remove_backoff_ms),
        }
    }

    /// Run one CLI invocation, returning stdout on success.
    async fn invoke(&self, args: &[&str]) -> EngineResult<String> {
        let command = format!("{} {}", self.binary, args.first().copied().unwrap_or(""));
        debug!("engine: {} {}", self.binary, args.join(" "));

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| EngineError::Timeout {
                command: command.clone(),
                timeout: self.command_timeout,
            })?
            .map_err(|source| EngineError::Spawn {
                command: command.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(EngineError::Cli {
                command,
                kind: classify(&stderr),
                stderr,
            })
        }
    }

    /// Create and start a container. Returns the engine-assigned container id.
    pub async fn run(&self, spec: &RunSpec) -> EngineResult<String> {
        spec.validate()?;
        let args = spec.to_args();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.invoke(&arg_refs).await?;
        Ok(stdout.trim().to_string())
    }

    pub async fn start(&self, name: &str) -> EngineResult<()> {
        self.invoke(&["start", name]).await.map(|_| ())
    }

    pub async fn restart(&self, name: &str) -> EngineResult<()> {
        self.invoke(&["restart", name]).await.map(|_| ())
    }

    /// Force-remove a container. Not idempotent; see [`safe_remove`].
    ///
    /// [`safe_remove`]: EngineGateway::safe_remove
    pub async fn remove(&self, name: &str) -> EngineResult<()> {
        self.invoke(&["rm", "-f", name]).await.map(|_| ())
    }

    /// Idempotent removal.
    ///
    /// Multiple cleanup paths (session stop, task stop, crash recovery) may
    /// race to delete the same container, so "no such container" is success
    /// and "removal already in progress" is retried with increasing backoff.
    pub async fn safe_remove(&self, name: &str) -> EngineResult<()> {
        let schedule = Schedule::linear(self.remove_retries, self.remove_backoff);
        let result = retry::with_backoff(
            schedule,
            |err: &EngineError| err.is_removal_in_progress(),
            || self.remove(name),
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Tri-state liveness: `Some(true)` running, `Some(false)` stopped,
    /// `None` the container does not exist. "Absent" and "stopped" need
    /// different recovery, so callers must branch on all three.
    pub async fn is_running(&self, name: &str) -> EngineResult<Option<bool>> {
        match self
            .invoke(&["inspect", "--format", "{{.State.Running}}", name])
            .await
        {
            Ok(stdout) => match stdout.trim() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                other => Err(EngineError::Output {
                    command: format!("{} inspect", self.binary),
                    detail: format!("unexpected state '{other}'"),
                }),
            },
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Full inspect document for a container, `None` when absent.
    async fn inspect(&self, name: &str) -> EngineResult<Option<serde_json::Value>> {
        let stdout = match self.invoke(&["inspect", name]).await {
            Ok(stdout) => stdout,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&stdout).map_err(|e| EngineError::Output {
                command: format!("{} inspect", self.binary),
                detail: e.to_string(),
            })?;
        Ok(parsed.as_array().and_then(|a| a.first()).cloned())
    }

    /// The container's address on the given network, `None` when the
    /// container is absent or not attached to that network.
    pub async fn network_address(&self, name: &str, network: &str) -> EngineResult<Option<String>> {
        let Some(doc) = self.inspect(name).await? else {
            return Ok(None);
        };
        let addr = doc
            .pointer(&format!("/NetworkSettings/Networks/{network}/IPAddress"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);
        Ok(addr)
    }

    /// Labels attached to a container, `None` when absent.
    pub async fn labels(&self, name: &str) -> EngineResult<Option<BTreeMap<String, String>>> {
        let Some(doc) = self.inspect(name).await? else {
            return Ok(None);
        };
        let mut labels = BTreeMap::new();
        if let Some(map) = doc.pointer("/Config/Labels").and_then(|v| v.as_object()) {
            for (key, value) in map {
                if let Some(value) = value.as_str() {
                    labels.insert(key.clone(), value.to_string());
                }
            }
        }
        Ok(Some(labels))
    }

    /// Host port the engine bound for a published container port.
    pub async fn resolved_host_port(
        &self,
        name: &str,
        container_port: u16,
    ) -> EngineResult<Option<u16>> {
        let spec = format!("{container_port}/tcp");
        let stdout = match self.invoke(&["port", name, &spec]).await {
            Ok(stdout) => stdout,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        // Lines look like "0.0.0.0:49153" or "[::]:49153"; any line will do.
        for line in stdout.lines() {
            if let Some(port) = line.rsplit(':').next()
                && let Ok(port) = port.trim().parse::<u16>()
            {
                return Ok(Some(port));
            }
        }
        Ok(None)
    }

    /// Combined stdout+stderr log output of a container.
    pub async fn logs(&self, name: &str) -> EngineResult<String> {
        let command = format!("{} logs", self.binary);
        let mut cmd = Command::new(&self.binary);
        cmd.args(["logs", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| EngineError::Timeout {
                command: command.clone(),
                timeout: self.command_timeout,
            })?
            .map_err(|source| EngineError::Spawn {
                command: command.clone(),
                source,
            })?;

        // The engine writes the container's stderr stream to our stderr even
        // on success, so both streams are part of the log text.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(EngineError::Cli {
                command,
                kind: classify(&stderr),
                stderr,
            });
        }
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    /// Spawn `exec -i <name> <args...>` with piped stdio, for callers that
    /// need to stream bytes through a process inside the container.
    pub fn exec_piped(&self, name: &str, args: &[&str]) -> EngineResult<Child> {
        let command = format!("{} exec", self.binary);
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec").arg("-i").arg(name).args(args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd.spawn().map_err(|source| EngineError::Spawn {
            command,
            source,
        })
    }

    /// Create a network, treating "already exists" as success.
    pub async fn network_create(&self, name: &str, internal: bool) -> EngineResult<()> {
        let mut args = vec!["network", "create"];
        if internal {
            args.push("--internal");
        }
        args.push(name);
        match self.invoke(&args).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Connect a container to a network, treating "already connected" as success.
    pub async fn network_connect(&self, network: &str, name: &str) -> EngineResult<()> {
        match self.invoke(&["network", "connect", network, name]).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Names of all containers (running or not) matching the label filters.
    pub async fn list_names(&self, label_filters: &[(&str, &str)]) -> EngineResult<Vec<String>> {
        let mut filters: Vec<String> = Vec::with_capacity(label_filters.len());
        for (key, value) in label_filters {
            filters.push(format!("label={key}={value}"));
        }
        let mut args = vec!["ps", "-a", "--format", "{{.Names}}"];
        for filter in &filters {
            args.push("--filter");
            args.push(filter.as_str());
        }
        let stdout = self.invoke(&args).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Log-and-continue removal for best-effort cleanup paths.
    pub async fn remove_quietly(&self, name: &str) {
        if let Err(err) = self.safe_remove(name).await {
            warn!("failed to remove container {name}: {err}");
        }
    }
}
