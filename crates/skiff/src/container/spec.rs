//! Run specification for container creation.
//!
//! `RunSpec` is the single input to [`EngineGateway::run`](super::EngineGateway::run).
//! It renders to CLI arguments in one place so the argument layout is
//! unit-testable without an engine present.

use std::collections::BTreeMap;

use super::error::{EngineError, EngineResult};

/// Host side of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPort {
    /// Let the engine pick an ephemeral host port.
    Auto,
    /// Bind a specific host port.
    Fixed(u16),
}

/// Published port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub host: HostPort,
    pub container: u16,
}

/// Bind mount with access mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Configuration for creating a container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: Option<String>,
    pub image: String,
    pub network: Option<String>,
    pub ports: Vec<PortBinding>,
    /// Sorted map so rendered args are deterministic.
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub entrypoint: Option<String>,
    pub args: Vec<String>,
    pub detach: bool,
}

impl RunSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            detach: true,
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Publish a container port on a fixed host port.
    pub fn port(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortBinding {
            host: HostPort::Fixed(host),
            container,
        });
        self
    }

    /// Publish a container port on an engine-chosen ephemeral host port.
    pub fn auto_port(mut self, container: u16) -> Self {
        self.ports.push(PortBinding {
            host: HostPort::Auto,
            container,
        });
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn mount(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        read_only: bool,
    ) -> Self {
        self.mounts.push(Mount {
            source: source.into(),
            target: target.into(),
            read_only,
        });
        self
    }

    pub fn entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Validate all fields before handing the spec to the engine.
    pub fn validate(&self) -> EngineResult<()> {
        validate_image_name(&self.image)?;
        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }
        for key in self.env.keys() {
            validate_env_key(key)?;
        }
        for mount in &self.mounts {
            validate_mount_path(&mount.source, "host")?;
            validate_mount_path(&mount.target, "container")?;
        }
        Ok(())
    }

    /// Render to `run` CLI arguments, image and command last.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".into()];
        if self.detach {
            args.push("-d".into());
        }
        if let Some(ref name) = self.name {
            args.push("--name".into());
            args.push(name.clone());
        }
        if let Some(ref network) = self.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        for port in &self.ports {
            args.push("-p".into());
            match port.host {
                // `-p <container>` alone asks the engine for an ephemeral host port.
                HostPort::Auto => args.push(port.container.to_string()),
                HostPort::Fixed(host) => args.push(format!("{}:{}", host, port.container)),
            }
        }
        for (key, value) in &self.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &self.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for mount in &self.mounts {
            args.push("-v".into());
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push(format!("{}:{}:{}", mount.source, mount.target, mode));
        }
        if let Some(ref entrypoint) = self.entrypoint {
            args.push("--entrypoint".into());
            args.push(entrypoint.clone());
        }
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Validate an OCI image reference: `[registry/][namespace/]name[:tag][@digest]`.
pub fn validate_image_name(image: &str) -> EngineResult<()> {
    if image.is_empty() {
        return Err(EngineError::InvalidInput("image name cannot be empty".into()));
    }
    if image.len() > 256 {
        return Err(EngineError::InvalidInput(
            "image name exceeds 256 characters".into(),
        ));
    }
    let valid = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid) {
        return Err(EngineError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    if image.contains("..") {
        return Err(EngineError::InvalidInput(
            "image name cannot contain '..'".into(),
        ));
    }
    Ok(())
}

/// Validate a container name: alphanumeric plus `-`/`_`, leading alphanumeric.
pub fn validate_container_name(name: &str) -> EngineResult<()> {
    if name.is_empty() {
        return Err(EngineError::InvalidInput(
            "container name cannot be empty".into(),
        ));
    }
    if name.len() > 128 {
        return Err(EngineError::InvalidInput(
            "container name exceeds 128 characters".into(),
        ));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() && first != '_' {
        return Err(EngineError::InvalidInput(format!(
            "container name '{name}' must start with an alphanumeric character"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(EngineError::InvalidInput(format!(
            "container name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

fn validate_env_key(key: &str) -> EngineResult<()> {
    if key.is_empty() {
        return Err(EngineError::InvalidInput(
            "environment variable key cannot be empty".into(),
        ));
    }
    let mut chars = key.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(EngineError::InvalidInput(format!(
            "environment variable key '{key}' must start with a letter or underscore"
        )));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(EngineError::InvalidInput(format!(
            "environment variable key '{key}' contains invalid characters"
        )));
    }
    Ok(())
}

fn validate_mount_path(path: &str, side: &str) -> EngineResult<()> {
    if path.is_empty() {
        return Err(EngineError::InvalidInput(format!(
            "{side} mount path cannot be empty"
        )));
    }
    if path.contains('\0') {
        return Err(EngineError::InvalidInput(format!(
            "{side} mount path cannot contain null bytes"
        )));
    }
    // Mount strings are passed as single argv entries, but colons would break
    // the source:target:mode split and shell metacharacters have no business
    // in a path we generate.
    let dangerous = [':', '$', '`', ';', '|', '&', '<', '>', '"', '\'', '\n', '\r'];
    for c in dangerous {
        if path.contains(c) {
            return Err(EngineError::InvalidInput(format!(
                "{side} mount path contains forbidden character '{c}'"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_minimal_run() {
        let spec = RunSpec::new("nginx:alpine").name("skiff-ingress-abc");
        assert_eq!(
            spec.to_args(),
            vec!["run", "-d", "--name", "skiff-ingress-abc", "nginx:alpine"]
        );
    }

    #[test]
    fn renders_auto_and_fixed_ports() {
        let spec = RunSpec::new("img").auto_port(80).port(8080, 7681);
        let args = spec.to_args();
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "80");
        assert_eq!(args[p + 2], "-p");
        assert_eq!(args[p + 3], "8080:7681");
    }

    #[test]
    fn renders_labels_env_and_mounts() {
        let spec = RunSpec::new("img")
            .label("type", "port-proxy")
            .label("sessionId", "s1")
            .env("HTTP_PROXY", "http://egress:3128")
            .mount("/data/s1", "/workspace", false)
            .mount("/data/certs", "/certs", true);
        let args = spec.to_args();
        assert!(args.windows(2).any(|w| w == ["--label", "sessionId=s1"]));
        assert!(args.windows(2).any(|w| w == ["--label", "type=port-proxy"]));
        assert!(
            args.windows(2)
                .any(|w| w == ["-e", "HTTP_PROXY=http://egress:3128"])
        );
        assert!(args.windows(2).any(|w| w == ["-v", "/data/s1:/workspace:rw"]));
        assert!(args.windows(2).any(|w| w == ["-v", "/data/certs:/certs:ro"]));
    }

    #[test]
    fn image_and_command_come_last() {
        let spec = RunSpec::new("alpine/socat")
            .arg("tcp-listen:80,fork,reuseaddr")
            .arg("tcp-connect:10.0.0.2:80");
        let args = spec.to_args();
        assert_eq!(args[args.len() - 3], "alpine/socat");
        assert_eq!(args[args.len() - 1], "tcp-connect:10.0.0.2:80");
    }

    #[test]
    fn validate_rejects_bad_inputs() {
        assert!(RunSpec::new("img$(whoami)").validate().is_err());
        assert!(RunSpec::new("img").name("bad;name").validate().is_err());
        assert!(RunSpec::new("img").env("1BAD", "x").validate().is_err());
        assert!(
            RunSpec::new("img")
                .mount("/ok", "/also:bad", false)
                .validate()
                .is_err()
        );
        assert!(
            RunSpec::new("ubuntu:latest")
                .name("skiff-agent-abc")
                .env("GIT_TOKEN", "t")
                .mount("/data", "/workspace", false)
                .validate()
                .is_ok()
        );
    }
}
