//! Per-mapping port forwarder containers.
//!
//! A mapping exposes one container port on one host port through a socat
//! forwarder container. The forwarder's labels are the only state: listing
//! is a pure read of engine-managed labels, so there is no database row to
//! drift from the actual container.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use serde::Serialize;

use crate::config::PortProxyConfig;
use crate::container::{EngineGateway, RunSpec};

/// Label keys carried by forwarder containers.
const LABEL_TYPE: &str = "type";
const LABEL_TYPE_VALUE: &str = "port-proxy";
const LABEL_SESSION: &str = "sessionId";
const LABEL_HOST_PORT: &str = "hostPort";
const LABEL_CONTAINER_PORT: &str = "containerPort";

/// Prefix for forwarder containers.
const FORWARDER_PREFIX: &str = "skiff-proxy-";

/// A duplicate mapping. Unlike container removal, duplicate creation must be
/// rejected so the user gets a clear error.
#[derive(Debug, thiserror::Error)]
#[error("port mapping conflict: {0}")]
pub struct MappingConflict(pub String);

/// One host-to-container port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub session_id: String,
    pub host_port: u16,
    pub container_port: u16,
    pub forwarder_container_name: String,
}

/// Deterministic forwarder container name for a mapping triple.
fn forwarder_name(session_id: &str, host_port: u16, container_port: u16) -> String {
    format!("{FORWARDER_PREFIX}{session_id}-{host_port}-{container_port}")
}

/// Reconstruct a mapping from a forwarder's label set.
fn mapping_from_labels(name: &str, labels: &BTreeMap<String, String>) -> Option<PortMapping> {
    if labels.get(LABEL_TYPE).map(String::as_str) != Some(LABEL_TYPE_VALUE) {
        return None;
    }
    let session_id = labels.get(LABEL_SESSION)?.clone();
    let host_port = labels.get(LABEL_HOST_PORT)?.parse().ok()?;
    let container_port = labels.get(LABEL_CONTAINER_PORT)?.parse().ok()?;
    Some(PortMapping {
        session_id,
        host_port,
        container_port,
        forwarder_container_name: name.to_string(),
    })
}

/// Manages forwarder containers.
#[derive(Clone)]
pub struct PortProxyManager {
    engine: Arc<EngineGateway>,
    config: PortProxyConfig,
    internal_network: String,
}

impl PortProxyManager {
    pub fn new(engine: Arc<EngineGateway>, config: PortProxyConfig, internal_network: String) -> Self {
        Self {
            engine,
            config,
            internal_network,
        }
    }

    /// Create a forwarder exposing `container_port` of `container_name` on
    /// host `host_port`.
    pub async fn add(
        &self,
        session_id: &str,
        container_name: &str,
        host_port: u16,
        container_port: u16,
    ) -> Result<PortMapping> {
        let target_addr = self
            .engine
            .network_address(container_name, &self.internal_network)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "cannot resolve address of {container_name} on network {}",
                    self.internal_network
                )
            })?;

        for existing in self.list(session_id).await? {
            if existing.host_port == host_port {
                return Err(MappingConflict(format!(
                    "host port {host_port} is already mapped for session {session_id} \
                     (container port {})",
                    existing.container_port
                ))
                .into());
            }
        }

        let name = forwarder_name(session_id, host_port, container_port);
        let spec = RunSpec::new(&self.config.image)
            .name(&name)
            .port(host_port, container_port)
            .label(LABEL_TYPE, LABEL_TYPE_VALUE)
            .label(LABEL_SESSION, session_id)
            .label(LABEL_HOST_PORT, host_port.to_string())
            .label(LABEL_CONTAINER_PORT, container_port.to_string())
            .arg(format!("tcp-listen:{container_port},fork,reuseaddr"))
            .arg(format!("tcp-connect:{target_addr}:{container_port}"));

        self.engine.run(&spec).await.context("running forwarder container")?;
        self.engine
            .network_connect(&self.internal_network, &name)
            .await
            .context("connecting forwarder to internal network")?;

        info!("port mapping {host_port} -> {container_name}:{container_port} via {name}");
        Ok(PortMapping {
            session_id: session_id.to_string(),
            host_port,
            container_port,
            forwarder_container_name: name,
        })
    }

    /// All mappings for one session, read from forwarder labels.
    pub async fn list(&self, session_id: &str) -> Result<Vec<PortMapping>> {
        self.scan(&[
            (LABEL_TYPE, LABEL_TYPE_VALUE),
            (LABEL_SESSION, session_id),
        ])
        .await
    }

    /// All mappings across sessions.
    pub async fn list_all(&self) -> Result<Vec<PortMapping>> {
        self.scan(&[(LABEL_TYPE, LABEL_TYPE_VALUE)]).await
    }

    async fn scan(&self, filters: &[(&str, &str)]) -> Result<Vec<PortMapping>> {
        let names = self.engine.list_names(filters).await?;
        let mut mappings = Vec::with_capacity(names.len());
        for name in names {
            match self.engine.labels(&name).await? {
                Some(labels) => match mapping_from_labels(&name, &labels) {
                    Some(mapping) => mappings.push(mapping),
                    None => warn!("forwarder {name} has malformed labels, skipping"),
                },
                // Removed between listing and inspect; fine.
                None => {}
            }
        }
        Ok(mappings)
    }

    /// Remove one mapping. Idempotent: absent forwarders count as removed.
    pub async fn remove(
        &self,
        session_id: &str,
        host_port: u16,
        container_port: u16,
    ) -> Result<()> {
        let name = forwarder_name(session_id, host_port, container_port);
        self.engine.safe_remove(&name).await?;
        Ok(())
    }

    /// Remove every mapping of a session. Best-effort idempotent.
    pub async fn remove_all(&self, session_id: &str) -> Result<()> {
        for mapping in self.list(session_id).await? {
            self.engine
                .remove_quietly(&mapping.forwarder_container_name)
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(session: &str, host: &str, container: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_TYPE.to_string(), LABEL_TYPE_VALUE.to_string()),
            (LABEL_SESSION.to_string(), session.to_string()),
            (LABEL_HOST_PORT.to_string(), host.to_string()),
            (LABEL_CONTAINER_PORT.to_string(), container.to_string()),
        ])
    }

    #[test]
    fn forwarder_names_are_deterministic() {
        assert_eq!(
            forwarder_name("s1", 8080, 3000),
            forwarder_name("s1", 8080, 3000)
        );
        assert_eq!(forwarder_name("s1", 8080, 3000), "skiff-proxy-s1-8080-3000");
    }

    #[test]
    fn mapping_roundtrips_through_labels() {
        let mapping =
            mapping_from_labels("skiff-proxy-s1-8080-3000", &labels("s1", "8080", "3000")).unwrap();
        assert_eq!(mapping.session_id, "s1");
        assert_eq!(mapping.host_port, 8080);
        assert_eq!(mapping.container_port, 3000);
        assert_eq!(mapping.forwarder_container_name, "skiff-proxy-s1-8080-3000");
    }

    #[test]
    fn non_proxy_labels_are_ignored() {
        let mut other = labels("s1", "8080", "3000");
        other.insert(LABEL_TYPE.to_string(), "something-else".to_string());
        assert!(mapping_from_labels("c", &other).is_none());
    }

    #[test]
    fn malformed_ports_are_rejected() {
        assert!(mapping_from_labels("c", &labels("s1", "eighty", "3000")).is_none());
        assert!(mapping_from_labels("c", &labels("s1", "70000", "3000")).is_none());
    }
}
