//! Session model types.

use serde::{Deserialize, Serialize};

/// Prefix for agent containers.
const AGENT_PREFIX: &str = "skiff-agent-";
/// Prefix for ingress (reverse-proxy) containers.
const INGRESS_PREFIX: &str = "skiff-ingress-";

/// Deterministic agent container name for a session.
///
/// Determinism is load-bearing: it makes start/stop idempotent and
/// collision-free across retries and page reloads.
pub fn agent_container_name(session_id: &str) -> String {
    format!("{AGENT_PREFIX}{session_id}")
}

/// Deterministic ingress container name for a session.
pub fn ingress_container_name(session_id: &str) -> String {
    format!("{INGRESS_PREFIX}{session_id}")
}

/// Session lifecycle state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Starting,
    Running,
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A user session backed by an agent container and an ingress container.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub project_id: Option<String>,
    pub status: SessionStatus,
    /// Host port bound by the ingress container, once resolved.
    pub port: Option<i64>,
    /// Path component of the terminal WebSocket endpoint.
    pub ws_path: Option<String>,
    pub container_name: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub error_message: Option<String>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Starting | SessionStatus::Running)
    }
}

/// Outcome of a session stop. Teardown failures are reported, not thrown,
/// so the caller can surface them without crashing.
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_deterministic() {
        assert_eq!(
            agent_container_name("7d1f"),
            agent_container_name("7d1f")
        );
        assert_eq!(agent_container_name("7d1f"), "skiff-agent-7d1f");
        assert_eq!(ingress_container_name("7d1f"), "skiff-ingress-7d1f");
        assert_ne!(agent_container_name("a"), ingress_container_name("a"));
    }
}
