//! Container engine error types and stderr classification.
//!
//! The engine CLI reports resource-state problems only through stderr text.
//! All pattern matching on that text lives here, behind a closed set of
//! reason codes, so the rest of the crate can branch on `EngineErrorKind`
//! instead of string contents.

use std::time::Duration;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Closed classification of engine CLI failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The named container/network does not exist.
    NotFound,
    /// Name already in use, or the resource already exists.
    Conflict,
    /// A removal for this container is already underway.
    RemovalInProgress,
    /// Anything the classifier does not recognize.
    Other,
}

/// Error from a container engine invocation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The CLI exited non-zero. Carries the raw stderr for diagnostics.
    #[error("{command} failed: {stderr}")]
    Cli {
        command: String,
        stderr: String,
        kind: EngineErrorKind,
    },

    /// The CLI did not finish within the per-invocation timeout.
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The engine binary could not be spawned at all.
    #[error("spawning {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The CLI succeeded but printed something we could not interpret.
    #[error("unexpected {command} output: {detail}")]
    Output { command: String, detail: String },

    /// Rejected before reaching the engine.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Classification of this error, `Other` for non-CLI failures.
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            EngineError::Cli { kind, .. } => *kind,
            _ => EngineErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == EngineErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == EngineErrorKind::Conflict
    }

    pub fn is_removal_in_progress(&self) -> bool {
        self.kind() == EngineErrorKind::RemovalInProgress
    }
}

/// Classify raw CLI stderr into a reason code.
///
/// Patterns cover both docker and podman phrasings. Order matters:
/// "removal of container ... is already in progress" also contains the word
/// "container", so the removal check runs before the not-found check.
pub fn classify(stderr: &str) -> EngineErrorKind {
    let text = stderr.to_lowercase();

    if text.contains("removal of container") && text.contains("already in progress")
        || text.contains("is being removed")
    {
        return EngineErrorKind::RemovalInProgress;
    }

    if text.contains("no such container")
        || text.contains("no such network")
        || text.contains("no such object")
        || text.contains("not found")
    {
        return EngineErrorKind::NotFound;
    }

    if text.contains("already in use")
        || text.contains("already exists")
        || text.contains("conflict")
    {
        return EngineErrorKind::Conflict;
    }

    EngineErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_found() {
        assert_eq!(
            classify("Error: No such container: skiff-agent-abc"),
            EngineErrorKind::NotFound
        );
        assert_eq!(
            classify("Error response from daemon: network skiff-internal not found"),
            EngineErrorKind::NotFound
        );
    }

    #[test]
    fn classifies_conflict() {
        assert_eq!(
            classify(
                "docker: Error response from daemon: Conflict. The container name \
                 \"/skiff-agent-abc\" is already in use by container \"f2a\"."
            ),
            EngineErrorKind::Conflict
        );
        assert_eq!(
            classify("Error response from daemon: network with name skiff-internal already exists"),
            EngineErrorKind::Conflict
        );
    }

    #[test]
    fn classifies_removal_in_progress() {
        assert_eq!(
            classify(
                "Error response from daemon: removal of container abc is already in progress"
            ),
            EngineErrorKind::RemovalInProgress
        );
        assert_eq!(
            classify("Error: container abc is being removed"),
            EngineErrorKind::RemovalInProgress
        );
    }

    #[test]
    fn unknown_text_is_other() {
        assert_eq!(classify(""), EngineErrorKind::Other);
        assert_eq!(
            classify("Error response from daemon: OCI runtime create failed"),
            EngineErrorKind::Other
        );
    }

    #[test]
    fn removal_in_progress_wins_over_not_found() {
        // Contains "container" but must not be read as NotFound.
        assert_eq!(
            classify("removal of container xyz is already in progress"),
            EngineErrorKind::RemovalInProgress
        );
    }
}
