//! Session lifecycle: models, persistence, and container orchestration.

mod models;
mod orchestrator;
mod repository;

pub use models::{
    Session, SessionStatus, StopOutcome, agent_container_name, ingress_container_name,
};
pub use orchestrator::{
    SessionOrchestrator, StartOptions, StartResult, validate_workspace_suffix,
};
pub use repository::SessionRepository;
