//! Task and execution model types.

use serde::{Deserialize, Serialize};

/// Prefix for ephemeral task containers.
const TASK_PREFIX: &str = "skiff-task-";

/// Deterministic container name for a task execution.
pub fn task_container_name(execution_id: &str) -> String {
    format!("{TASK_PREFIX}{execution_id}")
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
    Canceled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Execution lifecycle state. `pending` and `running` are the non-terminal
/// states; a task may have at most one non-terminal execution at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    NeedsInput,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::NeedsInput => "needs_input",
        };
        f.write_str(s)
    }
}

/// An asynchronous agent task.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub body: String,
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    /// Sub-path of the workspace root the task container gets mounted.
    pub workspace_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One run of a task inside an ephemeral container.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub status: ExecutionStatus,
    pub container_name: Option<String>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub logs: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// JSON payload handed to a task container via its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub task_id: String,
    pub body: String,
    pub agent_id: String,
    /// Workspace mount point inside the container.
    pub workspace: String,
    /// Host path mounted there, empty when no workspace is attached.
    #[serde(default)]
    pub mount_point: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_deterministic() {
        assert_eq!(task_container_name("e1"), "skiff-task-e1");
        assert_eq!(task_container_name("e1"), task_container_name("e1"));
    }

    #[test]
    fn terminal_states() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::NeedsInput.is_terminal());
    }

    #[test]
    fn payload_serializes_camel_case() {
        let payload = TaskPayload {
            task_id: "t1".to_string(),
            body: "fix the bug".to_string(),
            agent_id: "agent-x".to_string(),
            workspace: "/workspace".to_string(),
            mount_point: "/data/proj".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["agentId"], "agent-x");
        assert_eq!(json["mountPoint"], "/data/proj");
    }
}
