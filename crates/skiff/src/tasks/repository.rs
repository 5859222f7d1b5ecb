//! Task and execution database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{ExecutionStatus, Task, TaskExecution, TaskStatus};

/// Repository for task persistence.
#[derive(Debug, Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new task. The API layer is the caller.
    pub async fn create_task(
        &self,
        title: &str,
        body: &str,
        agent_id: Option<&str>,
        workspace_path: Option<&str>,
    ) -> Result<Task> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO tasks (id, title, body, status, agent_id, workspace_path, created_at, updated_at)
            VALUES (?, ?, ?, 'todo', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(title)
        .bind(body)
        .bind(agent_id)
        .bind(workspace_path)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("creating task")?;

        self.get_task(&id)
            .await?
            .context("task missing immediately after insert")
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, title, body, status, agent_id, workspace_path, created_at, updated_at
            FROM tasks
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching task")?;
        Ok(task)
    }

    pub async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating task status")?;
        Ok(())
    }

    /// Tasks the admission loop may consider: `todo` with an assigned agent,
    /// oldest first for FIFO fairness.
    pub async fn eligible_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, title, body, status, agent_id, workspace_path, created_at, updated_at
            FROM tasks
            WHERE status = 'todo' AND agent_id IS NOT NULL
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("selecting eligible tasks")?;
        Ok(tasks)
    }

    /// The task's single non-terminal execution, if any.
    pub async fn non_terminal_execution(&self, task_id: &str) -> Result<Option<TaskExecution>> {
        let execution = sqlx::query_as::<_, TaskExecution>(
            r#"
            SELECT id, task_id, status, container_name, result, error_message, logs,
                   created_at, started_at, finished_at
            FROM task_executions
            WHERE task_id = ? AND status IN ('pending', 'running')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching non-terminal execution")?;
        Ok(execution)
    }

    /// All non-terminal executions, for queue recovery after a restart.
    pub async fn list_non_terminal_executions(&self) -> Result<Vec<TaskExecution>> {
        let executions = sqlx::query_as::<_, TaskExecution>(
            r#"
            SELECT id, task_id, status, container_name, result, error_message, logs,
                   created_at, started_at, finished_at
            FROM task_executions
            WHERE status IN ('pending', 'running')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing non-terminal executions")?;
        Ok(executions)
    }

    pub async fn create_execution(&self, task_id: &str) -> Result<TaskExecution> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO task_executions (id, task_id, status, created_at)
            VALUES (?, ?, 'pending', ?)
            "#,
        )
        .bind(&id)
        .bind(task_id)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("creating execution")?;

        self.get_execution(&id)
            .await?
            .context("execution missing immediately after insert")
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<TaskExecution>> {
        let execution = sqlx::query_as::<_, TaskExecution>(
            r#"
            SELECT id, task_id, status, container_name, result, error_message, logs,
                   created_at, started_at, finished_at
            FROM task_executions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching execution")?;
        Ok(execution)
    }

    pub async fn mark_execution_running(&self, id: &str, container_name: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'running', container_name = ?, started_at = ?
            WHERE id = ?
            "#,
        )
        .bind(container_name)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking execution running")?;
        Ok(())
    }

    /// Record an execution's terminal state and collected output.
    pub async fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        result: Option<&str>,
        error_message: Option<&str>,
        logs: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE task_executions
            SET status = ?, result = ?, error_message = ?, logs = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(result)
        .bind(error_message)
        .bind(logs)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("finishing execution")?;
        Ok(())
    }

    pub async fn list_executions(&self, task_id: &str) -> Result<Vec<TaskExecution>> {
        let executions = sqlx::query_as::<_, TaskExecution>(
            r#"
            SELECT id, task_id, status, container_name, result, error_message, logs,
                   created_at, started_at, finished_at
            FROM task_executions
            WHERE task_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("listing executions")?;
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> TaskRepository {
        let db = Database::in_memory().await.unwrap();
        TaskRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn eligible_tasks_require_agent_and_todo() {
        let repo = repo().await;
        repo.create_task("with agent", "", Some("agent-x"), None)
            .await
            .unwrap();
        repo.create_task("no agent", "", None, None).await.unwrap();
        let doing = repo
            .create_task("already doing", "", Some("agent-x"), None)
            .await
            .unwrap();
        repo.set_task_status(&doing.id, TaskStatus::Doing)
            .await
            .unwrap();

        let eligible = repo.eligible_tasks(10).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].title, "with agent");
    }

    #[tokio::test]
    async fn execution_lifecycle_roundtrip() {
        let repo = repo().await;
        let task = repo
            .create_task("t", "body", Some("agent-x"), None)
            .await
            .unwrap();

        let execution = repo.create_execution(&task.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(
            repo.non_terminal_execution(&task.id)
                .await
                .unwrap()
                .is_some()
        );

        repo.mark_execution_running(&execution.id, "skiff-task-x")
            .await
            .unwrap();
        repo.finish_execution(
            &execution.id,
            ExecutionStatus::Completed,
            Some("ok"),
            None,
            Some("log text"),
        )
        .await
        .unwrap();

        let finished = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert_eq!(finished.result.as_deref(), Some("ok"));
        assert!(finished.finished_at.is_some());
        assert!(
            repo.non_terminal_execution(&task.id)
                .await
                .unwrap()
                .is_none()
        );
    }
}
