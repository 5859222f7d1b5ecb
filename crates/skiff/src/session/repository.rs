//! Session database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{Session, SessionStatus};

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new pending session row. The API layer calls this before
    /// the orchestrator ever touches the engine.
    pub async fn create(&self, id: &str, user_id: &str, project_id: Option<&str>) -> Result<Session> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, project_id, status, created_at)
            VALUES (?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(project_id)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        self.get(id)
            .await?
            .context("session missing immediately after insert")
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, project_id, status, port, ws_path, container_name,
                   created_at, started_at, stopped_at, error_message
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(session)
    }

    /// List all sessions owned by a user, newest first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, project_id, status, port, ws_path, container_name,
                   created_at, started_at, stopped_at, error_message
            FROM sessions
            WHERE user_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        Ok(sessions)
    }

    /// List sessions attached to a project, newest first.
    pub async fn list_for_project(&self, project_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, project_id, status, port, ws_path, container_name,
                   created_at, started_at, stopped_at, error_message
            FROM sessions
            WHERE project_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("listing project sessions")?;

        Ok(sessions)
    }

    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;
        Ok(())
    }

    /// Record the resolved ingress port, protocol path, and container name,
    /// and mark the session running.
    pub async fn mark_running(
        &self,
        id: &str,
        port: u16,
        ws_path: &str,
        container_name: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'running', port = ?, ws_path = ?, container_name = ?,
                started_at = ?, error_message = NULL
            WHERE id = ?
            "#,
        )
        .bind(port as i64)
        .bind(ws_path)
        .bind(container_name)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session running")?;
        Ok(())
    }

    pub async fn mark_stopped(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE sessions SET status = 'stopped', stopped_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session stopped")?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = 'stopped', error_message = ? WHERE id = ?",
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session failed")?;
        Ok(())
    }

    /// Whether `user_id` may attach to `session`: owner, or member of the
    /// session's project.
    pub async fn user_has_access(&self, session: &Session, user_id: &str) -> Result<bool> {
        if session.user_id == user_id {
            return Ok(true);
        }
        let Some(ref project_id) = session.project_id else {
            return Ok(false);
        };
        self.is_project_member(project_id, user_id).await
    }

    pub async fn is_project_member(&self, project_id: &str, user_id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM project_members WHERE project_id = ? AND user_id = ?",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("checking project membership")?;
        Ok(row.is_some())
    }

    pub async fn add_project_member(&self, project_id: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO project_members (project_id, user_id) VALUES (?, ?)",
        )
        .bind(project_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("adding project member")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> SessionRepository {
        let db = Database::in_memory().await.unwrap();
        SessionRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn create_and_fetch_roundtrip() {
        let repo = repo().await;
        let session = repo.create("s1", "alice", Some("p1")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.user_id, "alice");
        assert!(session.port.is_none());

        let fetched = repo.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "s1");
        assert_eq!(fetched.project_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn mark_running_records_resolution() {
        let repo = repo().await;
        repo.create("s1", "alice", None).await.unwrap();
        repo.mark_running("s1", 49153, "/ws", "skiff-agent-s1")
            .await
            .unwrap();

        let session = repo.get("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.port, Some(49153));
        assert_eq!(session.ws_path.as_deref(), Some("/ws"));
        assert_eq!(session.container_name.as_deref(), Some("skiff-agent-s1"));
        assert!(session.started_at.is_some());
    }

    #[tokio::test]
    async fn access_is_owner_or_project_member() {
        let repo = repo().await;
        let session = repo.create("s1", "alice", Some("p1")).await.unwrap();

        assert!(repo.user_has_access(&session, "alice").await.unwrap());
        assert!(!repo.user_has_access(&session, "bob").await.unwrap());

        repo.add_project_member("p1", "bob").await.unwrap();
        assert!(repo.user_has_access(&session, "bob").await.unwrap());

        let solo = repo.create("s2", "carol", None).await.unwrap();
        assert!(!repo.user_has_access(&solo, "bob").await.unwrap());
    }
}
