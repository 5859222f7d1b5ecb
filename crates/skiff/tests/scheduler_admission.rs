//! Admission loop behavior against a real (in-memory) database.

use std::sync::Arc;
use std::time::Duration;

use skiff::config::{EngineConfig, TaskConfig};
use skiff::container::EngineGateway;
use skiff::db::Database;
use skiff::tasks::{ExecutionStatus, TaskRepository, TaskScheduler, TaskStatus};

async fn scheduler(ceiling: usize) -> (TaskScheduler, TaskRepository, Database) {
    let db = Database::in_memory().await.unwrap();
    let repo = TaskRepository::new(db.pool().clone());
    let engine = Arc::new(EngineGateway::new(&EngineConfig::default()));
    let config = TaskConfig {
        ceiling,
        ..Default::default()
    };
    let scheduler = TaskScheduler::new(repo.clone(), engine, config, None);
    (scheduler, repo, db)
}

#[tokio::test]
async fn one_tick_admits_one_execution_and_flips_the_task() {
    let (scheduler, repo, _db) = scheduler(10).await;
    let task = repo
        .create_task("build", "cargo build", Some("agent-x"), None)
        .await
        .unwrap();

    let admitted = scheduler.admission_tick().await.unwrap();
    assert_eq!(admitted, 1);

    let executions = repo.list_executions(&task.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Pending);

    let task = repo.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Doing);

    // A second tick before the first execution completes enqueues nothing.
    let admitted = scheduler.admission_tick().await.unwrap();
    assert_eq!(admitted, 0);
    assert_eq!(repo.list_executions(&task.id).await.unwrap().len(), 1);
    assert_eq!(scheduler.current_load(), 1);
}

#[tokio::test]
async fn tasks_without_an_agent_are_never_admitted() {
    let (scheduler, repo, _db) = scheduler(10).await;
    let task = repo
        .create_task("unassigned", "", None, None)
        .await
        .unwrap();

    assert_eq!(scheduler.admission_tick().await.unwrap(), 0);
    assert!(repo.list_executions(&task.id).await.unwrap().is_empty());
    assert_eq!(
        repo.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Todo
    );
}

#[tokio::test]
async fn admission_stops_at_the_ceiling() {
    let (scheduler, repo, _db) = scheduler(2).await;
    for i in 0..3 {
        repo.create_task(&format!("task {i}"), "", Some("agent-x"), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(scheduler.admission_tick().await.unwrap(), 2);
    assert_eq!(scheduler.current_load(), 2);

    // The queue is full; the third task waits for capacity.
    assert_eq!(scheduler.admission_tick().await.unwrap(), 0);
}

#[tokio::test]
async fn admission_is_oldest_first() {
    let (scheduler, repo, _db) = scheduler(1).await;
    let first = repo
        .create_task("first", "", Some("agent-x"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = repo
        .create_task("second", "", Some("agent-x"), None)
        .await
        .unwrap();

    assert_eq!(scheduler.admission_tick().await.unwrap(), 1);
    assert_eq!(
        repo.get_task(&first.id).await.unwrap().unwrap().status,
        TaskStatus::Doing
    );
    assert_eq!(
        repo.get_task(&second.id).await.unwrap().unwrap().status,
        TaskStatus::Todo
    );
}

#[tokio::test]
async fn existing_execution_is_reenqueued_not_duplicated() {
    let (scheduler, repo, _db) = scheduler(10).await;
    let task = repo
        .create_task("recovered", "", Some("agent-x"), None)
        .await
        .unwrap();
    // Simulate a previous process that created the execution and then died
    // before its queue state survived.
    repo.create_execution(&task.id).await.unwrap();

    assert_eq!(scheduler.admission_tick().await.unwrap(), 1);
    assert_eq!(repo.list_executions(&task.id).await.unwrap().len(), 1);

    // Now tracked in the live queue; nothing further happens.
    assert_eq!(scheduler.admission_tick().await.unwrap(), 0);
    assert_eq!(repo.list_executions(&task.id).await.unwrap().len(), 1);
}
