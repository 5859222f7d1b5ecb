//! Asynchronous agent tasks: models, persistence, scheduling.

mod models;
mod repository;
mod result;
mod scheduler;

pub use models::{
    ExecutionStatus, Task, TaskExecution, TaskPayload, TaskStatus, task_container_name,
};
pub use repository::TaskRepository;
pub use result::{TaskReport, extract_report, fallback_report};
pub use scheduler::TaskScheduler;
