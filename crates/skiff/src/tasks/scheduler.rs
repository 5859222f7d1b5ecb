//! Task admission and execution.
//!
//! Two cooperating loops share one queue. The admission loop runs a single
//! pass on a fixed interval and enqueues work while the global ceiling
//! allows. The dispatcher drains the queue into semaphore-bounded jobs, one
//! ephemeral container per execution. The ceiling is a soft bound: both
//! loops read the same `TaskConfig.ceiling`, and brief overshoot in the race
//! window is acceptable where starvation is not. There is no shared lock —
//! the engine is the only source of truth and cannot be locked from here.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use dashmap::DashSet;
use log::{debug, error, info, warn};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::TaskConfig;
use crate::container::{EngineGateway, RunSpec};
use crate::session::validate_workspace_suffix;

use super::models::{
    ExecutionStatus, Task, TaskPayload, TaskStatus, task_container_name,
};
use super::repository::TaskRepository;
use super::result::{TaskReport, extract_report, fallback_report};

/// Workspace mount point inside task containers.
const WORKSPACE_TARGET: &str = "/workspace";

/// Environment variable carrying the JSON task payload.
const PAYLOAD_ENV: &str = "SKIFF_TASK";

/// Schedules and runs task executions.
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct SchedulerInner {
    repo: TaskRepository,
    engine: Arc<EngineGateway>,
    config: TaskConfig,
    workspace_root: Option<PathBuf>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// Executions currently queued or being worked.
    live: DashSet<String>,
    queued: AtomicUsize,
    active: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl TaskScheduler {
    pub fn new(
        repo: TaskRepository,
        engine: Arc<EngineGateway>,
        config: TaskConfig,
        workspace_root: Option<PathBuf>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                repo,
                engine,
                config,
                workspace_root,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(Some(queue_rx)),
                live: DashSet::new(),
                queued: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                shutdown_tx,
            }),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the admission loop and the execution dispatcher.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if !handles.is_empty() {
            return;
        }
        handles.push(tokio::spawn(admission_loop(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(dispatch_loop(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        info!(
            "task scheduler started (ceiling {}, admission every {}s)",
            self.inner.config.ceiling, self.inner.config.admission_interval_secs
        );
    }

    /// Stop both loops. Jobs already running finish on their own.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("task scheduler stopped");
    }

    /// One admission pass. Returns how many executions were enqueued.
    pub async fn admission_tick(&self) -> Result<usize> {
        self.inner.admission_tick().await
    }

    /// Stop an execution by removing its container directly; the worker's
    /// poll loop converges naturally.
    pub async fn stop_execution(&self, execution_id: &str) -> Result<()> {
        self.inner.stop_execution(execution_id).await
    }

    /// Queued plus active executions, as the admission check sees them.
    pub fn current_load(&self) -> usize {
        self.inner.load()
    }
}

async fn admission_loop(inner: Arc<SchedulerInner>, mut shutdown: watch::Receiver<bool>) {
    // Re-enqueue executions a previous process lost in flight.
    if let Err(err) = inner.recover_queue().await {
        error!("task queue recovery failed: {err:#}");
    }

    let mut interval =
        tokio::time::interval(Duration::from_secs(inner.config.admission_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match inner.admission_tick().await {
                    Ok(0) => {}
                    Ok(admitted) => debug!("admission tick enqueued {admitted} executions"),
                    Err(err) => error!("admission tick failed: {err:#}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn dispatch_loop(inner: Arc<SchedulerInner>, mut shutdown: watch::Receiver<bool>) {
    let Some(mut queue_rx) = inner.queue_rx.lock().await.take() else {
        return;
    };
    let semaphore = Arc::new(Semaphore::new(inner.config.ceiling));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = queue_rx.recv() => {
                let Some(execution_id) = msg else { break };
                inner.queued.fetch_sub(1, Ordering::SeqCst);
                inner.active.fetch_add(1, Ordering::SeqCst);

                let semaphore = semaphore.clone();
                let inner = inner.clone();
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    if let Err(err) = inner.run_execution(&execution_id).await {
                        error!("execution {execution_id} worker failed: {err:#}");
                    }
                    inner.active.fetch_sub(1, Ordering::SeqCst);
                    inner.live.remove(&execution_id);
                });
            }
        }
    }
}

impl SchedulerInner {
    fn load(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.active.load(Ordering::SeqCst)
    }

    fn enqueue(&self, execution_id: String) {
        self.live.insert(execution_id.clone());
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(execution_id).is_err() {
            // Dispatcher gone; shutdown in progress.
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Put every non-terminal execution back on the queue. Runs once at
    /// startup so a process restart cannot strand in-flight work.
    async fn recover_queue(&self) -> Result<usize> {
        let executions = self.repo.list_non_terminal_executions().await?;
        let mut recovered = 0;
        for execution in executions {
            if !self.live.contains(&execution.id) {
                info!(
                    "recovering {} execution {} for task {}",
                    execution.status, execution.id, execution.task_id
                );
                self.enqueue(execution.id);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// One admission pass: fill up to the ceiling with the oldest eligible
    /// tasks.
    async fn admission_tick(&self) -> Result<usize> {
        let load = self.load();
        let ceiling = self.config.ceiling;
        if load >= ceiling {
            return Ok(0);
        }
        let capacity = ceiling - load;

        let mut admitted = 0;
        for task in self.repo.eligible_tasks(capacity).await? {
            if admitted >= capacity {
                break;
            }
            if let Some(execution) = self.repo.non_terminal_execution(&task.id).await? {
                // An execution exists but the live queue does not know it:
                // a restart lost the in-flight state. Re-enqueue instead of
                // creating a second execution.
                if !self.live.contains(&execution.id) {
                    self.enqueue(execution.id);
                    admitted += 1;
                }
                continue;
            }

            let execution = self.repo.create_execution(&task.id).await?;
            self.repo.set_task_status(&task.id, TaskStatus::Doing).await?;
            self.enqueue(execution.id);
            admitted += 1;
        }
        Ok(admitted)
    }

    /// Drive one execution: container run, poll, collect, reconcile.
    async fn run_execution(&self, execution_id: &str) -> Result<()> {
        let Some(execution) = self.repo.get_execution(execution_id).await? else {
            warn!("execution {execution_id} disappeared before pickup");
            return Ok(());
        };
        if execution.status.is_terminal() {
            return Ok(());
        }
        let Some(task) = self.repo.get_task(&execution.task_id).await? else {
            warn!("task {} for execution {execution_id} is gone", execution.task_id);
            return Ok(());
        };

        let container_name = task_container_name(execution_id);
        self.repo
            .mark_execution_running(execution_id, &container_name)
            .await?;
        info!(
            "execution {execution_id} for task {} running in {container_name}",
            task.id
        );

        match self.run_container(&task, &container_name).await {
            Ok((report, logs)) => {
                // An explicit stop may have finished this execution while we
                // were polling; its verdict wins.
                if let Some(current) = self.repo.get_execution(execution_id).await?
                    && current.status.is_terminal()
                {
                    return Ok(());
                }

                let (execution_status, task_status) = if report.needs_input {
                    (ExecutionStatus::NeedsInput, TaskStatus::Todo)
                } else if report.completed {
                    (ExecutionStatus::Completed, TaskStatus::Done)
                } else {
                    (ExecutionStatus::Failed, TaskStatus::Todo)
                };

                // needs_input surfaces the input request as the result text.
                let result_text = if report.needs_input && !report.input_request.is_empty() {
                    report.input_request.clone()
                } else {
                    report.result.clone()
                };
                let error_text =
                    (!report.error_message.is_empty()).then_some(report.error_message.as_str());

                self.repo
                    .finish_execution(
                        execution_id,
                        execution_status,
                        Some(&result_text),
                        error_text,
                        Some(&logs),
                    )
                    .await?;
                self.repo.set_task_status(&task.id, task_status).await?;
                info!(
                    "execution {execution_id} finished {execution_status}, task {} -> {task_status}",
                    task.id
                );
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!("execution {execution_id} failed: {message}");
                self.repo
                    .finish_execution(
                        execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(&message),
                        None,
                    )
                    .await?;
                // Reset so the admission loop can retry the task.
                self.repo.set_task_status(&task.id, TaskStatus::Todo).await?;
            }
        }
        Ok(())
    }

    /// Launch the task container, poll it to completion, and collect its
    /// structured report from the logs.
    async fn run_container(
        &self,
        task: &Task,
        container_name: &str,
    ) -> Result<(TaskReport, String)> {
        let agent_id = task
            .agent_id
            .clone()
            .context("task has no assigned agent")?;
        let workspace = self.resolve_task_workspace(task)?;

        let payload = TaskPayload {
            task_id: task.id.clone(),
            body: task.body.clone(),
            agent_id,
            workspace: WORKSPACE_TARGET.to_string(),
            mount_point: workspace
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        };
        let payload_json =
            serde_json::to_string(&payload).context("serializing task payload")?;

        let mut spec = RunSpec::new(&self.config.image)
            .name(container_name)
            .env(PAYLOAD_ENV, payload_json);
        if let Some(ref workspace) = workspace {
            spec = spec.mount(workspace.display().to_string(), WORKSPACE_TARGET, false);
        }

        match self.engine.run(&spec).await {
            Ok(_) => {}
            Err(err) if err.is_conflict() => {
                // A recovered execution whose container survived the restart.
                debug!("task container {container_name} already exists, adopting it");
                if self.engine.is_running(container_name).await? == Some(false) {
                    let _ = self.engine.start(container_name).await;
                }
            }
            Err(err) => return Err(err).context("running task container"),
        }

        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.run_timeout_secs);
        while self.engine.is_running(container_name).await? == Some(true) {
            if tokio::time::Instant::now() >= deadline {
                self.engine.remove_quietly(container_name).await;
                bail!(
                    "execution timed out after {}s",
                    self.config.run_timeout_secs
                );
            }
            tokio::time::sleep(poll).await;
        }

        // The container exited, or an explicit stop removed it under us.
        let logs = match self.engine.logs(container_name).await {
            Ok(logs) => logs,
            Err(err) if err.is_not_found() => String::new(),
            Err(err) => {
                self.engine.remove_quietly(container_name).await;
                return Err(err).context("collecting task logs");
            }
        };

        let report = extract_report(&logs).unwrap_or_else(fallback_report);
        self.engine.remove_quietly(container_name).await;
        Ok((report, logs))
    }

    fn resolve_task_workspace(&self, task: &Task) -> Result<Option<PathBuf>> {
        let Some(ref root) = self.workspace_root else {
            return Ok(None);
        };
        let Some(suffix) = task.workspace_path.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        validate_workspace_suffix(suffix)?;
        let resolved = root.join(suffix);
        if !resolved.is_dir() {
            bail!("task workspace {} is not a directory", resolved.display());
        }
        Ok(Some(resolved))
    }

    async fn stop_execution(&self, execution_id: &str) -> Result<()> {
        let Some(execution) = self.repo.get_execution(execution_id).await? else {
            bail!("execution not found: {execution_id}");
        };
        let container_name = execution
            .container_name
            .unwrap_or_else(|| task_container_name(execution_id));

        self.engine.safe_remove(&container_name).await?;

        if !execution.status.is_terminal() {
            self.repo
                .finish_execution(
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    Some("stopped by user"),
                    None,
                )
                .await?;
            self.repo
                .set_task_status(&execution.task_id, TaskStatus::Canceled)
                .await?;
        }
        self.live.remove(execution_id);
        info!("execution {execution_id} stopped");
        Ok(())
    }
}
