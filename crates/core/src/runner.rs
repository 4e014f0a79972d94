use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::fs;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::generator::{Generator, Invocation};
use crate::id::{is_valid_id, new_id};
use crate::task::{Task, TaskParams, TaskState, TaskStatus};

/// Why a reconciliation pass was requested. Only used for logging; every
/// signal gets its own full pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileSignal {
    Startup,
    Created,
    Retried,
    Finished,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub dispatched: Option<String>,
    pub queued: Vec<(String, u32)>,
    pub repaired: Vec<String>,
}

/// Single-concurrency scheduler over the task root directory.
///
/// The directory listing is the only index: each pass reads every task's
/// status, so cost grows linearly with the number of tasks ever created.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    file_root: PathBuf,
    generator: Arc<dyn Generator>,
    active: Mutex<Option<String>>,
    reconcile_guard: AsyncMutex<()>,
    signals: mpsc::UnboundedSender<ReconcileSignal>,
}

impl TaskRunner {
    /// Create the runner and spawn its scheduler loop on the current Tokio
    /// runtime. The loop exits once every runner handle is dropped.
    pub fn new(file_root: impl Into<PathBuf>, generator: Arc<dyn Generator>) -> Self {
        let (signals, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(RunnerInner {
            file_root: file_root.into(),
            generator,
            active: Mutex::new(None),
            reconcile_guard: AsyncMutex::new(()),
            signals,
        });

        tokio::spawn(scheduler_loop(Arc::downgrade(&inner), receiver));

        Self { inner }
    }

    pub fn file_root(&self) -> &Path {
        &self.inner.file_root
    }

    /// Task currently owned by this process, if any.
    pub fn active_task(&self) -> Option<String> {
        self.lock_active().clone()
    }

    pub fn task(&self, id: &str) -> Result<Task, TaskError> {
        Task::open(&self.inner.file_root, id)
    }

    pub async fn existing_task(&self, id: &str) -> Result<Task, TaskError> {
        let task = self.task(id)?;
        if !task.exists().await? {
            return Err(TaskError::NotFound(id.to_string()));
        }
        Ok(task)
    }

    pub async fn create(&self, params: TaskParams) -> Result<String, TaskError> {
        let id = new_id();
        Task::new(&self.inner.file_root, &id).init(params).await?;
        self.request_reconcile(ReconcileSignal::Created);
        Ok(id)
    }

    pub async fn retry(&self, id: &str) -> Result<(), TaskError> {
        self.existing_task(id).await?.retry().await?;
        self.request_reconcile(ReconcileSignal::Retried);
        Ok(())
    }

    pub fn request_reconcile(&self, signal: ReconcileSignal) {
        if self.inner.signals.send(signal).is_err() {
            warn!(?signal, "Scheduler loop stopped; dropping reconcile signal");
        }
    }

    /// Task directory names, oldest first.
    pub async fn list_task_ids(&self) -> Result<Vec<String>, TaskError> {
        list_task_ids(&self.inner.file_root).await
    }

    /// Run one reconciliation pass.
    ///
    /// Passes are strictly sequential: a caller arriving while another pass is
    /// in flight waits for it and then scans again from scratch. Returns `None`
    /// when the pass was aborted by an error.
    pub async fn reconcile(&self) -> Option<ReconcileReport> {
        let _guard = match self.inner.reconcile_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Reconciliation pass in flight; waiting for it to finish");
                self.inner.reconcile_guard.lock().await
            }
        };

        match self.scan().await {
            Ok(report) => {
                debug!(
                    dispatched = ?report.dispatched,
                    queued = report.queued.len(),
                    repaired = report.repaired.len(),
                    "Reconciliation pass complete"
                );
                Some(report)
            }
            Err(err) => {
                error!(error = %err, "Reconciliation pass aborted");
                None
            }
        }
    }

    async fn scan(&self) -> Result<ReconcileReport, TaskError> {
        let ids = self.list_task_ids().await?;
        let active = self.active_task();
        let mut queue_position: u32 = if active.is_some() { 1 } else { 0 };
        let mut report = ReconcileReport::default();

        for id in ids {
            let is_active = active.as_deref() == Some(id.as_str());
            let task = Task::new(&self.inner.file_root, &id);
            let mut status = task.status().await?;

            if status.state == TaskState::Running {
                if is_active {
                    continue;
                }
                warn!(task_id = %id, "Task marked running without an owner; checking its log");
                task.validate_status().await?;
                report.repaired.push(id.clone());
                status = task.status().await?;
            }

            // Retried while its generator is still in flight.
            if status.state != TaskState::Pending || is_active {
                continue;
            }

            if active.is_none() && report.dispatched.is_none() {
                self.dispatch(&task).await?;
                report.dispatched = Some(id);
            } else {
                task.set_status(&TaskStatus::queued(queue_position)).await?;
                report.queued.push((id, queue_position));
            }
            queue_position += 1;
        }

        Ok(report)
    }

    async fn dispatch(&self, task: &Task) -> Result<(), TaskError> {
        self.set_active(Some(task.id()));
        if let Err(err) = task.set_status(&TaskStatus::running()).await {
            self.set_active(None);
            return Err(err);
        }

        info!(task_id = %task.id(), "Dispatching generator");
        let runner = self.clone();
        let task = task.clone();
        tokio::spawn(async move {
            runner.run_task(task).await;
        });
        Ok(())
    }

    async fn run_task(self, task: Task) {
        match self.execute(&task).await {
            Ok(state) => {
                info!(task_id = %task.id(), state = state.as_str(), "Generator run finished");
            }
            Err(err) => {
                error!(task_id = %task.id(), error = %err, "Generator run failed");
                if let Err(persist_err) = task.set_status(&TaskStatus::failed(err.to_string())).await
                {
                    error!(
                        task_id = %task.id(),
                        error = %persist_err,
                        "Failed to persist error status"
                    );
                }
            }
        }

        self.set_active(None);
        self.request_reconcile(ReconcileSignal::Finished);
    }

    async fn execute(&self, task: &Task) -> Result<TaskState, TaskError> {
        let params = task.params().await?;
        let invocation = Invocation::for_task(task, params);
        self.inner.generator.generate(&invocation).await?;
        task.validate_status().await
    }

    fn set_active(&self, id: Option<&str>) {
        *self.lock_active() = id.map(ToString::to_string);
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<String>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Task directory names under `root`, oldest first. Plain files and names
/// that are not task ids are skipped.
pub async fn list_task_ids(root: &Path) -> Result<Vec<String>, TaskError> {
    let mut entries = fs::read_dir(root)
        .await
        .map_err(|err| TaskError::storage(root, err))?;

    let mut ids = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| TaskError::storage(root, err))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|err| TaskError::storage(&entry.path(), err))?;
        if !file_type.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_valid_id(name) {
                ids.push(name.to_string());
            }
        }
    }

    ids.sort();
    Ok(ids)
}

async fn scheduler_loop(
    inner: Weak<RunnerInner>,
    mut signals: mpsc::UnboundedReceiver<ReconcileSignal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        debug!(?signal, "Reconcile signal received");
        TaskRunner { inner }.reconcile().await;
    }
    debug!("Scheduler loop stopped");
}
