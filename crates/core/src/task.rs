use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::id::is_valid_id;
use crate::store::{path_exists, read_json, write_json};

pub type TaskParams = BTreeMap<String, String>;

pub const DEFAULT_PARAMS: [(&str, &str); 3] =
    [("length", "single"), ("game", "doom2"), ("engine", "gzdoom")];

/// Written by the generator as the last line of a completed run.
pub const COMPLETION_MARKER: &str = "====== END OF OBLIGE LOGS ======";
pub const TITLE_PREFIX: &str = "Game title:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Error,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatus {
    fn with_state(state: TaskState) -> Self {
        Self {
            state,
            queue: None,
            title: None,
            error: None,
        }
    }

    pub fn pending() -> Self {
        Self::with_state(TaskState::Pending)
    }

    pub fn queued(position: u32) -> Self {
        Self {
            queue: Some(position),
            ..Self::pending()
        }
    }

    pub fn running() -> Self {
        Self::with_state(TaskState::Running)
    }

    pub fn done(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::with_state(TaskState::Done)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_state(TaskState::Error)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFile {
    Params,
    Status,
    Log,
    Artifact,
}

impl TaskFile {
    pub fn file_name(self) -> &'static str {
        match self {
            TaskFile::Params => "params.json",
            TaskFile::Status => "status.json",
            TaskFile::Log => "run.log",
            TaskFile::Artifact => "output.wad",
        }
    }
}

/// One generation job, addressed by id inside the task root directory.
///
/// A `Task` is only a handle; every accessor goes to disk.
#[derive(Debug, Clone)]
pub struct Task {
    id: String,
    dir: PathBuf,
}

impl Task {
    pub(crate) fn new(file_root: &Path, id: &str) -> Self {
        Self {
            id: id.to_string(),
            dir: file_root.join(id),
        }
    }

    /// Handle for `id` under `file_root`; rejects ids that are not plain
    /// lowercase base-36.
    pub fn open(file_root: &Path, id: &str) -> Result<Self, TaskError> {
        if !is_valid_id(id) {
            return Err(TaskError::InvalidId(id.to_string()));
        }
        Ok(Self::new(file_root, id))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self, file: TaskFile) -> PathBuf {
        self.dir.join(file.file_name())
    }

    pub async fn exists(&self) -> Result<bool, TaskError> {
        path_exists(&self.path(TaskFile::Status)).await
    }

    /// Create the task directory and persist merged params plus a pending status.
    ///
    /// Fails if the directory already exists.
    pub async fn init(&self, params: TaskParams) -> Result<(), TaskError> {
        fs::create_dir(&self.dir)
            .await
            .map_err(|err| TaskError::storage(&self.dir, err))?;

        let merged = merge_with_defaults(params);
        write_json(&self.path(TaskFile::Params), &merged).await?;
        self.set_status(&TaskStatus::pending()).await?;

        info!(task_id = %self.id, params = ?merged, "Task created");
        Ok(())
    }

    pub async fn params(&self) -> Result<TaskParams, TaskError> {
        read_json(&self.path(TaskFile::Params)).await
    }

    pub async fn status(&self) -> Result<TaskStatus, TaskError> {
        read_json(&self.path(TaskFile::Status)).await
    }

    pub async fn set_status(&self, status: &TaskStatus) -> Result<(), TaskError> {
        write_json(&self.path(TaskFile::Status), status).await
    }

    /// Put the task back in the queue and drop any previous artifact.
    pub async fn retry(&self) -> Result<(), TaskError> {
        self.set_status(&TaskStatus::pending()).await?;

        let artifact = self.path(TaskFile::Artifact);
        if path_exists(&artifact).await? {
            fs::remove_file(&artifact)
                .await
                .map_err(|err| TaskError::storage(&artifact, err))?;
        }

        info!(task_id = %self.id, "Task reset for retry");
        Ok(())
    }

    /// Derive the real state of a task from its generator log.
    ///
    /// Anything short of a finished log with a title line goes back to
    /// `pending`; there is no partial-progress resumption.
    pub async fn validate_status(&self) -> Result<TaskState, TaskError> {
        let current = self.status().await?;
        if current.state == TaskState::Done {
            return Ok(TaskState::Done);
        }

        let log = self.read_log().await?;
        let next = if !is_finished(&log) {
            debug!(task_id = %self.id, "Completion marker missing from log");
            TaskStatus::pending()
        } else if let Some(title) = parse_title(&log) {
            TaskStatus::done(title)
        } else {
            warn!(task_id = %self.id, "Log finished without a game title; requeueing");
            TaskStatus::pending()
        };

        self.set_status(&next).await?;
        info!(
            task_id = %self.id,
            from = current.state.as_str(),
            to = next.state.as_str(),
            "Task status validated against log"
        );
        Ok(next.state)
    }

    async fn read_log(&self) -> Result<String, TaskError> {
        let path = self.path(TaskFile::Log);
        match fs::read(&path).await {
            Ok(raw) => Ok(String::from_utf8_lossy(&raw).into_owned()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(TaskError::storage(&path, err)),
        }
    }
}

pub fn merge_with_defaults(params: TaskParams) -> TaskParams {
    let mut merged: TaskParams = DEFAULT_PARAMS
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    merged.extend(params);
    merged
}

pub fn is_finished(log: &str) -> bool {
    log.contains(COMPLETION_MARKER)
}

pub fn parse_title(log: &str) -> Option<String> {
    log.lines()
        .find(|line| line.starts_with(TITLE_PREFIX))
        .and_then(|line| line.split_once(':'))
        .map(|(_, title)| title.trim())
        .filter(|title| !title.is_empty())
        .map(ToString::to_string)
}
