use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::TaskError;
use crate::logging::GENERATOR_LOG_TARGET;
use crate::task::{Task, TaskFile, TaskParams};

const STDERR_TAIL_CHARS: usize = 2000;

/// Everything a generator run needs to know about its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub task_id: String,
    pub artifact_path: PathBuf,
    pub log_path: PathBuf,
    pub params: TaskParams,
}

impl Invocation {
    pub fn for_task(task: &Task, params: TaskParams) -> Self {
        Self {
            task_id: task.id().to_string(),
            artifact_path: task.path(TaskFile::Artifact),
            log_path: task.path(TaskFile::Log),
            params,
        }
    }
}

/// Runs one generation to completion.
///
/// `Ok(())` only means the run terminated cleanly; the caller still inspects
/// the log to decide whether it produced anything.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, invocation: &Invocation) -> Result<(), TaskError>;
}

#[derive(Debug, Clone)]
pub struct ObligeGenerator {
    pub program: PathBuf,
    pub home_dir: PathBuf,
    pub install_dir: PathBuf,
}

impl ObligeGenerator {
    /// Generator installed under `root`, with the binary at `root/Oblige`.
    pub fn from_root(root: PathBuf) -> Self {
        Self {
            program: root.join("Oblige"),
            home_dir: root.clone(),
            install_dir: root,
        }
    }

    pub fn args(&self, invocation: &Invocation) -> Vec<String> {
        let mut args = vec![
            "--batch".to_string(),
            invocation.artifact_path.display().to_string(),
            "--log".to_string(),
            invocation.log_path.display().to_string(),
            "--home".to_string(),
            self.home_dir.display().to_string(),
            "--install".to_string(),
            self.install_dir.display().to_string(),
        ];
        args.extend(
            invocation
                .params
                .iter()
                .map(|(key, value)| format!("{key}={value}")),
        );
        args
    }
}

#[async_trait]
impl Generator for ObligeGenerator {
    async fn generate(&self, invocation: &Invocation) -> Result<(), TaskError> {
        let args = self.args(invocation);
        trace!(
            task_id = %invocation.task_id,
            program = %self.program.display(),
            args = ?args,
            "spawn generator"
        );

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| {
                TaskError::Process(format!("spawn {}: {err}", self.program.display()))
            })?;

        let stderr = stderr_tail(&output.stderr);
        if !stderr.is_empty() {
            debug!(
                target: GENERATOR_LOG_TARGET,
                task_id = %invocation.task_id,
                stderr = %stderr,
                "generator stderr"
            );
        }

        if output.status.success() {
            debug!(task_id = %invocation.task_id, "generator exited successfully");
            return Ok(());
        }

        let reason = match output.status.code() {
            Some(code) => format!("exit code: {code}"),
            None => "terminated by signal".to_string(),
        };
        if stderr.is_empty() {
            Err(TaskError::Process(reason))
        } else {
            Err(TaskError::Process(format!("{reason}: {stderr}")))
        }
    }
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    let char_count = trimmed.chars().count();
    if char_count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(char_count - STDERR_TAIL_CHARS).collect()
}
