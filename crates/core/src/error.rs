use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("error encoding {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("generator failed: {0}")]
    Process(String),
    #[error("invalid task id: {0}")]
    InvalidId(String),
    #[error("task not found: {0}")]
    NotFound(String),
}

impl TaskError {
    pub(crate) fn storage(path: &Path, source: io::Error) -> Self {
        TaskError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when the underlying I/O failure was a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        match self {
            TaskError::Storage { source, .. } => source.kind() == io::ErrorKind::NotFound,
            TaskError::NotFound(_) => true,
            _ => false,
        }
    }
}
