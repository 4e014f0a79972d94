//! Helpers for the small JSON state files each task keeps on disk.

use std::io;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::error::TaskError;

pub async fn path_exists(path: &Path) -> Result<bool, TaskError> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(TaskError::storage(path, err)),
    }
}

/// Serialize `value` and replace the file content with it.
///
/// An existing file is truncated to zero length before the write so a short
/// new document can never leave trailing bytes of the previous one behind.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TaskError> {
    let encoded = serde_json::to_vec(value).map_err(|source| TaskError::Encode {
        path: path.to_path_buf(),
        source,
    })?;

    if path_exists(path).await? {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|err| TaskError::storage(path, err))?;
        file.set_len(0)
            .await
            .map_err(|err| TaskError::storage(path, err))?;
    }

    fs::write(path, encoded)
        .await
        .map_err(|err| TaskError::storage(path, err))
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TaskError> {
    let raw = fs::read(path)
        .await
        .map_err(|err| TaskError::storage(path, err))?;
    serde_json::from_slice(&raw).map_err(|source| TaskError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
