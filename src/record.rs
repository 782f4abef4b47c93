//! One-file-per-record persistence with commit-then-replace.
//!
//! A write stages the full new value in `<name>.commit`, syncs it, then
//! renames it over `<name>`. A read first looks for a leftover commit file:
//! a commit that decodes is a completed stage whose replace was interrupted,
//! so it is promoted; one that does not decode was torn mid-stage and is
//! dropped. Either way the reader sees the last fully staged value.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::store::StoreError;

pub const COMMIT_SUFFIX: &str = ".commit";

/// Handle to a single persisted record. Holds no lock; callers serialize.
#[derive(Debug, Clone)]
pub struct RecordFile {
    dir: PathBuf,
    path: PathBuf,
    commit_path: PathBuf,
}

impl RecordFile {
    pub fn new(dir: &Path, file_name: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            path: dir.join(file_name),
            commit_path: dir.join(format!("{file_name}{COMMIT_SUFFIX}")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commit_path(&self) -> &Path {
        &self.commit_path
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Load the record. `StoreError::NotFound` when it was never written.
    pub async fn read<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        self.recover::<T>().await?;
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(StoreError::io(format!("read {}", self.name()), e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::serialization(format!("decode {}", self.name()), e))
    }

    /// Durably replace the record with `value`.
    pub async fn write<T: Serialize>(&self, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::serialization(format!("encode {}", self.name()), e))?;
        self.stage(&bytes).await?;
        self.replace().await
    }

    /// Remove the record and any staged commit. Absent files are not an error.
    pub async fn delete(&self) -> Result<(), StoreError> {
        for path in [&self.commit_path, &self.path] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(format!("delete {}", self.name()), e)),
            }
        }
        Ok(())
    }

    /// Write the commit file and flush it to stable storage.
    pub(crate) async fn stage(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let op = || format!("stage {}", self.name());
        let mut file = fs::File::create(&self.commit_path)
            .await
            .map_err(|e| StoreError::io(op(), e))?;
        file.write_all(bytes).await.map_err(|e| StoreError::io(op(), e))?;
        file.sync_all().await.map_err(|e| StoreError::io(op(), e))?;
        Ok(())
    }

    async fn replace(&self) -> Result<(), StoreError> {
        fs::rename(&self.commit_path, &self.path)
            .await
            .map_err(|e| StoreError::io(format!("replace {}", self.name()), e))?;
        self.sync_dir().await;
        Ok(())
    }

    /// Finish or discard a stage left behind by an interrupted write.
    async fn recover<T: DeserializeOwned>(&self) -> Result<(), StoreError> {
        let staged = match fs::read(&self.commit_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(format!("recover {}", self.name()), e)),
        };

        if serde_json::from_slice::<T>(&staged).is_ok() {
            debug!(record = %self.name(), "Promoting staged commit");
            self.replace().await
        } else {
            warn!(record = %self.name(), "Discarding torn commit file");
            fs::remove_file(&self.commit_path)
                .await
                .map_err(|e| StoreError::io(format!("recover {}", self.name()), e))
        }
    }

    /// Make the rename itself durable. Best effort: not every platform
    /// lets a directory be opened for sync.
    async fn sync_dir(&self) {
        #[cfg(unix)]
        {
            if let Ok(dir) = fs::File::open(&self.dir).await {
                let _ = dir.sync_all().await;
            }
        }
    }
}
