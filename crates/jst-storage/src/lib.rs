//! SQLite access for tracker consolidation: legacy source reading, the unified
//! target store, and hash-addressed snapshots of the target taken before a run.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod source;
mod unified;

pub use source::{
    read_source, ColumnInfo, SourceIssue, SourceReadOutcome, SourceStatus, SourceTable,
};
pub use unified::{
    ConflictPolicy, DuplicateGroup, KeyIndexCheck, RunLedgerEntry, RunStart, TableWriteStats,
    UnifiedBatch, UnifiedStore, WriteSummary,
};

pub const CRATE_NAME: &str = "jst-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid SQL identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Accepts only `[A-Za-z0-9_]+`; anything else never reaches interpolated SQL.
pub fn validate_identifier(name: &str) -> Result<&str, StorageError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

pub fn quote_identifier(name: &str) -> Result<String, StorageError> {
    validate_identifier(name).map(|n| format!("\"{n}\""))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable copies of the unified database, addressed by content hash.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_relative_path(
        &self,
        taken_at: DateTime<Utc>,
        label: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = taken_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(label)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Copy an existing file into the store.
    pub async fn store_file(
        &self,
        taken_at: DateTime<Utc>,
        label: &str,
        path: &Path,
    ) -> anyhow::Result<StoredSnapshot> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {} for snapshot", path.display()))?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();
        self.store_bytes(taken_at, label, &extension, &bytes).await
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        taken_at: DateTime<Utc>,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.snapshot_relative_path(taken_at, label, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}
