//! Artifact storage for stage outputs.
//!
//! Stage executors hand back raw payloads; workers write them through an
//! [`ArtifactStore`] and attach the returned references to the stage record.
//! Two stores are provided:
//!
//! - [`FsArtifactStore`]: files on disk, content-addressed by SHA-256, with
//!   metadata rows in the database
//! - [`MemoryArtifactStore`]: process-local map, for tests and dry runs

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use super::database::Database;
use crate::pipeline::stage::StageKind;

/// Errors that can occur during artifact storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] super::database::DatabaseError),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Artifact not found: {0}")]
    NotFound(ArtifactRef),

    /// Checksum verification failed.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Failed to create storage directory: {0}")]
    DirectoryCreationFailed(String),
}

/// Opaque handle to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored stage output, owned by exactly one job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    pub reference: ArtifactRef,
    /// Stage that produced this artifact.
    pub kind: StageKind,
    pub owning_job_id: Uuid,
    /// File name chosen by the executor (e.g., "logo-1.png").
    pub name: String,
    pub size_bytes: u64,
}

/// Durable blob store for stage outputs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `data` and returns a reference attributed to `owner`.
    async fn put(
        &self,
        owner: Uuid,
        kind: StageKind,
        name: &str,
        data: &[u8],
    ) -> Result<Artifact, StorageError>;

    /// Reads back the bytes of a stored artifact.
    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, reference: &ArtifactRef) -> Result<(), StorageError>;
}

/// Computes the SHA-256 checksum of data.
fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Number of locks checksums are striped over.
const CHECKSUM_LOCK_STRIPES: usize = 64;

/// Filesystem artifact store.
///
/// Files are organized by their checksum so identical payloads share one file
/// on disk. Metadata is stored in the `artifacts` table.
///
/// Creating a shared file, adding a row for it, and removing the file once
/// its last row is gone all happen under the checksum's lock, so a file
/// exists whenever a row points at it.
pub struct FsArtifactStore {
    base_path: PathBuf,
    db: Arc<Database>,
    checksum_locks: Vec<Mutex<()>>,
}

impl FsArtifactStore {
    pub fn new(base_path: impl Into<PathBuf>, db: Arc<Database>) -> Self {
        Self {
            base_path: base_path.into(),
            db,
            checksum_locks: (0..CHECKSUM_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    async fn ensure_directories(&self) -> Result<(), StorageError> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path).await.map_err(|e| {
                StorageError::DirectoryCreationFailed(format!(
                    "Failed to create base directory {:?}: {}",
                    self.base_path, e
                ))
            })?;
        }
        Ok(())
    }

    /// Uses the first 2 characters of the checksum as a subdirectory.
    fn artifact_path(&self, checksum: &str) -> PathBuf {
        let subdir = &checksum[0..2.min(checksum.len())];
        self.base_path.join(subdir).join(checksum)
    }

    fn checksum_lock(&self, checksum: &str) -> &Mutex<()> {
        let stripe = checksum
            .get(..2)
            .and_then(|prefix| usize::from_str_radix(prefix, 16).ok())
            .unwrap_or(0);
        &self.checksum_locks[stripe % self.checksum_locks.len()]
    }

    /// Writes `data` to a temporary file beside `path`, then renames it into
    /// place. Readers see either no file or the complete one.
    async fn write_file(path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let tmp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let written = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_file(path: &Path) -> Result<(), StorageError> {
        if fs::try_exists(path).await? {
            fs::remove_file(path).await?;
            if let Some(parent) = path.parent() {
                let _ = fs::remove_dir(parent).await; // may not be empty
            }
        }
        Ok(())
    }

    /// References of every artifact attributed to a job, oldest first.
    pub async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<ArtifactRef>, StorageError> {
        let rows = sqlx::query("SELECT id FROM artifacts WHERE job_id = ?1 ORDER BY created_at")
            .bind(job_id.to_string())
            .fetch_all(self.db.pool())
            .await?;

        rows.iter()
            .map(|row| Ok(ArtifactRef::new(row.try_get::<String, _>("id")?)))
            .collect()
    }

    /// Gets the total storage size used by artifacts.
    pub async fn total_storage_size(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COALESCE(SUM(size_bytes), 0) AS total FROM artifacts")
            .fetch_one(self.db.pool())
            .await?;

        let total: i64 = row.try_get("total")?;
        Ok(total as u64)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        owner: Uuid,
        kind: StageKind,
        name: &str,
        data: &[u8],
    ) -> Result<Artifact, StorageError> {
        self.ensure_directories().await?;

        let artifact_id = Uuid::new_v4();
        let checksum = compute_checksum(data);
        let file_path = self.artifact_path(&checksum);

        let _guard = self.checksum_lock(&checksum).lock().await;

        // Identical payloads are written once.
        let created = !fs::try_exists(&file_path).await?;
        if created {
            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            Self::write_file(&file_path, data).await?;
        }

        let relative_path = file_path
            .strip_prefix(&self.base_path)
            .unwrap_or(&file_path)
            .to_string_lossy()
            .to_string();

        let inserted = sqlx::query(
            r#"
            INSERT INTO artifacts (id, job_id, stage_kind, name, path, size_bytes, checksum, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(artifact_id.to_string())
        .bind(owner.to_string())
        .bind(kind.as_str())
        .bind(name)
        .bind(&relative_path)
        .bind(data.len() as i64)
        .bind(&checksum)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await;

        if let Err(e) = inserted {
            // A file that existed before this call belongs to other rows.
            if created {
                if let Err(cleanup) = Self::remove_file(&file_path).await {
                    warn!(path = ?file_path, error = %cleanup, "Failed to remove unreferenced artifact file");
                }
            }
            return Err(e.into());
        }

        Ok(Artifact {
            reference: ArtifactRef::new(artifact_id.to_string()),
            kind,
            owning_job_id: owner,
            name: name.to_string(),
            size_bytes: data.len() as u64,
        })
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>, StorageError> {
        let row = sqlx::query("SELECT path, checksum FROM artifacts WHERE id = ?1")
            .bind(reference.as_str())
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| StorageError::NotFound(reference.clone()))?;

        let relative_path: String = row.try_get("path")?;
        let expected_checksum: String = row.try_get("checksum")?;

        let file_path = self.base_path.join(&relative_path);
        let mut file = fs::File::open(&file_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(reference.clone())
            } else {
                StorageError::Io(e)
            }
        })?;

        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        let actual_checksum = compute_checksum(&data);
        if actual_checksum != expected_checksum {
            return Err(StorageError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        Ok(data)
    }

    /// The underlying file is only removed once no other artifact shares it.
    async fn delete(&self, reference: &ArtifactRef) -> Result<(), StorageError> {
        let row = sqlx::query("SELECT path, checksum FROM artifacts WHERE id = ?1")
            .bind(reference.as_str())
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| StorageError::NotFound(reference.clone()))?;

        let relative_path: String = row.try_get("path")?;
        let checksum: String = row.try_get("checksum")?;

        let _guard = self.checksum_lock(&checksum).lock().await;

        let deleted = sqlx::query("DELETE FROM artifacts WHERE id = ?1")
            .bind(reference.as_str())
            .execute(self.db.pool())
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StorageError::NotFound(reference.clone()));
        }

        let count_row = sqlx::query("SELECT COUNT(*) AS count FROM artifacts WHERE checksum = ?1")
            .bind(&checksum)
            .fetch_one(self.db.pool())
            .await?;
        let remaining_refs: i64 = count_row.try_get("count")?;

        if remaining_refs == 0 {
            Self::remove_file(&self.base_path.join(&relative_path)).await?;
        }

        Ok(())
    }
}

/// In-process artifact store.
#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<ArtifactRef, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    pub async fn contains(&self, reference: &ArtifactRef) -> bool {
        self.blobs.read().await.contains_key(reference)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        owner: Uuid,
        kind: StageKind,
        name: &str,
        data: &[u8],
    ) -> Result<Artifact, StorageError> {
        let reference = ArtifactRef::new(Uuid::new_v4().to_string());
        self.blobs
            .write()
            .await
            .insert(reference.clone(), data.to_vec());
        Ok(Artifact {
            reference,
            kind,
            owning_job_id: owner,
            name: name.to_string(),
            size_bytes: data.len() as u64,
        })
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(reference.clone()))
    }

    async fn delete(&self, reference: &ArtifactRef) -> Result<(), StorageError> {
        self.blobs
            .write()
            .await
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(reference.clone()))
    }
}
