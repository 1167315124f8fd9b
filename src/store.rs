//! Durable `job id -> MigrationJob` mapping.

use crate::job::MigrationJob;
use crate::log_warn;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job record could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt job record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Option<MigrationJob>, StoreError>;

    /// Replace the stored record. Must be durable before returning.
    async fn save(&self, job: &MigrationJob) -> Result<(), StoreError>;

    /// Active jobs, plus archived ones when `include_archived` is set.
    async fn list(&self, include_archived: bool) -> Result<Vec<MigrationJob>, StoreError>;

    /// Move a finished job out of the active set. It stays loadable.
    async fn archive(&self, id: Uuid) -> Result<(), StoreError>;
}

/// One pretty-printed JSON file per job. Writes go to a temp file that is
/// fsynced and renamed over the old record.
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("archive")).await?;
        Ok(Self { root })
    }

    fn active_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    fn archive_path(&self, id: Uuid) -> PathBuf {
        self.root.join("archive").join(format!("{}.json", id))
    }

    async fn read(path: &Path) -> Result<Option<MigrationJob>, StoreError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    async fn read_dir(dir: &Path, jobs: &mut Vec<MigrationJob>) -> Result<(), StoreError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(err) => log_warn!("Skipping unreadable job record: {}", err),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn load(&self, id: Uuid) -> Result<Option<MigrationJob>, StoreError> {
        if let Some(job) = Self::read(&self.active_path(id)).await? {
            return Ok(Some(job));
        }
        Self::read(&self.archive_path(id)).await
    }

    async fn save(&self, job: &MigrationJob) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;

        let content = serde_json::to_vec_pretty(job)?;
        let path = self.active_path(job.id);
        let tmp = path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list(&self, include_archived: bool) -> Result<Vec<MigrationJob>, StoreError> {
        let mut jobs = Vec::new();
        Self::read_dir(&self.root, &mut jobs).await?;
        if include_archived {
            Self::read_dir(&self.root.join("archive"), &mut jobs).await?;
        }
        jobs.sort_by_key(|j| j.timestamps.created);
        Ok(jobs)
    }

    async fn archive(&self, id: Uuid) -> Result<(), StoreError> {
        match tokio::fs::rename(self.active_path(id), self.archive_path(id)).await {
            Ok(()) => Ok(()),
            // Already archived.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Volatile store for tests and dry runs.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, (MigrationJob, bool)>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self, id: Uuid) -> Result<Option<MigrationJob>, StoreError> {
        Ok(self.jobs.read().await.get(&id).map(|(job, _)| job.clone()))
    }

    async fn save(&self, job: &MigrationJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let archived = jobs.get(&job.id).map(|(_, a)| *a).unwrap_or(false);
        jobs.insert(job.id, (job.clone(), archived));
        Ok(())
    }

    async fn list(&self, include_archived: bool) -> Result<Vec<MigrationJob>, StoreError> {
        let mut jobs: Vec<MigrationJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|(_, archived)| include_archived || !archived)
            .map(|(job, _)| job.clone())
            .collect();
        jobs.sort_by_key(|j| j.timestamps.created);
        Ok(jobs)
    }

    async fn archive(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(entry) = self.jobs.write().await.get_mut(&id) {
            entry.1 = true;
        }
        Ok(())
    }
}
