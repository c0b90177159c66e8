//! JSON state file for [`MemoryStore`](super::MemoryStore)

use super::memory::Tables;
use super::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    tables: Tables,
}

/// State file holding every store table, with a `.backup` of the previous write
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }

    /// Load the tables, or empty tables when the file does not exist yet
    pub async fn load(&self) -> Result<Tables> {
        if !self.path.exists() {
            tracing::debug!("State file not found, starting with empty tables");
            return Ok(Tables::default());
        }

        let content = fs::read_to_string(&self.path).await?;
        let document: SnapshotDocument = serde_json::from_str(&content)?;

        if document.version > SNAPSHOT_VERSION {
            return Err(StoreError::VersionTooNew {
                found: document.version,
                supported: SNAPSHOT_VERSION,
            });
        }

        tracing::debug!(
            locks = document.tables.locks.len(),
            relations = document.tables.relations.len(),
            "Loaded state file {}",
            self.path.display()
        );
        Ok(document.tables)
    }

    pub async fn save(&self, tables: &Tables) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).await?;
            }
        }

        let backup = self.backup_path();
        if self.path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&self.path, &backup).await?;
            tracing::debug!("Created state backup");
        }

        let document = SnapshotDocument {
            version: SNAPSHOT_VERSION,
            updated_at: Utc::now(),
            tables: tables.clone(),
        };
        fs::write(&self.path, serde_json::to_string_pretty(&document)?).await?;

        tracing::debug!(locks = tables.locks.len(), "Saved state file {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ResourceStore};
    use flowgate_core::{FlowId, ResourceFlowLock, ResourceRef, TaskKind};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_load_with_backup() {
        let temp_dir = tempdir().unwrap();
        let file = SnapshotFile::new(temp_dir.path().join("state").join("flowgate.json"));

        let store = MemoryStore::new();
        store
            .lock_resource(ResourceFlowLock::new(
                ResourceRef::new("lb-1", "LB"),
                FlowId::new("f1"),
                TaskKind::new("add_rs"),
            ))
            .await
            .unwrap();

        file.save(&store.snapshot().await).await.unwrap();
        file.save(&store.snapshot().await).await.unwrap();
        assert!(file.backup_path().exists());

        let restored = MemoryStore::from_tables(file.load().await.unwrap());
        let lock = restored
            .get_lock(&ResourceRef::new("lb-1", "LB"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.owner, FlowId::new("f1"));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let temp_dir = tempdir().unwrap();
        let file = SnapshotFile::new(temp_dir.path().join("none.json"));
        let tables = file.load().await.unwrap();
        assert!(tables.locks.is_empty());
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"version": 99, "updated_at": "2026-01-01T00:00:00Z", "tables": {}}"#,
        )
        .unwrap();

        let err = SnapshotFile::new(&path).load().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionTooNew {
                found: 99,
                supported: 1
            }
        ));
    }
}
