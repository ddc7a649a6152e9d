//! File lifecycle after staging: destruction, and the delivered → operational
//! step signalled by the ingest agent removing a catalog link.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::content::ContentStore;
use crate::error::RegistryError;
use crate::ports::{RegistryStore, Result};
use crate::types::{FileState, RecordFilter};

/// Remove a file's registry record and its canonical content.
///
/// Either half may already be gone; content is removed even when no record
/// was ever created.
pub async fn destroy_file(
    store: &dyn RegistryStore,
    content: &dyn ContentStore,
    name: &str,
) -> Result<()> {
    match store.destroy_record(name).await {
        Ok(()) | Err(RegistryError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    content.remove(name).await?;
    tracing::info!(target: "calreg.status", file = name, "file destroyed");
    Ok(())
}

/// Whether the ingest agent still holds a delivery: the catalog link or its
/// `_proc` working copy exists.
async fn catalog_pending(link: &Path) -> Result<bool> {
    if tokio::fs::try_exists(link).await? {
        return Ok(true);
    }
    let mut proc_link = link.as_os_str().to_owned();
    proc_link.push("_proc");
    Ok(tokio::fs::try_exists(PathBuf::from(proc_link)).await?)
}

#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn RegistryStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    /// Current state of `name`, first advancing a delivered file to
    /// operational once its catalog link is gone.
    pub async fn refresh_status(&self, name: &str) -> Result<FileState> {
        let mut record = self.store.load_record(name).await?;
        if !matches!(record.state, FileState::Delivered | FileState::Archived) {
            return Ok(record.state);
        }
        let Some(link) = record.catalog_link.clone() else {
            return Ok(record.state);
        };
        if catalog_pending(&link).await? {
            return Ok(record.state);
        }
        record
            .advance(FileState::Operational)
            .map_err(RegistryError::Conflict)?;
        record.activated_at = Some(Utc::now());
        self.store.update_record(&record).await?;
        tracing::info!(
            target: "calreg.status",
            file = name,
            catalog = %link.display(),
            "catalog consumed, file operational"
        );
        Ok(record.state)
    }

    /// Refresh every delivered or archived file of `project`. Returns the names
    /// that became operational.
    pub async fn sweep_delivered(&self, project: &str) -> Result<Vec<String>> {
        let mut advanced = Vec::new();
        for state in [FileState::Delivered, FileState::Archived] {
            let filter = RecordFilter {
                project: Some(project.to_string()),
                state: Some(state),
                ..Default::default()
            };
            for record in self.store.query_records(&filter).await? {
                if self.refresh_status(&record.name).await? == FileState::Operational {
                    advanced.push(record.name);
                }
            }
        }
        tracing::info!(
            target: "calreg.status",
            project,
            advanced = advanced.len(),
            "delivery sweep completed"
        );
        Ok(advanced)
    }

    /// Explicit state change reported by the ingest agent.
    pub async fn advance(&self, name: &str, next: FileState) -> Result<()> {
        let mut record = self.store.load_record(name).await?;
        record.advance(next).map_err(RegistryError::Conflict)?;
        if next == FileState::Operational {
            record.activated_at = Some(Utc::now());
        }
        self.store.update_record(&record).await?;
        tracing::info!(target: "calreg.status", file = name, state = %next, "state advanced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::LocalContentStore;
    use crate::store::MemoryStore;
    use crate::types::FileRecord;
    use tempfile::TempDir;

    async fn delivered(store: &MemoryStore, name: &str, link: &Path) {
        let mut record = FileRecord::pending(name, "proj", "alice");
        record.state = FileState::Delivered;
        record.catalog_link = Some(link.to_path_buf());
        store.create_record(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_waits_for_catalog_and_proc_links() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("proj_0001.cat");
        tokio::fs::write(&link, "a.fits\n").await.unwrap();

        let store = Arc::new(MemoryStore::new());
        delivered(&store, "a.fits", &link).await;
        let status = StatusService::new(store.clone());

        assert_eq!(status.refresh_status("a.fits").await.unwrap(), FileState::Delivered);

        let proc_link = dir.path().join("proj_0001.cat_proc");
        tokio::fs::rename(&link, &proc_link).await.unwrap();
        assert_eq!(status.refresh_status("a.fits").await.unwrap(), FileState::Delivered);

        tokio::fs::remove_file(&proc_link).await.unwrap();
        assert_eq!(status.refresh_status("a.fits").await.unwrap(), FileState::Operational);
        let record = store.load_record("a.fits").await.unwrap();
        assert!(record.activated_at.is_some());
    }

    #[tokio::test]
    async fn test_sweep_reports_advanced_files() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let kept = dir.path().join("kept.cat");
        tokio::fs::write(&kept, "").await.unwrap();
        delivered(&store, "a.fits", &dir.path().join("gone.cat")).await;
        delivered(&store, "b.fits", &kept).await;

        let status = StatusService::new(store);
        assert_eq!(status.sweep_delivered("proj").await.unwrap(), vec!["a.fits"]);
    }

    #[tokio::test]
    async fn test_advance_refuses_regression() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_record(&FileRecord::pending("a.fits", "proj", "alice"))
            .await
            .unwrap();
        let status = StatusService::new(store);
        let err = status.advance("a.fits", FileState::Operational).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
        status.advance("a.fits", FileState::Delivered).await.unwrap();
        status.advance("a.fits", FileState::Archived).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_file_tolerates_missing_record() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let content = LocalContentStore::new(dir.path());
        content.write("orphan.fits", b"x").await.unwrap();

        destroy_file(&store, &content, "orphan.fits").await.unwrap();
        assert!(!content.exists("orphan.fits").await.unwrap());
    }
}
