//! JSON file store: a `MemoryStore` loaded from disk at startup and written
//! back after every mutation, so each CLI invocation sees the previous one's
//! records, counters, batches and locks.
//!
//! Writes go to a temporary sibling and are renamed into place. There is no
//! inter-process locking; concurrent invocations against one state file can
//! lose updates.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use calreg_core::ports::{LockStore, RegistryStore, Result};
use calreg_core::types::*;
use calreg_core::{MemoryState, MemoryStore, RegistryError};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    /// Open `path`, starting empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str::<MemoryState>(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            MemoryState::default()
        };
        tracing::debug!(path = %path.display(), records = state.records.len(), "state loaded");
        Ok(Self {
            path,
            inner: MemoryStore::from_state(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self) -> Result<()> {
        let state = self.inner.snapshot().await;
        let json = serde_json::to_vec_pretty(&state)
            .context("Failed to serialize registry state")
            .map_err(RegistryError::Internal)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Flush after a mutation that succeeded.
    async fn persist<T>(&self, result: Result<T>) -> Result<T> {
        let value = result?;
        self.flush().await?;
        Ok(value)
    }
}

#[async_trait]
impl RegistryStore for JsonFileStore {
    async fn create_record(&self, record: &FileRecord) -> Result<()> {
        self.persist(self.inner.create_record(record).await).await
    }

    async fn load_record(&self, name: &str) -> Result<FileRecord> {
        self.inner.load_record(name).await
    }

    async fn find_record(&self, name: &str) -> Result<Option<FileRecord>> {
        self.inner.find_record(name).await
    }

    async fn update_record(&self, record: &FileRecord) -> Result<()> {
        self.persist(self.inner.update_record(record).await).await
    }

    async fn destroy_record(&self, name: &str) -> Result<()> {
        self.persist(self.inner.destroy_record(name).await).await
    }

    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<FileRecord>> {
        self.inner.query_records(filter).await
    }

    async fn next_serial(&self, key: &SerialKey) -> Result<u32> {
        self.persist(self.inner.next_serial(key).await).await
    }

    async fn last_serial(&self, key: &SerialKey) -> Result<u32> {
        self.inner.last_serial(key).await
    }

    async fn advance_serial(&self, key: &SerialKey, at_least: u32) -> Result<u32> {
        self.persist(self.inner.advance_serial(key, at_least).await).await
    }

    async fn save_batch(&self, batch: &BatchRecord) -> Result<()> {
        self.persist(self.inner.save_batch(batch).await).await
    }

    async fn load_batch(&self, batch_id: Uuid) -> Result<BatchRecord> {
        self.inner.load_batch(batch_id).await
    }

    async fn transition_batch(
        &self,
        batch_id: Uuid,
        from: Disposition,
        to: Disposition,
    ) -> Result<BatchRecord> {
        self.persist(self.inner.transition_batch(batch_id, from, to).await)
            .await
    }

    async fn list_batches(&self, disposition: Option<Disposition>) -> Result<Vec<BatchRecord>> {
        self.inner.list_batches(disposition).await
    }

    async fn get_context(&self, project: &str, kind: ContextKind) -> Result<Option<String>> {
        self.inner.get_context(project, kind).await
    }

    async fn set_context(&self, project: &str, kind: ContextKind, name: &str) -> Result<()> {
        self.persist(self.inner.set_context(project, kind, name).await)
            .await
    }

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        self.persist(self.inner.insert_audit_entry(entry).await).await
    }

    async fn list_audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.inner.list_audit_entries(limit).await
    }
}

#[async_trait]
impl LockStore for JsonFileStore {
    async fn try_create_lock(&self, lock: &LockRecord) -> Result<Option<LockRecord>> {
        self.persist(self.inner.try_create_lock(lock).await).await
    }

    async fn get_lock(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        self.inner.get_lock(key).await
    }

    async fn touch_lock(
        &self,
        key: &LockKey,
        token: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>> {
        self.persist(self.inner.touch_lock(key, token, at).await)
            .await
    }

    async fn delete_lock(&self, key: &LockKey, token: Uuid) -> Result<bool> {
        self.persist(self.inner.delete_lock(key, token).await).await
    }

    async fn list_locks(&self) -> Result<Vec<LockRecord>> {
        self.inner.list_locks().await
    }

    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<u32> {
        self.persist(self.inner.purge_expired_locks(now).await).await
    }
}
