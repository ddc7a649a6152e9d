//! In-memory registry and lock store.
//!
//! Used by tests and as the engine behind the CLI's JSON file store, which
//! snapshots `MemoryState` to disk after each mutation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::ports::{LockStore, RegistryStore, Result};
use crate::types::*;

/// Everything a `MemoryStore` holds. String keys keep the snapshot JSON-friendly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryState {
    #[serde(default)]
    pub records: BTreeMap<String, FileRecord>,
    /// `SerialKey::storage_key` → last serial handed out.
    #[serde(default)]
    pub counters: BTreeMap<String, u32>,
    #[serde(default)]
    pub batches: BTreeMap<String, BatchRecord>,
    /// `{project}:{kind}` → top-level file name.
    #[serde(default)]
    pub contexts: BTreeMap<String, String>,
    /// `LockKey` display form → lease.
    #[serde(default)]
    pub locks: BTreeMap<String, LockRecord>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
}

fn context_key(project: &str, kind: ContextKind) -> String {
    format!("{project}:{}", kind.as_str())
}

pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_state(MemoryState::default())
    }

    pub fn from_state(state: MemoryState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.read().await.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn create_record(&self, record: &FileRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.name) {
            return Err(RegistryError::Conflict(format!(
                "record '{}' already exists",
                record.name
            )));
        }
        state.records.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn load_record(&self, name: &str) -> Result<FileRecord> {
        self.find_record(name)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("file '{name}'")))
    }

    async fn find_record(&self, name: &str) -> Result<Option<FileRecord>> {
        Ok(self.state.read().await.records.get(name).cloned())
    }

    async fn update_record(&self, record: &FileRecord) -> Result<()> {
        let mut state = self.state.write().await;
        match state.records.get_mut(&record.name) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RegistryError::NotFound(format!("file '{}'", record.name))),
        }
    }

    async fn destroy_record(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .records
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(format!("file '{name}'")))
    }

    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<FileRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn next_serial(&self, key: &SerialKey) -> Result<u32> {
        let mut state = self.state.write().await;
        let counter = state.counters.entry(key.storage_key()).or_insert(0);
        *counter = counter
            .checked_add(1)
            .ok_or_else(|| RegistryError::NameCollision(format!("serial space exhausted for {key}")))?;
        Ok(*counter)
    }

    async fn last_serial(&self, key: &SerialKey) -> Result<u32> {
        let state = self.state.read().await;
        Ok(state
            .counters
            .get(&key.storage_key())
            .copied()
            .unwrap_or(0))
    }

    async fn advance_serial(&self, key: &SerialKey, at_least: u32) -> Result<u32> {
        let mut state = self.state.write().await;
        let counter = state.counters.entry(key.storage_key()).or_insert(0);
        if *counter < at_least {
            *counter = at_least;
        }
        Ok(*counter)
    }

    async fn save_batch(&self, batch: &BatchRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .batches
            .insert(batch.batch_id.to_string(), batch.clone());
        Ok(())
    }

    async fn load_batch(&self, batch_id: Uuid) -> Result<BatchRecord> {
        let state = self.state.read().await;
        state
            .batches
            .get(&batch_id.to_string())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("batch {batch_id}")))
    }

    async fn transition_batch(
        &self,
        batch_id: Uuid,
        from: Disposition,
        to: Disposition,
    ) -> Result<BatchRecord> {
        let mut state = self.state.write().await;
        let batch = state
            .batches
            .get_mut(&batch_id.to_string())
            .ok_or_else(|| RegistryError::NotFound(format!("batch {batch_id}")))?;
        if batch.disposition != from {
            return Err(RegistryError::Conflict(format!(
                "batch {batch_id} is {}, expected {from}",
                batch.disposition
            )));
        }
        batch.disposition = to;
        if to == Disposition::Finalizing {
            batch.claimed_at = Some(Utc::now());
        }
        Ok(batch.clone())
    }

    async fn list_batches(&self, disposition: Option<Disposition>) -> Result<Vec<BatchRecord>> {
        let state = self.state.read().await;
        let mut batches: Vec<BatchRecord> = state
            .batches
            .values()
            .filter(|b| disposition.is_none_or(|d| b.disposition == d))
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    async fn get_context(&self, project: &str, kind: ContextKind) -> Result<Option<String>> {
        let state = self.state.read().await;
        Ok(state.contexts.get(&context_key(project, kind)).cloned())
    }

    async fn set_context(&self, project: &str, kind: ContextKind, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .contexts
            .insert(context_key(project, kind), name.to_string());
        Ok(())
    }

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        self.state.write().await.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().await;
        Ok(state.audit.iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_create_lock(&self, lock: &LockRecord) -> Result<Option<LockRecord>> {
        let mut state = self.state.write().await;
        let slot = lock.key.to_string();
        if let Some(existing) = state.locks.get(&slot) {
            if !existing.is_expired() {
                return Ok(Some(existing.clone()));
            }
        }
        state.locks.insert(slot, lock.clone());
        Ok(None)
    }

    async fn get_lock(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        Ok(self.state.read().await.locks.get(&key.to_string()).cloned())
    }

    async fn touch_lock(
        &self,
        key: &LockKey,
        token: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>> {
        let mut state = self.state.write().await;
        match state.locks.get_mut(&key.to_string()) {
            Some(lock) if lock.token == token && !lock.is_expired_at(at) => {
                lock.refreshed_at = at;
                Ok(Some(lock.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_lock(&self, key: &LockKey, token: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        let slot = key.to_string();
        match state.locks.get(&slot) {
            Some(lock) if lock.token == token => {
                state.locks.remove(&slot);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_locks(&self) -> Result<Vec<LockRecord>> {
        Ok(self.state.read().await.locks.values().cloned().collect())
    }

    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<u32> {
        let mut state = self.state.write().await;
        let before = state.locks.len();
        state.locks.retain(|_, lock| !lock.is_expired_at(now));
        Ok(u32::try_from(before - state.locks.len()).unwrap_or(u32::MAX))
    }
}
