//! Storage port traits for the registry.
//! Implemented by `store::MemoryStore` and the CLI's JSON file store; core logic
//! depends only on these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::types::*;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry view of every known file, plus the counters, batches, context
/// pointers and audit rows that live beside it.
///
/// Single-row operations are atomic. Nothing spans rows; multi-file batches are
/// undone by compensating cleanup in the submission workflow.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    // ── FileRecord CRUD ────────────────────────────────────────

    /// Insert a new record. Fails with `Conflict` when the name is taken.
    async fn create_record(&self, record: &FileRecord) -> Result<()>;

    /// Load a record by name. Fails with `NotFound`.
    async fn load_record(&self, name: &str) -> Result<FileRecord>;

    async fn find_record(&self, name: &str) -> Result<Option<FileRecord>>;

    /// Replace an existing record. Fails with `NotFound`.
    async fn update_record(&self, record: &FileRecord) -> Result<()>;

    /// Delete a record. Fails with `NotFound`.
    async fn destroy_record(&self, name: &str) -> Result<()>;

    /// Records matching `filter`, ordered by name.
    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<FileRecord>>;

    // ── Serial counters ────────────────────────────────────────

    /// Atomically increment the counter for `key` and return the new value.
    /// The first call for a key returns 1.
    async fn next_serial(&self, key: &SerialKey) -> Result<u32>;

    /// Last value handed out for `key`, 0 when none.
    async fn last_serial(&self, key: &SerialKey) -> Result<u32>;

    /// Raise the counter for `key` to at least `at_least`. Never lowers it.
    /// Returns the counter value after the call.
    async fn advance_serial(&self, key: &SerialKey, at_least: u32) -> Result<u32>;

    // ── Batches ────────────────────────────────────────────────

    async fn save_batch(&self, batch: &BatchRecord) -> Result<()>;

    async fn load_batch(&self, batch_id: Uuid) -> Result<BatchRecord>;

    /// Compare-and-set on disposition. Fails with `Conflict` when the stored
    /// disposition is not `from`. Moving to `Finalizing` also stamps
    /// `claimed_at`. Returns the updated batch.
    async fn transition_batch(
        &self,
        batch_id: Uuid,
        from: Disposition,
        to: Disposition,
    ) -> Result<BatchRecord>;

    async fn list_batches(&self, disposition: Option<Disposition>) -> Result<Vec<BatchRecord>>;

    // ── Context pointers ───────────────────────────────────────

    async fn get_context(&self, project: &str, kind: ContextKind) -> Result<Option<String>>;

    async fn set_context(&self, project: &str, kind: ContextKind, name: &str) -> Result<()>;

    // ── Audit trail ────────────────────────────────────────────

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<()>;

    /// Most recent entries first.
    async fn list_audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>>;
}

/// Shared lease table. Locks outlive any single request, so this lives in the
/// store rather than in process memory.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert `lock` unless a live lock already holds its key; an expired lock
    /// is replaced. Returns the live lock that blocked the insert, or `None`.
    async fn try_create_lock(&self, lock: &LockRecord) -> Result<Option<LockRecord>>;

    /// Stored lock for `key`, expired or not.
    async fn get_lock(&self, key: &LockKey) -> Result<Option<LockRecord>>;

    /// Set `refreshed_at = at` when the live lock on `key` is the acquisition
    /// identified by `token`. Returns the refreshed lock, `None` when it was lost.
    async fn touch_lock(
        &self,
        key: &LockKey,
        token: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>>;

    /// Delete the lock on `key` when it is the acquisition identified by
    /// `token`. Returns whether a row went.
    async fn delete_lock(&self, key: &LockKey, token: Uuid) -> Result<bool>;

    async fn list_locks(&self) -> Result<Vec<LockRecord>>;

    /// Delete every lock expired at `now`. Returns the count removed.
    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<u32>;
}
