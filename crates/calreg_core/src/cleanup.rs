//! Retention and cleanup.
//!
//! - Expired locks are purged from the lease table.
//! - `Ready` batches nobody confirmed or cancelled within
//!   `abandoned_batch_hours` are cancelled, destroying their staged files.
//! - `Finalizing` batches whose confirm died are rolled back once the claim is
//!   older than a lock lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::{LockStore, RegistryStore, Result};
use crate::submission::SubmissionService;
use crate::types::Disposition;

/// Configuration for the cleanup policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupPolicy {
    /// Hours after which an unconfirmed `Ready` batch is cancelled.
    pub abandoned_batch_hours: u32,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            abandoned_batch_hours: 72,
        }
    }
}

/// Result of a cleanup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Number of expired locks removed.
    pub expired_locks: u32,
    /// Number of abandoned batches cancelled.
    pub abandoned_batches: u32,
    /// Number of interrupted confirmations rolled back.
    #[serde(default)]
    pub stalled_batches: u32,
    /// Timestamp when cleanup was performed.
    pub cleaned_at: DateTime<Utc>,
}

/// Run the cleanup process according to the given policy.
pub async fn run_cleanup(
    store: &dyn RegistryStore,
    lock_store: &dyn LockStore,
    submissions: &SubmissionService,
    policy: &CleanupPolicy,
) -> Result<CleanupReport> {
    let now = Utc::now();
    let cutoff = now - chrono::Duration::hours(i64::from(policy.abandoned_batch_hours));

    let expired_locks = lock_store.purge_expired_locks(now).await?;

    let mut abandoned_batches = 0;
    for batch in store.list_batches(Some(Disposition::Ready)).await? {
        if batch.created_at >= cutoff {
            continue;
        }
        match submissions.cancel(batch.batch_id, &batch.submitter).await {
            Ok(()) => abandoned_batches += 1,
            Err(e) => tracing::error!(
                target: "calreg.cleanup",
                batch_id = %batch.batch_id,
                error = %e,
                "failed to cancel abandoned batch"
            ),
        }
    }

    let mut stalled_batches = 0;
    for batch in store.list_batches(Some(Disposition::Finalizing)).await? {
        match submissions.recover_stalled(batch.batch_id).await {
            Ok(true) => stalled_batches += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(
                target: "calreg.cleanup",
                batch_id = %batch.batch_id,
                error = %e,
                "failed to roll back stalled batch"
            ),
        }
    }

    tracing::info!(
        target: "calreg.cleanup",
        expired_locks,
        abandoned_batches,
        stalled_batches,
        cutoff = %cutoff,
        "cleanup completed"
    );

    Ok(CleanupReport {
        expired_locks,
        abandoned_batches,
        stalled_batches,
        cleaned_at: now,
    })
}
