//! Bad-file flags.
//!
//! Blacklisting is transitive: a blacklisted file taints every rule file that
//! selects it, directly or through intermediate rule files. Each tainted file
//! remembers the roots that reached it in `blacklisted_by`, so lifting one
//! root leaves files still reached by another root blacklisted. Rejection
//! flags only the named file.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::ports::{RegistryStore, Result};
use crate::types::{AuditAction, AuditEntry, FileRecord, RecordFilter};

#[derive(Clone)]
pub struct BlacklistService {
    store: Arc<dyn RegistryStore>,
}

impl BlacklistService {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    /// Blacklist `root` and everything that selects it. Returns the affected names.
    pub async fn blacklist(&self, root: &str, user: &str) -> Result<Vec<String>> {
        let affected = self
            .propagate(root, |record| {
                if !record.blacklisted_by.iter().any(|r| r == root) {
                    record.blacklisted_by.push(root.to_string());
                    record.blacklisted_by.sort();
                }
            })
            .await?;
        self.store
            .insert_audit_entry(&AuditEntry::new(AuditAction::Blacklist, user, affected.clone()).with_detail(root))
            .await?;
        tracing::info!(target: "calreg.blacklist", root, user, affected = affected.len(), "file blacklisted");
        Ok(affected)
    }

    /// Lift the blacklisting rooted at `root`. Returns the affected names.
    pub async fn unblacklist(&self, root: &str, user: &str) -> Result<Vec<String>> {
        let affected = self
            .propagate(root, |record| record.blacklisted_by.retain(|r| r != root))
            .await?;
        self.store
            .insert_audit_entry(&AuditEntry::new(AuditAction::Unblacklist, user, affected.clone()).with_detail(root))
            .await?;
        tracing::info!(target: "calreg.blacklist", root, user, affected = affected.len(), "blacklist lifted");
        Ok(affected)
    }

    /// Set or clear the non-transitive reject flag.
    pub async fn set_rejected(&self, name: &str, rejected: bool, user: &str) -> Result<()> {
        let mut record = self.store.load_record(name).await?;
        record.rejected = rejected;
        self.store.update_record(&record).await?;
        self.store
            .insert_audit_entry(
                &AuditEntry::new(AuditAction::Reject, user, vec![name.to_string()])
                    .with_detail(if rejected { "rejected" } else { "accepted" }),
            )
            .await?;
        tracing::info!(target: "calreg.blacklist", file = name, rejected, user, "reject flag set");
        Ok(())
    }

    /// Apply `edit` to `root` and every transitive referrer, then recompute
    /// each file's flag from its remaining roots.
    async fn propagate<F>(&self, root: &str, edit: F) -> Result<Vec<String>>
    where
        F: Fn(&mut FileRecord) + Send + Sync,
    {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([root.to_string()]);
        // Fails NotFound for an unknown root before anything changes.
        self.store.load_record(root).await?;

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let mut record = self.store.load_record(&name).await?;
            edit(&mut record);
            record.blacklisted = !record.blacklisted_by.is_empty();
            self.store.update_record(&record).await?;

            let referrers = self
                .store
                .query_records(&RecordFilter {
                    references: Some(name.clone()),
                    ..Default::default()
                })
                .await?;
            queue.extend(referrers.into_iter().map(|r| r.name));
        }
        Ok(seen.into_iter().collect())
    }
}
