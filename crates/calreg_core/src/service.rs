//! Registry facade: wires the services over a pair of stores.

use std::sync::Arc;

use crate::blacklist::BlacklistService;
use crate::certify::{BasicCertifier, Certifier};
use crate::cleanup::{run_cleanup, CleanupReport};
use crate::config::RegistryConfig;
use crate::content::{ContentStore, LocalContentStore};
use crate::delivery::DeliveryWriter;
use crate::derivation::DerivationEngine;
use crate::error::RegistryError;
use crate::locks::LockManager;
use crate::naming::NamingService;
use crate::ports::{LockStore, RegistryStore, Result};
use crate::seed::SeedService;
use crate::status::StatusService;
use crate::submission::SubmissionService;
use crate::types::{AuditAction, AuditEntry, ContextKind, FileState, RuleTier};

#[derive(Clone)]
pub struct RegistryService {
    pub config: RegistryConfig,
    pub store: Arc<dyn RegistryStore>,
    pub lock_store: Arc<dyn LockStore>,
    pub content: Arc<dyn ContentStore>,
    pub naming: NamingService,
    pub locks: LockManager,
    pub delivery: DeliveryWriter,
    pub submissions: SubmissionService,
    pub blacklist: BlacklistService,
    pub status: StatusService,
    pub seeder: SeedService,
}

impl RegistryService {
    /// Build the service graph. `certifier` defaults to `BasicCertifier`.
    pub fn build(
        config: RegistryConfig,
        store: Arc<dyn RegistryStore>,
        lock_store: Arc<dyn LockStore>,
        certifier: Option<Arc<dyn Certifier>>,
    ) -> Self {
        let content: Arc<dyn ContentStore> =
            Arc::new(LocalContentStore::new(config.storage_root.clone()));
        let certifier =
            certifier.unwrap_or_else(|| Arc::new(BasicCertifier::new(store.clone())));
        let naming = NamingService::new(store.clone(), content.clone(), config.serial_width);
        let locks = LockManager::new(lock_store.clone(), config.locks.policy());
        let derivation =
            DerivationEngine::new(store.clone(), content.clone(), naming.clone(), certifier.clone());
        let delivery = DeliveryWriter::new(
            naming.clone(),
            content.clone(),
            &config.project,
            config.catalog_dir.clone(),
            config.delivery_dirs.clone(),
        );
        let submissions = SubmissionService::new(
            &config.project,
            store.clone(),
            content.clone(),
            naming.clone(),
            locks.clone(),
            certifier,
            derivation,
            delivery.clone(),
        );

        Self {
            blacklist: BlacklistService::new(store.clone()),
            status: StatusService::new(store.clone()),
            seeder: SeedService::new(&config.project, store.clone(), content.clone(), naming.clone()),
            config,
            store,
            lock_store,
            content,
            naming,
            locks,
            delivery,
            submissions,
        }
    }

    pub async fn get_context(&self, kind: ContextKind) -> Result<Option<String>> {
        self.store.get_context(&self.config.project, kind).await
    }

    /// Point a context at a registered top-level file. Pending files are
    /// refused: they may still be cancelled.
    pub async fn set_context(&self, kind: ContextKind, name: &str, user: &str) -> Result<()> {
        let record = self.store.load_record(name).await?;
        if record.category.tier() != Some(RuleTier::Top) {
            return Err(RegistryError::InvalidInput(format!(
                "'{name}' is not a top-level rule file"
            )));
        }
        if record.state == FileState::Pending {
            return Err(RegistryError::Conflict(format!("'{name}' is still pending")));
        }
        if record.is_bad() {
            return Err(RegistryError::Conflict(format!(
                "'{name}' is blacklisted or rejected"
            )));
        }
        self.store.set_context(&self.config.project, kind, name).await?;
        self.store
            .insert_audit_entry(
                &AuditEntry::new(AuditAction::SetContext, user, vec![name.to_string()])
                    .with_detail(kind.as_str()),
            )
            .await?;
        tracing::info!(target: "calreg.status", context = kind.as_str(), file = name, user, "context set");
        Ok(())
    }

    pub async fn cleanup(&self) -> Result<CleanupReport> {
        run_cleanup(
            self.store.as_ref(),
            self.lock_store.as_ref(),
            &self.submissions,
            &self.config.cleanup,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{BatchRecord, ContextSelector, Disposition, FileRecord, LockKey, LockRecord};
    use tempfile::TempDir;

    async fn service() -> (TempDir, RegistryService) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let config = RegistryConfig::rooted_at("proj", dir.path());
        let service = RegistryService::build(config, store.clone(), store, None);
        (dir, service)
    }

    #[tokio::test]
    async fn test_set_context_requires_live_top_level_file() {
        let (_dir, service) = service().await;
        let mut top = FileRecord::pending("proj_0002.pmap", "proj", "ops");
        service.store.create_record(&top).await.unwrap();

        let err = service
            .set_context(ContextKind::Operational, "proj_0002.pmap", "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));

        top.state = FileState::Delivered;
        service.store.update_record(&top).await.unwrap();
        service
            .set_context(ContextKind::Operational, "proj_0002.pmap", "ops")
            .await
            .unwrap();
        assert_eq!(
            service.get_context(ContextKind::Operational).await.unwrap().as_deref(),
            Some("proj_0002.pmap")
        );
        assert!(service.get_context(ContextKind::Edit).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_cancels_abandoned_batches_and_purges_locks() {
        let (_dir, service) = service().await;
        let now = chrono::Utc::now();

        let mut stale = LockRecord::new(LockKey::instrument("miri"), "bob", 1000);
        stale.acquired_at = now - chrono::Duration::hours(1);
        stale.refreshed_at = stale.acquired_at;
        service.lock_store.try_create_lock(&stale).await.unwrap();
        let live = LockRecord::new(LockKey::instrument("nircam"), "carol", 60_000);
        service.lock_store.try_create_lock(&live).await.unwrap();

        let batch = |hours_old: i64| BatchRecord {
            batch_id: uuid::Uuid::new_v4(),
            project: "proj".into(),
            instrument: None,
            submitter: "alice".into(),
            description: String::new(),
            base_context: ContextSelector::Edit,
            new_file_map: Default::default(),
            disposition: Disposition::Ready,
            created_at: now - chrono::Duration::hours(hours_old),
            claimed_at: None,
            finalized_at: None,
            final_context: None,
            substitutions: Default::default(),
            catalog: None,
            failure: None,
        };
        let abandoned = batch(100);
        let recent = batch(1);
        service.store.save_batch(&abandoned).await.unwrap();
        service.store.save_batch(&recent).await.unwrap();

        let report = service.cleanup().await.unwrap();
        assert_eq!(report.expired_locks, 1);
        assert_eq!(report.abandoned_batches, 1);
        assert_eq!(
            service.store.load_batch(abandoned.batch_id).await.unwrap().disposition,
            Disposition::Cancelled
        );
        assert_eq!(
            service.store.load_batch(recent.batch_id).await.unwrap().disposition,
            Disposition::Ready
        );
        assert_eq!(service.locks.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_context_rejects_non_top_level() {
        let (_dir, service) = service().await;
        let mut middle = FileRecord::pending("proj_miri_0001.imap", "proj", "ops");
        middle.state = FileState::Delivered;
        service.store.create_record(&middle).await.unwrap();
        let err = service
            .set_context(ContextKind::Edit, "proj_miri_0001.imap", "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidInput(_)));
    }
}
