//! Bootstrap import of an existing rule hierarchy.
//!
//! Seeding registers files without certification or derivation. Serial
//! counters are mirrored from the imported names so the allocator never
//! reissues them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::content::{content_hash, validate_name, ContentStore, ContentStoreError};
use crate::error::RegistryError;
use crate::naming::{compare_by_serial, decompose_name, NamingService};
use crate::ports::{RegistryStore, Result};
use crate::rules::RuleFile;
use crate::types::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRequest {
    pub sources: Vec<PathBuf>,
    pub state: FileState,
    pub submitter: String,
    /// Point the edit and operational contexts at the newest seeded top-level file.
    pub set_contexts: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedReport {
    pub registered: Vec<String>,
    /// Names already registered; left untouched.
    pub skipped: Vec<String>,
    pub contexts: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct SeedService {
    project: String,
    store: Arc<dyn RegistryStore>,
    content: Arc<dyn ContentStore>,
    naming: NamingService,
}

impl SeedService {
    pub fn new(
        project: impl Into<String>,
        store: Arc<dyn RegistryStore>,
        content: Arc<dyn ContentStore>,
        naming: NamingService,
    ) -> Self {
        Self {
            project: project.into(),
            store,
            content,
            naming,
        }
    }

    pub async fn seed(&self, request: SeedRequest) -> Result<SeedReport> {
        if request.state == FileState::Pending {
            return Err(RegistryError::InvalidInput(
                "seeded files cannot be pending; there is no batch to confirm them".into(),
            ));
        }
        let mut report = SeedReport::default();
        let mut newest_top: Option<String> = None;

        for source in &request.sources {
            let name = source
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    RegistryError::InvalidInput(format!("no file name in {}", source.display()))
                })?;
            validate_name(&name)?;

            if self.store.find_record(&name).await?.is_some() {
                tracing::debug!(target: "calreg.status", file = %name, "already registered, skipped");
                report.skipped.push(name);
                continue;
            }

            let record = self.register(source, &name, &request).await?;
            if let Some(warning) = self.naming.observe_name(&name).await? {
                report.warnings.push(warning);
            }
            if record.category.tier() == Some(RuleTier::Top)
                && newest_top.as_deref().is_none_or(|top| compare_by_serial(&name, top).is_gt())
            {
                newest_top = Some(name.clone());
            }
            report.registered.push(name);
        }

        if request.set_contexts {
            if let Some(top) = &newest_top {
                for kind in [ContextKind::Edit, ContextKind::Operational] {
                    self.store.set_context(&self.project, kind, top).await?;
                }
                report.contexts = Some(top.clone());
            }
        }

        let mut entry = AuditEntry::new(AuditAction::Seed, &request.submitter, report.registered.clone());
        if let Some(top) = &report.contexts {
            entry = entry.with_detail(format!("contexts set to {top}"));
        }
        self.store.insert_audit_entry(&entry).await?;

        tracing::info!(
            target: "calreg.status",
            registered = report.registered.len(),
            skipped = report.skipped.len(),
            contexts = ?report.contexts,
            "seed complete"
        );
        Ok(report)
    }

    async fn register(&self, source: &Path, name: &str, request: &SeedRequest) -> Result<FileRecord> {
        let path = match self.content.place(source, name).await {
            Ok(path) => path,
            // Already in canonical storage: reuse it as is.
            Err(ContentStoreError::AlreadyExists(_)) => self.content.path_for(name)?,
            Err(e) => return Err(e.into()),
        };
        let bytes = tokio::fs::read(&path).await?;

        let mut record = FileRecord::pending(name, &self.project, &request.submitter);
        record.sha256 = content_hash(&bytes);
        record.size = bytes.len() as u64;
        record.description = "seeded".into();

        if record.category.is_rule() {
            let rule = RuleFile::parse(&bytes)?;
            record.references = rule.references();
            record.derived_from = rule.header.derived_from.clone();
            record.instrument = rule.header.instrument.clone();
            record.file_type = rule.header.file_type.clone();
        } else if let Some((key, _)) = decompose_name(name) {
            record.instrument = key.instrument;
            record.file_type = key.file_type;
        }

        record.state = request.state;
        if request.state == FileState::Operational {
            record.activated_at = Some(Utc::now());
        }
        self.store.create_record(&record).await?;
        tracing::debug!(target: "calreg.status", file = name, state = request.state.as_str(), "file seeded");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::LocalContentStore;
    use crate::store::MemoryStore;
    use crate::types::SerialKey;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> (SeedService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let content: Arc<dyn ContentStore> =
            Arc::new(LocalContentStore::new(dir.path().join("storage")));
        let naming = NamingService::new(store.clone(), content.clone(), 4);
        (SeedService::new("proj", store.clone(), content, naming), store)
    }

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_seed_registers_hierarchy_and_sets_contexts() {
        let dir = TempDir::new().unwrap();
        let (service, store) = service(&dir);
        let sources = vec![
            write(&dir, "proj_miri_dark_0003.fits", "dark"),
            write(
                &dir,
                "proj_miri_dark_0001.rmap",
                "header: {name: proj_miri_dark_0001.rmap, tier: bottom, project: proj, instrument: miri, file_type: dark}\nselector: {\"*\": proj_miri_dark_0003.fits}\n",
            ),
            write(
                &dir,
                "proj_0001.pmap",
                "header: {name: proj_0001.pmap, tier: top, project: proj}\nselector: {miri: proj_miri_0001.imap}\n",
            ),
        ];

        let report = service
            .seed(SeedRequest {
                sources,
                state: FileState::Operational,
                submitter: "ops".into(),
                set_contexts: true,
            })
            .await
            .unwrap();

        assert_eq!(report.registered.len(), 3);
        assert_eq!(report.contexts.as_deref(), Some("proj_0001.pmap"));
        assert_eq!(
            store.get_context("proj", ContextKind::Edit).await.unwrap().as_deref(),
            Some("proj_0001.pmap")
        );

        let reference = store.load_record("proj_miri_dark_0003.fits").await.unwrap();
        assert_eq!(reference.state, FileState::Operational);
        assert_eq!(reference.instrument.as_deref(), Some("miri"));
        assert!(reference.activated_at.is_some());

        let key = SerialKey::new("proj", Some("miri"), Some("dark"), ".fits");
        assert_eq!(store.last_serial(&key).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_seed_skips_registered_and_rejects_pending() {
        let dir = TempDir::new().unwrap();
        let (service, _store) = service(&dir);
        let source = write(&dir, "flat.fits", "flat");
        let request = SeedRequest {
            sources: vec![source.clone()],
            state: FileState::Delivered,
            submitter: "ops".into(),
            set_contexts: false,
        };

        service.seed(request.clone()).await.unwrap();
        let again = service.seed(request.clone()).await.unwrap();
        assert!(again.registered.is_empty());
        assert_eq!(again.skipped, vec!["flat.fits".to_string()]);

        let err = service
            .seed(SeedRequest {
                state: FileState::Pending,
                ..request
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidInput(_)));
    }
}
