//! Shared fixtures: a registry in a temporary directory, seeded with a small
//! operational hierarchy for project `proj`.
//!
//! ```text
//! proj_0001.pmap
//! ├── instrumentA → proj_instrumentA_0001.imap
//! │   ├── typeX → proj_instrumentA_typeX_0001.rmap → legacy_ax.ext
//! │   └── typeY → proj_instrumentA_typeY_0001.rmap → legacy_ay.ext
//! └── instrumentB → proj_instrumentB_0001.imap
//!     └── typeX → proj_instrumentB_typeX_0001.rmap → legacy_bx.ext
//! ```

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use calreg_core::seed::SeedRequest;
use calreg_core::{
    AuditEntry, BatchRecord, Candidate, Certifier, ContextKind, ContextSelector, Disposition,
    FileRecord, FileState, MemoryStore, RecordFilter, RegistryConfig, RegistryError,
    RegistryService, RegistryStore, Result, SerialKey, StageRequest,
};
use tempfile::TempDir;
use uuid::Uuid;

pub const TOP: &str = "proj_0001.pmap";
pub const MIDDLE_A: &str = "proj_instrumentA_0001.imap";
pub const BOTTOM_AX: &str = "proj_instrumentA_typeX_0001.rmap";

pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub registry: RegistryService,
}

pub fn bottom_rule(header_name: &str, instrument: &str, file_type: &str, reference: &str) -> String {
    format!(
        "header:\n  name: {header_name}\n  tier: bottom\n  project: proj\n  instrument: {instrument}\n  file_type: {file_type}\nselector:\n  default: {reference}\n"
    )
}

fn middle_rule(name: &str, instrument: &str, children: &[(&str, &str)]) -> String {
    let mut body = format!(
        "header:\n  name: {name}\n  tier: middle\n  project: proj\n  instrument: {instrument}\nselector:\n"
    );
    for (key, child) in children {
        body.push_str(&format!("  {key}: {child}\n"));
    }
    body
}

fn top_rule(name: &str, children: &[(&str, &str)]) -> String {
    let mut body = format!("header:\n  name: {name}\n  tier: top\n  project: proj\nselector:\n");
    for (key, child) in children {
        body.push_str(&format!("  {key}: {child}\n"));
    }
    body
}

impl Fixture {
    pub async fn new() -> Self {
        let memory = Arc::new(MemoryStore::new());
        Self::build(true, memory.clone(), memory, None).await
    }

    /// A registry whose pickup directory was never created.
    pub async fn without_delivery_dir() -> Self {
        let memory = Arc::new(MemoryStore::new());
        Self::build(false, memory.clone(), memory, None).await
    }

    /// A registry that reaches `memory` through `registry_store`, certified by
    /// `certifier` when one is given.
    pub async fn custom(
        memory: Arc<MemoryStore>,
        registry_store: Arc<dyn RegistryStore>,
        certifier: Option<Arc<dyn Certifier>>,
    ) -> Self {
        Self::build(true, memory, registry_store, certifier).await
    }

    async fn build(
        create_delivery_dir: bool,
        store: Arc<MemoryStore>,
        registry_store: Arc<dyn RegistryStore>,
        certifier: Option<Arc<dyn Certifier>>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = RegistryConfig::rooted_at("proj", dir.path());
        config.locks.acquire_timeout_secs = 0;
        config.locks.poll_interval_ms = 10;
        if create_delivery_dir {
            for delivery_dir in &config.delivery_dirs {
                std::fs::create_dir_all(delivery_dir).unwrap();
            }
        }

        let registry = RegistryService::build(config, registry_store, store.clone(), certifier);
        let fixture = Self {
            dir,
            store,
            registry,
        };
        fixture.seed().await;
        fixture
    }

    async fn seed(&self) {
        let seed_dir = self.dir.path().join("seed");
        std::fs::create_dir_all(&seed_dir).unwrap();
        let files = [
            ("legacy_ax.ext".to_string(), "ax".to_string()),
            ("legacy_ay.ext".to_string(), "ay".to_string()),
            ("legacy_bx.ext".to_string(), "bx".to_string()),
            (
                BOTTOM_AX.to_string(),
                bottom_rule(BOTTOM_AX, "instrumentA", "typeX", "legacy_ax.ext"),
            ),
            (
                "proj_instrumentA_typeY_0001.rmap".to_string(),
                bottom_rule("proj_instrumentA_typeY_0001.rmap", "instrumentA", "typeY", "legacy_ay.ext"),
            ),
            (
                "proj_instrumentB_typeX_0001.rmap".to_string(),
                bottom_rule("proj_instrumentB_typeX_0001.rmap", "instrumentB", "typeX", "legacy_bx.ext"),
            ),
            (
                MIDDLE_A.to_string(),
                middle_rule(
                    MIDDLE_A,
                    "instrumentA",
                    &[("typeX", BOTTOM_AX), ("typeY", "proj_instrumentA_typeY_0001.rmap")],
                ),
            ),
            (
                "proj_instrumentB_0001.imap".to_string(),
                middle_rule(
                    "proj_instrumentB_0001.imap",
                    "instrumentB",
                    &[("typeX", "proj_instrumentB_typeX_0001.rmap")],
                ),
            ),
            (
                TOP.to_string(),
                top_rule(
                    TOP,
                    &[("instrumentA", MIDDLE_A), ("instrumentB", "proj_instrumentB_0001.imap")],
                ),
            ),
        ];
        let mut sources = Vec::new();
        for (name, body) in &files {
            let path = seed_dir.join(name);
            std::fs::write(&path, body).unwrap();
            sources.push(path);
        }
        let report = self
            .registry
            .seeder
            .seed(SeedRequest {
                sources,
                state: FileState::Operational,
                submitter: "ops".into(),
                set_contexts: true,
            })
            .await
            .unwrap();
        assert_eq!(report.contexts.as_deref(), Some(TOP));
    }

    /// Write an upload into the submitter's scratch area.
    pub fn upload(&self, name: &str, body: &str) -> PathBuf {
        let uploads = self.dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let path = uploads.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    pub fn request(&self, submitter: &str, candidates: Vec<Candidate>) -> StageRequest {
        StageRequest {
            instrument: None,
            submitter: submitter.into(),
            description: "test submission".into(),
            candidates,
            auto_rename: true,
            base: ContextSelector::Edit,
        }
    }

    pub fn delivery_dir(&self) -> PathBuf {
        self.registry.config.delivery_dirs[0].clone()
    }

    pub async fn batch_records(&self, batch_id: Uuid) -> Vec<String> {
        self.store
            .query_records(&RecordFilter {
                batch_id: Some(batch_id),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect()
    }

    pub async fn record_count(&self) -> usize {
        self.store
            .query_records(&RecordFilter::default())
            .await
            .unwrap()
            .len()
    }
}

// ── Failing store ────────────────────────────────────────────────

/// `MemoryStore` whose batch rows and audit entries can be made to fail.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    pub fail_save_batch: AtomicBool,
    pub fail_audit: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_save_batch: AtomicBool::new(false),
            fail_audit: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(RegistryError::Internal(anyhow::anyhow!("{what}: database unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for FlakyStore {
    async fn create_record(&self, record: &FileRecord) -> Result<()> {
        self.inner.create_record(record).await
    }

    async fn load_record(&self, name: &str) -> Result<FileRecord> {
        self.inner.load_record(name).await
    }

    async fn find_record(&self, name: &str) -> Result<Option<FileRecord>> {
        self.inner.find_record(name).await
    }

    async fn update_record(&self, record: &FileRecord) -> Result<()> {
        self.inner.update_record(record).await
    }

    async fn destroy_record(&self, name: &str) -> Result<()> {
        self.inner.destroy_record(name).await
    }

    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<FileRecord>> {
        self.inner.query_records(filter).await
    }

    async fn next_serial(&self, key: &SerialKey) -> Result<u32> {
        self.inner.next_serial(key).await
    }

    async fn last_serial(&self, key: &SerialKey) -> Result<u32> {
        self.inner.last_serial(key).await
    }

    async fn advance_serial(&self, key: &SerialKey, at_least: u32) -> Result<u32> {
        self.inner.advance_serial(key, at_least).await
    }

    async fn save_batch(&self, batch: &BatchRecord) -> Result<()> {
        Self::check(&self.fail_save_batch, "save_batch")?;
        self.inner.save_batch(batch).await
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
        self.inner.transition_batch(batch_id, from, to).await
    }

    async fn list_batches(&self, disposition: Option<Disposition>) -> Result<Vec<BatchRecord>> {
        self.inner.list_batches(disposition).await
    }

    async fn get_context(&self, project: &str, kind: ContextKind) -> Result<Option<String>> {
        self.inner.get_context(project, kind).await
    }

    async fn set_context(&self, project: &str, kind: ContextKind, name: &str) -> Result<()> {
        self.inner.set_context(project, kind, name).await
    }

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        Self::check(&self.fail_audit, "insert_audit_entry")?;
        self.inner.insert_audit_entry(entry).await
    }

    async fn list_audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.inner.list_audit_entries(limit).await
    }
}
