//! Submission workflow: stage, confirm and cancel a batch of files.
//!
//! | Verb      | Batch disposition                  | Key logic                                   |
//! |-----------|------------------------------------|---------------------------------------------|
//! | stage     | → Ready                            | Certify all, name, place, register pending  |
//! | confirm   | Ready → Finalizing → Confirmed     | Lock, derive, deliver, mark delivered       |
//! | cancel    | Ready → Finalizing → Cancelled     | Destroy every staged record and its content |
//! | recover   | Finalizing → Cancelled             | Roll back a confirm that never finished     |
//!
//! Staging runs without a lock; it only touches the submitter's own new files.
//! Confirmation mutates the shared rule hierarchy and runs under the
//! instrument lock. Any failure after the batch is claimed for confirmation
//! rolls the whole batch back: delivery links are retracted and every record
//! of the batch is destroyed. Cleanup failures are logged, never returned in
//! place of the error that caused them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::certify::{CertificationReport, Certifier, CertifyContext, CertifyTarget};
use crate::content::{content_hash, validate_name, ContentStore};
use crate::delivery::{DeliveryReceipt, DeliveryWriter};
use crate::derivation::{DerivationEngine, DeriveRequest};
use crate::error::RegistryError;
use crate::locks::LockManager;
use crate::naming::{compare_by_serial, NamingService};
use crate::ports::{RegistryStore, Result};
use crate::rules::RuleFile;
use crate::status::destroy_file;
use crate::types::*;

// ── Requests and outcomes ──────────────────────────────────────

/// One file offered for submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub path: PathBuf,
    /// Name the submitter knows the file by; defaults to the path's file name.
    pub upload_name: Option<String>,
    pub instrument: Option<String>,
    pub file_type: Option<String>,
}

impl Candidate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            upload_name: None,
            instrument: None,
            file_type: None,
        }
    }

    pub fn classified(mut self, instrument: &str, file_type: &str) -> Self {
        self.instrument = Some(instrument.to_string());
        self.file_type = Some(file_type.to_string());
        self
    }

    fn name(&self) -> Result<String> {
        if let Some(name) = &self.upload_name {
            return Ok(name.clone());
        }
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                RegistryError::InvalidInput(format!("no file name in {}", self.path.display()))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    /// Instrument whose lock will guard confirmation. Inferred from the files
    /// when unset.
    pub instrument: Option<String>,
    pub submitter: String,
    pub description: String,
    pub candidates: Vec<Candidate>,
    /// Mint serial names instead of keeping upload names.
    pub auto_rename: bool,
    pub base: ContextSelector,
}

/// A staged rule file whose predecessor already has other successors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collision {
    pub file: String,
    pub derived_from: String,
    pub others: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub batch_id: Uuid,
    /// Upload name → registry name.
    pub new_file_map: BTreeMap<String, String>,
    pub certifications: Vec<CertificationReport>,
    pub collisions: Vec<Collision>,
    pub warnings: Vec<String>,
    pub base_context: ContextSelector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmOutcome {
    pub batch_id: Uuid,
    pub final_top: String,
    pub substitutions: BTreeMap<String, String>,
    pub delivered: Vec<String>,
    pub catalog: String,
    pub warnings: Vec<String>,
}

/// A staged file with its chosen registry name.
struct Planned {
    upload: String,
    name: String,
    candidate: Candidate,
    category: FileCategory,
    rule: Option<RuleFile>,
    instrument: Option<String>,
    file_type: Option<String>,
}

// ── Service ────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SubmissionService {
    project: String,
    store: Arc<dyn RegistryStore>,
    content: Arc<dyn ContentStore>,
    naming: NamingService,
    locks: LockManager,
    certifier: Arc<dyn Certifier>,
    derivation: DerivationEngine,
    delivery: DeliveryWriter,
}

impl SubmissionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: impl Into<String>,
        store: Arc<dyn RegistryStore>,
        content: Arc<dyn ContentStore>,
        naming: NamingService,
        locks: LockManager,
        certifier: Arc<dyn Certifier>,
        derivation: DerivationEngine,
        delivery: DeliveryWriter,
    ) -> Self {
        Self {
            project: project.into(),
            store,
            content,
            naming,
            locks,
            certifier,
            derivation,
            delivery,
        }
    }

    /// Lock that guards confirmation of `batch`.
    pub fn lock_key_for(&self, batch: &BatchRecord) -> LockKey {
        match &batch.instrument {
            Some(instrument) => LockKey::instrument(instrument),
            None => LockKey::project(&batch.project),
        }
    }

    // ── 1. stage ──────────────────────────────────────────────────

    /// Certify, name, place and register the candidates as a `Ready` batch.
    ///
    /// Any certification failure rejects the whole request with
    /// `CertificationFailed` before anything is written.
    pub async fn stage(&self, request: StageRequest) -> Result<StageOutcome> {
        if request.candidates.is_empty() {
            return Err(RegistryError::InvalidInput("no files submitted".into()));
        }
        if request.submitter.trim().is_empty() {
            return Err(RegistryError::InvalidInput("submitter is required".into()));
        }

        let mut uploads = BTreeSet::new();
        for candidate in &request.candidates {
            let upload = candidate.name()?;
            validate_name(&upload)?;
            if !uploads.insert(upload.clone()) {
                return Err(RegistryError::InvalidInput(format!(
                    "'{upload}' submitted more than once"
                )));
            }
        }

        // Certification gate
        let certifications = self.certify_candidates(&request.candidates, &uploads).await?;
        if certifications.iter().any(CertificationReport::is_failed) {
            tracing::info!(
                target: "calreg.submit",
                submitter = %request.submitter,
                failed = certifications.iter().filter(|r| r.is_failed()).count(),
                "submission rejected by certification"
            );
            return Err(RegistryError::CertificationFailed(certifications));
        }

        let batch_id = Uuid::new_v4();
        let mut warnings = Vec::new();
        let planned = self.plan(&request, &mut warnings).await?;
        let batch_instrument = self.batch_instrument(&request, &planned)?;
        let new_file_map: BTreeMap<String, String> = planned
            .iter()
            .map(|p| (p.upload.clone(), p.name.clone()))
            .collect();

        // Placement; a failure discards whatever was already staged.
        let mut staged = Vec::new();
        if let Err(e) = self
            .place_all(&request, batch_id, &planned, &new_file_map, &mut staged)
            .await
        {
            self.discard(&staged).await;
            tracing::error!(
                target: "calreg.submit",
                batch_id = %batch_id,
                error = %e,
                discarded = staged.len(),
                "staging failed, submission cleaned up"
            );
            return Err(e);
        }

        let batch = BatchRecord {
            batch_id,
            project: self.project.clone(),
            instrument: batch_instrument,
            submitter: request.submitter.clone(),
            description: request.description.clone(),
            base_context: request.base.clone(),
            new_file_map: new_file_map.clone(),
            disposition: Disposition::Ready,
            created_at: Utc::now(),
            claimed_at: None,
            finalized_at: None,
            final_context: None,
            substitutions: BTreeMap::new(),
            catalog: None,
            failure: None,
        };
        let collisions = match self.record_batch(&batch, &staged).await {
            Ok(collisions) => collisions,
            Err(e) => {
                self.discard(&staged).await;
                self.mark_failed(batch, &e).await;
                tracing::error!(
                    target: "calreg.submit",
                    batch_id = %batch_id,
                    error = %e,
                    discarded = staged.len(),
                    "staging failed after placement, submission cleaned up"
                );
                return Err(e);
            }
        };

        tracing::info!(
            target: "calreg.submit",
            batch_id = %batch_id,
            submitter = %request.submitter,
            files = staged.len(),
            collisions = collisions.len(),
            "batch staged"
        );
        Ok(StageOutcome {
            batch_id,
            new_file_map,
            certifications,
            collisions,
            warnings,
            base_context: request.base,
        })
    }

    async fn certify_candidates(
        &self,
        candidates: &[Candidate],
        uploads: &BTreeSet<String>,
    ) -> Result<Vec<CertificationReport>> {
        let mut reports = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let upload = candidate.name()?;
            let report = self
                .certifier
                .certify(
                    &CertifyTarget {
                        name: &upload,
                        path: &candidate.path,
                        category: FileCategory::from_name(&upload),
                    },
                    &CertifyContext {
                        project: &self.project,
                        batch_names: uploads,
                    },
                )
                .await?;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Choose registry names: references first, then rule files bottom-up.
    async fn plan(&self, request: &StageRequest, warnings: &mut Vec<String>) -> Result<Vec<Planned>> {
        let mut planned = Vec::with_capacity(request.candidates.len());
        for candidate in &request.candidates {
            let upload = candidate.name()?;
            let category = FileCategory::from_name(&upload);
            let rule = match category {
                FileCategory::Rule { .. } => Some(RuleFile::parse(&tokio::fs::read(&candidate.path).await?)?),
                FileCategory::Reference => None,
            };
            let header = rule.as_ref().map(|r| &r.header);
            let instrument = candidate
                .instrument
                .clone()
                .or_else(|| header.and_then(|h| h.instrument.clone()))
                .or_else(|| match category {
                    FileCategory::Reference => request.instrument.clone(),
                    FileCategory::Rule { .. } => None,
                });
            let file_type = candidate
                .file_type
                .clone()
                .or_else(|| header.and_then(|h| h.file_type.clone()));
            planned.push(Planned {
                upload,
                name: String::new(),
                candidate: candidate.clone(),
                category,
                rule,
                instrument,
                file_type,
            });
        }

        planned.sort_by_key(|p| match p.category {
            FileCategory::Reference => 0,
            FileCategory::Rule { tier: RuleTier::Bottom } => 1,
            FileCategory::Rule { tier: RuleTier::Middle } => 2,
            FileCategory::Rule { tier: RuleTier::Top } => 3,
        });

        for p in &mut planned {
            p.name = if request.auto_rename {
                self.naming.allocate(&self.serial_key(p)?).await?
            } else {
                if self.naming.is_taken(&p.upload).await? {
                    return Err(RegistryError::NameCollision(format!(
                        "'{}' already exists in the registry",
                        p.upload
                    )));
                }
                if let Some(warning) = self.naming.observe_name(&p.upload).await? {
                    tracing::warn!(target: "calreg.submit", file = %p.upload, "{warning}");
                    warnings.push(warning);
                }
                p.upload.clone()
            };
        }
        Ok(planned)
    }

    fn serial_key(&self, p: &Planned) -> Result<SerialKey> {
        let extension = extension_of(&p.upload);
        let require_instrument = || {
            p.instrument.as_deref().ok_or_else(|| {
                RegistryError::InvalidInput(format!("'{}' does not name its instrument", p.upload))
            })
        };
        Ok(match p.category {
            FileCategory::Reference => SerialKey::new(
                &self.project,
                p.instrument.as_deref(),
                p.file_type.as_deref(),
                extension,
            ),
            FileCategory::Rule { tier: RuleTier::Top } => {
                SerialKey::new(&self.project, None, None, extension)
            }
            FileCategory::Rule { tier: RuleTier::Middle } => {
                SerialKey::new(&self.project, Some(require_instrument()?), None, extension)
            }
            FileCategory::Rule { tier: RuleTier::Bottom } => {
                let file_type = p.file_type.as_deref().ok_or_else(|| {
                    RegistryError::InvalidInput(format!("'{}' does not name its file type", p.upload))
                })?;
                SerialKey::new(&self.project, Some(require_instrument()?), Some(file_type), extension)
            }
        })
    }

    /// The single instrument a batch touches, if any.
    fn batch_instrument(&self, request: &StageRequest, planned: &[Planned]) -> Result<Option<String>> {
        let mut instruments: BTreeSet<&str> = planned.iter().filter_map(|p| p.instrument.as_deref()).collect();
        if let Some(requested) = request.instrument.as_deref() {
            instruments.insert(requested);
        }
        match instruments.len() {
            0 => Ok(None),
            1 => Ok(instruments.into_iter().next().map(str::to_string)),
            _ => Err(RegistryError::InvalidInput(format!(
                "batch spans several instruments ({}); submit them separately",
                instruments.into_iter().collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    async fn place_all(
        &self,
        request: &StageRequest,
        batch_id: Uuid,
        planned: &[Planned],
        new_file_map: &BTreeMap<String, String>,
        staged: &mut Vec<String>,
    ) -> Result<()> {
        for p in planned {
            let mut record = FileRecord::pending(&p.name, &self.project, &request.submitter);
            record.uploaded_as = p.upload.clone();
            record.description = request.description.clone();
            record.batch_id = Some(batch_id);
            record.instrument = p.instrument.clone();
            record.file_type = p.file_type.clone();

            match &p.rule {
                None => {
                    let path = self.content.place(&p.candidate.path, &p.name).await?;
                    staged.push(p.name.clone());
                    let bytes = tokio::fs::read(&path).await?;
                    record.sha256 = content_hash(&bytes);
                    record.size = bytes.len() as u64;
                }
                Some(rule) => {
                    let mut rule = rule.renamed(&p.name);
                    rule.substitute(new_file_map);
                    let yaml = rule.to_yaml()?;
                    self.content.write(&p.name, yaml.as_bytes()).await?;
                    staged.push(p.name.clone());
                    record.sha256 = content_hash(yaml.as_bytes());
                    record.size = yaml.len() as u64;
                    record.references = rule.references();
                    record.derived_from = rule.header.derived_from.clone();
                }
            }
            self.store.create_record(&record).await?;
            tracing::debug!(
                target: "calreg.submit",
                batch_id = %batch_id,
                upload = %p.upload,
                file = %p.name,
                "file staged"
            );
        }
        Ok(())
    }

    /// Collision check, batch row and audit entry for freshly placed files.
    async fn record_batch(&self, batch: &BatchRecord, staged: &[String]) -> Result<Vec<Collision>> {
        let collisions = self.find_collisions(batch.batch_id, staged).await?;
        self.store.save_batch(batch).await?;
        self.store
            .insert_audit_entry(
                &AuditEntry::new(AuditAction::Stage, &batch.submitter, batch.staged_names())
                    .with_batch(batch.batch_id)
                    .with_detail(batch.description.clone()),
            )
            .await?;
        Ok(collisions)
    }

    /// Leave a `Cancelled` row behind if the batch was already saved.
    async fn mark_failed(&self, mut batch: BatchRecord, cause: &RegistryError) {
        match self.store.load_batch(batch.batch_id).await {
            Ok(_) => {
                batch.disposition = Disposition::Cancelled;
                batch.finalized_at = Some(Utc::now());
                batch.failure = Some(cause.to_string());
                if let Err(e) = self.store.save_batch(&batch).await {
                    tracing::error!(target: "calreg.submit", batch_id = %batch.batch_id, error = %e, "failed to record cancelled batch");
                }
            }
            Err(RegistryError::NotFound(_)) => {}
            Err(e) => {
                tracing::error!(target: "calreg.submit", batch_id = %batch.batch_id, error = %e, "cannot check batch row after failure");
            }
        }
    }

    /// Rule files whose predecessor already has successors outside this batch.
    async fn find_collisions(&self, batch_id: Uuid, staged: &[String]) -> Result<Vec<Collision>> {
        let mut collisions = Vec::new();
        for name in staged {
            let record = self.store.load_record(name).await?;
            if !record.category.is_rule() {
                continue;
            }
            let Some(parent) = record.derived_from.clone() else {
                continue;
            };
            let filter = RecordFilter {
                derived_from: Some(parent.clone()),
                ..Default::default()
            };
            let others: Vec<String> = self
                .store
                .query_records(&filter)
                .await?
                .into_iter()
                .filter(|other| other.batch_id != Some(batch_id))
                .map(|other| other.name)
                .collect();
            if !others.is_empty() {
                tracing::warn!(
                    target: "calreg.submit",
                    file = %name,
                    derived_from = %parent,
                    others = ?others,
                    "derivation collision"
                );
                collisions.push(Collision {
                    file: name.clone(),
                    derived_from: parent,
                    others,
                });
            }
        }
        Ok(collisions)
    }

    // ── 2. confirm ────────────────────────────────────────────────

    /// Confirm under a freshly acquired instrument lock, released afterwards.
    ///
    /// `ResourceLocked` leaves the batch `Ready` for a later retry. The lock is
    /// not re-entrant, so a caller already holding it gets `ResourceLocked` too
    /// and must use `confirm_with_lock`; that lock is never released here.
    pub async fn confirm(&self, batch_id: Uuid, holder: &str) -> Result<ConfirmOutcome> {
        let batch = self.store.load_batch(batch_id).await?;
        let key = self.lock_key_for(&batch);
        let lock = self.locks.acquire(&key, holder).await?;
        let result = self.confirm_with_lock(batch_id, &lock).await;
        if let Err(e) = self.locks.release(&lock).await {
            tracing::error!(target: "calreg.submit", key = %key, error = %e, "failed to release lock");
        }
        result
    }

    /// Confirm a batch while holding `lock`, acquired earlier by the submitter.
    pub async fn confirm_with_lock(&self, batch_id: Uuid, lock: &HeldLock) -> Result<ConfirmOutcome> {
        self.locks.verify(lock).await?;

        let batch = self.store.load_batch(batch_id).await?;
        if lock.key != self.lock_key_for(&batch) {
            return Err(RegistryError::InvalidInput(format!(
                "batch {batch_id} must be confirmed under {}, not {}",
                self.lock_key_for(&batch),
                lock.key
            )));
        }
        if lock.holder != batch.submitter {
            return Err(RegistryError::InvalidInput(format!(
                "batch {batch_id} was submitted by {}",
                batch.submitter
            )));
        }

        // Claim: a batch is finalised at most once.
        let batch = self
            .store
            .transition_batch(batch_id, Disposition::Ready, Disposition::Finalizing)
            .await
            .map_err(|e| match e {
                RegistryError::Conflict(_) => RegistryError::Conflict(format!(
                    "batch {batch_id} is no longer ready and cannot be confirmed"
                )),
                other => other,
            })?;

        let mut receipt = None;
        match self.finalize(&batch, lock, &mut receipt).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.abort(batch, receipt.as_ref(), &e).await;
                Err(e)
            }
        }
    }

    async fn finalize(
        &self,
        batch: &BatchRecord,
        lock: &HeldLock,
        receipt_slot: &mut Option<DeliveryReceipt>,
    ) -> Result<ConfirmOutcome> {
        let batch_id = batch.batch_id;
        let mut warnings = Vec::new();

        // 1. Every staged file is still ours and still pending.
        let mut staged = Vec::new();
        for name in batch.staged_names() {
            let record = self.store.load_record(&name).await?;
            if record.state != FileState::Pending || record.batch_id != Some(batch_id) {
                return Err(RegistryError::SubmissionFailed(format!(
                    "'{name}' is {} and no longer part of batch {batch_id}",
                    record.state
                )));
            }
            staged.push(record);
        }

        // 2. Resolve the base top-level file under the lock.
        let edit_before = self.store.get_context(&self.project, ContextKind::Edit).await?;
        let base = match &batch.base_context {
            ContextSelector::Edit => edit_before.clone(),
            ContextSelector::Named(name) => Some(name.clone()),
        };
        let submitted_top = staged
            .iter()
            .filter(|r| r.category.tier() == Some(RuleTier::Top))
            .map(|r| r.name.clone())
            .max_by(|a, b| compare_by_serial(a, b));
        let derive_from = submitted_top.clone().or_else(|| base.clone());

        // 3. Derive when lower-tier rule files changed.
        let updated: Vec<FileRecord> = staged
            .iter()
            .filter(|r| matches!(r.category.tier(), Some(RuleTier::Bottom | RuleTier::Middle)))
            .cloned()
            .collect();
        let (final_top, substitutions) = if updated.is_empty() {
            let top = derive_from.ok_or_else(|| {
                RegistryError::SubmissionFailed(format!("project '{}' has no edit context", self.project))
            })?;
            (top, BTreeMap::new())
        } else {
            let base_top = derive_from.ok_or_else(|| {
                RegistryError::DerivationFailed(format!(
                    "project '{}' has no top-level file to derive from",
                    self.project
                ))
            })?;
            let outcome = self
                .derivation
                .derive(
                    &base_top,
                    &updated,
                    &DeriveRequest {
                        batch_id,
                        submitter: batch.submitter.clone(),
                        description: batch.description.clone(),
                    },
                )
                .await?;
            if !outcome.generated.is_empty() {
                self.store
                    .insert_audit_entry(
                        &AuditEntry::new(AuditAction::Derive, &batch.submitter, outcome.generated.clone())
                            .with_batch(batch_id)
                            .with_detail(format!("from {base_top}")),
                    )
                    .await?;
            }
            (outcome.final_top, outcome.substitutions)
        };

        // 4. Still locked? Derivation can outlast a lease.
        self.locks.verify(lock).await?;

        // 5. Deliver everything the batch now owns.
        let records = self
            .store
            .query_records(&RecordFilter {
                batch_id: Some(batch_id),
                ..Default::default()
            })
            .await?;
        let names: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
        let receipt = receipt_slot.insert(self.delivery.deliver(&names).await?);
        // Remembered so an interrupted confirm can still retract the links.
        let mut delivering = batch.clone();
        delivering.catalog = Some(receipt.catalog_name.clone());
        self.store.save_batch(&delivering).await?;
        self.store
            .insert_audit_entry(
                &AuditEntry::new(AuditAction::Deliver, &batch.submitter, names.clone())
                    .with_batch(batch_id)
                    .with_detail(receipt.catalog_name.clone()),
            )
            .await?;

        // 6. Pending → Delivered.
        for mut record in records {
            record.advance(FileState::Delivered).map_err(RegistryError::SubmissionFailed)?;
            record.catalog_link = Some(receipt.catalog_link.clone());
            self.store.update_record(&record).await?;
        }

        // 7. Advance the edit context. A confirm for another instrument may
        //    have moved it since step 2; the later confirm wins.
        let edit_now = self.store.get_context(&self.project, ContextKind::Edit).await?;
        if edit_now != edit_before {
            let warning = format!(
                "edit context moved from {} to {} during confirmation",
                edit_before.as_deref().unwrap_or("none"),
                edit_now.as_deref().unwrap_or("none")
            );
            tracing::warn!(target: "calreg.submit", batch_id = %batch_id, "{warning}");
            warnings.push(warning);
        }
        if edit_now.as_deref() != Some(final_top.as_str()) {
            self.store
                .set_context(&self.project, ContextKind::Edit, &final_top)
                .await?;
            self.store
                .insert_audit_entry(
                    &AuditEntry::new(AuditAction::SetContext, &batch.submitter, vec![final_top.clone()])
                        .with_batch(batch_id)
                        .with_detail(ContextKind::Edit.as_str()),
                )
                .await?;
        }

        // 8. Record the result.
        let mut confirmed = batch.clone();
        confirmed.disposition = Disposition::Confirmed;
        confirmed.finalized_at = Some(Utc::now());
        confirmed.final_context = Some(final_top.clone());
        confirmed.substitutions = substitutions.clone();
        confirmed.catalog = Some(receipt.catalog_name.clone());
        self.store.save_batch(&confirmed).await?;
        self.store
            .insert_audit_entry(
                &AuditEntry::new(AuditAction::Confirm, &batch.submitter, names.clone())
                    .with_batch(batch_id)
                    .with_detail(final_top.clone()),
            )
            .await?;

        tracing::info!(
            target: "calreg.submit",
            batch_id = %batch_id,
            final_top = %final_top,
            delivered = names.len(),
            catalog = %receipt.catalog_name,
            "batch confirmed"
        );
        Ok(ConfirmOutcome {
            batch_id,
            final_top,
            substitutions,
            delivered: names,
            catalog: receipt.catalog_name.clone(),
            warnings,
        })
    }

    /// Roll back a claimed batch after a failed confirmation.
    async fn abort(&self, mut batch: BatchRecord, receipt: Option<&DeliveryReceipt>, cause: &RegistryError) {
        if let Some(receipt) = receipt {
            self.delivery.retract(receipt).await;
        }
        let names = self.batch_files(&batch).await;
        self.restore_edit_context(&batch, &names).await;
        self.discard(&names).await;

        batch.disposition = Disposition::Cancelled;
        batch.finalized_at = Some(Utc::now());
        batch.failure = Some(cause.to_string());
        if let Err(e) = self.store.save_batch(&batch).await {
            tracing::error!(target: "calreg.submit", batch_id = %batch.batch_id, error = %e, "failed to record cancelled batch");
        }
        let entry = AuditEntry::new(AuditAction::Cancel, &batch.submitter, names)
            .with_batch(batch.batch_id)
            .with_detail(format!("confirm failed: {cause}"));
        if let Err(e) = self.store.insert_audit_entry(&entry).await {
            tracing::error!(target: "calreg.submit", batch_id = %batch.batch_id, error = %e, "failed to audit cancellation");
        }
        tracing::error!(
            target: "calreg.submit",
            batch_id = %batch.batch_id,
            code = cause.code(),
            error = %cause,
            "confirmation failed, batch rolled back"
        );
    }

    /// Point the edit context back at the predecessor of a top-level file the
    /// batch is about to lose.
    async fn restore_edit_context(&self, batch: &BatchRecord, names: &[String]) {
        let edit = match self.store.get_context(&self.project, ContextKind::Edit).await {
            Ok(Some(edit)) if names.contains(&edit) => edit,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(target: "calreg.submit", batch_id = %batch.batch_id, error = %e, "cannot read edit context");
                return;
            }
        };
        let previous = match self.store.load_record(&edit).await {
            Ok(record) => record.derived_from,
            Err(e) => {
                tracing::error!(target: "calreg.submit", file = %edit, error = %e, "cannot load discarded top-level file");
                None
            }
        };
        let Some(previous) = previous else {
            tracing::warn!(target: "calreg.submit", batch_id = %batch.batch_id, file = %edit, "edit context points at a discarded file");
            return;
        };
        match self.store.set_context(&self.project, ContextKind::Edit, &previous).await {
            Ok(()) => tracing::warn!(
                target: "calreg.submit",
                batch_id = %batch.batch_id,
                from = %edit,
                to = %previous,
                "edit context restored"
            ),
            Err(e) => tracing::error!(target: "calreg.submit", batch_id = %batch.batch_id, error = %e, "failed to restore edit context"),
        }
    }

    // ── 3. recover ────────────────────────────────────────────────

    /// Roll back a batch left `Finalizing` by a confirm or cancel that never
    /// finished: the process died or the caller dropped the future.
    ///
    /// Only claims older than a lock lease are touched, and only while the
    /// submitter no longer holds the batch's lock, so a confirm still running
    /// under its lease is left alone. Returns whether the batch was rolled back.
    pub async fn recover_stalled(&self, batch_id: Uuid) -> Result<bool> {
        let batch = self.store.load_batch(batch_id).await?;
        if batch.disposition != Disposition::Finalizing || !self.is_stale_claim(&batch).await? {
            return Ok(false);
        }
        let receipt = match batch.catalog.as_deref() {
            Some(catalog) => {
                let names = self.batch_files(&batch).await;
                Some(self.delivery.receipt_for(catalog, &names))
            }
            None => None,
        };
        let cause = RegistryError::SubmissionFailed(format!(
            "batch {batch_id} was claimed at {} and never finished",
            batch.claimed_at.unwrap_or(batch.created_at)
        ));
        self.abort(batch, receipt.as_ref(), &cause).await;
        Ok(true)
    }

    async fn is_stale_claim(&self, batch: &BatchRecord) -> Result<bool> {
        let claimed_at = batch.claimed_at.unwrap_or(batch.created_at);
        let lease = chrono::Duration::from_std(self.locks.policy().max_age)
            .unwrap_or(chrono::Duration::MAX);
        if Utc::now().signed_duration_since(claimed_at) <= lease {
            return Ok(false);
        }
        let owner = self.locks.owner_of(&self.lock_key_for(batch)).await?;
        Ok(owner.as_deref() != Some(batch.submitter.as_str()))
    }

    // ── 4. cancel ─────────────────────────────────────────────────

    /// Destroy everything a `Ready` batch staged. Cancelling a cancelled batch
    /// is a no-op. A `Finalizing` batch can only be cancelled once its claim
    /// went stale; see `recover_stalled`.
    pub async fn cancel(&self, batch_id: Uuid, user: &str) -> Result<()> {
        let batch = self.store.load_batch(batch_id).await?;
        if batch.disposition == Disposition::Cancelled {
            tracing::debug!(target: "calreg.submit", batch_id = %batch_id, "batch already cancelled");
            return Ok(());
        }
        if batch.submitter != user {
            return Err(RegistryError::InvalidInput(format!(
                "batch {batch_id} was submitted by {}",
                batch.submitter
            )));
        }
        if batch.disposition == Disposition::Finalizing && self.recover_stalled(batch_id).await? {
            return Ok(());
        }
        if matches!(batch.disposition, Disposition::Confirmed | Disposition::Finalizing) {
            return Err(RegistryError::Conflict(format!(
                "batch {batch_id} is {} and cannot be cancelled",
                batch.disposition
            )));
        }

        let mut batch = match self
            .store
            .transition_batch(batch_id, Disposition::Ready, Disposition::Finalizing)
            .await
        {
            Ok(batch) => batch,
            Err(RegistryError::Conflict(_)) => {
                // Lost a race; a concurrent cancel is fine, anything else is not.
                let current = self.store.load_batch(batch_id).await?;
                if current.disposition == Disposition::Cancelled {
                    return Ok(());
                }
                return Err(RegistryError::Conflict(format!(
                    "batch {batch_id} is {} and cannot be cancelled",
                    current.disposition
                )));
            }
            Err(e) => return Err(e),
        };

        let names = self.batch_files(&batch).await;
        self.discard(&names).await;

        batch.disposition = Disposition::Cancelled;
        batch.finalized_at = Some(Utc::now());
        self.store.save_batch(&batch).await?;
        self.store
            .insert_audit_entry(
                &AuditEntry::new(AuditAction::Cancel, user, names.clone()).with_batch(batch_id),
            )
            .await?;

        tracing::info!(target: "calreg.submit", batch_id = %batch_id, files = names.len(), "batch cancelled");
        Ok(())
    }

    /// Every file belonging to the batch: staged names plus anything the
    /// registry attributes to it.
    async fn batch_files(&self, batch: &BatchRecord) -> Vec<String> {
        let mut names: BTreeSet<String> = batch.staged_names().into_iter().collect();
        let filter = RecordFilter {
            batch_id: Some(batch.batch_id),
            ..Default::default()
        };
        match self.store.query_records(&filter).await {
            Ok(records) => names.extend(records.into_iter().map(|r| r.name)),
            Err(e) => tracing::error!(
                target: "calreg.submit",
                batch_id = %batch.batch_id,
                error = %e,
                "cannot list batch records for cleanup"
            ),
        }
        names.into_iter().collect()
    }

    /// Best-effort destruction; failures are logged and swallowed.
    async fn discard(&self, names: &[String]) {
        for name in names.iter().rev() {
            if let Err(e) = destroy_file(self.store.as_ref(), self.content.as_ref(), name).await {
                tracing::error!(
                    target: "calreg.submit",
                    file = %name,
                    error = %e,
                    "cleanup of staged file failed"
                );
            }
        }
    }
}
