//! Rule derivation.
//!
//! Given updated bottom- or middle-tier rule files, generate the higher-tier
//! files that must select them. Existing files are never edited: every change
//! produces a newly named copy, certified before it is registered. Runs only
//! while the caller holds the instrument lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::certify::{Certifier, CertifyContext, CertifyTarget};
use crate::content::{content_hash, ContentStore};
use crate::error::RegistryError;
use crate::naming::{compare_by_serial, NamingService};
use crate::ports::{RegistryStore, Result};
use crate::rules::RuleFile;
use crate::status::destroy_file;
use crate::types::{FileCategory, FileRecord, RuleTier, SerialKey};

/// Who and what the generated files are attributed to.
#[derive(Debug, Clone)]
pub struct DeriveRequest {
    pub batch_id: Uuid,
    pub submitter: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivationOutcome {
    /// Top-level file now canonical for the project.
    pub final_top: String,
    /// Replaced rule file → its generated successor.
    pub substitutions: BTreeMap<String, String>,
    /// Every file generated, children first.
    pub generated: Vec<String>,
}

fn keep_newest(slot: &mut String, candidate: &str) {
    if compare_by_serial(candidate, slot).is_gt() {
        *slot = candidate.to_string();
    }
}

#[derive(Clone)]
pub struct DerivationEngine {
    store: Arc<dyn RegistryStore>,
    content: Arc<dyn ContentStore>,
    naming: NamingService,
    certifier: Arc<dyn Certifier>,
}

impl DerivationEngine {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        content: Arc<dyn ContentStore>,
        naming: NamingService,
        certifier: Arc<dyn Certifier>,
    ) -> Self {
        Self {
            store,
            content,
            naming,
            certifier,
        }
    }

    /// Derive a new hierarchy from `base_top` with the `updated` bottom and
    /// middle rule files spliced in. Other files in `updated` are ignored.
    ///
    /// When everything is already selected, nothing is generated and
    /// `base_top` comes back as `final_top`. On failure every generated file is
    /// destroyed before the error is returned.
    pub async fn derive(
        &self,
        base_top: &str,
        updated: &[FileRecord],
        request: &DeriveRequest,
    ) -> Result<DerivationOutcome> {
        let mut generated = Vec::new();
        match self
            .derive_inner(base_top, updated, request, &mut generated)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                for name in generated.iter().rev() {
                    if let Err(cleanup) =
                        destroy_file(self.store.as_ref(), self.content.as_ref(), name).await
                    {
                        tracing::error!(
                            target: "calreg.derive",
                            file = %name,
                            error = %cleanup,
                            "failed to discard generated file"
                        );
                    }
                }
                tracing::warn!(
                    target: "calreg.derive",
                    base_top,
                    error = %e,
                    discarded = generated.len(),
                    "derivation aborted"
                );
                Err(e)
            }
        }
    }

    async fn derive_inner(
        &self,
        base_top: &str,
        updated: &[FileRecord],
        request: &DeriveRequest,
        generated: &mut Vec<String>,
    ) -> Result<DerivationOutcome> {
        let top_record = self.store.load_record(base_top).await.map_err(|e| match e {
            RegistryError::NotFound(_) => {
                RegistryError::DerivationFailed(format!("base top-level file '{base_top}' is not registered"))
            }
            other => other,
        })?;
        if top_record.category.tier() != Some(RuleTier::Top) {
            return Err(RegistryError::DerivationFailed(format!(
                "'{base_top}' is not a top-level rule file"
            )));
        }
        let mut top = self.load_rule(base_top).await?;
        let project = top_record.project.clone();

        // 1. Group bottom files by instrument then file type, and submitted
        //    middle files by instrument; newest name wins.
        let mut bottoms: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut middles: BTreeMap<String, String> = BTreeMap::new();
        for record in updated {
            match record.category.tier() {
                Some(RuleTier::Bottom) => {
                    let (Some(instrument), Some(file_type)) =
                        (&record.instrument, &record.file_type)
                    else {
                        return Err(RegistryError::DerivationFailed(format!(
                            "bottom rule file '{}' does not name its instrument and file type",
                            record.name
                        )));
                    };
                    keep_newest(
                        bottoms
                            .entry(instrument.clone())
                            .or_default()
                            .entry(file_type.clone())
                            .or_default(),
                        &record.name,
                    );
                }
                Some(RuleTier::Middle) => {
                    let Some(instrument) = &record.instrument else {
                        return Err(RegistryError::DerivationFailed(format!(
                            "middle rule file '{}' does not name its instrument",
                            record.name
                        )));
                    };
                    keep_newest(middles.entry(instrument.clone()).or_default(), &record.name);
                }
                _ => {}
            }
        }
        let instruments: BTreeSet<String> =
            bottoms.keys().chain(middles.keys()).cloned().collect();

        let mut substitutions = BTreeMap::new();
        let mut top_changed = false;

        // 2. Per instrument, start from the submitted middle file or the one the
        //    top selects, and generate a successor when its selection changed.
        for instrument in &instruments {
            let selected = top.child(instrument).map(str::to_string);
            let start = match middles.get(instrument).cloned().or_else(|| selected.clone()) {
                Some(name) => name,
                None => {
                    return Err(RegistryError::DerivationFailed(format!(
                        "'{base_top}' has no entry for instrument '{instrument}'"
                    )))
                }
            };

            let mut middle = self.load_rule(&start).await?;
            let mut changed = false;
            for (file_type, bottom) in bottoms.get(instrument).into_iter().flatten() {
                if middle.child(file_type) != Some(bottom.as_str()) {
                    middle.set_child(file_type, bottom);
                    changed = true;
                }
            }

            let final_middle = if changed {
                let key =
                    SerialKey::new(&project, Some(instrument.as_str()), None, RuleTier::Middle.extension());
                let new_middle = self.naming.allocate(&key).await?;
                let mut rule = middle.renamed(&new_middle);
                rule.header.derived_from = Some(start.clone());
                self.admit(&new_middle, &rule, &start, request, generated)
                    .await?;
                new_middle
            } else {
                start
            };

            if selected.as_deref() != Some(final_middle.as_str()) {
                top.set_child(instrument, &final_middle);
                top_changed = true;
                if let Some(old) = selected {
                    substitutions.insert(old, final_middle);
                }
            }
        }

        // 3. Roll up to a new top-level file when any selection changed.
        let final_top = if top_changed {
            let key = SerialKey::new(&project, None, None, RuleTier::Top.extension());
            let new_top = self.naming.allocate(&key).await?;
            let mut rule = top.renamed(&new_top);
            rule.header.derived_from = Some(base_top.to_string());
            self.admit(&new_top, &rule, base_top, request, generated)
                .await?;
            substitutions.insert(base_top.to_string(), new_top.clone());
            new_top
        } else {
            base_top.to_string()
        };

        // 4. Closure: everything the new files select must be usable.
        for name in generated.iter() {
            let record = self.store.load_record(name).await?;
            for child in &record.references {
                match self.store.find_record(child).await? {
                    Some(found) if !found.is_bad() => {}
                    Some(_) => {
                        return Err(RegistryError::DerivationFailed(format!(
                            "'{name}' would select blacklisted or rejected file '{child}'"
                        )))
                    }
                    None => {
                        return Err(RegistryError::DerivationFailed(format!(
                            "'{name}' would select unregistered file '{child}'"
                        )))
                    }
                }
            }
        }

        tracing::info!(
            target: "calreg.derive",
            base_top,
            final_top = %final_top,
            generated = generated.len(),
            "derivation completed"
        );
        Ok(DerivationOutcome {
            final_top,
            substitutions,
            generated: generated.clone(),
        })
    }

    async fn load_rule(&self, name: &str) -> Result<RuleFile> {
        let bytes = self.content.read(name).await?;
        RuleFile::parse(&bytes).map_err(|e| {
            RegistryError::DerivationFailed(format!("cannot parse existing rule file '{name}': {e}"))
        })
    }

    /// Write, certify and register one generated rule file.
    async fn admit(
        &self,
        name: &str,
        rule: &RuleFile,
        derived_from: &str,
        request: &DeriveRequest,
        generated: &mut Vec<String>,
    ) -> Result<()> {
        let yaml = rule.to_yaml()?;
        let path = self.content.write(name, yaml.as_bytes()).await?;
        generated.push(name.to_string());

        let category = FileCategory::from_name(name);
        let no_batch = BTreeSet::new();
        let report = self
            .certifier
            .certify(
                &CertifyTarget {
                    name,
                    path: &path,
                    category,
                },
                &CertifyContext {
                    project: &rule.header.project,
                    batch_names: &no_batch,
                },
            )
            .await?;
        if report.is_failed() {
            return Err(RegistryError::DerivationFailed(format!(
                "generated file failed certification: {report}"
            )));
        }

        let mut record = FileRecord::pending(name, &rule.header.project, &request.submitter);
        record.instrument = rule.header.instrument.clone();
        record.file_type = rule.header.file_type.clone();
        record.sha256 = content_hash(yaml.as_bytes());
        record.size = yaml.len() as u64;
        record.derived_from = Some(derived_from.to_string());
        record.references = rule.references();
        record.description = request.description.clone();
        record.batch_id = Some(request.batch_id);
        self.store.create_record(&record).await?;

        tracing::debug!(
            target: "calreg.derive",
            file = name,
            derived_from,
            "generated rule file registered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certify::{BasicCertifier, CertificationReport};
    use crate::content::LocalContentStore;
    use crate::store::MemoryStore;
    use crate::types::FileState;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        content: Arc<LocalContentStore>,
        engine: DerivationEngine,
    }

    async fn register(fx: &Fixture, name: &str, body: &str, instrument: Option<&str>, file_type: Option<&str>) {
        fx.content.write(name, body.as_bytes()).await.unwrap();
        let mut record = FileRecord::pending(name, "proj", "seed");
        record.state = FileState::Operational;
        record.instrument = instrument.map(str::to_string);
        record.file_type = file_type.map(str::to_string);
        if let Ok(rule) = RuleFile::parse(body.as_bytes()) {
            record.references = rule.references();
        }
        fx.store.create_record(&record).await.unwrap();
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let content = Arc::new(LocalContentStore::new(dir.path()));
        let naming = NamingService::new(store.clone(), content.clone(), 4);
        let certifier = Arc::new(BasicCertifier::new(store.clone()));
        let engine = DerivationEngine::new(store.clone(), content.clone(), naming, certifier);
        let fx = Fixture {
            _dir: dir,
            store,
            content,
            engine,
        };

        register(&fx, "proj_miri_dark_0001.fits", "d1", Some("miri"), Some("dark")).await;
        register(&fx, "proj_miri_dark_0002.fits", "d2", Some("miri"), Some("dark")).await;
        register(
            &fx,
            "proj_miri_dark_0001.rmap",
            "header: {name: proj_miri_dark_0001.rmap, tier: bottom, project: proj, instrument: miri, file_type: dark}\nselector: {default: proj_miri_dark_0001.fits}\n",
            Some("miri"),
            Some("dark"),
        )
        .await;
        register(
            &fx,
            "proj_miri_0001.imap",
            "header: {name: proj_miri_0001.imap, tier: middle, project: proj, instrument: miri}\nselector: {dark: proj_miri_dark_0001.rmap}\n",
            Some("miri"),
            None,
        )
        .await;
        register(
            &fx,
            "proj_0001.pmap",
            "header: {name: proj_0001.pmap, tier: top, project: proj}\nselector: {miri: proj_miri_0001.imap}\n",
            None,
            None,
        )
        .await;
        fx
    }

    async fn stage_bottom(fx: &Fixture, name: &str, reference: &str) -> FileRecord {
        let body = format!(
            "header: {{name: {name}, tier: bottom, project: proj, instrument: miri, file_type: dark}}\nselector: {{default: {reference}}}\n"
        );
        fx.content.write(name, body.as_bytes()).await.unwrap();
        let mut record = FileRecord::pending(name, "proj", "alice");
        record.instrument = Some("miri".into());
        record.file_type = Some("dark".into());
        record.references = vec![reference.to_string()];
        fx.store.create_record(&record).await.unwrap();
        record
    }

    fn request() -> DeriveRequest {
        DeriveRequest {
            batch_id: Uuid::new_v4(),
            submitter: "alice".into(),
            description: "new darks".into(),
        }
    }

    #[tokio::test]
    async fn test_derive_generates_middle_and_top() {
        let fx = fixture().await;
        let bottom = stage_bottom(&fx, "proj_miri_dark_0002.rmap", "proj_miri_dark_0002.fits").await;

        let outcome = fx
            .engine
            .derive("proj_0001.pmap", &[bottom], &request())
            .await
            .unwrap();

        assert_eq!(outcome.final_top, "proj_0002.pmap");
        assert_eq!(
            outcome.substitutions,
            BTreeMap::from([
                ("proj_0001.pmap".to_string(), "proj_0002.pmap".to_string()),
                ("proj_miri_0001.imap".to_string(), "proj_miri_0002.imap".to_string()),
            ])
        );

        let top = RuleFile::parse(&fx.content.read("proj_0002.pmap").await.unwrap()).unwrap();
        assert_eq!(top.child("miri"), Some("proj_miri_0002.imap"));
        assert_eq!(top.header.derived_from.as_deref(), Some("proj_0001.pmap"));
        let middle = RuleFile::parse(&fx.content.read("proj_miri_0002.imap").await.unwrap()).unwrap();
        assert_eq!(middle.child("dark"), Some("proj_miri_dark_0002.rmap"));

        let record = fx.store.load_record("proj_miri_0002.imap").await.unwrap();
        assert_eq!(record.state, FileState::Pending);
        assert_eq!(record.derived_from.as_deref(), Some("proj_miri_0001.imap"));
    }

    #[tokio::test]
    async fn test_derive_without_changes_keeps_base() {
        let fx = fixture().await;
        let existing = fx.store.load_record("proj_miri_dark_0001.rmap").await.unwrap();
        let outcome = fx
            .engine
            .derive("proj_0001.pmap", &[existing], &request())
            .await
            .unwrap();
        assert_eq!(outcome.final_top, "proj_0001.pmap");
        assert!(outcome.substitutions.is_empty());
        assert!(outcome.generated.is_empty());
    }

    #[tokio::test]
    async fn test_submitted_middle_for_new_instrument_extends_top() {
        let fx = fixture().await;
        let body = "header: {name: proj_nircam_0001.imap, tier: middle, project: proj, instrument: nircam}\nselector: {}\n";
        fx.content.write("proj_nircam_0001.imap", body.as_bytes()).await.unwrap();
        let mut middle = FileRecord::pending("proj_nircam_0001.imap", "proj", "alice");
        middle.instrument = Some("nircam".into());
        fx.store.create_record(&middle).await.unwrap();

        let outcome = fx
            .engine
            .derive("proj_0001.pmap", &[middle], &request())
            .await
            .unwrap();
        assert_eq!(outcome.generated, vec!["proj_0002.pmap".to_string()]);
        let top = RuleFile::parse(&fx.content.read("proj_0002.pmap").await.unwrap()).unwrap();
        assert_eq!(top.child("nircam"), Some("proj_nircam_0001.imap"));
        assert_eq!(top.child("miri"), Some("proj_miri_0001.imap"));
    }

    #[tokio::test]
    async fn test_unknown_instrument_fails_cleanly() {
        let fx = fixture().await;
        let mut bottom = stage_bottom(&fx, "proj_miri_dark_0002.rmap", "proj_miri_dark_0002.fits").await;
        bottom.instrument = Some("nircam".into());

        let err = fx
            .engine
            .derive("proj_0001.pmap", &[bottom], &request())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DerivationFailed(_)));
        assert!(fx.store.find_record("proj_0002.pmap").await.unwrap().is_none());
    }

    /// Passes everything except top-level rule files.
    struct RejectTopLevel;

    #[async_trait::async_trait]
    impl Certifier for RejectTopLevel {
        async fn certify(
            &self,
            target: &CertifyTarget<'_>,
            _ctx: &CertifyContext<'_>,
        ) -> Result<CertificationReport> {
            let mut report = CertificationReport::ok(target.name);
            if target.category.tier() == Some(RuleTier::Top) {
                report.fail("top-level files are frozen");
            }
            Ok(report)
        }
    }

    #[tokio::test]
    async fn test_failed_certification_of_generated_file_discards_all() {
        let fx = fixture().await;
        let naming = NamingService::new(fx.store.clone(), fx.content.clone(), 4);
        let engine = DerivationEngine::new(
            fx.store.clone(),
            fx.content.clone(),
            naming,
            Arc::new(RejectTopLevel),
        );
        let bottom = stage_bottom(&fx, "proj_miri_dark_0002.rmap", "proj_miri_dark_0002.fits").await;

        let err = engine
            .derive("proj_0001.pmap", &[bottom], &request())
            .await
            .unwrap_err();
        let RegistryError::DerivationFailed(message) = &err else {
            panic!("expected DerivationFailed, got {err:?}");
        };
        assert!(message.contains("proj_0002.pmap"), "{message}");

        // The middle file was certified and registered before the top failed.
        assert!(fx.store.find_record("proj_miri_0002.imap").await.unwrap().is_none());
        assert!(!fx.content.exists("proj_miri_0002.imap").await.unwrap());
        assert!(fx.store.find_record("proj_0002.pmap").await.unwrap().is_none());
        assert!(!fx.content.exists("proj_0002.pmap").await.unwrap());
    }

    #[tokio::test]
    async fn test_newest_bottom_wins_past_serial_padding() {
        let fx = fixture().await;
        let older = stage_bottom(&fx, "proj_miri_dark_9999.rmap", "proj_miri_dark_0002.fits").await;
        let newer = stage_bottom(&fx, "proj_miri_dark_10000.rmap", "proj_miri_dark_0002.fits").await;

        let outcome = fx
            .engine
            .derive("proj_0001.pmap", &[newer, older], &request())
            .await
            .unwrap();
        let middle = RuleFile::parse(&fx.content.read("proj_miri_0002.imap").await.unwrap()).unwrap();
        assert_eq!(middle.child("dark"), Some("proj_miri_dark_10000.rmap"));
        assert_eq!(outcome.final_top, "proj_0002.pmap");
    }

    #[tokio::test]
    async fn test_blacklisted_bottom_aborts_and_discards() {
        let fx = fixture().await;
        let bottom = stage_bottom(&fx, "proj_miri_dark_0002.rmap", "proj_miri_dark_0002.fits").await;
        let mut bad = bottom.clone();
        bad.blacklisted = true;
        fx.store.update_record(&bad).await.unwrap();

        let err = fx
            .engine
            .derive("proj_0001.pmap", &[bottom], &request())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DerivationFailed(_)));
        assert!(fx.store.find_record("proj_miri_0002.imap").await.unwrap().is_none());
        assert!(!fx.content.exists("proj_miri_0002.imap").await.unwrap());
        assert!(!fx.content.exists("proj_0002.pmap").await.unwrap());
    }
}
