//! Certification: the pass/warn/fail predicate applied to every candidate and
//! generated file.
//!
//! A failing file is an expected result, returned as a `CertificationReport`.
//! Only the submission gate turns failed reports into an error.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ports::{RegistryStore, Result};
use crate::rules::RuleFile;
use crate::types::{extension_of, FileCategory, RuleTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertifyOutcome {
    Ok,
    Warnings,
    Failed,
}

/// Per-file certification result with human-readable detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificationReport {
    pub file: String,
    pub outcome: CertifyOutcome,
    pub messages: Vec<String>,
}

impl CertificationReport {
    pub fn ok(file: &str) -> Self {
        Self {
            file: file.to_string(),
            outcome: CertifyOutcome::Ok,
            messages: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        if self.outcome == CertifyOutcome::Ok {
            self.outcome = CertifyOutcome::Warnings;
        }
        self.messages.push(message.into());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.outcome = CertifyOutcome::Failed;
        self.messages.push(message.into());
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == CertifyOutcome::Failed
    }

    /// `Err(self)` when the file failed.
    pub fn into_result(self) -> std::result::Result<Self, Self> {
        if self.is_failed() {
            Err(self)
        } else {
            Ok(self)
        }
    }
}

impl std::fmt::Display for CertificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.file, self.outcome)?;
        for message in &self.messages {
            write!(f, "\n  - {message}")?;
        }
        Ok(())
    }
}

/// File under certification.
#[derive(Debug, Clone, Copy)]
pub struct CertifyTarget<'a> {
    /// Name the file is known by in its batch (upload or registry name).
    pub name: &'a str,
    pub path: &'a Path,
    pub category: FileCategory,
}

/// What the certifier may rely on besides the file itself.
#[derive(Debug, Clone, Copy)]
pub struct CertifyContext<'a> {
    pub project: &'a str,
    /// Names of the other files travelling in the same batch, which may be
    /// referenced before they are registered.
    pub batch_names: &'a BTreeSet<String>,
}

#[async_trait]
pub trait Certifier: Send + Sync {
    /// Certify one file. `Err` is reserved for infrastructure failures.
    async fn certify(
        &self,
        target: &CertifyTarget<'_>,
        ctx: &CertifyContext<'_>,
    ) -> Result<CertificationReport>;
}

/// Structural checks only: content is present, rule files parse and every
/// reference resolves to a usable file.
pub struct BasicCertifier {
    store: Arc<dyn RegistryStore>,
}

impl BasicCertifier {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    async fn check_rule(
        &self,
        tier: RuleTier,
        content: &[u8],
        ctx: &CertifyContext<'_>,
        report: &mut CertificationReport,
    ) -> Result<()> {
        let rule = match RuleFile::parse(content) {
            Ok(rule) => rule,
            Err(e) => {
                report.fail(e.to_string());
                return Ok(());
            }
        };
        if rule.header.tier != tier {
            report.fail(format!(
                "header declares tier {} but the extension implies {tier}",
                rule.header.tier
            ));
        }
        if rule.header.project != ctx.project {
            report.fail(format!(
                "header project '{}' does not match '{}'",
                rule.header.project, ctx.project
            ));
        }
        if rule.selector.is_empty() {
            report.warn("selector is empty");
        }
        for child in rule.references() {
            if ctx.batch_names.contains(&child) {
                continue;
            }
            match self.store.find_record(&child).await? {
                None => report.fail(format!("references unknown file '{child}'")),
                Some(record) if record.blacklisted => {
                    report.fail(format!("references blacklisted file '{child}'"))
                }
                Some(record) if record.rejected => {
                    report.fail(format!("references rejected file '{child}'"))
                }
                Some(record) => {
                    let expected = tier.child();
                    if record.category.tier() != expected {
                        report.fail(format!(
                            "'{child}' is {} and cannot be selected by a {tier} rule file",
                            record.category
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Certifier for BasicCertifier {
    async fn certify(
        &self,
        target: &CertifyTarget<'_>,
        ctx: &CertifyContext<'_>,
    ) -> Result<CertificationReport> {
        let mut report = CertificationReport::ok(target.name);
        let content = match tokio::fs::read(target.path).await {
            Ok(content) => content,
            Err(e) => {
                report.fail(format!("cannot read {}: {e}", target.path.display()));
                return Ok(report);
            }
        };
        if content.is_empty() {
            report.fail("file is empty");
            return Ok(report);
        }
        match target.category {
            FileCategory::Reference => {
                if extension_of(target.name).is_empty() {
                    report.warn("reference file has no extension");
                }
            }
            FileCategory::Rule { tier } => {
                self.check_rule(tier, &content, ctx, &mut report).await?;
            }
        }
        tracing::debug!(
            target: "calreg.submit",
            file = target.name,
            outcome = ?report.outcome,
            "certified"
        );
        Ok(report)
    }
}
