//! Registry value types: file records, serial keys, batches and audit entries.
//! No I/O here.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Rule tiers and file categories ─────────────────────────────

/// Level of a rule file in the three-tier hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTier {
    /// Project-wide selector, one entry per instrument.
    Top,
    /// Per-instrument selector, one entry per file type.
    Middle,
    /// Per-file-type rules selecting reference files.
    Bottom,
}

impl RuleTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Middle => "middle",
            Self::Bottom => "bottom",
        }
    }

    /// File extension carried by rule files of this tier.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Top => ".pmap",
            Self::Middle => ".imap",
            Self::Bottom => ".rmap",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            ".pmap" => Some(Self::Top),
            ".imap" => Some(Self::Middle),
            ".rmap" => Some(Self::Bottom),
            _ => None,
        }
    }

    /// Tier of the files this tier's selector points at, `None` for bottom
    /// files which select reference files.
    pub fn child(&self) -> Option<Self> {
        match self {
            Self::Top => Some(Self::Middle),
            Self::Middle => Some(Self::Bottom),
            Self::Bottom => None,
        }
    }
}

impl std::fmt::Display for RuleTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of file a registry entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileCategory {
    /// Opaque calibration data.
    Reference,
    /// Selector file in the rule hierarchy.
    Rule { tier: RuleTier },
}

impl FileCategory {
    /// Classify a file by the extension of its name.
    pub fn from_name(name: &str) -> Self {
        match RuleTier::from_extension(&extension_of(name)) {
            Some(tier) => Self::Rule { tier },
            None => Self::Reference,
        }
    }

    pub fn tier(&self) -> Option<RuleTier> {
        match self {
            Self::Reference => None,
            Self::Rule { tier } => Some(*tier),
        }
    }

    pub fn is_rule(&self) -> bool {
        matches!(self, Self::Rule { .. })
    }
}

impl std::fmt::Display for FileCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::Rule { tier } => write!(f, "rule/{tier}"),
        }
    }
}

/// Extension of `name` including the leading dot, or an empty string.
pub fn extension_of(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_string(),
        _ => String::new(),
    }
}

// ── File lifecycle ─────────────────────────────────────────────

/// Lifecycle state of a registered file.
///
/// Transitions (forward only):
///   Pending → Delivered → Archived → Operational
///   Delivered → Operational
/// Pending files are destroyed rather than regressed when a batch is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Delivered,
    Archived,
    Operational,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Archived => "archived",
            Self::Operational => "operational",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" | "uploaded" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "archived" => Some(Self::Archived),
            "operational" => Some(Self::Operational),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: FileState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Delivered)
                | (Self::Delivered, Self::Archived)
                | (Self::Delivered, Self::Operational)
                | (Self::Archived, Self::Operational)
        )
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── FileRecord ─────────────────────────────────────────────────

/// Registry metadata for one reference or rule file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub category: FileCategory,
    pub project: String,
    pub instrument: Option<String>,
    pub file_type: Option<String>,
    pub state: FileState,
    /// Hex SHA-256 of the file content as stored.
    pub sha256: String,
    pub size: u64,
    /// File this one supersedes, `None` when it has no predecessor.
    pub derived_from: Option<String>,
    /// Names selected by this file (rule files only).
    #[serde(default)]
    pub references: Vec<String>,
    pub uploaded_as: String,
    pub submitter: String,
    pub description: String,
    pub batch_id: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub use_after: Option<DateTime<Utc>>,
    /// Delivery manifest link whose removal signals the file became operational.
    pub catalog_link: Option<PathBuf>,
    /// Transitive bad-file flag.
    pub blacklisted: bool,
    /// Roots of the blacklisting that reached this file.
    #[serde(default)]
    pub blacklisted_by: Vec<String>,
    /// Non-transitive bad-file flag.
    pub rejected: bool,
}

impl FileRecord {
    /// Fresh `Pending` record classified by its name; callers fill in the rest.
    pub fn pending(name: &str, project: &str, submitter: &str) -> Self {
        Self {
            name: name.to_string(),
            category: FileCategory::from_name(name),
            project: project.to_string(),
            instrument: None,
            file_type: None,
            state: FileState::Pending,
            sha256: String::new(),
            size: 0,
            derived_from: None,
            references: Vec::new(),
            uploaded_as: name.to_string(),
            submitter: submitter.to_string(),
            description: String::new(),
            batch_id: None,
            submitted_at: Utc::now(),
            activated_at: None,
            use_after: None,
            catalog_link: None,
            blacklisted: false,
            blacklisted_by: Vec::new(),
            rejected: false,
        }
    }

    /// Whether the file must not be referenced by newly generated rules.
    pub fn is_bad(&self) -> bool {
        self.blacklisted || self.rejected
    }

    pub fn extension(&self) -> String {
        extension_of(&self.name)
    }

    /// Move to `next`, refusing regressions and skipped states.
    pub fn advance(&mut self, next: FileState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "file '{}' cannot move from {} to {}",
                self.name, self.state, next
            ));
        }
        self.state = next;
        Ok(())
    }
}

/// Query filters for `RegistryStore::query_records`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub project: Option<String>,
    pub instrument: Option<String>,
    pub file_type: Option<String>,
    pub category: Option<FileCategory>,
    pub state: Option<FileState>,
    pub derived_from: Option<String>,
    pub batch_id: Option<Uuid>,
    /// Only rule files whose selector references this name.
    pub references: Option<String>,
    pub extension: Option<String>,
}

impl RecordFilter {
    pub fn matches(&self, record: &FileRecord) -> bool {
        self.project.as_ref().is_none_or(|p| &record.project == p)
            && self
                .instrument
                .as_ref()
                .is_none_or(|i| record.instrument.as_ref() == Some(i))
            && self
                .file_type
                .as_ref()
                .is_none_or(|t| record.file_type.as_ref() == Some(t))
            && self.category.is_none_or(|c| record.category == c)
            && self.state.is_none_or(|s| record.state == s)
            && self
                .derived_from
                .as_ref()
                .is_none_or(|d| record.derived_from.as_ref() == Some(d))
            && self.batch_id.is_none_or(|b| record.batch_id == Some(b))
            && self
                .references
                .as_ref()
                .is_none_or(|r| record.references.iter().any(|x| x == r))
            && self
                .extension
                .as_ref()
                .is_none_or(|e| &record.extension() == e)
    }
}

// ── Serial counters ────────────────────────────────────────────

/// Composite key of a serial-number counter.
///
/// Names minted for a key look like `{project}_{instrument}_{file_type}_{serial}{extension}`
/// with the absent parts omitted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SerialKey {
    pub project: String,
    pub instrument: Option<String>,
    pub file_type: Option<String>,
    pub extension: String,
}

impl SerialKey {
    pub fn new(
        project: impl Into<String>,
        instrument: Option<&str>,
        file_type: Option<&str>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            instrument: instrument.map(str::to_string),
            file_type: file_type.map(str::to_string),
            extension: extension.into(),
        }
    }

    /// Name prefix shared by every name of this key, including the trailing `_`.
    pub fn prefix(&self) -> String {
        let mut parts = vec![self.project.as_str()];
        if let Some(instrument) = &self.instrument {
            parts.push(instrument);
        }
        if let Some(file_type) = &self.file_type {
            parts.push(file_type);
        }
        format!("{}_", parts.join("_"))
    }

    /// Render the file name for `serial`, zero-padded to `width` digits.
    pub fn file_name(&self, serial: u32, width: usize) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix(),
            serial,
            self.extension,
            width = width
        )
    }

    /// Storage form used by string-keyed tables.
    pub fn storage_key(&self) -> String {
        format!("{}*{}", self.prefix(), self.extension)
    }
}

impl std::fmt::Display for SerialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

// ── Locks ──────────────────────────────────────────────────────

/// Key of a mutual-exclusion lock: one live lock per (type, name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub resource_type: String,
    pub resource_name: String,
}

impl LockKey {
    pub fn new(resource_type: impl Into<String>, resource_name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_name: resource_name.into(),
        }
    }

    pub fn instrument(name: impl Into<String>) -> Self {
        Self::new("instrument", name)
    }

    pub fn project(name: impl Into<String>) -> Self {
        Self::new("project", name)
    }

    /// Parse the `type:name` form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        let (resource_type, resource_name) = s.split_once(':')?;
        if resource_type.is_empty() || resource_name.is_empty() {
            return None;
        }
        Some(Self::new(resource_type, resource_name))
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.resource_name)
    }
}

/// Stored lease for a lock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: LockKey,
    pub holder: String,
    /// Unique per acquisition; release and refresh match on it.
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    /// Last `reset_expiry`; the lease runs `max_age_ms` from here.
    pub refreshed_at: DateTime<Utc>,
    pub max_age_ms: u64,
}

impl LockRecord {
    pub fn new(key: LockKey, holder: &str, max_age_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            key,
            holder: holder.to_string(),
            token: Uuid::new_v4(),
            acquired_at: now,
            refreshed_at: now,
            max_age_ms,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.max_age_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|max_age| self.refreshed_at.checked_add_signed(max_age))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Proof of ownership handed to the holder by `LockManager::acquire`.
///
/// Survives across request cycles: serialise it into a session and present it
/// again at confirm time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldLock {
    pub key: LockKey,
    pub holder: String,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

impl From<&LockRecord> for HeldLock {
    fn from(record: &LockRecord) -> Self {
        Self {
            key: record.key.clone(),
            holder: record.holder.clone(),
            token: record.token,
            acquired_at: record.acquired_at,
        }
    }
}

// ── Contexts ───────────────────────────────────────────────────

/// Named pointers to a project's top-level rule file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Derivation point for new submissions.
    Edit,
    /// What the pipelines currently run against.
    Operational,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Operational => "operational",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "edit" | "default" => Some(Self::Edit),
            "operational" => Some(Self::Operational),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which top-level file a submission derives from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "name", rename_all = "snake_case")]
pub enum ContextSelector {
    /// Whatever the edit context points at when the batch is confirmed.
    Edit,
    /// A fixed top-level file.
    Named(String),
}

// ── Batches ────────────────────────────────────────────────────

/// Disposition of a staged batch.
///
/// Transitions:
///   Ready → Finalizing → Confirmed
///   Ready → Finalizing → Cancelled (explicit cancel or failed confirm)
///
/// A batch left `Finalizing` by a confirm that never finished is rolled back
/// to `Cancelled` once its claim is older than a lock lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Ready,
    Finalizing,
    Confirmed,
    Cancelled,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Finalizing => "finalizing",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Cancelled)
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Files staged together by one submission, persisted between the stage and
/// confirm/cancel round trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: Uuid,
    pub project: String,
    /// Instrument whose lock guards confirmation, `None` for project-wide batches.
    pub instrument: Option<String>,
    pub submitter: String,
    pub description: String,
    pub base_context: ContextSelector,
    /// Upload name → registry name for every staged file.
    pub new_file_map: BTreeMap<String, String>,
    pub disposition: Disposition,
    pub created_at: DateTime<Utc>,
    /// When the batch last moved to `Finalizing`.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub final_context: Option<String>,
    #[serde(default)]
    pub substitutions: BTreeMap<String, String>,
    pub catalog: Option<String>,
    pub failure: Option<String>,
}

impl BatchRecord {
    /// Registry names staged by the submitter, sorted.
    pub fn staged_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.new_file_map.values().cloned().collect();
        names.sort();
        names
    }
}

// ── Audit trail ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Stage,
    Confirm,
    Cancel,
    Derive,
    Deliver,
    Blacklist,
    Unblacklist,
    Reject,
    Seed,
    SetContext,
}

/// One row of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub user: String,
    pub files: Vec<String>,
    pub batch_id: Option<Uuid>,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, user: &str, files: Vec<String>) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            user: user.to_string(),
            files,
            batch_id: None,
            detail: None,
        }
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
