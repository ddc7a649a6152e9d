//! Collision-free serial naming.
//!
//! Names follow `{project}[_{instrument}[_{file_type}]]_{serial}{extension}`
//! with a zero-padded serial. Padding only keeps string order right until a
//! serial outgrows it; `compare_by_serial` orders by the number itself.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::content::ContentStore;
use crate::error::RegistryError;
use crate::ports::{RegistryStore, Result};
use crate::types::{extension_of, RecordFilter, SerialKey};

/// Proposals tried before `allocate` gives up.
const MAX_ALLOCATION_ATTEMPTS: u32 = 1000;

/// Serial carried by `name` when it belongs to `key`, `None` otherwise.
pub fn serial_of(key: &SerialKey, name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix(&key.prefix())?
        .strip_suffix(key.extension.as_str())?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Split a serial name back into its key and serial.
///
/// Returns `None` for names that do not follow the naming pattern, such as
/// externally supplied upload names.
pub fn decompose_name(name: &str) -> Option<(SerialKey, u32)> {
    let extension = extension_of(name);
    let stem = name.strip_suffix(extension.as_str())?;
    let (head, digits) = stem.rsplit_once('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let serial = digits.parse().ok()?;
    let parts: Vec<&str> = head.split('_').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let key = match parts.as_slice() {
        [project] => SerialKey::new(*project, None, None, extension),
        [project, instrument] => SerialKey::new(*project, Some(*instrument), None, extension),
        [project, instrument, file_type] => {
            SerialKey::new(*project, Some(*instrument), Some(*file_type), extension)
        }
        _ => return None,
    };
    Some((key, serial))
}

/// Order names by serial, then by name. Names without a serial sort first.
pub fn compare_by_serial(a: &str, b: &str) -> Ordering {
    let serial = |name: &str| decompose_name(name).map(|(_, serial)| serial);
    serial(a).cmp(&serial(b)).then_with(|| a.cmp(b))
}

/// Allocates registry names from the serial counters.
#[derive(Clone)]
pub struct NamingService {
    store: Arc<dyn RegistryStore>,
    content: Arc<dyn ContentStore>,
    serial_width: usize,
}

impl NamingService {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        content: Arc<dyn ContentStore>,
        serial_width: usize,
    ) -> Self {
        Self {
            store,
            content,
            serial_width,
        }
    }

    pub fn serial_width(&self) -> usize {
        self.serial_width
    }

    /// Mint a new unused name for `key`.
    ///
    /// The counter is first raised past every serial already present in the
    /// registry or canonical storage, then advanced until the proposed name is
    /// free in both. Counter increments are atomic, so concurrent callers never
    /// receive the same name.
    pub async fn allocate(&self, key: &SerialKey) -> Result<String> {
        let existing = self.max_existing_serial(key).await?;
        self.store.advance_serial(key, existing).await?;

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let serial = self.store.next_serial(key).await?;
            let name = key.file_name(serial, self.serial_width);
            if self.is_taken(&name).await? {
                tracing::warn!(
                    target: "calreg.naming",
                    name = %name,
                    "proposed name already in use, trying next serial"
                );
                continue;
            }
            tracing::debug!(target: "calreg.naming", key = %key, name = %name, "allocated name");
            return Ok(name);
        }
        Err(RegistryError::NameCollision(format!(
            "no free name for {key} after {MAX_ALLOCATION_ATTEMPTS} attempts"
        )))
    }

    /// Account for a name chosen outside the allocator.
    ///
    /// Mirrors the key's counter up to the name's serial so later allocations
    /// do not collide with it. Returns a warning when the name looks newer than
    /// anything the allocator handed out.
    pub async fn observe_name(&self, name: &str) -> Result<Option<String>> {
        let Some((key, serial)) = decompose_name(name) else {
            return Ok(None);
        };
        let last = self.store.last_serial(&key).await?;
        self.store.advance_serial(&key, serial).await?;
        if serial > last {
            return Ok(Some(format!(
                "existing name '{name}' looks newer than the last generated name for {key}"
            )));
        }
        Ok(None)
    }

    /// Whether `name` exists in the registry or canonical storage.
    pub async fn is_taken(&self, name: &str) -> Result<bool> {
        if self.store.find_record(name).await?.is_some() {
            return Ok(true);
        }
        Ok(self.content.exists(name).await?)
    }

    async fn max_existing_serial(&self, key: &SerialKey) -> Result<u32> {
        let filter = RecordFilter {
            project: Some(key.project.clone()),
            extension: Some(key.extension.clone()),
            ..Default::default()
        };
        let registered = self.store.query_records(&filter).await?;
        let stored = self.content.list_names().await?;
        Ok(registered
            .iter()
            .map(|r| r.name.as_str())
            .chain(stored.iter().map(String::as_str))
            .filter_map(|name| serial_of(key, name))
            .max()
            .unwrap_or(0))
    }
}
