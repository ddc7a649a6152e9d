//! Rule file model.
//!
//! A rule file is a YAML document with a `header` and a `selector` mapping
//! keys to child file names:
//!
//! ```yaml
//! header:
//!   name: proj_miri_0002.imap
//!   tier: middle
//!   project: proj
//!   instrument: miri
//! selector:
//!   dark: proj_miri_dark_0004.rmap
//!   flat: proj_miri_flat_0001.rmap
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::ports::Result;
use crate::types::RuleTier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleHeader {
    pub name: String,
    pub tier: RuleTier,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
    /// Keys this core does not interpret, carried through unchanged.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFile {
    pub header: RuleHeader,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

impl RuleFile {
    pub fn parse(content: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(content)
            .map_err(|e| RegistryError::InvalidInput(format!("unparsable rule file: {e}")))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| RegistryError::Internal(anyhow::anyhow!("rule file serialisation: {e}")))
    }

    /// Names selected by this file, sorted and deduplicated.
    pub fn references(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.selector.values().cloned().collect();
        refs.sort();
        refs.dedup();
        refs
    }

    /// Child file selected under `key`.
    pub fn child(&self, key: &str) -> Option<&str> {
        self.selector.get(key).map(String::as_str)
    }

    /// Point `key` at `child`. Returns the previous child.
    pub fn set_child(&mut self, key: &str, child: &str) -> Option<String> {
        self.selector.insert(key.to_string(), child.to_string())
    }

    /// Copy of this file under `new_name`.
    ///
    /// When the header named another file, that file becomes `derived_from`.
    pub fn renamed(&self, new_name: &str) -> Self {
        let mut next = self.clone();
        if self.header.name != new_name {
            if !self.header.name.is_empty() && self.header.name != "none" {
                next.header.derived_from = Some(self.header.name.clone());
            }
            next.header.name = new_name.to_string();
        }
        next
    }

    /// Rewrite selector values through `renames`. Returns whether anything changed.
    pub fn substitute(&mut self, renames: &BTreeMap<String, String>) -> bool {
        let mut changed = false;
        for child in self.selector.values_mut() {
            if let Some(new_name) = renames.get(child) {
                if new_name != child {
                    *child = new_name.clone();
                    changed = true;
                }
            }
        }
        changed
    }
}
