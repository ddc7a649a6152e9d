//! Canonical file storage.
//!
//! Every registered file lives at one canonical path derived from its name.
//! Rule files go under `rules/`, reference files under `references/`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::types::FileCategory;

/// Error type for canonical storage operations
#[derive(Debug, thiserror::Error)]
pub enum ContentStoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),
}

impl ContentStoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

type Result<T> = std::result::Result<T, ContentStoreError>;

/// Canonical-location storage for registry file content.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Put `source` at the canonical path for `name`: hard link when possible,
    /// copy otherwise. Fails with `AlreadyExists` rather than overwrite.
    ///
    /// The stored file is made read-only. A hard link shares its inode with
    /// `source`, so the submitter's upload turns read-only as well and can no
    /// longer be edited in place under the registry's feet.
    async fn place(&self, source: &Path, name: &str) -> Result<PathBuf>;

    /// Write generated content under `name`. Fails with `AlreadyExists`.
    async fn write(&self, name: &str, content: &[u8]) -> Result<PathBuf>;

    async fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// Remove the stored file. Missing files are not an error.
    async fn remove(&self, name: &str) -> Result<()>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Every stored file name, sorted.
    async fn list_names(&self) -> Result<Vec<String>>;

    fn path_for(&self, name: &str) -> Result<PathBuf>;
}

/// Local filesystem implementation
pub struct LocalContentStore {
    base_path: PathBuf,
}

impl LocalContentStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn subdir(category: FileCategory) -> &'static str {
        match category {
            FileCategory::Reference => "references",
            FileCategory::Rule { .. } => "rules",
        }
    }

    async fn prepare(&self, name: &str) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ContentStoreError::io(&path, e))?
        {
            return Err(ContentStoreError::AlreadyExists(name.to_string()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ContentStoreError::io(parent, e))?;
        }
        Ok(path)
    }
}

/// Registry names are plain file names: no separators, no parent references.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
        || name.starts_with('.')
    {
        return Err(ContentStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Mark a file read-only.
pub async fn set_read_only(path: &Path) -> std::io::Result<()> {
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_readonly(true);
    tokio::fs::set_permissions(path, perms).await
}

/// Hex SHA-256 of `content`.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn place(&self, source: &Path, name: &str) -> Result<PathBuf> {
        let path = self.prepare(name).await?;
        match tokio::fs::hard_link(source, &path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ContentStoreError::AlreadyExists(name.to_string()));
            }
            Err(e) => {
                // Cross-device or unsupported: fall back to a copy.
                tracing::debug!(
                    source = %source.display(),
                    error = %e,
                    "hard link failed, copying"
                );
                tokio::fs::copy(source, &path)
                    .await
                    .map_err(|e| ContentStoreError::io(source, e))?;
            }
        }
        set_read_only(&path)
            .await
            .map_err(|e| ContentStoreError::io(&path, e))?;
        Ok(path)
    }

    async fn write(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.prepare(name).await?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ContentStoreError::io(&path, e))?;
        set_read_only(&path)
            .await
            .map_err(|e| ContentStoreError::io(&path, e))?;
        Ok(path)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ContentStoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(ContentStoreError::io(&path, e)),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ContentStoreError::io(&path, e)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ContentStoreError::io(&path, e))
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for sub in ["rules", "references"] {
            let dir = self.base_path.join(sub);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ContentStoreError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ContentStoreError::io(&dir, e))?
            {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self
            .base_path
            .join(Self::subdir(FileCategory::from_name(name)))
            .join(name))
    }
}
