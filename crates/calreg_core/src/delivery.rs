//! Delivery: publish a confirmed batch as a catalog plus hard links in every
//! configured pickup directory. All or nothing; a partial set of links is
//! removed before the error is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::content::{set_read_only, ContentStore};
use crate::error::RegistryError;
use crate::naming::NamingService;
use crate::ports::Result;
use crate::types::SerialKey;

/// Catalog file extension.
pub const CATALOG_EXTENSION: &str = ".cat";

/// What a successful delivery created, enough to undo it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub catalog_name: String,
    /// Catalog written to the catalog directory.
    pub catalog_path: PathBuf,
    /// Catalog link in the first delivery directory; its removal by the ingest
    /// agent marks the delivery consumed.
    pub catalog_link: PathBuf,
    /// Every link created, catalog links included.
    pub links: Vec<PathBuf>,
    pub delivered: Vec<String>,
}

#[derive(Clone)]
pub struct DeliveryWriter {
    naming: NamingService,
    content: Arc<dyn ContentStore>,
    project: String,
    catalog_dir: PathBuf,
    delivery_dirs: Vec<PathBuf>,
}

impl DeliveryWriter {
    pub fn new(
        naming: NamingService,
        content: Arc<dyn ContentStore>,
        project: impl Into<String>,
        catalog_dir: impl Into<PathBuf>,
        delivery_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            naming,
            content,
            project: project.into(),
            catalog_dir: catalog_dir.into(),
            delivery_dirs,
        }
    }

    /// Deliver `names`, which must all be present in canonical storage.
    pub async fn deliver(&self, names: &[String]) -> Result<DeliveryReceipt> {
        let Some(first_dir) = self.delivery_dirs.first() else {
            return Err(RegistryError::DeliveryFailed(
                "no delivery directories configured".into(),
            ));
        };

        let key = SerialKey::new(&self.project, None, None, CATALOG_EXTENSION);
        let catalog_name = self.naming.allocate(&key).await?;
        let catalog_path = self.catalog_dir.join(&catalog_name);
        self.write_catalog(&catalog_path, names).await?;

        let mut links = Vec::new();
        if let Err(e) = self
            .link_all(names, &catalog_name, &catalog_path, &mut links)
            .await
        {
            remove_quietly(&links).await;
            remove_quietly(std::slice::from_ref(&catalog_path)).await;
            tracing::error!(
                target: "calreg.deliver",
                catalog = %catalog_name,
                error = %e,
                removed_links = links.len(),
                "delivery rolled back"
            );
            return Err(e);
        }

        tracing::info!(
            target: "calreg.deliver",
            catalog = %catalog_name,
            files = names.len(),
            dirs = self.delivery_dirs.len(),
            "delivery completed"
        );
        Ok(DeliveryReceipt {
            catalog_link: first_dir.join(&catalog_name),
            catalog_name,
            catalog_path,
            links,
            delivered: names.to_vec(),
        })
    }

    /// Receipt for an earlier delivery of `names` under `catalog_name`, rebuilt
    /// from the configured directories. Links that were never made are skipped
    /// by `retract`.
    pub fn receipt_for(&self, catalog_name: &str, names: &[String]) -> DeliveryReceipt {
        let mut links = Vec::new();
        for dir in &self.delivery_dirs {
            links.extend(names.iter().map(|name| dir.join(name)));
            links.push(dir.join(catalog_name));
        }
        let catalog_link = self
            .delivery_dirs
            .first()
            .map(|dir| dir.join(catalog_name))
            .unwrap_or_default();
        DeliveryReceipt {
            catalog_name: catalog_name.to_string(),
            catalog_path: self.catalog_dir.join(catalog_name),
            catalog_link,
            links,
            delivered: names.to_vec(),
        }
    }

    /// Undo a delivery: remove its links and catalog.
    pub async fn retract(&self, receipt: &DeliveryReceipt) {
        remove_quietly(&receipt.links).await;
        remove_quietly(std::slice::from_ref(&receipt.catalog_path)).await;
        tracing::warn!(
            target: "calreg.deliver",
            catalog = %receipt.catalog_name,
            "delivery retracted"
        );
    }

    async fn write_catalog(&self, path: &Path, names: &[String]) -> Result<()> {
        tokio::fs::create_dir_all(&self.catalog_dir).await.map_err(|e| {
            RegistryError::DeliveryFailed(format!(
                "cannot create catalog directory {}: {e}",
                self.catalog_dir.display()
            ))
        })?;
        let mut body = names.join("\n");
        body.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| {
                RegistryError::DeliveryFailed(format!("cannot create catalog {}: {e}", path.display()))
            })?;
        let written: std::io::Result<()> = async {
            file.write_all(body.as_bytes()).await?;
            file.flush().await?;
            drop(file);
            set_read_only(path).await
        }
        .await;
        if let Err(e) = written {
            remove_quietly(&[path.to_path_buf()]).await;
            return Err(RegistryError::DeliveryFailed(format!(
                "cannot write catalog {}: {e}",
                path.display()
            )));
        }
        Ok(())
    }

    async fn link_all(
        &self,
        names: &[String],
        catalog_name: &str,
        catalog_path: &Path,
        links: &mut Vec<PathBuf>,
    ) -> Result<()> {
        for dir in &self.delivery_dirs {
            for name in names {
                let source = self.content.path_for(name)?;
                link_into(&source, dir, name, links).await?;
            }
            link_into(catalog_path, dir, catalog_name, links).await?;
        }
        Ok(())
    }
}

async fn link_into(source: &Path, dir: &Path, name: &str, links: &mut Vec<PathBuf>) -> Result<()> {
    let target = dir.join(name);
    tokio::fs::hard_link(source, &target).await.map_err(|e| {
        RegistryError::DeliveryFailed(format!(
            "cannot link {} into {}: {e}",
            source.display(),
            dir.display()
        ))
    })?;
    links.push(target);
    Ok(())
}

/// Best-effort removal; failures are logged and swallowed.
async fn remove_quietly(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                target: "calreg.deliver",
                path = %path.display(),
                error = %e,
                "failed to remove delivery artefact"
            ),
        }
    }
}
