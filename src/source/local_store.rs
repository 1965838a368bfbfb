// Directory-backed bundle stores: packaged fallback copies, the local
// authoring tree and the persistent per-hash download copies.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use tokio::fs;

use crate::catalog::ContentHash;
use crate::config::PlatformTarget;

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<name>`. Names may contain `/` but never leave the root.
    pub fn bundle_path(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        if name.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("bundle name '{}' is not a relative path", name));
        }
        Ok(self.root.join(rel))
    }

    /// `<root>/<hash>/<name>`.
    pub fn copy_path(&self, hash: ContentHash, name: &str) -> Result<PathBuf> {
        let rel = self.bundle_path(name)?;
        let rel = rel.strip_prefix(&self.root)?;
        Ok(self.root.join(hash.to_string()).join(rel))
    }

    pub fn manifest_path(&self, target: &PlatformTarget) -> PathBuf {
        self.root.join(target.manifest_file_name())
    }

    pub async fn read_bundle(&self, name: &str) -> Result<Option<Bytes>> {
        read_optional(&self.bundle_path(name)?).await
    }

    pub async fn read_manifest(&self, target: &PlatformTarget) -> Result<Option<Bytes>> {
        read_optional(&self.manifest_path(target)).await
    }

    pub async fn has_copy(&self, hash: ContentHash, name: &str) -> bool {
        match self.copy_path(hash, name) {
            Ok(path) => fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn read_copy(&self, hash: ContentHash, name: &str) -> Result<Option<Bytes>> {
        read_optional(&self.copy_path(hash, name)?).await
    }

    /// Write through a temp file so a crash never leaves a torn copy behind.
    pub async fn write_copy(&self, hash: ContentHash, name: &str, data: &[u8]) -> Result<()> {
        let path = self.copy_path(hash, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = path.with_extension("partial");
        fs::write(&tmp, data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {}", tmp.display()))?;
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<Bytes>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}
