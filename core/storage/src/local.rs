//! Local filesystem blob store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::adapter::BlobStore;
use satchel_common::{Error, Result};

/// Local filesystem blob store.
///
/// Keys map to paths under a root directory; `/` in a key becomes a
/// subdirectory. Writes go to a temp file in the same directory and are
/// renamed into place, so a crash never leaves a torn blob.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store rooted at the given directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Invalid path
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        Ok(Self { root })
    }

    /// Map a key to a filesystem path, rejecting traversal components.
    fn key_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(Error::InvalidInput("blob key cannot be empty".to_string()));
        }
        let mut path = self.root.clone();
        for component in key.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(Error::InvalidInput(format!("invalid blob key: {key}")));
            }
            path.push(component);
        }
        Ok(path)
    }

    fn collect_keys(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect_keys(&path, root, out)?;
            } else if path.extension().map(|e| e == "tmp") != Some(true) {
                if let Ok(rel) = path.strip_prefix(root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write-then-rename within the same directory keeps the swap atomic.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let path = self.key_path(key)?;
        Ok(path.is_file())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let mut keys = Vec::new();
        Self::collect_keys(&root, &root, &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}
