use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::ResourceBackend;

/// A directory of artifact files. Keys are full file paths.
///
/// Hidden files (leading `.`) are never reported, so editors' swap files and
/// in-progress temp files do not become artifacts.
pub struct FilesystemResource {
    root: PathBuf,
    include: Option<Regex>,
}

impl FilesystemResource {
    /// Open a directory resource, creating the directory if missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            SluiceError::Resource(format!(
                "Failed to create resource directory {}: {}",
                root.display(),
                e
            ))
        })?;
        debug!(path = %root.display(), "Filesystem resource opened");
        Ok(Self {
            root,
            include: None,
        })
    }

    /// Only report files whose name matches `pattern`.
    /// Wrap `root` without creating it. Scans fail until it exists.
    pub fn attach(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            include: None,
        }
    }

    pub fn with_include(mut self, pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| SluiceError::Config(format!("invalid include pattern: {}", e)))?;
        self.include = Some(re);
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        self.include.as_ref().map_or(true, |re| re.is_match(name))
    }

    fn scan_blocking(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Err(SluiceError::Resource(format!(
                "resource directory missing: {}",
                self.root.display()
            )));
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| SluiceError::Resource(e.to_string()))?;
            if entry.file_type().is_file() && self.accepts(entry.path()) {
                keys.push(entry.path().display().to_string());
            }
        }
        Ok(keys)
    }

    /// Reject keys that escape the resource root.
    fn checked_path(&self, key: &str) -> Result<PathBuf> {
        let path = PathBuf::from(key);
        if !path.starts_with(&self.root)
            || path.components().any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SluiceError::Resource(format!(
                "key outside resource root {}: {}",
                self.root.display(),
                key
            )));
        }
        Ok(path)
    }
}

impl ResourceBackend for FilesystemResource {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn scan(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move { self.scan_blocking() })
    }

    fn read(&self, key: &str) -> BoxFuture<'_, Result<Vec<u8>>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.checked_path(&key)?;
            Ok(tokio::fs::read(&path).await?)
        })
    }

    fn write(&self, name: &str, content: Vec<u8>) -> BoxFuture<'_, Result<String>> {
        let key = self.key_for(name);
        Box::pin(async move {
            let path = self.checked_path(&key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
            Ok(key)
        })
    }

    fn key_for(&self, name: &str) -> String {
        self.root.join(name).display().to_string()
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.checked_path(&key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_skips_hidden_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join(".a.txt.swp"), "x").unwrap();

        let res = FilesystemResource::open(dir.path()).unwrap();
        let keys = res.scan().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].ends_with("a.txt"));
        assert!(keys[1].ends_with("b.txt"));
    }

    #[tokio::test]
    async fn test_include_pattern_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test_file0.txt"), "x").unwrap();
        std::fs::write(dir.path().join("notes.md"), "x").unwrap();

        let res = FilesystemResource::open(dir.path())
            .unwrap()
            .with_include(r"\.txt$")
            .unwrap();
        let keys = res.scan().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("test_file0.txt"));
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let res = FilesystemResource::open(dir.path().join("registry")).unwrap();
        let key = res.write("model0.txt", b"weights".to_vec()).await.unwrap();
        assert_eq!(key, res.key_for("model0.txt"));
        assert_eq!(res.read(&key).await.unwrap(), b"weights");
        res.remove(&key).await.unwrap();
        // Removing twice is fine
        res.remove(&key).await.unwrap();
        assert!(res.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_outside_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let res = FilesystemResource::open(dir.path().join("data")).unwrap();
        assert!(res.read("/etc/passwd").await.is_err());
        let sneaky = format!("{}/../escape.txt", res.location());
        assert!(res.read(&sneaky).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_missing_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vanishing");
        let res = FilesystemResource::open(&root).unwrap();
        std::fs::remove_dir(&root).unwrap();
        assert!(matches!(res.scan().await, Err(SluiceError::Resource(_))));
    }

    #[tokio::test]
    async fn test_attach_leaves_missing_dir_alone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("plots");
        let res = FilesystemResource::attach(&root);
        assert!(!root.exists());
        assert!(res.scan().await.is_err());
    }
}
