//! File-backed durable store.
//!
//! Saves write a sibling temp file and rename it over the target so a crash
//! leaves either the old or the new blob.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{DurableStore, StoreError};

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn load(&self) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn save(&self, blob: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, blob).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
