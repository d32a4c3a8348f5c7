//! Object store writing to a local directory.

use async_trait::async_trait;
use bytes::Bytes;
use deployit_core::artifact::{ArtifactKey, ObjectStore, StorageError};
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Stores objects as files under `root`, keyed by their object key.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url,
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn object_path(&self, object_key: &str) -> PathBuf {
        object_key
            .split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        key: &ArtifactKey,
        data: Bytes,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let path = self.object_path(&key.object_key());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &data).await?;
        debug!(key = %key, path = %path.display(), "Stored object");
        Ok(())
    }

    fn public_url(&self, object_key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), object_key),
            None => {
                let path = self.object_path(object_key);
                let absolute = std::path::absolute(&path).unwrap_or(path);
                format!("file://{}", absolute.display())
            }
        }
    }

    fn location(&self, prefix: &str) -> String {
        let mut location = self.object_path(prefix).display().to_string();
        if prefix.ends_with('/') {
            location.push('/');
        }
        location
    }
}
