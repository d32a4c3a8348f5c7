//! Artifact storage abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use thiserror::Error;

use crate::DeploymentId;

/// Content type used when the extension is not in [`content_type_for`].
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Key for storing an artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// Deployment the file belongs to.
    pub deployment_id: DeploymentId,
    /// Path relative to the artifact directory, `/`-separated.
    pub path: String,
}

impl ArtifactKey {
    /// Build a key from a path relative to the artifact directory.
    pub fn from_relative(deployment_id: &DeploymentId, relative: &Path) -> Self {
        let path = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        Self {
            deployment_id: deployment_id.clone(),
            path: path.replace('\\', "/"),
        }
    }

    /// Full object key: `<deployment id>/<relative path>`.
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.deployment_id, self.path)
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.deployment_id, self.path)
    }
}

/// Storage backend errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request failed: {0}")]
    Request(String),

    #[error("object store returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid storage configuration: {0}")]
    Config(String),
}

/// Trait for object storage backends that deployments are published to.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Store an object.
    async fn put(
        &self,
        key: &ArtifactKey,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Public URL for an object key.
    fn public_url(&self, object_key: &str) -> String;

    /// Backend-specific location of a key prefix, e.g. `s3://bucket/prefix/`.
    fn location(&self, prefix: &str) -> String;
}

/// Map a file extension to the content type it is served with.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
