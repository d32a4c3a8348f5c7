//! Artifact upload and object storage backends for deployit.
//!
//! Provides:
//! - [`ArtifactUploader`], which ships an artifact directory file by file
//! - [`S3ObjectStore`] on the AWS SDK
//! - [`LocalObjectStore`] for development and tests

pub mod local;
pub mod s3;
pub mod uploader;

pub use deployit_core::artifact::{ArtifactKey, ObjectStore, StorageError};
pub use local::LocalObjectStore;
pub use s3::{S3ObjectStore, S3Settings};
pub use uploader::{ArtifactUploader, NoopObserver, UploadObserver};

use deployit_config::{StorageBackend, StorageConfig};
use std::sync::Arc;
use tracing::info;

/// Build the object store selected by `config`.
pub async fn object_store_from_config(
    config: &StorageConfig,
) -> Result<Arc<dyn ObjectStore>, StorageError> {
    let store: Arc<dyn ObjectStore> = match config.backend {
        StorageBackend::S3 => Arc::new(
            S3ObjectStore::connect(S3Settings {
                bucket: config.bucket.clone(),
                region: config.region.clone(),
                endpoint: config.endpoint.clone(),
                access_key_id: config.access_key_id.clone(),
                secret_access_key: config.secret_access_key.clone(),
                public_base_url: config.public_base_url.clone(),
            })
            .await?,
        ),
        StorageBackend::Local => Arc::new(LocalObjectStore::new(
            config.local_root.clone(),
            config.public_base_url.clone(),
        )),
    };
    info!(backend = store.name(), "Object store configured");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_backend_from_config() {
        let config = StorageConfig {
            backend: StorageBackend::Local,
            ..Default::default()
        };
        let store = object_store_from_config(&config).await.unwrap();
        assert_eq!(store.name(), "local");
    }

    #[tokio::test]
    async fn test_s3_backend_from_config() {
        let config = StorageConfig {
            access_key_id: Some("AKID".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..Default::default()
        };
        let store = object_store_from_config(&config).await.unwrap();
        assert_eq!(store.name(), "s3");

        let config = StorageConfig {
            bucket: String::new(),
            ..config
        };
        assert!(matches!(
            object_store_from_config(&config).await,
            Err(StorageError::Config(_))
        ));
    }
}
