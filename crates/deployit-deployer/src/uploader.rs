//! Artifact uploader: ships an artifact directory to an object store.

use async_trait::async_trait;
use bytes::Bytes;
use deployit_core::DeploymentId;
use deployit_core::artifact::{ArtifactKey, ObjectStore, content_type_for};
use deployit_core::deploy::{FailedFile, UPLOAD_PREVIEW_LIMIT, UploadResult};
use deployit_core::pipeline::StageError;
use deployit_executor::workspace::list_files;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A progress line is logged after this many files.
pub const LOG_EVERY_FILES: usize = 10;

/// Receives upload progress for the job being deployed.
#[async_trait]
pub trait UploadObserver: Send + Sync {
    /// Called once the file list is known and after every file, whether or
    /// not it uploaded.
    async fn on_progress(&self, done: usize, total: usize) -> deployit_core::Result<()>;

    /// A line for the job's log.
    async fn on_log(&self, line: &str) -> deployit_core::Result<()>;
}

/// Observer that ignores everything.
pub struct NoopObserver;

#[async_trait]
impl UploadObserver for NoopObserver {
    async fn on_progress(&self, _done: usize, _total: usize) -> deployit_core::Result<()> {
        Ok(())
    }

    async fn on_log(&self, _line: &str) -> deployit_core::Result<()> {
        Ok(())
    }
}

/// Uploads artifact directories file by file.
#[derive(Clone)]
pub struct ArtifactUploader {
    store: Arc<dyn ObjectStore>,
}

impl ArtifactUploader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Upload every regular file under `artifact_dir`.
    ///
    /// The file list is taken once up front. A file that fails to read or
    /// upload is recorded in [`UploadResult::failed_files`] and the batch
    /// carries on; only failing to list the directory, a cancellation, or an
    /// observer error aborts the upload.
    pub async fn upload(
        &self,
        deployment_id: &DeploymentId,
        artifact_dir: &Path,
        observer: &dyn UploadObserver,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, StageError> {
        let files = list_files(artifact_dir).await.map_err(|e| {
            StageError::Upload(format!(
                "cannot list artifact directory {}: {}",
                artifact_dir.display(),
                e
            ))
        })?;
        let total = files.len();

        info!(
            deployment_id = %deployment_id,
            store = self.store.name(),
            total,
            "Uploading artifacts"
        );
        observer
            .on_log(&format!(
                "Found {total} files to upload to {}",
                self.store.location(&format!("{deployment_id}/"))
            ))
            .await?;
        observer.on_progress(0, total).await?;

        let mut uploaded = Vec::with_capacity(total);
        let mut failed_files = Vec::new();

        for (index, relative) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }

            let key = ArtifactKey::from_relative(deployment_id, relative);
            match self.upload_file(&key, &artifact_dir.join(relative)).await {
                Ok(()) => uploaded.push(key.path),
                Err(error) => {
                    warn!(key = %key, error = %error, "Failed to upload file");
                    observer
                        .on_log(&format!("Failed to upload {}: {}", key.path, error))
                        .await?;
                    failed_files.push(FailedFile {
                        path: key.path,
                        error,
                    });
                }
            }

            let done = index + 1;
            observer.on_progress(done, total).await?;
            if done % LOG_EVERY_FILES == 0 {
                observer
                    .on_log(&format!("Processed {done}/{total} files"))
                    .await?;
            }
        }

        let uploaded_count = uploaded.len();
        observer
            .on_log(&format!(
                "Upload finished: {uploaded_count} uploaded, {} failed",
                failed_files.len()
            ))
            .await?;
        info!(
            deployment_id = %deployment_id,
            uploaded = uploaded_count,
            failed = failed_files.len(),
            "Upload finished"
        );

        uploaded.truncate(UPLOAD_PREVIEW_LIMIT);
        Ok(UploadResult {
            deployment_id: deployment_id.clone(),
            total_files: total,
            uploaded_count,
            failed_files,
            object_store_url: self
                .store
                .public_url(&format!("{deployment_id}/index.html")),
            storage_path: self.store.location(&format!("{deployment_id}/")),
            uploaded_preview: uploaded,
            local_path: artifact_dir.display().to_string(),
        })
    }

    async fn upload_file(&self, key: &ArtifactKey, path: &Path) -> Result<(), String> {
        let data = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
        self.store
            .put(key, Bytes::from(data), content_type_for(path))
            .await
            .map_err(|e| e.to_string())
    }
}
