//! S3 object store on the AWS SDK.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use deployit_core::artifact::{ArtifactKey, ObjectStore, StorageError};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Per-operation timeout for object uploads, retries included.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Settings for [`S3ObjectStore`].
#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// S3-compatible endpoint; objects are addressed path-style below it.
    pub endpoint: Option<String>,
    /// Static credentials. Without them the SDK's default provider chain
    /// (environment, profile, instance metadata) is used.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Overrides the public URL prefix of uploaded objects.
    pub public_base_url: Option<String>,
}

impl S3Settings {
    fn static_credentials(&self) -> Option<Credentials> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => Some(
                Credentials::new(key.clone(), secret.clone(), None, None, "deployit-config"),
            ),
            _ => None,
        }
    }
}

/// Uploads objects to an S3 bucket with `PutObject`.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    region: String,
    endpoint: Option<Url>,
    public_base_url: Option<String>,
}

impl S3ObjectStore {
    /// Build a store from explicit credentials.
    pub fn new(settings: S3Settings) -> Result<Self, StorageError> {
        let credentials = settings.static_credentials().ok_or_else(|| {
            StorageError::Config(
                "S3 credentials are required (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)"
                    .to_string(),
            )
        })?;
        let builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials);
        Self::build(builder, settings)
    }

    /// Build a store, falling back to the SDK's credential chain when the
    /// settings carry no credentials.
    pub async fn connect(settings: S3Settings) -> Result<Self, StorageError> {
        if settings.static_credentials().is_some() {
            return Self::new(settings);
        }
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .load()
            .await;
        Self::build(aws_sdk_s3::config::Builder::from(&shared), settings)
    }

    fn build(
        mut builder: aws_sdk_s3::config::Builder,
        settings: S3Settings,
    ) -> Result<Self, StorageError> {
        if settings.bucket.is_empty() {
            return Err(StorageError::Config("bucket must not be empty".to_string()));
        }
        let endpoint = settings
            .endpoint
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| StorageError::Config(format!("invalid S3 endpoint: {e}")))?;
        if let Some(endpoint) = &endpoint {
            builder = builder
                .endpoint_url(endpoint.as_str().trim_end_matches('/'))
                .force_path_style(true);
        }
        builder = builder.timeout_config(
            TimeoutConfig::builder()
                .operation_timeout(OPERATION_TIMEOUT)
                .build(),
        );

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket,
            region: settings.region,
            endpoint,
            public_base_url: settings.public_base_url,
        })
    }
}

/// Append the `/`-separated `key` to `base`, percent-encoding each segment.
fn join_key(base: &str, key: &str) -> String {
    let Ok(mut url) = Url::parse(base) else {
        return format!("{}/{}", base.trim_end_matches('/'), key);
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().extend(key.split('/'));
    }
    url.to_string()
}

fn storage_error(err: SdkError<PutObjectError, HttpResponse>) -> StorageError {
    let message = match err.as_service_error() {
        Some(service) => format!(
            "{}: {}",
            service.code().unwrap_or("Unknown"),
            service.message().unwrap_or_default()
        ),
        None => DisplayErrorContext(&err).to_string(),
    };
    match err.raw_response() {
        Some(raw) => StorageError::Http {
            status: raw.status().as_u16(),
            body: message,
        },
        None => StorageError::Request(message),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put(
        &self,
        key: &ArtifactKey,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.object_key())
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(storage_error)?;

        debug!(key = %key, "Uploaded object");
        Ok(())
    }

    fn public_url(&self, object_key: &str) -> String {
        match (&self.public_base_url, &self.endpoint) {
            (Some(base), _) => join_key(base, object_key),
            (None, Some(endpoint)) => join_key(
                &format!("{}/{}", endpoint.as_str().trim_end_matches('/'), self.bucket),
                object_key,
            ),
            (None, None) => join_key(
                &format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region),
                object_key,
            ),
        }
    }

    fn location(&self, prefix: &str) -> String {
        format!("s3://{}/{}", self.bucket, prefix)
    }
}
