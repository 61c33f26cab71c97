//! S3-compatible storage backend.
//!
//! Works against AWS S3 and the S3-compatible services that honour
//! conditional writes (`If-None-Match: *`), which the container write lock
//! depends on.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via the configuration file. Each
//! account specifies its own `key_id` and `key_secret`.

use crate::{
    FileInfo, StorageBackend,
    backend::FileInfoStream,
    error::{ErrorKind, Result},
    validate_path,
};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::{ByteStream, DateTime},
};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// S3-compatible storage backend.
///
/// Stores blobs in a bucket, optionally under a key prefix. All paths are
/// relative to the configured prefix (if any).
///
/// # Examples
///
/// ```no_run
/// use stow_storage::backend::S3Backend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "cloud",
///     "workspaces",
///     Some("containers/".to_string()),
///     "us-east-1",
///     None::<String>,
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - AWS region or provider-specific region
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - Access key ID
    /// * `key_secret` - Secret access key
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix
            .map(validate_path)
            .transpose()?
            .map(|p| p.to_str().map(|s| s.to_string()).ok_or_raise(|| ErrorKind::InvalidPath(p)))
            .transpose()?;
        let credentials = Credentials::new(key_id, key_secret, None, None, "stow-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // 1 initial attempt + 3 retries with exponential backoff
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for S3-compatible services (MinIO, etc.)
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Ok(Self {
            name: name.into(),
            client: Client::from_conf(config_builder.build()),
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    fn full_key(&self, path: &Path) -> Result<String> {
        let validated = validate_path(path)?;
        let path_str = validated.to_str().ok_or_raise(|| ErrorKind::InvalidPath(validated.clone()))?;
        Ok(join_key(self.prefix.as_deref(), path_str))
    }

    fn relative_path(&self, key: &str) -> Result<PathBuf> {
        validate_path(strip_key_prefix(self.prefix.as_deref(), key))
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 request limiter closed".to_string()))
    }

    fn parse_datetime(dt: Option<&DateTime>) -> Result<OffsetDateTime> {
        match dt {
            Some(dt) => OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
                .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string())),
            None => Ok(OffsetDateTime::UNIX_EPOCH),
        }
    }

    fn network_error<E, R>(err: SdkError<E, R>) -> ErrorKind
    where
        E: std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug,
    {
        ErrorKind::Network(DisplayErrorContext(err).to_string())
    }
}

fn join_key(prefix: Option<&str>, path: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), path),
        None => path.to_string(),
    }
}

fn strip_key_prefix<'a>(prefix: Option<&str>, key: &'a str) -> &'a str {
    match prefix {
        Some(prefix) => key.strip_prefix(prefix.trim_end_matches('/')).and_then(|s| s.strip_prefix('/')).unwrap_or(key),
        None => key,
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let key_prefix = match prefix.map(|p| self.full_key(p)).transpose() {
            // Component-based matching: "fonts" must not match "fonts-02/…".
            Ok(pfx) => pfx.map(|p| format!("{p}/")).or_else(|| self.prefix.as_ref().map(|p| format!("{}/", p.trim_end_matches('/')))),
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            let mut continuation: Option<String> = None;
            loop {
                let _permit = match self.acquire_permit().await {
                    Ok(permit) => permit,
                    Err(e) => { yield Err(e); return; },
                };
                let response = self.client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .set_prefix(key_prefix.clone())
                    .set_continuation_token(continuation.take())
                    .send()
                    .await;
                let output = match response {
                    Ok(output) => output,
                    Err(e) => { yield Err(exn::Exn::from(Self::network_error(e))); return; },
                };
                for object in output.contents() {
                    let Some(key) = object.key() else { continue };
                    let info = self.relative_path(key).and_then(|path| {
                        let modified = Self::parse_datetime(object.last_modified())?;
                        let size = u64::try_from(object.size().unwrap_or_default()).unwrap_or_default();
                        Ok(FileInfo::new(path, size, modified))
                    });
                    yield info;
                }
                match output.next_continuation_token() {
                    Some(token) if output.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                    _ => break,
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if matches!(&*e, ErrorKind::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()))
            },
            Err(e) => exn::bail!(Self::network_error(e)),
        };
        let body = output.body.collect().await.or_raise(|| ErrorKind::Network(format!("reading body of {key}")))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(Self::network_error)?;
        Ok(())
    }

    async fn create_new(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .if_none_match("*")
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await;
        match response {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.code(), Some("PreconditionFailed" | "ConditionalRequestConflict")) => {
                tracing::debug!(%key, "conditional create lost to an existing object");
                exn::bail!(ErrorKind::AlreadyExists(path.to_path_buf()))
            },
            Err(e) => exn::bail!(Self::network_error(e)),
        }
    }

    async fn compare_and_swap(&self, path: &Path, expected: &[u8], data: Option<&[u8]>) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()))
            },
            Err(e) => exn::bail!(Self::network_error(e)),
        };
        let etag = output.e_tag().map(str::to_string).ok_or_raise(|| {
            ErrorKind::BackendError(format!("S3 returned no ETag for {key}"))
        })?;
        let body = output.body.collect().await.or_raise(|| ErrorKind::Network(format!("reading body of {key}")))?;
        if body.into_bytes().as_ref() != expected {
            exn::bail!(ErrorKind::Conflict(path.to_path_buf()));
        }
        // The ETag pins the version we compared against.
        let response = match data {
            Some(data) => self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .if_match(&etag)
                .body(ByteStream::from(data.to_vec()))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| (e.code().map(str::to_string), Self::network_error(e))),
            None => self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .if_match(&etag)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| (e.code().map(str::to_string), Self::network_error(e))),
        };
        match response {
            Ok(()) => Ok(()),
            Err((Some(code), _)) if matches!(code.as_str(), "PreconditionFailed" | "ConditionalRequestConflict") => {
                tracing::debug!(%key, "conditional replace lost to a concurrent change");
                exn::bail!(ErrorKind::Conflict(path.to_path_buf()))
            },
            Err((Some(code), _)) if code == "NoSuchKey" => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Err((_, kind)) => exn::bail!(kind),
        }
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        // S3 happily deletes keys that never existed.
        self.stat(path).await?;
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client.delete_object().bucket(&self.bucket).key(&key).send().await.map_err(Self::network_error)?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()))
            },
            Err(e) => exn::bail!(Self::network_error(e)),
        };
        let size = u64::try_from(output.content_length().unwrap_or_default()).unwrap_or_default();
        let modified = Self::parse_datetime(output.last_modified())?;
        Ok(FileInfo::new(validate_path(path)?, size, modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_key() {
        assert_eq!(join_key(None, "acme/manifest.json"), "acme/manifest.json");
        assert_eq!(join_key(Some("tenant"), "acme/manifest.json"), "tenant/acme/manifest.json");
        assert_eq!(join_key(Some("tenant/"), "acme/manifest.json"), "tenant/acme/manifest.json");
    }

    #[test]
    fn test_strip_key_prefix() {
        assert_eq!(strip_key_prefix(None, "acme/manifest.json"), "acme/manifest.json");
        assert_eq!(strip_key_prefix(Some("tenant"), "tenant/acme/manifest.json"), "acme/manifest.json");
        assert_eq!(strip_key_prefix(Some("tenant/"), "tenant/acme/manifest.json"), "acme/manifest.json");
    }
}
