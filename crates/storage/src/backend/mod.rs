//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, which provides a unified
//! interface for blob operations across different backends (local filesystem,
//! S3-compatible services, in-memory for tests).

mod local;
#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::FileInfo;
use crate::error::Result;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;

/// Stream of listed blobs, as returned by [`StorageBackend::list_stream()`].
pub type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;

/// Unified interface for blob storage backends.
///
/// All operations are asynchronous; the interesting backends are remote. A
/// cloud workspace container only ever needs whole-blob reads and writes plus
/// one conditional write ([`create_new()`](Self::create_new)) to arbitrate its
/// write lock.
///
/// # Path Handling
/// All paths are relative to the storage root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use stow_storage::{backend::StorageBackend, error::Result};
///
/// async fn manifest_size(backend: &dyn StorageBackend) -> Result<u64> {
///     let path = Path::new("fonts-02/manifest.json");
///     if backend.exists(path).await? {
///         Ok(backend.stat(path).await?.size)
///     } else {
///         Ok(0)
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend (name taken from the configuration
    /// object key). Used for logging only.
    fn name(&self) -> &str;

    /// List all blobs matching an optional prefix.
    ///
    /// Default implementation of this method is to collect all the results
    /// from [`list_stream()`](Self::list_stream) into a [`Vec`] before
    /// returning.
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<FileInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream blob metadata matching an optional prefix.
    ///
    /// Prefixes are component-based: `fonts` matches `fonts/manifest.json`
    /// but not `fonts-02/manifest.json`. Listing a prefix that does not exist
    /// yields an empty stream, not an error.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// use std::path::Path;
    /// # use stow_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut stream = backend.list_stream(Some(Path::new("fonts-02/blobs")));
    /// while let Some(info) = stream.try_next().await? {
    ///     println!("{}: {} bytes", info.path.display(), info.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a>;

    /// Check if a blob exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read blob contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write blob contents.
    ///
    /// Creates a new blob or overwrites an existing one. Implementations
    /// create parent directories as needed.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Write blob contents only if nothing exists at `path` yet.
    ///
    /// Returns [`AlreadyExists`](crate::error::ErrorKind::AlreadyExists)
    /// otherwise. The check and the write must be a single atomic step from
    /// the point of view of every other client of the same storage; this is
    /// what makes it usable as a lock.
    ///
    /// ```no_run
    /// use std::path::Path;
    /// # use stow_storage::{backend::StorageBackend, error::{ErrorKind, Result}};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// match backend.create_new(Path::new("acme/write-lock.json"), b"{}").await {
    ///     Ok(()) => println!("lock is ours"),
    ///     Err(e) if matches!(&*e, ErrorKind::AlreadyExists(_)) => println!("somebody else has it"),
    ///     Err(e) => return Err(e),
    /// }
    /// # Ok(())
    /// # }
    /// ```
    async fn create_new(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Replace a blob only if it still holds exactly `expected`.
    ///
    /// With `data` of `None` the blob is deleted instead. Returns
    /// [`Conflict`](crate::error::ErrorKind::Conflict) when the blob holds
    /// something else (or another swap on it is in flight) and
    /// [`NotFound`](crate::error::ErrorKind::NotFound) when it is gone. Like
    /// [`create_new()`](Self::create_new), the comparison and the change are
    /// one atomic step for every other client of the same storage.
    async fn compare_and_swap(&self, path: &Path, expected: &[u8], data: Option<&[u8]>) -> Result<()>;

    /// Delete a blob.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Get blob metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist.
    async fn stat(&self, path: &Path) -> Result<FileInfo>;
}
