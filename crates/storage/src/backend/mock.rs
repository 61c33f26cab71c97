//! In-memory storage backend for testing.

use super::FileInfoStream;
use crate::error::{ErrorKind, Result};
use crate::file::FileInfo;
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::StorageBackend;

/// In-memory storage backend for testing.
///
/// Blobs are stored in a `HashMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. Wrap one in an
/// [`Arc`](std::sync::Arc) and hand it to several workspaces to simulate
/// multiple machines sharing one cloud account.
///
/// # Examples
///
/// ```
/// use stow_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("fonts-02/manifest.json", b"{}"),
/// ]);
/// assert!(backend.exists(Path::new("fonts-02/manifest.json")).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<PathBuf, (OffsetDateTime, Vec<u8>)>>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with blobs.
    ///
    /// Panics if any path fails validation. If test setup is wrong, then the
    /// test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = OffsetDateTime::now_utc();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, (now, data.into()));
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of blobs currently stored.
    pub async fn len(&self) -> usize {
        self.storage.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.is_empty()
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot under the read lock, then drop it before yielding.
            let entries: Vec<FileInfo> = {
                let guard = self.storage.read().await;
                guard
                    .iter()
                    .filter(|(path, _)| match &validated_prefix {
                        Some(pfx) => path.starts_with(pfx),
                        None => true,
                    })
                    .map(|(path, (modified, data))| FileInfo::new(path.clone(), data.len() as u64, *modified))
                    .collect()
            };
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let (_modified, data) =
            self.storage.read().await.get(&path).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))?;
        Ok(data)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        self.storage.write().await.insert(path, (OffsetDateTime::now_utc(), data.to_vec()));
        Ok(())
    }

    async fn create_new(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        let mut guard = self.storage.write().await;
        if guard.contains_key(&path) {
            exn::bail!(ErrorKind::AlreadyExists(path));
        }
        guard.insert(path, (OffsetDateTime::now_utc(), data.to_vec()));
        Ok(())
    }

    async fn compare_and_swap(&self, path: &Path, expected: &[u8], data: Option<&[u8]>) -> Result<()> {
        let path = validate_path(path)?;
        let mut guard = self.storage.write().await;
        match guard.get(&path) {
            None => exn::bail!(ErrorKind::NotFound(path)),
            Some((_, current)) if current.as_slice() != expected => exn::bail!(ErrorKind::Conflict(path)),
            Some(_) => {},
        }
        match data {
            Some(data) => {
                guard.insert(path, (OffsetDateTime::now_utc(), data.to_vec()));
            },
            None => {
                guard.remove(&path);
            },
        }
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        self.storage.write().await.remove(&path).map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = validate_path(path)?;
        let guard = self.storage.read().await;
        let (modified, data) = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(FileInfo::new(path.clone(), data.len() as u64, *modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read() {
        let backend = MockBackend::default();
        backend.write(Path::new("acme/manifest.json"), b"{}").await.unwrap();
        assert_eq!(backend.read(Path::new("acme/manifest.json")).await.unwrap(), b"{}");
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let backend = MockBackend::default();
        let err = backend.read(Path::new("missing")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_new_is_exclusive() {
        let backend = MockBackend::default();
        backend.create_new(Path::new("acme/write-lock.json"), b"a").await.unwrap();
        let err = backend.create_new(Path::new("acme/write-lock.json"), b"b").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
        assert_eq!(backend.read(Path::new("acme/write-lock.json")).await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let backend = MockBackend::with_files([("acme/write-lock.json", Vec::from(*b"alice"))]);
        let path = Path::new("acme/write-lock.json");

        let err = backend.compare_and_swap(path, b"bob", Some(b"carol")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        assert_eq!(backend.read(path).await.unwrap(), b"alice");

        backend.compare_and_swap(path, b"alice", Some(b"carol")).await.unwrap();
        assert_eq!(backend.read(path).await.unwrap(), b"carol");

        backend.compare_and_swap(path, b"carol", None).await.unwrap();
        assert!(backend.is_empty().await);
        let err = backend.compare_and_swap(path, b"carol", None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let backend = MockBackend::with_files([("acme/blobs/1", Vec::from(*b"x"))]);
        backend.delete(Path::new("acme/blobs/1")).await.unwrap();
        assert!(backend.is_empty().await);
        let err = backend.delete(Path::new("acme/blobs/1")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let backend = MockBackend::with_files([
            ("acme/blobs/1", Vec::from(*b"a")),
            ("acme/manifest.json", Vec::from(*b"b")),
            ("acme-2/manifest.json", Vec::from(*b"c")),
        ]);
        let files = backend.list(Some(Path::new("acme"))).await.unwrap();
        assert_eq!(files.len(), 2);
        let stat = backend.stat(Path::new("acme/blobs/1")).await.unwrap();
        assert_eq!(stat.size, 1);
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files([("../escape", Vec::from(*b"bad"))]);
    }
}
