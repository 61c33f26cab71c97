//! Local filesystem storage backend.
//!
//! Lets a directory (a network share, a synced folder, a test fixture) play
//! the part of a cloud account. Files are accessed via `tokio::fs`.

use crate::backend::FileInfoStream;
use crate::error::ErrorKind;
use crate::{FileInfo, StorageBackend, error::Result, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs::{self, DirEntry};
use tokio::io::AsyncWriteExt;

enum WalkEntry {
    File(FileInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// Stores blobs as files below a root directory.
///
/// # Examples
///
/// ```no_run
/// use stow_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("share", "/mnt/workspaces")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend, creating `root` if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute or is not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Only happens once per backend; not worth an async constructor.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    fn metadata(path: &Path, metadata: Metadata) -> Result<FileInfo> {
        let modified = OffsetDateTime::from(metadata.modified().map_err(ErrorKind::Io)?);
        Ok(FileInfo::new(path, metadata.len(), modified))
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        let relative = self.relative_path(&path)?;
        if metadata.is_dir() {
            // Keep descending while the directory could still contain a match.
            return Ok(match prefix {
                Some(pfx) if !relative.starts_with(pfx) && !pfx.starts_with(&relative) => WalkEntry::Skip,
                _ => WalkEntry::Descend(path),
            });
        }
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_file() {
            return Ok(WalkEntry::File(Self::metadata(&relative, metadata)?));
        }
        // Most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }

    /// Second half of [`compare_and_swap()`](StorageBackend::compare_and_swap),
    /// run while `staged` (the exclusive swap file) is held.
    async fn swap_staged(
        staged: &mut fs::File,
        staged_path: &Path,
        abs_path: &Path,
        path: &Path,
        expected: &[u8],
        data: Option<&[u8]>,
    ) -> Result<()> {
        let current = fs::read(abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        if current != expected {
            exn::bail!(ErrorKind::Conflict(path.to_path_buf()));
        }
        match data {
            Some(data) => {
                staged.write_all(data).await.map_err(|e| Self::map_io_error(e, path))?;
                staged.sync_all().await.map_err(|e| Self::map_io_error(e, path))?;
                fs::rename(staged_path, abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
            },
            None => fs::remove_file(abs_path).await.map_err(|e| Self::map_io_error(e, path))?,
        }
        Ok(())
    }

    async fn ensure_parent(&self, abs_path: &Path, path: &Path) -> Result<()> {
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let mut stack = vec![self.root.clone()];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Same as S3: listing something that isn't there is empty.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        self.ensure_parent(&abs_path, path).await?;
        Ok(fs::write(&abs_path, data).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn create_new(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        self.ensure_parent(&abs_path, path).await?;
        // O_EXCL is the atomic part; everything after it is just a write.
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&abs_path)
            .await
            .map_err(|e| {
                tracing::debug!(path = %path.display(), error = %e, "exclusive create failed");
                Self::map_io_error(e, path)
            })?;
        file.write_all(data).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(file.sync_all().await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn compare_and_swap(&self, path: &Path, expected: &[u8], data: Option<&[u8]>) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        let staged_path = swap_path(&abs_path);
        // Only one swap per blob at a time: whoever creates the swap file owns
        // it, stages the new contents there and renames it over the blob.
        let mut staged = match fs::OpenOptions::new().write(true).create_new(true).open(&staged_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(path = %path.display(), "another swap is in flight");
                exn::bail!(ErrorKind::Conflict(path.to_path_buf()))
            },
            Err(e) => exn::bail!(Self::map_io_error(e, path)),
        };
        let outcome = Self::swap_staged(&mut staged, &staged_path, &abs_path, path, expected, data).await;
        drop(staged);
        if (outcome.is_err() || data.is_none())
            && let Err(e) = fs::remove_file(&staged_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %staged_path.display(), error = %e, "could not remove swap file");
        }
        outcome
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
        }
        Self::metadata(&validate_path(path)?, metadata)
    }
}

fn swap_path(abs_path: &Path) -> PathBuf {
    let mut staged = abs_path.as_os_str().to_owned();
    staged.push(".swap");
    PathBuf::from(staged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("local", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("local", "relative/path").is_err());
    }

    #[test]
    fn test_absolute_path_rejects_traversal() {
        let (temp_dir, backend) = backend();
        let expected = temp_dir.path().join("acme/manifest.json");
        assert_eq!(backend.absolute_path("acme/manifest.json").unwrap(), expected);
        assert!(backend.absolute_path("../etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (_dir, backend) = backend();
        backend.write(Path::new("acme/blobs/abc"), b"content").await.unwrap();
        assert_eq!(backend.read(Path::new("acme/blobs/abc")).await.unwrap(), b"content");
    }

    #[tokio::test]
    async fn test_create_new_is_exclusive() {
        let (_dir, backend) = backend();
        let lock = Path::new("acme/write-lock.json");
        backend.create_new(lock, b"first").await.unwrap();
        let err = backend.create_new(lock, b"second").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
        assert_eq!(backend.read(lock).await.unwrap(), b"first");
        backend.delete(lock).await.unwrap();
        backend.create_new(lock, b"third").await.unwrap();
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (dir, backend) = backend();
        let lock = Path::new("acme/write-lock.json");
        backend.write(lock, b"alice").await.unwrap();

        let err = backend.compare_and_swap(lock, b"bob", Some(b"carol")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        assert_eq!(backend.read(lock).await.unwrap(), b"alice");

        backend.compare_and_swap(lock, b"alice", Some(b"carol")).await.unwrap();
        assert_eq!(backend.read(lock).await.unwrap(), b"carol");
        assert!(!dir.path().join("acme/write-lock.json.swap").exists());

        backend.compare_and_swap(lock, b"carol", None).await.unwrap();
        assert!(!backend.exists(lock).await.unwrap());
        let err = backend.compare_and_swap(lock, b"carol", None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        assert!(!dir.path().join("acme/write-lock.json.swap").exists());
    }

    #[tokio::test]
    async fn test_compare_and_swap_with_swap_in_flight() {
        let (dir, backend) = backend();
        let lock = Path::new("acme/write-lock.json");
        backend.write(lock, b"alice").await.unwrap();
        std::fs::write(dir.path().join("acme/write-lock.json.swap"), b"").unwrap();
        let err = backend.compare_and_swap(lock, b"alice", Some(b"carol")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        assert_eq!(backend.read(lock).await.unwrap(), b"alice");
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let (_dir, backend) = backend();
        let err = backend.delete(Path::new("nope.json")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat() {
        let (_dir, backend) = backend();
        backend.write(Path::new("acme/manifest.json"), b"{}").await.unwrap();
        let info = backend.stat(Path::new("acme/manifest.json")).await.unwrap();
        assert_eq!(info.path, PathBuf::from("acme/manifest.json"));
        assert_eq!(info.size, 2);
        let err = backend.stat(Path::new("acme")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_with_prefix_is_component_based() {
        let (_dir, backend) = backend();
        backend.write(Path::new("fonts/blobs/a"), b"1").await.unwrap();
        backend.write(Path::new("fonts/manifest.json"), b"2").await.unwrap();
        backend.write(Path::new("fonts-02/blobs/b"), b"3").await.unwrap();
        assert_eq!(backend.list(None).await.unwrap().len(), 3);
        let fonts = backend.list(Some(Path::new("fonts"))).await.unwrap();
        assert_eq!(fonts.len(), 2);
        assert!(fonts.iter().all(|f| f.path.starts_with("fonts")));
        let blobs = backend.list(Some(Path::new("fonts/blobs"))).await.unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].path, Path::new("fonts/blobs/a"));
    }

    #[tokio::test]
    async fn test_list_nonexistent_prefix() {
        let (_dir, backend) = backend();
        assert!(backend.list(Some(Path::new("nothing/here"))).await.unwrap().is_empty());
    }
}
