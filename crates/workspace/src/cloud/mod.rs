//! Cloud containers.
//!
//! The authoritative copy of a cloud container lives in blob storage:
//!
//! ```text
//! <containerId>/manifest.json      published generation and file hashes
//! <containerId>/write-lock.json    present while somebody holds the write lock
//! <containerId>/blobs/<blake3>     immutable file contents
//! ```
//!
//! Each process keeps a cache directory with local copies of the files it
//! has needed so far. Readers verify a cached copy against the manifest
//! before handing it out and download it again when it is stale. Writers
//! change cached copies in place while holding the write lock and publish
//! them as new blobs plus a new manifest when they release it.

mod lock;
mod manifest;

use exn::{OptionExt, ResultExt};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use stow_storage::BackendHandle;
use stow_storage::error::ErrorKind as StorageErrorKind;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::instrument;

pub use self::lock::{WriteLockRecord, with_write_lock};
pub use self::manifest::{Manifest, ManifestEntry, content_hash};
use self::manifest::RemoteLayout;
use crate::error::{ErrorKind, Result};
use crate::names::ContainerId;

const SNAPSHOT_FILE: &str = ".manifest.json";
/// Rounds of create-or-take-over before giving up on a contended lock.
const LOCK_ATTEMPTS: usize = 5;

#[derive(Debug)]
struct HeldLock {
    holder: String,
    /// Our record as stored, for releasing it conditionally.
    record: Vec<u8>,
    /// Manifest as stored when the lock was acquired; `None` if there was none.
    base: Option<Vec<u8>>,
    /// Files created or opened for writing since the lock was acquired.
    touched: BTreeSet<String>,
}

/// A cached file whose contents were hashed, and what it looked like then.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Verified {
    hash: String,
    size: u64,
    modified: Option<SystemTime>,
}

impl Verified {
    async fn of(path: &Path, hash: String) -> Option<Self> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        Some(Self { hash, size: metadata.len(), modified: metadata.modified().ok() })
    }

    /// Whether `path` still looks exactly like it did when hashed as `hash`.
    async fn still_matches(&self, path: &Path, hash: &str) -> bool {
        self.hash == hash && Self::of(path, hash.to_string()).await.is_some_and(|now| now == *self)
    }
}

#[derive(Debug, Default)]
struct CloudState {
    manifest: Manifest,
    /// Cached files known to match a given hash, as long as they are unchanged on disk.
    verified: HashMap<String, Verified>,
    lock: Option<HeldLock>,
}

impl CloudState {
    async fn mark_verified(&mut self, path: &Path, file: &str, hash: String) {
        match Verified::of(path, hash).await {
            Some(verified) => self.verified.insert(file.to_string(), verified),
            None => self.verified.remove(file),
        };
    }
}

/// The local side of one cloud container.
pub struct CloudContainer {
    id: ContainerId,
    storage: BackendHandle,
    layout: RemoteLayout,
    cache_dir: PathBuf,
    writeable: bool,
    lease: Duration,
    session: String,
    state: Mutex<CloudState>,
}

fn is_not_found(err: &stow_storage::error::Error) -> bool {
    matches!(&**err, StorageErrorKind::NotFound(_))
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io)?;
    }
    let tmp = path.with_extension("download");
    tokio::fs::write(&tmp, data).await.or_raise(|| ErrorKind::Io)?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).or_raise(|| ErrorKind::Io);
    }
    Ok(())
}

impl CloudContainer {
    /// Attach to a cloud container, fetching its current manifest.
    ///
    /// A container with no manifest yet is empty. When storage cannot be
    /// reached, the manifest last seen by this cache is used instead so that
    /// previously downloaded files stay readable offline.
    #[instrument(skip(storage, cache_dir), fields(storage = storage.name()))]
    pub async fn connect(
        id: ContainerId,
        storage: BackendHandle,
        cache_dir: impl Into<PathBuf>,
        writeable: bool,
        lease: Duration,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        tokio::fs::create_dir_all(&cache_dir).await.or_raise(|| ErrorKind::Io)?;
        let container = Self {
            layout: RemoteLayout::new(&id),
            id,
            storage,
            cache_dir,
            writeable,
            lease,
            session: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(CloudState::default()),
        };
        let manifest = match container.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(err) => match container.read_snapshot().await {
                Some(snapshot) => {
                    tracing::warn!(container = %container.id, error = %*err, "storage unavailable, using cached manifest");
                    snapshot
                },
                None => return Err(err),
            },
        };
        tracing::debug!(generation = manifest.generation, files = manifest.files.len(), "connected to cloud container");
        container.write_snapshot(&manifest).await?;
        container.state.lock().await.manifest = manifest;
        Ok(container)
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }

    pub fn storage_name(&self) -> &str {
        self.storage.name()
    }

    /// The manifest this container currently works from.
    pub async fn manifest(&self) -> Manifest {
        self.state.lock().await.manifest.clone()
    }

    async fn fetch_manifest(&self) -> Result<Manifest> {
        Ok(self.fetch_manifest_raw().await?.0)
    }

    /// The published manifest along with its stored bytes, if there is one.
    async fn fetch_manifest_raw(&self) -> Result<(Manifest, Option<Vec<u8>>)> {
        match self.storage.read(&self.layout.manifest()).await {
            Ok(data) => Ok((Manifest::from_bytes(&data, &self.id)?, Some(data))),
            Err(e) if is_not_found(&e) => Ok((Manifest::default(), None)),
            Err(e) => Err(ErrorKind::storage(e)),
        }
    }

    async fn read_snapshot(&self) -> Option<Manifest> {
        let data = tokio::fs::read(self.cache_dir.join(SNAPSHOT_FILE)).await.ok()?;
        Manifest::from_bytes(&data, &self.id).ok()
    }

    async fn write_snapshot(&self, manifest: &Manifest) -> Result<()> {
        write_atomic(&self.cache_dir.join(SNAPSHOT_FILE), &manifest.to_bytes()?).await
    }

    /// Pick up changes published by other writers.
    ///
    /// Returns `true` if the manifest changed. Ignored while holding the
    /// write lock, since nobody else can have published anything.
    #[instrument(skip(self), fields(container = %self.id))]
    pub async fn check_for_changes(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.lock.is_some() {
            return Ok(false);
        }
        let remote = self.fetch_manifest().await?;
        if remote.generation == state.manifest.generation {
            return Ok(false);
        }
        tracing::info!(from = state.manifest.generation, to = remote.generation, "cloud container changed");
        self.write_snapshot(&remote).await?;
        state.manifest = remote;
        Ok(true)
    }

    /// Every db file of the container, including ones created under the
    /// current write lock and not yet published.
    pub async fn file_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: BTreeSet<String> = state.manifest.files.keys().cloned().collect();
        if let Some(lock) = &state.lock {
            names.extend(lock.touched.iter().filter(|f| self.cache_dir.join(f).exists()).cloned());
        }
        names.into_iter().collect()
    }

    /// Published content hash of `file`.
    pub async fn published_hash(&self, file: &str) -> Option<String> {
        self.state.lock().await.manifest.files.get(file).map(|entry| entry.hash.clone())
    }

    /// Local path of `file`, downloading it first if the cached copy is
    /// missing or does not match the manifest.
    #[instrument(skip(self), fields(container = %self.id))]
    pub async fn ensure_local(&self, file: &str) -> Result<PathBuf> {
        let mut state = self.state.lock().await;
        self.ensure_local_locked(&mut state, file).await
    }

    async fn ensure_local_locked(&self, state: &mut CloudState, file: &str) -> Result<PathBuf> {
        let path = self.cache_dir.join(file);
        if let Some(lock) = &state.lock
            && lock.touched.contains(file)
        {
            return Ok(path);
        }
        let entry = state.manifest.files.get(file).cloned().ok_or_raise(|| ErrorKind::DbNotFound(file.to_string()))?;
        if let Some(verified) = state.verified.get(file)
            && verified.still_matches(&path, &entry.hash).await
        {
            return Ok(path);
        }
        if let Ok(local) = tokio::fs::read(&path).await
            && content_hash(&local) == entry.hash
        {
            state.mark_verified(&path, file, entry.hash).await;
            return Ok(path);
        }

        let data = self.storage.read(&self.layout.blob(&entry.hash)).await.map_err(ErrorKind::storage)?;
        if content_hash(&data) != entry.hash {
            exn::bail!(ErrorKind::Corrupt(file.to_string()));
        }
        write_atomic(&path, &data).await?;
        tracing::debug!(file, size = data.len(), "downloaded cloud db");
        state.mark_verified(&path, file, entry.hash).await;
        Ok(path)
    }

    /// Local path of `file` for writing. The file becomes part of the next
    /// publish.
    pub(crate) async fn prepare_for_write(&self, file: &str) -> Result<PathBuf> {
        let mut state = self.state.lock().await;
        if state.lock.is_none() {
            exn::bail!(ErrorKind::WriteLockRequired(self.id.to_string()));
        }
        let path = self.ensure_local_locked(&mut state, file).await?;
        if let Some(lock) = state.lock.as_mut() {
            lock.touched.insert(file.to_string());
        }
        Ok(path)
    }

    /// Local path for a brand new `file`. The file becomes part of the next
    /// publish.
    pub(crate) async fn prepare_for_create(&self, file: &str) -> Result<PathBuf> {
        let mut state = self.state.lock().await;
        let lock = state.lock.as_mut().ok_or_raise(|| ErrorKind::WriteLockRequired(self.id.to_string()))?;
        lock.touched.insert(file.to_string());
        Ok(self.cache_dir.join(file))
    }

    pub async fn has_write_lock(&self) -> bool {
        self.state.lock().await.lock.is_some()
    }

    async fn read_lock_record(&self) -> Result<Option<WriteLockRecord>> {
        Ok(self.read_lock_raw().await?.map(|(record, _)| record))
    }

    /// The lock record along with its stored bytes.
    async fn read_lock_raw(&self) -> Result<Option<(WriteLockRecord, Vec<u8>)>> {
        match self.storage.read(&self.layout.write_lock()).await {
            Ok(data) => {
                let record =
                    serde_json::from_slice(&data).or_raise(|| ErrorKind::InvalidManifest(self.id.to_string()))?;
                Ok(Some((record, data)))
            },
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(ErrorKind::storage(e)),
        }
    }

    /// Who holds the write lock right now, if anybody. Expired locks count
    /// as free.
    pub async fn write_lock_holder(&self) -> Result<Option<String>> {
        let now = OffsetDateTime::now_utc();
        Ok(self.read_lock_record().await?.filter(|record| !record.is_expired(now)).map(|record| record.holder))
    }

    /// Become the only writer of this container.
    ///
    /// Fails immediately when somebody else holds an unexpired lock. On
    /// success the manifest is refreshed so that changes are made on top of
    /// the latest published state.
    #[instrument(skip(self), fields(container = %self.id))]
    pub async fn acquire_write_lock(&self, user: &str) -> Result<()> {
        if !self.writeable {
            exn::bail!(ErrorKind::NotWriteable(self.id.to_string()));
        }
        let mut state = self.state.lock().await;
        if let Some(lock) = &state.lock {
            exn::bail!(ErrorKind::LockHeld { container: self.id.to_string(), holder: lock.holder.clone() });
        }
        let now = OffsetDateTime::now_utc();
        let lease = time::Duration::try_from(self.lease).unwrap_or(time::Duration::HOUR);
        let record =
            WriteLockRecord { holder: user.to_string(), session: self.session.clone(), expires_at: (now + lease).unix_timestamp() };
        let bytes = record.to_bytes()?;
        self.claim_lock_record(&bytes).await?;

        let (remote, base) = match self.fetch_manifest_raw().await {
            Ok(fetched) => fetched,
            Err(err) => {
                if let Err(e) = self.delete_lock_record(&bytes).await {
                    tracing::warn!(error = %*e, "could not release write lock after failed manifest fetch");
                }
                return Err(err);
            },
        };
        if remote.generation != state.manifest.generation {
            self.write_snapshot(&remote).await?;
            state.manifest = remote;
        }
        state.lock = Some(HeldLock { holder: user.to_string(), record: bytes, base, touched: BTreeSet::new() });
        tracing::info!(user, "acquired write lock");
        Ok(())
    }

    /// Store `record` as the lock record, either by creating it or by
    /// replacing an expired one.
    ///
    /// Every step is conditional on what was last seen in storage. A record
    /// that disappears between steps sends us back to creating it; a record
    /// that changes under a takeover means somebody else won.
    async fn claim_lock_record(&self, record: &[u8]) -> Result<()> {
        let key = self.layout.write_lock();
        let mut last_holder = None;
        for _ in 0..LOCK_ATTEMPTS {
            match self.storage.create_new(&key, record).await {
                Ok(()) => return Ok(()),
                Err(e) if matches!(&*e, StorageErrorKind::AlreadyExists(_)) => {},
                Err(e) => return Err(ErrorKind::storage(e)),
            }
            let Some((existing, raw)) = self.read_lock_raw().await? else {
                tracing::debug!("write lock released while acquiring, retrying");
                continue;
            };
            if existing.session != self.session && !existing.is_expired(OffsetDateTime::now_utc()) {
                exn::bail!(ErrorKind::LockHeld { container: self.id.to_string(), holder: existing.holder });
            }
            tracing::warn!(holder = %existing.holder, "taking over expired write lock");
            match self.storage.compare_and_swap(&key, &raw, Some(record)).await {
                Ok(()) => return Ok(()),
                Err(e) if matches!(&*e, StorageErrorKind::Conflict(_) | StorageErrorKind::NotFound(_)) => {
                    tracing::debug!(holder = %existing.holder, "lost race for expired write lock, retrying");
                    last_holder = Some(existing.holder);
                },
                Err(e) => return Err(ErrorKind::storage(e)),
            }
        }
        exn::bail!(ErrorKind::LockHeld {
            container: self.id.to_string(),
            holder: last_holder.unwrap_or_else(|| "another writer".to_string()),
        })
    }

    /// Publish every change made under the write lock and release it.
    ///
    /// Returns whether anything was published. The lock is released even if
    /// publishing fails; the unpublished changes are then discarded and the
    /// cached copies are re-verified on next use. If the lease ran out and
    /// another session took the lock over, nothing is published and the
    /// result is [`ErrorKind::LockLost`].
    #[instrument(skip(self), fields(container = %self.id))]
    pub async fn release_write_lock(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let lock = state.lock.take().ok_or_raise(|| ErrorKind::LockNotHeld(self.id.to_string()))?;
        let published = self.publish(&mut state, &lock).await;
        let unlocked = self.delete_lock_record(&lock.record).await;
        if let Err(err) = &published {
            tracing::warn!(error = %**err, "publishing failed, changes discarded");
            if let Err(e) = self.discard(&mut state, lock.touched.iter().cloned()).await {
                tracing::warn!(error = %*e, "could not discard unpublished changes");
            }
        }
        let published = published?;
        unlocked?;
        tracing::info!(holder = %lock.holder, published, generation = state.manifest.generation, "released write lock");
        Ok(published)
    }

    fn lock_lost(&self) -> ErrorKind {
        ErrorKind::LockLost(self.id.to_string())
    }

    /// Fail unless the stored lock record is still this session's.
    async fn ensure_lock_owned(&self) -> Result<()> {
        match self.read_lock_record().await? {
            Some(record) if record.session == self.session => Ok(()),
            Some(record) => {
                tracing::warn!(holder = %record.holder, "write lock was taken over before publishing");
                exn::bail!(self.lock_lost())
            },
            None => exn::bail!(self.lock_lost()),
        }
    }

    async fn publish(&self, state: &mut CloudState, lock: &HeldLock) -> Result<bool> {
        let touched = &lock.touched;
        let mut manifest = state.manifest.clone();
        let mut changed = false;
        for file in touched {
            let path = self.cache_dir.join(file);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    changed |= manifest.files.remove(file).is_some();
                    continue;
                },
                Err(e) => return Err(e).or_raise(|| ErrorKind::Io),
            };
            let hash = content_hash(&data);
            if manifest.files.get(file).is_some_and(|entry| entry.hash == hash) {
                state.mark_verified(&path, file, hash).await;
                continue;
            }
            let blob = self.layout.blob(&hash);
            if !self.storage.exists(&blob).await.map_err(ErrorKind::storage)? {
                self.storage.write(&blob, &data).await.map_err(ErrorKind::storage)?;
            }
            tracing::debug!(%file, %hash, size = data.len(), "uploaded cloud db");
            manifest.files.insert(file.clone(), ManifestEntry { hash: hash.clone(), size: data.len() as u64 });
            state.mark_verified(&path, file, hash).await;
            changed = true;
        }
        if !changed {
            return Ok(false);
        }
        manifest.generation += 1;
        self.ensure_lock_owned().await?;
        // Only replace the manifest we started from, in case the lock was
        // taken over and released again since the check above.
        let key = self.layout.manifest();
        let bytes = manifest.to_bytes()?;
        let written = match &lock.base {
            Some(base) => self.storage.compare_and_swap(&key, base, Some(&bytes)).await,
            None => self.storage.create_new(&key, &bytes).await,
        };
        match written {
            Ok(()) => {},
            Err(e)
                if matches!(
                    &*e,
                    StorageErrorKind::Conflict(_) | StorageErrorKind::NotFound(_) | StorageErrorKind::AlreadyExists(_)
                ) =>
            {
                tracing::warn!(generation = manifest.generation, "manifest changed under the write lock");
                exn::bail!(self.lock_lost())
            },
            Err(e) => return Err(ErrorKind::storage(e)),
        }
        self.write_snapshot(&manifest).await?;
        state.manifest = manifest;
        Ok(true)
    }

    /// Remove the lock record, but only if it is still exactly `record`.
    async fn delete_lock_record(&self, record: &[u8]) -> Result<()> {
        match self.storage.compare_and_swap(&self.layout.write_lock(), record, None).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) if matches!(&*e, StorageErrorKind::Conflict(_)) => {
                tracing::warn!("write lock was taken over before release");
                Ok(())
            },
            Err(e) => Err(ErrorKind::storage(e)),
        }
    }

    /// Forget `files` as changed: newly created ones are deleted, changed
    /// ones are re-verified against the manifest on next use.
    async fn discard(&self, state: &mut CloudState, files: impl IntoIterator<Item = String>) -> Result<()> {
        for file in files {
            state.verified.remove(&file);
            if !state.manifest.files.contains_key(&file) {
                match tokio::fs::remove_file(self.cache_dir.join(&file)).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                        return Err(e).or_raise(|| ErrorKind::Io);
                    },
                    _ => {},
                }
            }
            tracing::debug!(%file, "abandoned changes");
        }
        Ok(())
    }

    /// Throw away every change made under the current write lock.
    ///
    /// Newly created files are deleted; changed ones are restored from
    /// storage the next time they are needed. The lock stays held.
    #[instrument(skip(self), fields(container = %self.id))]
    pub async fn abandon_changes(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let lock = state.lock.as_mut().ok_or_raise(|| ErrorKind::LockNotHeld(self.id.to_string()))?;
        let touched = std::mem::take(&mut lock.touched);
        self.discard(&mut state, touched).await
    }

    /// Delete blobs no longer referenced by the manifest. Requires the write
    /// lock, so that no publish can race with it. Returns how many were
    /// deleted.
    #[instrument(skip(self), fields(container = %self.id))]
    pub async fn clean_unused_blobs(&self) -> Result<usize> {
        let state = self.state.lock().await;
        if state.lock.is_none() {
            exn::bail!(ErrorKind::WriteLockRequired(self.id.to_string()));
        }
        let blobs = self.layout.blobs();
        let listed = self.storage.list(Some(&blobs)).await.map_err(ErrorKind::storage)?;
        let mut deleted = 0;
        for info in listed {
            let Some(hash) = self.layout.blob_hash(&info.path) else { continue };
            if state.manifest.is_referenced(hash) {
                continue;
            }
            self.storage.delete(&info.path).await.map_err(ErrorKind::storage)?;
            deleted += 1;
        }
        tracing::info!(deleted, "cleaned unused blobs");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rstest::rstest;
    use std::sync::Arc;
    use stow_storage::backend::{FileInfoStream, MockBackend};
    use stow_storage::{FileInfo, StorageBackend};

    const HOUR: Duration = Duration::from_secs(3600);
    const LOCK: &str = "fonts-02/write-lock.json";

    async fn connect(storage: &Arc<MockBackend>, cache: &Path, writeable: bool) -> CloudContainer {
        connect_with_lease(storage.clone(), cache, writeable, HOUR).await
    }

    async fn connect_with_lease(storage: BackendHandle, cache: &Path, writeable: bool, lease: Duration) -> CloudContainer {
        let id = ContainerId::new("fonts-02").unwrap();
        CloudContainer::connect(id, storage, cache, writeable, lease).await.unwrap()
    }

    fn lock_record(holder: &str, expires_at: i64) -> Vec<u8> {
        WriteLockRecord { holder: holder.to_string(), session: format!("{holder}-session"), expires_at }.to_bytes().unwrap()
    }

    fn in_an_hour() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp() + 3600
    }

    async fn stored_holder(storage: &MockBackend) -> String {
        let record: WriteLockRecord = serde_json::from_slice(&storage.read(Path::new(LOCK)).await.unwrap()).unwrap();
        record.holder
    }

    /// What carol does right after the first read of the lock record.
    #[derive(Debug, Clone, Copy)]
    enum CarolMoves {
        /// The holder releases and carol creates a fresh lock.
        AfterRelease,
        /// Carol takes over the same expired lock first.
        TakesOverExpired,
    }

    /// Storage where another writer, carol, acts in between two steps of
    /// acquiring the lock.
    struct RacingStorage {
        inner: Arc<MockBackend>,
        carol: std::sync::Mutex<Option<CarolMoves>>,
    }

    #[async_trait]
    impl StorageBackend for RacingStorage {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
            self.inner.list_stream(prefix)
        }

        async fn exists(&self, path: &Path) -> stow_storage::error::Result<bool> {
            self.inner.exists(path).await
        }

        async fn read(&self, path: &Path) -> stow_storage::error::Result<Vec<u8>> {
            let carol = if path == Path::new(LOCK) { self.carol.lock().unwrap().take() } else { None };
            match carol {
                None => self.inner.read(path).await,
                Some(CarolMoves::AfterRelease) => {
                    self.inner.delete(path).await?;
                    self.inner.create_new(path, &lock_record("carol", in_an_hour())).await?;
                    exn::bail!(StorageErrorKind::NotFound(path.to_path_buf()))
                },
                Some(CarolMoves::TakesOverExpired) => {
                    let seen = self.inner.read(path).await?;
                    self.inner.compare_and_swap(path, &seen, Some(&lock_record("carol", in_an_hour()))).await?;
                    Ok(seen)
                },
            }
        }

        async fn write(&self, path: &Path, data: &[u8]) -> stow_storage::error::Result<()> {
            self.inner.write(path, data).await
        }

        async fn create_new(&self, path: &Path, data: &[u8]) -> stow_storage::error::Result<()> {
            self.inner.create_new(path, data).await
        }

        async fn compare_and_swap(
            &self,
            path: &Path,
            expected: &[u8],
            data: Option<&[u8]>,
        ) -> stow_storage::error::Result<()> {
            self.inner.compare_and_swap(path, expected, data).await
        }

        async fn delete(&self, path: &Path) -> stow_storage::error::Result<()> {
            self.inner.delete(path).await
        }

        async fn stat(&self, path: &Path) -> stow_storage::error::Result<FileInfo> {
            self.inner.stat(path).await
        }
    }

    #[tokio::test]
    async fn test_publish_and_download() {
        let storage = Arc::new(MockBackend::default());
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let writer = connect(&storage, a.path(), true).await;
        let reader = connect(&storage, b.path(), false).await;
        assert!(writer.file_names().await.is_empty());

        writer.acquire_write_lock("alice").await.unwrap();
        let path = writer.prepare_for_create("fonts-1.0.0.wsdb").await.unwrap();
        tokio::fs::write(&path, b"v1").await.unwrap();
        assert_eq!(writer.file_names().await, ["fonts-1.0.0.wsdb"]);
        assert!(writer.release_write_lock().await.unwrap());
        assert_eq!(writer.manifest().await.generation, 1);
        assert!(!storage.exists(Path::new("fonts-02/write-lock.json")).await.unwrap());

        assert!(reader.check_for_changes().await.unwrap());
        assert!(!reader.check_for_changes().await.unwrap());
        let local = reader.ensure_local("fonts-1.0.0.wsdb").await.unwrap();
        assert_eq!(tokio::fs::read(&local).await.unwrap(), b"v1");

        // A stale cached copy is replaced.
        tokio::fs::write(&local, b"tampered").await.unwrap();
        let local = reader.ensure_local("fonts-1.0.0.wsdb").await.unwrap();
        assert_eq!(tokio::fs::read(&local).await.unwrap(), b"v1");
    }

    #[tokio::test]
    async fn test_lock_exclusion_and_takeover() {
        let storage = Arc::new(MockBackend::default());
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let first = connect(&storage, a.path(), true).await;
        let second = connect(&storage, b.path(), true).await;

        first.acquire_write_lock("alice").await.unwrap();
        let err = second.acquire_write_lock("bob").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::LockHeld { holder, .. } if holder == "alice"));
        let err = first.acquire_write_lock("alice").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::LockHeld { .. }));
        assert_eq!(second.write_lock_holder().await.unwrap().as_deref(), Some("alice"));

        // An expired lock is fair game.
        let expired = WriteLockRecord { holder: "alice".to_string(), session: "gone".to_string(), expires_at: 0 };
        storage.write(Path::new("fonts-02/write-lock.json"), &expired.to_bytes().unwrap()).await.unwrap();
        assert_eq!(second.write_lock_holder().await.unwrap(), None);
        second.acquire_write_lock("bob").await.unwrap();
        assert_eq!(first.write_lock_holder().await.unwrap().as_deref(), Some("bob"));
    }

    #[rstest]
    #[case::released_in_between(CarolMoves::AfterRelease, in_an_hour())]
    #[case::same_expired_lock(CarolMoves::TakesOverExpired, 0)]
    #[tokio::test]
    async fn test_racing_writers_get_one_lock(#[case] carol: CarolMoves, #[case] bob_expires_at: i64) {
        let inner = Arc::new(MockBackend::default());
        inner.write(Path::new(LOCK), &lock_record("bob", bob_expires_at)).await.unwrap();
        let storage = Arc::new(RacingStorage { inner: inner.clone(), carol: std::sync::Mutex::new(Some(carol)) });
        let cache = tempfile::tempdir().unwrap();
        let alice = connect_with_lease(storage, cache.path(), true, HOUR).await;

        let err = alice.acquire_write_lock("alice").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::LockHeld { holder, .. } if holder == "carol"), "{err:?}");
        assert!(!alice.has_write_lock().await);
        assert_eq!(stored_holder(&inner).await, "carol");
    }

    #[tokio::test]
    async fn test_expired_writer_cannot_publish() {
        let storage = Arc::new(MockBackend::default());
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let slow = connect_with_lease(storage.clone(), a.path(), true, Duration::ZERO).await;
        let fast = connect(&storage, b.path(), true).await;

        slow.acquire_write_lock("alice").await.unwrap();
        let late = slow.prepare_for_create("alice-1.0.0.wsdb").await.unwrap();
        tokio::fs::write(&late, b"late").await.unwrap();

        fast.acquire_write_lock("bob").await.unwrap();
        let path = fast.prepare_for_create("bob-1.0.0.wsdb").await.unwrap();
        tokio::fs::write(&path, b"on time").await.unwrap();
        assert!(fast.release_write_lock().await.unwrap());

        let err = slow.release_write_lock().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::LockLost(_)), "{err:?}");
        assert!(!late.exists());
        assert!(!slow.has_write_lock().await);

        assert!(slow.check_for_changes().await.unwrap());
        assert_eq!(slow.manifest().await.generation, 1);
        assert_eq!(slow.file_names().await, ["bob-1.0.0.wsdb"]);
    }

    #[tokio::test]
    async fn test_expired_writer_leaves_new_lock_alone() {
        let storage = Arc::new(MockBackend::default());
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let slow = connect_with_lease(storage.clone(), a.path(), true, Duration::ZERO).await;
        let fast = connect(&storage, b.path(), true).await;

        slow.acquire_write_lock("alice").await.unwrap();
        let path = slow.prepare_for_create("alice-1.0.0.wsdb").await.unwrap();
        tokio::fs::write(&path, b"late").await.unwrap();
        fast.acquire_write_lock("bob").await.unwrap();

        let err = slow.release_write_lock().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::LockLost(_)));
        assert_eq!(stored_holder(&storage).await, "bob");
        assert!(!storage.exists(Path::new("fonts-02/manifest.json")).await.unwrap());

        assert!(!fast.release_write_lock().await.unwrap());
        assert!(!storage.exists(Path::new(LOCK)).await.unwrap());
    }

    #[tokio::test]
    async fn test_readonly_container_cannot_lock() {
        let storage = Arc::new(MockBackend::default());
        let cache = tempfile::tempdir().unwrap();
        let container = connect(&storage, cache.path(), false).await;
        let err = container.acquire_write_lock("alice").await.unwrap_err();
        assert!((*err).to_string().contains("container is not writeable"));
        let err = container.prepare_for_create("x-1.0.0.wsdb").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::WriteLockRequired(_)));
    }

    #[tokio::test]
    async fn test_abandon_changes() {
        let storage = Arc::new(MockBackend::default());
        let cache = tempfile::tempdir().unwrap();
        let container = connect(&storage, cache.path(), true).await;
        container.acquire_write_lock("alice").await.unwrap();
        let path = container.prepare_for_create("fonts-1.0.0.wsdb").await.unwrap();
        tokio::fs::write(&path, b"draft").await.unwrap();
        container.abandon_changes().await.unwrap();
        assert!(!path.exists());
        assert!(!container.release_write_lock().await.unwrap());
        assert_eq!(container.manifest().await, Manifest::default());
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_rejected() {
        let storage = Arc::new(MockBackend::default());
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let writer = connect(&storage, a.path(), true).await;
        writer.acquire_write_lock("alice").await.unwrap();
        let path = writer.prepare_for_create("fonts-1.0.0.wsdb").await.unwrap();
        tokio::fs::write(&path, b"v1").await.unwrap();
        writer.release_write_lock().await.unwrap();

        let hash = writer.published_hash("fonts-1.0.0.wsdb").await.unwrap();
        storage.write(&Path::new("fonts-02/blobs").join(&hash), b"garbage").await.unwrap();
        let reader = connect(&storage, b.path(), false).await;
        let err = reader.ensure_local("fonts-1.0.0.wsdb").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Corrupt(_)));
        let err = reader.ensure_local("missing-1.0.0.wsdb").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::DbNotFound(_)));
    }

    #[tokio::test]
    async fn test_clean_unused_blobs() {
        let storage = Arc::new(MockBackend::default());
        let cache = tempfile::tempdir().unwrap();
        let container = connect(&storage, cache.path(), true).await;
        for contents in [&b"v1"[..], b"v2"] {
            container.acquire_write_lock("alice").await.unwrap();
            let path = container.prepare_for_write_or_create("fonts-1.0.0.wsdb").await;
            tokio::fs::write(&path, contents).await.unwrap();
            container.release_write_lock().await.unwrap();
        }
        assert_eq!(storage.list(Some(Path::new("fonts-02/blobs"))).await.unwrap().len(), 2);
        let err = container.clean_unused_blobs().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::WriteLockRequired(_)));
        container.acquire_write_lock("alice").await.unwrap();
        assert_eq!(container.clean_unused_blobs().await.unwrap(), 1);
        container.release_write_lock().await.unwrap();
        assert_eq!(storage.list(Some(Path::new("fonts-02/blobs"))).await.unwrap().len(), 1);
    }

    impl CloudContainer {
        async fn prepare_for_write_or_create(&self, file: &str) -> PathBuf {
            match self.prepare_for_write(file).await {
                Ok(path) => path,
                Err(_) => self.prepare_for_create(file).await.unwrap(),
            }
        }
    }
}
