//! Workspace containers.

use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use stow_resource::{OpenMode, ResourceDb, Version, VersionRange};
use stow_storage::BackendHandle;
use tracing::instrument;

use crate::cloud::{self, CloudContainer};
use crate::db::{WorkspaceDb, WorkspaceDbProps};
use crate::error::{ErrorKind, Result};
use crate::names::{ContainerId, DbName};
use crate::registry::Registry;
use crate::resolve::{VersionQuery, db_file_name, parse_db_file_name, resolve_version, versions_of};

const SCRATCH_DIR: &str = ".scratch";

/// Where a cloud container lives.
#[derive(Clone)]
pub struct CloudProps {
    pub storage: BackendHandle,
}

/// How to open a container.
#[derive(Clone)]
pub struct ContainerProps {
    /// Container id, or an alias resolved through the workspace settings.
    pub container_id: String,
    /// Allow changes. Cloud containers additionally need the write lock.
    pub writeable: bool,
    /// Absent for containers that only exist in the local container directory.
    pub cloud: Option<CloudProps>,
}

impl ContainerProps {
    pub fn local(container_id: impl Into<String>) -> Self {
        Self { container_id: container_id.into(), writeable: false, cloud: None }
    }

    pub fn cloud(container_id: impl Into<String>, storage: BackendHandle) -> Self {
        Self { container_id: container_id.into(), writeable: false, cloud: Some(CloudProps { storage }) }
    }

    pub fn writeable(mut self, writeable: bool) -> Self {
        self.writeable = writeable;
        self
    }
}

/// Identity of an open db: its file plus, for cloud containers, the
/// content it was opened with. A db republished with new content is a
/// different db.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DbKey {
    pub(crate) file_name: String,
    pub(crate) hash: Option<String>,
}

/// A directory of versioned workspace dbs.
///
/// Local containers are a plain directory under the workspace's container
/// directory. Cloud containers are a cache directory kept in sync with blob
/// storage by a [`CloudContainer`].
pub struct WorkspaceContainer {
    this: Weak<Self>,
    id: ContainerId,
    root: PathBuf,
    writeable: bool,
    cloud: Option<CloudContainer>,
    dbs: Registry<DbKey, WorkspaceDb>,
    closed: AtomicBool,
}

impl WorkspaceContainer {
    /// Open a container rooted at `<local_dir>/<id>` or, for cloud containers,
    /// at `<cloud_cache_dir>/<id>`.
    #[instrument(skip(props), fields(cloud = props.cloud.is_some(), writeable = props.writeable))]
    pub async fn open(
        id: ContainerId,
        props: &ContainerProps,
        local_dir: &Path,
        cloud_cache_dir: &Path,
        lease: Duration,
    ) -> Result<Arc<Self>> {
        let (root, cloud) = match &props.cloud {
            Some(CloudProps { storage }) => {
                let root = cloud_cache_dir.join(id.as_str());
                let cloud = CloudContainer::connect(id.clone(), storage.clone(), &root, props.writeable, lease).await?;
                (root, Some(cloud))
            },
            None => (local_dir.join(id.as_str()), None),
        };
        tracing::debug!(root = %root.display(), "opened container");
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            id,
            root,
            writeable: props.writeable,
            cloud,
            dbs: Registry::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Directory holding the db files, or their cached copies.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory files extracted from dbs are written to.
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }

    pub fn cloud(&self) -> Option<&CloudContainer> {
        self.cloud.as_ref()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::ContainerClosed(self.id.to_string()));
        }
        Ok(())
    }

    /// Poll cloud storage for newly published changes. Always `false` for
    /// local containers.
    pub async fn check_for_changes(&self) -> Result<bool> {
        match &self.cloud {
            Some(cloud) => cloud.check_for_changes().await,
            None => Ok(false),
        }
    }

    /// Names of every db file in the container.
    pub async fn db_file_names(&self) -> Result<Vec<String>> {
        if let Some(cloud) = &self.cloud {
            return Ok(cloud.file_names().await);
        }
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).or_raise(|| ErrorKind::Io),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Io)? {
            if let Some(name) = entry.file_name().to_str()
                && parse_db_file_name(name).is_some()
                && entry.file_type().await.is_ok_and(|t| t.is_file())
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Every version of `db_name` in the container, lowest first.
    pub async fn db_versions(&self, db_name: &str) -> Result<Vec<Version>> {
        let db_name = DbName::new(db_name)?;
        let files = self.db_file_names().await?;
        Ok(versions_of(&db_name, files.iter().map(String::as_str)))
    }

    /// Name of the file holding the best version of a db for `props`,
    /// without opening or downloading it.
    pub async fn resolve_file_name(&self, props: &WorkspaceDbProps) -> Result<String> {
        let db_name = DbName::new(props.db_name.as_str())?;
        let range = match props.version.as_deref() {
            Some(range) => VersionRange::parse(range).map_err(|e| e.raise(ErrorKind::InvalidRange(range.to_string())))?,
            None => VersionRange::any(),
        };
        let files = self.db_file_names().await?;
        let query = VersionQuery { db_name: &db_name, range: &range, include_prerelease: props.include_prerelease };
        let (file_name, _) = resolve_version(&query, files.iter().map(String::as_str))?;
        Ok(file_name.to_string())
    }

    /// Local path of `file_name`, downloading it first for cloud containers.
    pub async fn local_path(&self, file_name: &str) -> Result<PathBuf> {
        if let Some(cloud) = &self.cloud {
            return cloud.ensure_local(file_name).await;
        }
        let path = self.root.join(file_name);
        if !tokio::fs::try_exists(&path).await.or_raise(|| ErrorKind::Io)? {
            exn::bail!(ErrorKind::DbNotFound(file_name.to_string()));
        }
        Ok(path)
    }

    /// Open the best version of a db for reading.
    ///
    /// Callers asking for the same db share one handle; each call must be
    /// balanced by [`drop_workspace_db()`](Self::drop_workspace_db).
    #[instrument(skip(self, props), fields(container = %self.id, db = %props.db_name))]
    pub async fn get_workspace_db(&self, props: &WorkspaceDbProps) -> Result<Arc<WorkspaceDb>> {
        self.ensure_open()?;
        let file_name = self.resolve_file_name(props).await?;
        let hash = match &self.cloud {
            Some(cloud) => cloud.published_hash(&file_name).await,
            None => None,
        };
        let key = DbKey { file_name, hash };
        let (this, opened) = (self, key.clone());
        self.dbs
            .acquire(key, move || async move {
                let path = this.local_path(&opened.file_name).await?;
                let db = ResourceDb::open(&path, OpenMode::Readonly).await.map_err(ErrorKind::resource)?;
                let scratch = this.scratch_dir();
                let workspace_db = WorkspaceDb::new(this.this.clone(), this.id.clone(), opened, path, &scratch, db)?;
                Ok::<_, crate::error::Error>(Arc::new(workspace_db))
            })
            .await
    }

    /// Give back a db obtained from [`get_workspace_db()`](Self::get_workspace_db),
    /// closing it when nobody else uses it. Dbs opened through the workspace
    /// go back through [`Workspace::drop_workspace_db()`](crate::Workspace::drop_workspace_db).
    pub async fn drop_workspace_db(&self, db: &WorkspaceDb) {
        if let Some(last) = self.dbs.release(db.key()).await {
            last.close().await;
        }
    }

    /// Fail unless changes may be made right now.
    pub async fn require_write_access(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.writeable {
            exn::bail!(ErrorKind::NotWriteable(self.id.to_string()));
        }
        if let Some(cloud) = &self.cloud
            && !cloud.has_write_lock().await
        {
            exn::bail!(ErrorKind::WriteLockRequired(self.id.to_string()));
        }
        Ok(())
    }

    /// Create a new, empty db file for one version of a db.
    #[instrument(skip(self), fields(container = %self.id))]
    pub async fn create_db_file(&self, db_name: &DbName, version: &Version) -> Result<PathBuf> {
        self.require_write_access().await?;
        let file_name = db_file_name(db_name, version);
        for existing in self.db_file_names().await? {
            if existing == file_name {
                exn::bail!(ErrorKind::AlreadyExists(file_name));
            }
            if let Some((name, _)) = parse_db_file_name(&existing)
                && name != db_name.as_str()
                && name.eq_ignore_ascii_case(db_name.as_str())
            {
                exn::bail!(ErrorKind::NameCollision(db_name.to_string(), name.to_string()));
            }
        }
        let path = match &self.cloud {
            Some(cloud) => cloud.prepare_for_create(&file_name).await?,
            None => self.root.join(&file_name),
        };
        ResourceDb::create_empty(&path).await.map_err(ErrorKind::resource)?;
        tracing::info!(file = %file_name, "created workspace db");
        Ok(path)
    }

    /// Local path of an existing db file that is about to be changed.
    pub async fn prepare_for_write(&self, file_name: &str) -> Result<PathBuf> {
        self.require_write_access().await?;
        match &self.cloud {
            Some(cloud) => cloud.prepare_for_write(file_name).await,
            None => self.local_path(file_name).await,
        }
    }

    /// Run `operation` with permission to change this container.
    ///
    /// Cloud containers hold the write lock for the duration of `operation`,
    /// see [`cloud::with_write_lock()`]. Local containers only need to be
    /// writeable.
    pub async fn with_write_lock<T, F, Fut>(&self, user: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_open()?;
        match &self.cloud {
            Some(cloud) => cloud::with_write_lock(user, cloud, operation).await,
            None if !self.writeable => exn::bail!(ErrorKind::NotWriteable(self.id.to_string())),
            None => operation().await,
        }
    }

    /// Close every open db. Unpublished changes of a cloud container are
    /// abandoned.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for db in self.dbs.drain().await {
            db.close().await;
        }
        if let Some(cloud) = &self.cloud
            && cloud.has_write_lock().await
        {
            tracing::warn!(container = %self.id, "closing container with write lock held, abandoning changes");
            if let Err(err) = cloud.abandon_changes().await {
                tracing::warn!(error = %*err, "could not abandon changes");
            }
            if let Err(err) = cloud.release_write_lock().await {
                tracing::warn!(error = %*err, "could not release write lock");
            }
        }
        tracing::debug!(container = %self.id, "closed container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_container(dir: &Path, writeable: bool) -> Arc<WorkspaceContainer> {
        let props = ContainerProps::local("fonts-02").writeable(writeable);
        let id = ContainerId::new("fonts-02").unwrap();
        WorkspaceContainer::open(id, &props, dir, &dir.join("cache"), Duration::from_secs(60)).await.unwrap()
    }

    fn props(db_name: &str, version: Option<&str>) -> WorkspaceDbProps {
        WorkspaceDbProps { db_name: db_name.to_string(), version: version.map(str::to_string), include_prerelease: false }
    }

    #[tokio::test]
    async fn test_empty_container() {
        let dir = tempfile::tempdir().unwrap();
        let container = local_container(dir.path(), false).await;
        assert!(container.db_file_names().await.unwrap().is_empty());
        assert!(container.db_versions("fonts").await.unwrap().is_empty());
        let err = container.resolve_file_name(&props("fonts", None)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NoVersion { .. }));
        let err = container.resolve_file_name(&props("fonts", Some("not a range"))).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidRange(_)));
        let err = container.resolve_file_name(&props("a:b", None)).await.unwrap_err();
        assert!((*err).to_string().contains("dbName"));
    }

    #[tokio::test]
    async fn test_create_and_share_db() {
        let dir = tempfile::tempdir().unwrap();
        let container = local_container(dir.path(), true).await;
        let name = DbName::new("fonts").unwrap();
        container.create_db_file(&name, &Version::new(1, 0, 0)).await.unwrap();
        let err = container.create_db_file(&name, &Version::new(1, 0, 0)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
        let err = container.create_db_file(&DbName::new("Fonts").unwrap(), &Version::new(2, 0, 0)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NameCollision(..)));

        let a = container.get_workspace_db(&props("fonts", None)).await.unwrap();
        let b = container.get_workspace_db(&props("fonts", Some("^1"))).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(container.dbs.ref_count(a.key()).await, 2);
        container.drop_workspace_db(&a).await;
        container.drop_workspace_db(&b).await;
        assert!(container.dbs.is_empty().await);
    }

    #[tokio::test]
    async fn test_readonly_container_rejects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let container = local_container(dir.path(), false).await;
        let err = container.create_db_file(&DbName::new("fonts").unwrap(), &Version::new(1, 0, 0)).await.unwrap_err();
        assert!((*err).to_string().starts_with("container is not writeable"));
        let err = container.with_write_lock("alice", || async { Ok(()) }).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotWriteable(_)));
    }

    #[tokio::test]
    async fn test_closed_container() {
        let dir = tempfile::tempdir().unwrap();
        let container = local_container(dir.path(), true).await;
        container.create_db_file(&DbName::new("fonts").unwrap(), &Version::new(1, 0, 0)).await.unwrap();
        let db = container.get_workspace_db(&props("fonts", None)).await.unwrap();
        container.close().await;
        assert!(!db.is_open());
        let err = container.get_workspace_db(&props("fonts", None)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ContainerClosed(_)));
        // Dropping after close is harmless.
        container.drop_workspace_db(&db).await;
    }
}
