//! Workspace dbs: one version of a resource db inside a container.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use stow_resource::{OpenMode, ResourceDb, ResourceValue, Version, normalize_version};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::container::{DbKey, WorkspaceContainer};
use crate::error::{ErrorKind, Result};
use crate::names::{ContainerId, DbName};
use crate::resolve::parse_db_file_name;

const DEFAULT_VERSION: &str = "0.0.0";

/// Which db to open and which of its versions are acceptable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceDbProps {
    pub db_name: String,
    /// Semver range; any release version when absent.
    pub version: Option<String>,
    pub include_prerelease: bool,
}

impl WorkspaceDbProps {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self { db_name: db_name.into(), ..Self::default() }
    }

    pub fn version(mut self, range: impl Into<String>) -> Self {
        self.version = Some(range.into());
        self
    }

    pub fn include_prerelease(mut self, include: bool) -> Self {
        self.include_prerelease = include;
        self
    }
}

/// Replace anything that is not safe in a file name on every platform.
fn sanitize(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' }).collect()
}

/// Where the file resource `name` is extracted to below `scratch`.
///
/// Different names can sanitize to the same file name (`fonts/x`, `fonts x`),
/// so each resource gets a directory named after a digest of its full name.
fn extracted_path(scratch: &Path, name: &str, ext: &str) -> PathBuf {
    let digest = blake3::hash(name.as_bytes()).to_hex();
    scratch.join(&digest[..16]).join(extracted_file_name(name, ext))
}

fn extracted_file_name(name: &str, ext: &str) -> String {
    let mut file_name = sanitize(name);
    if !ext.is_empty() && !file_name.ends_with(&format!(".{ext}")) {
        file_name.push('.');
        file_name.push_str(&sanitize(ext));
    }
    file_name
}

/// A read-only workspace db, shared through its container.
///
/// Obtained from [`WorkspaceContainer::get_workspace_db()`] or
/// [`Workspace::get_workspace_db()`](crate::Workspace::get_workspace_db).
#[derive(Debug)]
pub struct WorkspaceDb {
    container: Weak<WorkspaceContainer>,
    container_id: ContainerId,
    db_name: DbName,
    version: Version,
    key: DbKey,
    path: PathBuf,
    scratch: PathBuf,
    db: ResourceDb,
    // Resource name to extracted path and the generation extracted.
    extracted: Mutex<HashMap<String, (PathBuf, i64)>>,
    extractions: AtomicUsize,
}

impl WorkspaceDb {
    pub(crate) fn new(
        container: Weak<WorkspaceContainer>,
        container_id: ContainerId,
        key: DbKey,
        path: PathBuf,
        scratch_dir: &Path,
        db: ResourceDb,
    ) -> Result<Self> {
        let (name, version) =
            parse_db_file_name(&key.file_name).ok_or_else(|| exn::Exn::from(ErrorKind::DbNotFound(key.file_name.clone())))?;
        let db_name = DbName::new(name)?;
        // Cloud handles of one version with different published content must not share extracted files.
        let scratch = match &key.hash {
            Some(hash) => scratch_dir.join(format!("{db_name}-{version}-{}", hash.get(..16).unwrap_or(hash))),
            None => scratch_dir.join(format!("{db_name}-{version}")),
        };
        Ok(Self {
            container,
            container_id,
            db_name,
            version,
            key,
            path,
            scratch,
            db,
            extracted: Mutex::new(HashMap::new()),
            extractions: AtomicUsize::new(0),
        })
    }

    pub(crate) fn key(&self) -> &DbKey {
        &self.key
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn db_name(&self) -> &DbName {
        &self.db_name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Local path of the db file.
    pub fn db_file_name(&self) -> &Path {
        &self.path
    }

    /// The container this db was opened from, unless it is gone.
    pub fn container(&self) -> Option<Arc<WorkspaceContainer>> {
        self.container.upgrade()
    }

    pub fn is_open(&self) -> bool {
        self.db.is_open()
    }

    pub async fn get_string(&self, name: &str) -> Result<Option<String>> {
        self.db.get_string(name).await.map_err(ErrorKind::resource)
    }

    pub async fn get_blob(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.db.get_blob(name).await.map_err(ErrorKind::resource)
    }

    pub async fn get_object<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.db.get_object(name).await.map_err(ErrorKind::resource)
    }

    /// Local path of an embedded file, extracting it on first use.
    ///
    /// Later calls return the same path without extracting again, unless
    /// the file was replaced in the meantime.
    #[instrument(skip(self), fields(db = %self.key.file_name))]
    pub async fn get_file(&self, name: &str) -> Result<Option<PathBuf>> {
        let Some(info) = self.db.file_info(name).await.map_err(ErrorKind::resource)? else {
            return Ok(None);
        };
        let mut extracted = self.extracted.lock().await;
        if let Some((path, generation)) = extracted.get(name)
            && *generation == info.generation
            && tokio::fs::try_exists(path).await.unwrap_or(false)
        {
            return Ok(Some(path.clone()));
        }
        let dest = extracted_path(&self.scratch, name, &info.ext);
        let info = self.db.extract_file(name, &dest).await.map_err(ErrorKind::resource)?;
        self.extractions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(dest = %dest.display(), size = info.size, "extracted file");
        extracted.insert(name.to_string(), (dest.clone(), info.generation));
        Ok(Some(dest))
    }

    /// How many times a file has been extracted from this db.
    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::Relaxed)
    }

    pub(crate) async fn close(&self) {
        self.db.close().await;
    }
}

struct OpenDb {
    version: Version,
    path: PathBuf,
    db: ResourceDb,
}

/// A workspace db opened for changes.
///
/// Changes need a writeable container; on a cloud container they also need
/// the container's write lock, held for as long as the db is being changed.
pub struct EditableWorkspaceDb {
    container: Arc<WorkspaceContainer>,
    props: WorkspaceDbProps,
    db_name: DbName,
    open: Option<OpenDb>,
}

impl EditableWorkspaceDb {
    pub fn new(props: WorkspaceDbProps, container: &Arc<WorkspaceContainer>) -> Result<Self> {
        let db_name = DbName::new(props.db_name.as_str())?;
        Ok(Self { container: container.clone(), props, db_name, open: None })
    }

    pub fn container(&self) -> &Arc<WorkspaceContainer> {
        &self.container
    }

    pub fn db_name(&self) -> &DbName {
        &self.db_name
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn version(&self) -> Option<&Version> {
        self.open.as_ref().map(|open| &open.version)
    }

    pub fn db_file_name(&self) -> Option<&Path> {
        self.open.as_ref().map(|open| open.path.as_path())
    }

    /// Create a new version of the db and open it.
    ///
    /// `version` defaults to `0.0.0`; `v` prefixes and missing minor or patch
    /// numbers are accepted (`"v1.2"` is `1.2.0`).
    #[instrument(skip(self), fields(container = %self.container.id(), db = %self.db_name))]
    pub async fn create_db(&mut self, version: Option<&str>) -> Result<()> {
        let input = version.unwrap_or(DEFAULT_VERSION);
        let version = normalize_version(input).map_err(|e| e.raise(ErrorKind::InvalidVersion(input.to_string())))?;
        self.close().await;
        let path = self.container.create_db_file(&self.db_name, &version).await?;
        let db = ResourceDb::open(&path, OpenMode::ReadWrite).await.map_err(ErrorKind::resource)?;
        self.open = Some(OpenDb { version, path, db });
        Ok(())
    }

    /// Open the best existing version of the db for `props`.
    #[instrument(skip(self), fields(container = %self.container.id(), db = %self.db_name))]
    pub async fn open(&mut self) -> Result<()> {
        let file_name = self.container.resolve_file_name(&self.props).await?;
        let path = self.container.prepare_for_write(&file_name).await?;
        let db = ResourceDb::open(&path, OpenMode::ReadWrite).await.map_err(ErrorKind::resource)?;
        let (_, version) =
            parse_db_file_name(&file_name).ok_or_else(|| exn::Exn::from(ErrorKind::DbNotFound(file_name.clone())))?;
        self.close().await;
        self.open = Some(OpenDb { version, path, db });
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(open) = self.open.take() {
            open.db.close().await;
        }
    }

    fn db(&self) -> Result<&ResourceDb> {
        match &self.open {
            Some(open) => Ok(&open.db),
            None => exn::bail!(ErrorKind::DbNotOpen(self.db_name.to_string())),
        }
    }

    async fn writable(&self) -> Result<&ResourceDb> {
        let db = self.db()?;
        self.container.require_write_access().await?;
        Ok(db)
    }

    pub async fn get_string(&self, name: &str) -> Result<Option<String>> {
        self.db()?.get_string(name).await.map_err(ErrorKind::resource)
    }

    pub async fn get_blob(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.db()?.get_blob(name).await.map_err(ErrorKind::resource)
    }

    pub async fn has_file(&self, name: &str) -> Result<bool> {
        Ok(self.db()?.file_info(name).await.map_err(ErrorKind::resource)?.is_some())
    }

    pub async fn add_string(&self, name: &str, value: &str) -> Result<()> {
        self.writable().await?.add_string(name, value).await.map_err(ErrorKind::resource)
    }

    pub async fn update_string(&self, name: &str, value: &str) -> Result<()> {
        self.writable().await?.update_string(name, value).await.map_err(ErrorKind::resource)
    }

    pub async fn remove_string(&self, name: &str) -> Result<()> {
        self.writable().await?.remove_string(name).await.map_err(ErrorKind::resource)
    }

    pub async fn add_blob(&self, name: &str, value: &[u8]) -> Result<()> {
        self.writable().await?.add_blob(name, value).await.map_err(ErrorKind::resource)
    }

    pub async fn update_blob(&self, name: &str, value: &[u8]) -> Result<()> {
        self.writable().await?.update_blob(name, value).await.map_err(ErrorKind::resource)
    }

    pub async fn remove_blob(&self, name: &str) -> Result<()> {
        self.writable().await?.remove_blob(name).await.map_err(ErrorKind::resource)
    }

    pub async fn add_value(&self, name: &str, value: &ResourceValue) -> Result<()> {
        self.writable().await?.add_value(name, value).await.map_err(ErrorKind::resource)
    }

    pub async fn update_value(&self, name: &str, value: &ResourceValue) -> Result<()> {
        self.writable().await?.update_value(name, value).await.map_err(ErrorKind::resource)
    }

    /// Embed the file at `source`. The extension defaults to that of `source`.
    pub async fn add_file(&self, name: &str, source: &Path, ext: Option<&str>) -> Result<()> {
        self.writable().await?.add_file(name, source, ext).await.map_err(ErrorKind::resource)
    }

    pub async fn update_file(&self, name: &str, source: &Path) -> Result<()> {
        self.writable().await?.update_file(name, source).await.map_err(ErrorKind::resource)
    }

    pub async fn remove_file(&self, name: &str) -> Result<()> {
        self.writable().await?.remove_file(name).await.map_err(ErrorKind::resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerProps;
    use rstest::rstest;
    use std::time::Duration;
    use stow_resource::ResourceKind;

    async fn container(dir: &Path) -> Arc<WorkspaceContainer> {
        let props = ContainerProps::local("test-container").writeable(true);
        let id = ContainerId::new("test-container").unwrap();
        WorkspaceContainer::open(id, &props, dir, &dir.join("cache"), Duration::from_secs(60)).await.unwrap()
    }

    #[rstest]
    #[case("Helvetica.ttf", "ttf", "Helvetica.ttf")]
    #[case("fonts/Helvetica", "ttf", "fonts_Helvetica.ttf")]
    #[case("readme", "", "readme")]
    #[case("a b:c", "txt", "a_b_c.txt")]
    fn test_extracted_file_name(#[case] name: &str, #[case] ext: &str, #[case] expected: &str) {
        assert_eq!(extracted_file_name(name, ext), expected);
    }

    #[tokio::test]
    async fn test_resource_contract() {
        let dir = tempfile::tempdir().unwrap();
        let container = container(dir.path()).await;
        let mut db = EditableWorkspaceDb::new(WorkspaceDbProps::new("styles"), &container).unwrap();
        let err = db.add_string("x", "y").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::DbNotOpen(_)));

        db.create_db(None).await.unwrap();
        assert_eq!(db.version().unwrap().to_string(), "0.0.0");
        assert!(db.db_file_name().unwrap().ends_with("styles-0.0.0.wsdb"));

        let err = db.update_string("s", "v").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Resource(stow_resource::ErrorKind::NotFound(ResourceKind::String, _))));
        assert!((*err).to_string().contains("does not exist"));
        let err = db.remove_string("s").await.unwrap_err();
        assert!((*err).to_string().contains("does not exist"));
        db.add_string("s", "v").await.unwrap();
        let err = db.add_string("s", "v").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Resource(stow_resource::ErrorKind::AlreadyExists(ResourceKind::String, _))));

        db.add_blob("empty", &[]).await.unwrap();
        assert_eq!(db.get_blob("empty").await.unwrap(), Some(vec![]));
        let err = db.add_file("f", &dir.path().join("missing.txt"), None).await.unwrap_err();
        assert!((*err).to_string().contains("no such file"));
        db.close().await;
        assert!(!db.is_open());
    }

    #[tokio::test]
    async fn test_get_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("logo.svg");
        tokio::fs::write(&source, "<svg/>").await.unwrap();
        let container = container(dir.path()).await;
        let mut editable = EditableWorkspaceDb::new(WorkspaceDbProps::new("assets"), &container).unwrap();
        editable.create_db(Some("1.0")).await.unwrap();
        editable.add_file("images/logo", &source, None).await.unwrap();

        let db = container.get_workspace_db(&WorkspaceDbProps::new("assets")).await.unwrap();
        assert_eq!(db.get_file("missing").await.unwrap(), None);
        let first = db.get_file("images/logo").await.unwrap().unwrap();
        let second = db.get_file("images/logo").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(db.extractions(), 1);
        assert!(first.starts_with(container.scratch_dir().join("assets-1.0.0")));
        assert_eq!(first.file_name().unwrap(), "images_logo.svg");
        assert_eq!(tokio::fs::read_to_string(&first).await.unwrap(), "<svg/>");

        tokio::fs::write(&source, "<svg></svg>").await.unwrap();
        editable.update_file("images/logo", &source).await.unwrap();
        let third = db.get_file("images/logo").await.unwrap().unwrap();
        assert_eq!(third, first);
        assert_eq!(db.extractions(), 2);
        assert_eq!(tokio::fs::read_to_string(&third).await.unwrap(), "<svg></svg>");
    }

    #[tokio::test]
    async fn test_get_file_keeps_similar_names_apart() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a.txt"), dir.path().join("b.txt"));
        tokio::fs::write(&a, "AAAA").await.unwrap();
        tokio::fs::write(&b, "BBBB").await.unwrap();
        let container = container(dir.path()).await;
        let mut editable = EditableWorkspaceDb::new(WorkspaceDbProps::new("assets"), &container).unwrap();
        editable.create_db(Some("1.0")).await.unwrap();
        editable.add_file("fonts/x", &a, None).await.unwrap();
        editable.add_file("fonts_x", &b, None).await.unwrap();
        editable.add_file("fonts x", &b, None).await.unwrap();

        let db = container.get_workspace_db(&WorkspaceDbProps::new("assets")).await.unwrap();
        let slash = db.get_file("fonts/x").await.unwrap().unwrap();
        let underscore = db.get_file("fonts_x").await.unwrap().unwrap();
        let space = db.get_file("fonts x").await.unwrap().unwrap();
        assert_ne!(slash, underscore);
        assert_ne!(underscore, space);
        assert_ne!(slash, space);
        assert_eq!(db.get_file("fonts/x").await.unwrap().unwrap(), slash);
        assert_eq!(tokio::fs::read_to_string(&slash).await.unwrap(), "AAAA");
        assert_eq!(tokio::fs::read_to_string(&underscore).await.unwrap(), "BBBB");
        assert_eq!(db.extractions(), 3);
    }

    #[rstest]
    #[case("a", "txt")]
    #[case("a.txt", "txt")]
    #[case("a_b", "")]
    #[case("a b", "")]
    fn test_extracted_paths_are_distinct(#[case] name: &str, #[case] ext: &str) {
        let scratch = Path::new("/scratch");
        let others = [("a", "txt"), ("a.txt", "txt"), ("a_b", ""), ("a b", "")];
        for (other, other_ext) in others.into_iter().filter(|&(other, _)| other != name) {
            assert_ne!(extracted_path(scratch, name, ext), extracted_path(scratch, other, other_ext));
        }
    }

    #[tokio::test]
    async fn test_create_db_rejects_bad_version() {
        let dir = tempfile::tempdir().unwrap();
        let container = container(dir.path()).await;
        let mut db = EditableWorkspaceDb::new(WorkspaceDbProps::new("styles"), &container).unwrap();
        let err = db.create_db(Some("badname")).await.unwrap_err();
        assert!((*err).to_string().contains("invalid version"));
        assert!(!db.is_open());
        let err = EditableWorkspaceDb::new(WorkspaceDbProps::new("con"), &container).err().unwrap();
        assert!((*err).to_string().contains("dbName"));
    }
}
