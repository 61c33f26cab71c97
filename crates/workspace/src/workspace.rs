//! The workspace: every container and db a process has open, plus the
//! settings that tell it where to find them.

use exn::ResultExt;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stow_resource::ResourceKind;
use stow_settings::{Settings, SettingsPriority};
use tracing::instrument;

use crate::container::{ContainerProps, WorkspaceContainer};
use crate::db::{WorkspaceDb, WorkspaceDbProps};
use crate::error::{ErrorKind, Result};
use crate::names::ContainerId;
use crate::registry::Registry;

/// Setting holding `[{"name": ..., "id": ...}]` container aliases.
pub const CONTAINER_ALIAS_SETTING: &str = "workspace/container/alias";

const DEFAULT_LEASE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Deserialize)]
struct ContainerAlias {
    name: String,
    id: String,
}

/// Where a workspace keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceOpts {
    /// Parent of every local container directory.
    pub container_dir: PathBuf,
    /// Parent of every cloud container's cache directory.
    pub cloud_cache_dir: PathBuf,
    /// Empty the cloud cache directory when the workspace is created.
    pub clear_cloud_cache: bool,
    /// How long a cloud write lock lasts before others may take it over.
    pub write_lock_lease: Duration,
}

impl WorkspaceOpts {
    pub fn new(container_dir: impl Into<PathBuf>) -> Self {
        let container_dir = container_dir.into();
        Self {
            cloud_cache_dir: container_dir.join(".cloud-cache").join("default"),
            container_dir,
            clear_cloud_cache: false,
            write_lock_lease: DEFAULT_LEASE,
        }
    }
}

/// A settings dictionary stored as a string resource of a workspace db.
#[derive(Clone)]
pub struct SettingsLocator {
    pub container: ContainerProps,
    pub db: WorkspaceDbProps,
    pub resource_name: String,
}

pub struct Workspace {
    settings: Arc<Settings>,
    opts: WorkspaceOpts,
    containers: Registry<ContainerId, WorkspaceContainer>,
}

impl Workspace {
    #[instrument(skip(settings))]
    pub async fn new(settings: Arc<Settings>, opts: WorkspaceOpts) -> Result<Self> {
        if opts.clear_cloud_cache {
            match tokio::fs::remove_dir_all(&opts.cloud_cache_dir).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e).or_raise(|| ErrorKind::Io),
                _ => tracing::info!(dir = %opts.cloud_cache_dir.display(), "cleared cloud cache"),
            }
        }
        tokio::fs::create_dir_all(&opts.cloud_cache_dir).await.or_raise(|| ErrorKind::Io)?;
        Ok(Self { settings, opts, containers: Registry::new() })
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn opts(&self) -> &WorkspaceOpts {
        &self.opts
    }

    /// Map a container alias to a container id.
    ///
    /// Aliases come from the [`CONTAINER_ALIAS_SETTING`] of every settings
    /// dictionary, highest priority first. Names without an alias are
    /// returned unchanged.
    pub fn resolve_container_name(&self, name: &str) -> String {
        self.settings
            .resolve_setting(CONTAINER_ALIAS_SETTING, |value, _| {
                let aliases: Vec<ContainerAlias> = serde_json::from_value(value.clone()).ok()?;
                aliases.into_iter().find(|alias| alias.name == name).map(|alias| alias.id)
            })
            .unwrap_or_else(|| name.to_string())
    }

    /// Open a container, or share the already open one with the same id.
    ///
    /// Props only matter to whoever opens the container first. Each call
    /// must be balanced by [`drop_container()`](Self::drop_container).
    pub async fn get_container(&self, props: &ContainerProps) -> Result<Arc<WorkspaceContainer>> {
        let id = ContainerId::new(self.resolve_container_name(&props.container_id))?;
        let opts = &self.opts;
        let opened = id.clone();
        self.containers
            .acquire(id, move || async move {
                WorkspaceContainer::open(opened, props, &opts.container_dir, &opts.cloud_cache_dir, opts.write_lock_lease)
                    .await
            })
            .await
    }

    /// Give back a container, closing it when nobody else uses it.
    pub async fn drop_container(&self, container: &WorkspaceContainer) {
        if let Some(last) = self.containers.release(container.id()).await {
            last.close().await;
        }
    }

    /// Open the best version of a db in a container.
    ///
    /// The container stays open for as long as the db does; balance each
    /// call with [`drop_workspace_db()`](Self::drop_workspace_db).
    pub async fn get_workspace_db(
        &self,
        container: &ContainerProps,
        props: &WorkspaceDbProps,
    ) -> Result<Arc<WorkspaceDb>> {
        let container = self.get_container(container).await?;
        match container.get_workspace_db(props).await {
            Ok(db) => Ok(db),
            Err(err) => {
                self.drop_container(&container).await;
                Err(err)
            },
        }
    }

    /// Close a db opened with [`get_workspace_db()`](Self::get_workspace_db)
    /// and give back the container reference it took.
    ///
    /// Only for dbs from this workspace's `get_workspace_db()`. A db opened
    /// straight from a [`WorkspaceContainer`] took no container reference and
    /// is closed with [`WorkspaceContainer::drop_workspace_db()`] instead.
    pub async fn drop_workspace_db(&self, db: &WorkspaceDb) {
        let Some(container) = db.container() else { return };
        container.drop_workspace_db(db).await;
        self.drop_container(&container).await;
    }

    /// Install a settings dictionary stored in a workspace db.
    ///
    /// The dictionary is named `<containerId>/<dbName>/<resourceName>`, so
    /// loading the same resource again replaces it.
    #[instrument(skip(self, locator), fields(resource = %locator.resource_name))]
    pub async fn load_settings_dictionary(&self, locator: &SettingsLocator, priority: SettingsPriority) -> Result<String> {
        let db = self.get_workspace_db(&locator.container, &locator.db).await?;
        let json = db.get_string(&locator.resource_name).await;
        let name = format!("{}/{}/{}", db.container_id(), db.db_name(), locator.resource_name);
        self.drop_workspace_db(&db).await;
        let json = json?.ok_or_else(|| {
            exn::Exn::from(ErrorKind::Resource(stow_resource::ErrorKind::NotFound(
                ResourceKind::String,
                locator.resource_name.clone(),
            )))
        })?;
        self.settings.add_json(name.clone(), priority, &json).map_err(ErrorKind::settings)?;
        Ok(name)
    }

    /// Close every open container and db.
    pub async fn close(&self) {
        for container in self.containers.drain().await {
            container.close().await;
        }
    }
}
