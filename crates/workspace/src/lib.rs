//! Versioned workspace containers.
//!
//! A workspace container is a directory of resource dbs, each present in any
//! number of versions side by side (`fonts-1.2.0.wsdb`, `fonts-1.3.0.wsdb`).
//! Readers ask for a db by name and semver range and get the best version
//! present. Containers either live in a local directory or are synchronized
//! from blob storage, in which case a write lock serializes writers across
//! processes and machines while readers keep working from the last published
//! state until they poll for changes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stow_settings::Settings;
//! use stow_workspace::{ContainerProps, Workspace, WorkspaceDbProps, WorkspaceOpts, error::Result};
//!
//! # async fn example() -> Result<()> {
//! let workspace = Workspace::new(Arc::new(Settings::new()), WorkspaceOpts::new("/var/lib/stow")).await?;
//! let db = workspace
//!     .get_workspace_db(&ContainerProps::local("fonts-02"), &WorkspaceDbProps::new("fonts").version("^1.2"))
//!     .await?;
//! if let Some(path) = db.get_file("Helvetica.ttf").await? {
//!     println!("{}", path.display());
//! }
//! workspace.drop_workspace_db(&db).await;
//! # Ok(())
//! # }
//! ```

pub mod cloud;
mod container;
mod db;
pub mod error;
mod names;
mod registry;
pub mod resolve;
mod workspace;

pub use self::cloud::{CloudContainer, with_write_lock};
pub use self::container::{CloudProps, ContainerProps, WorkspaceContainer};
pub use self::db::{EditableWorkspaceDb, WorkspaceDb, WorkspaceDbProps};
pub use self::names::{ContainerId, DbName};
pub use self::registry::Registry;
pub use self::workspace::{CONTAINER_ALIAS_SETTING, SettingsLocator, Workspace, WorkspaceOpts};
pub use stow_resource::{ResourceValue, Version};
pub use stow_settings::SettingsPriority;
