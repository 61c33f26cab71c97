use clap::{Args, Parser, Subcommand, ValueEnum};
use exn::ResultExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stow_config::{AccountConfig, Config};
use stow_settings::{Settings, SettingsPriority};
use stow_storage::BackendHandle;
use stow_storage::backend::LocalBackend;
use stow_workspace::{ContainerProps, EditableWorkspaceDb, Workspace, WorkspaceDbProps, WorkspaceOpts};
use tokio::io::AsyncWriteExt;

use crate::error::{ErrorKind, Result};

#[derive(Debug, Parser)]
#[command(name = "stow", version, about = "Versioned workspace containers")]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(long, short, global = true, env = "STOW_CONFIG")]
    pub config: Option<PathBuf>,
    /// Storage account holding cloud containers. Containers are local when omitted.
    #[arg(long, short, global = true)]
    pub account: Option<String>,
    /// Name recorded as the holder of write locks.
    #[arg(long, global = true, env = "USER", default_value = "stow")]
    pub user: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List every version of a db.
    Versions { container: String, db: String },
    /// Show which file a db name and version range resolve to.
    Resolve {
        container: String,
        db: String,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Print a resource of a db.
    Get {
        container: String,
        db: String,
        resource: String,
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long, value_enum, default_value_t = Kind::String)]
        kind: Kind,
    },
    /// Create a new, empty version of a db.
    Create {
        container: String,
        db: String,
        /// Defaults to 0.0.0.
        #[arg(long)]
        version: Option<String>,
    },
    /// Add or replace a resource in one version of a db.
    Put {
        container: String,
        db: String,
        version: String,
        resource: String,
        #[command(flatten)]
        value: PutValue,
    },
}

#[derive(Debug, Args)]
pub struct RangeArgs {
    /// Semver range the version must satisfy.
    #[arg(long)]
    range: Option<String>,
    /// Consider prerelease versions.
    #[arg(long)]
    prerelease: bool,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct PutValue {
    #[arg(long)]
    string: Option<String>,
    /// Embed this file.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    String,
    Blob,
    File,
}

impl RangeArgs {
    fn props(&self, db: &str) -> WorkspaceDbProps {
        let mut props = WorkspaceDbProps::new(db).include_prerelease(self.prerelease);
        props.version = self.range.clone();
        props
    }
}

async fn connect_account(config: &Config, name: &str) -> Result<BackendHandle> {
    let account = config.account(name).map_err(|e| e.raise(ErrorKind::Account(name.to_string())))?;
    match account {
        AccountConfig::Local { root } => {
            let backend = LocalBackend::new(name, root).map_err(|e| e.raise(ErrorKind::Account(name.to_string())))?;
            Ok(Arc::new(backend))
        },
        #[cfg(feature = "s3")]
        AccountConfig::S3 { bucket, prefix, region, endpoint, key_id, key_secret } => {
            let backend = stow_storage::backend::S3Backend::new(
                name,
                bucket,
                prefix.clone(),
                region,
                endpoint.as_deref(),
                key_id,
                key_secret,
            )
            .await
            .map_err(|e| e.raise(ErrorKind::Account(name.to_string())))?;
            Ok(Arc::new(backend))
        },
        #[cfg(not(feature = "s3"))]
        AccountConfig::S3 { .. } => exn::bail!(ErrorKind::S3Disabled(name.to_string())),
    }
}

fn container_props(name: &str, storage: Option<&BackendHandle>, writeable: bool) -> ContainerProps {
    let props = match storage {
        Some(storage) => ContainerProps::cloud(name, storage.clone()),
        None => ContainerProps::local(name),
    };
    props.writeable(writeable)
}

pub async fn run(args: Cli, config: Config) -> Result<()> {
    let settings = Arc::new(Settings::new());
    for path in &config.settings {
        settings.add_file(path, SettingsPriority::Application).map_err(|e| e.raise(ErrorKind::Settings))?;
    }
    let opts = WorkspaceOpts {
        container_dir: config.container_dir.clone(),
        cloud_cache_dir: config.cloud_cache_dir(),
        clear_cloud_cache: config.cloud_cache.clear_contents,
        write_lock_lease: Duration::from_secs(config.write_lock.lease_seconds),
    };
    let workspace = Workspace::new(settings, opts).await.map_err(ErrorKind::workspace)?;
    let storage = match &args.account {
        Some(name) => Some(connect_account(&config, name).await?),
        None => None,
    };
    let result = execute(&workspace, storage.as_ref(), &args).await;
    workspace.close().await;
    result
}

async fn execute(workspace: &Workspace, storage: Option<&BackendHandle>, args: &Cli) -> Result<()> {
    match &args.command {
        Command::Versions { container, db } => {
            let container = workspace.get_container(&container_props(container, storage, false)).await;
            let container = container.map_err(ErrorKind::workspace)?;
            let versions = container.db_versions(db).await.map_err(ErrorKind::workspace)?;
            for version in versions {
                println!("{version}");
            }
        },
        Command::Resolve { container, db, range } => {
            let container = workspace.get_container(&container_props(container, storage, false)).await;
            let container = container.map_err(ErrorKind::workspace)?;
            let file_name = container.resolve_file_name(&range.props(db)).await.map_err(ErrorKind::workspace)?;
            println!("{}", container.root().join(file_name).display());
        },
        Command::Get { container, db, resource, range, kind } => {
            let props = container_props(container, storage, false);
            let db = workspace.get_workspace_db(&props, &range.props(db)).await.map_err(ErrorKind::workspace)?;
            let result = print_resource(&db, resource, *kind).await;
            workspace.drop_workspace_db(&db).await;
            result?;
        },
        Command::Create { container, db, version } => {
            let container = workspace.get_container(&container_props(container, storage, true)).await;
            let container = container.map_err(ErrorKind::workspace)?;
            let (target, version) = (&container, version.as_deref());
            let created = container
                .with_write_lock(&args.user, move || async move {
                    let mut db = EditableWorkspaceDb::new(WorkspaceDbProps::new(db.as_str()), target)?;
                    db.create_db(version).await?;
                    let file = db.db_file_name().map(|path| path.display().to_string()).unwrap_or_default();
                    db.close().await;
                    Ok(file)
                })
                .await
                .map_err(ErrorKind::workspace)?;
            println!("{created}");
        },
        Command::Put { container, db, version, resource, value } => {
            let container = workspace.get_container(&container_props(container, storage, true)).await;
            let container = container.map_err(ErrorKind::workspace)?;
            let props = WorkspaceDbProps::new(db.as_str()).version(format!("={version}")).include_prerelease(true);
            let target = &container;
            container
                .with_write_lock(&args.user, move || async move {
                    let mut db = EditableWorkspaceDb::new(props, target)?;
                    db.open().await?;
                    let result = if let Some(string) = &value.string {
                        match db.get_string(resource).await? {
                            Some(_) => db.update_string(resource, string).await,
                            None => db.add_string(resource, string).await,
                        }
                    } else if let Some(file) = &value.file {
                        match db.has_file(resource).await? {
                            true => db.update_file(resource, file).await,
                            false => db.add_file(resource, file, None).await,
                        }
                    } else {
                        Ok(())
                    };
                    db.close().await;
                    result
                })
                .await
                .map_err(ErrorKind::workspace)?;
            tracing::info!(%resource, "stored resource");
        },
    }
    Ok(())
}

async fn print_resource(db: &stow_workspace::WorkspaceDb, resource: &str, kind: Kind) -> Result<()> {
    let not_found = || exn::Exn::from(ErrorKind::NotFound(resource.to_string()));
    match kind {
        Kind::String => {
            let value = db.get_string(resource).await.map_err(ErrorKind::workspace)?.ok_or_else(not_found)?;
            println!("{value}");
        },
        Kind::Blob => {
            let value = db.get_blob(resource).await.map_err(ErrorKind::workspace)?.ok_or_else(not_found)?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&value).await.or_raise(|| ErrorKind::Output)?;
            stdout.flush().await.or_raise(|| ErrorKind::Output)?;
        },
        Kind::File => {
            let path = db.get_file(resource).await.map_err(ErrorKind::workspace)?.ok_or_else(not_found)?;
            println!("{}", path.display());
        },
    }
    Ok(())
}
