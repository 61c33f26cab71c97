//! Resource database files: creation, opening and the persistence version stamp.

use exn::{OptionExt, ResultExt};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::version::{VersionRange, normalize_version};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
const MAX_READERS: u32 = 4;
const VERSIONS_PROPERTY: &str = "persistence/versions";

/// Persistence version of the schema written by this library.
pub const PERSISTENCE_VERSION: &str = "3.0.0";
/// Ranges stamped into every newly created database.
pub const REQUIRED_READ_VERSION: &str = "^3.0";
pub const REQUIRED_WRITE_VERSION: &str = "^3.0";

/// How a [`ResourceDb`] is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Readonly,
    ReadWrite,
}

/// The version ranges a library must satisfy to read or write a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredVersions {
    pub read_version: String,
    pub write_version: String,
}

impl Default for RequiredVersions {
    fn default() -> Self {
        Self { read_version: REQUIRED_READ_VERSION.to_string(), write_version: REQUIRED_WRITE_VERSION.to_string() }
    }
}

/// An open resource database.
///
/// One SQLite file holding three independent namespaces (strings, blobs and
/// embedded files). Readers get a small pool; writers get exactly one
/// connection so that SQLite never has to arbitrate between two writers
/// inside the same process.
#[derive(Debug, Clone)]
pub struct ResourceDb {
    pool: SqlitePool,
    path: PathBuf,
    mode: OpenMode,
}

impl ResourceDb {
    /// Create a new, empty resource database at `path`.
    ///
    /// Missing parent directories are created and any existing file at `path`
    /// is replaced. The new database carries the current required versions
    /// and is closed again before returning.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn create_empty(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io)?;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!("replaced existing database"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e).or_raise(|| ErrorKind::Io),
        }
        let options = Self::base_options().filename(path).create_if_missing(true);
        let db = Self::connect(options, path, OpenMode::ReadWrite).await?;
        MIGRATOR.run(&db.pool).await.or_raise(|| ErrorKind::Migration)?;
        db.set_required_versions(&RequiredVersions::default()).await?;
        db.close().await;
        Ok(())
    }

    /// Open an existing resource database.
    ///
    /// Fails with [`ErrorKind::VersionMismatch`] when this library's
    /// persistence version does not satisfy the database's required read
    /// version (or write version, for [`OpenMode::ReadWrite`]).
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.or_raise(|| ErrorKind::Io)? {
            exn::bail!(ErrorKind::DbNotFound(path.to_path_buf()));
        }
        let options = Self::base_options().filename(path).read_only(mode == OpenMode::Readonly);
        let db = Self::connect(options, path, mode).await?;
        if let Err(e) = db.check_persistence_version().await {
            db.close().await;
            return Err(e);
        }
        Ok(db)
    }

    async fn connect(options: SqliteConnectOptions, path: &Path, mode: OpenMode) -> Result<Self> {
        let max = match mode {
            OpenMode::Readonly => MAX_READERS,
            OpenMode::ReadWrite => 1,
        };
        let pool = SqlitePoolOptions::new()
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max)
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(Self { pool, path: path.to_path_buf(), mode })
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // Database files get copied around and uploaded whole, so keep
            // everything in the one file: no WAL sidecars.
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(std::time::Duration::from_millis(3000))
    }

    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA cache_size = -4096;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn check_persistence_version(&self) -> Result<()> {
        let required = self.required_versions().await?;
        let ours = normalize_version(PERSISTENCE_VERSION)?;
        let mut checks = vec![("read", &required.read_version)];
        if self.mode == OpenMode::ReadWrite {
            checks.push(("write", &required.write_version));
        }
        for (access, range) in checks {
            if !VersionRange::parse(range)?.matches(&ours, false) {
                exn::bail!(ErrorKind::VersionMismatch {
                    found: PERSISTENCE_VERSION.to_string(),
                    required: range.clone(),
                    access,
                });
            }
        }
        Ok(())
    }

    /// The version ranges stamped into this database.
    pub async fn required_versions(&self) -> Result<RequiredVersions> {
        let raw = self
            .property(VERSIONS_PROPERTY)
            .await?
            .ok_or_raise(|| ErrorKind::VersionMismatch {
                found: PERSISTENCE_VERSION.to_string(),
                required: "(none)".to_string(),
                access: "read",
            })?;
        serde_json::from_str(&raw).or_raise(|| ErrorKind::InvalidData)
    }

    /// Overwrite the version ranges stamped into this database.
    pub async fn set_required_versions(&self, versions: &RequiredVersions) -> Result<()> {
        self.ensure_writable()?;
        let raw = serde_json::to_string(versions).or_raise(|| ErrorKind::InvalidData)?;
        sqlx::query("INSERT INTO properties (name, value) VALUES (?1, ?2) ON CONFLICT(name) DO UPDATE SET value = ?2")
            .bind(VERSIONS_PROPERTY)
            .bind(raw)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn property(&self, name: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM properties WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.mode != OpenMode::ReadWrite {
            exn::bail!(ErrorKind::ReadOnly(self.path.clone()));
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        !self.pool.is_closed()
    }

    /// Close the database, waiting for outstanding connections to return.
    pub async fn close(&self) {
        if self.mode == OpenMode::ReadWrite {
            _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        }
        self.pool.close().await;
    }
}
