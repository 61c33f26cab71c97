//! Workspace errors.
//!
//! Errors from the resource, storage and settings crates are kept as children
//! in the error tree; their top-level message is copied into the wrapping
//! kind so that callers matching on this crate's [`ErrorKind`] still see it.

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("invalid containerId \"{}\": {reason}", id.escape_debug())]
    InvalidContainerId {
        #[error(not(source))]
        id: String,
        reason: &'static str,
    },
    #[display("invalid dbName \"{}\": {reason}", name.escape_debug())]
    InvalidDbName {
        #[error(not(source))]
        name: String,
        reason: &'static str,
    },
    #[display("invalid version \"{_0}\"")]
    InvalidVersion(#[error(not(source))] String),
    #[display("invalid version range \"{_0}\"")]
    InvalidRange(#[error(not(source))] String),
    #[display("No version of \"{db_name}\" satisfies \"{range}\"")]
    NoVersion {
        #[error(not(source))]
        db_name: String,
        range: String,
    },
    #[display("workspace db \"{_0}\" does not exist")]
    DbNotFound(#[error(not(source))] String),
    #[display("workspace db \"{_0}\" already exists")]
    AlreadyExists(#[error(not(source))] String),
    #[display("dbName \"{_0}\" differs only by case from existing \"{_1}\"")]
    NameCollision(#[error(not(source))] String, String),
    #[display("workspace db \"{_0}\" is not open")]
    DbNotOpen(#[error(not(source))] String),
    #[display("container is not writeable: {_0}")]
    NotWriteable(#[error(not(source))] String),
    #[display("cannot acquire write lock on container {container}: held by {holder}")]
    LockHeld {
        #[error(not(source))]
        container: String,
        holder: String,
    },
    #[display("container {_0} requires the write lock for changes")]
    WriteLockRequired(#[error(not(source))] String),
    #[display("write lock on container {_0} is not held")]
    LockNotHeld(#[error(not(source))] String),
    /// Another session took over the write lock before changes were published.
    #[display("write lock on container {_0} was lost, changes discarded")]
    LockLost(#[error(not(source))] String),
    #[display("container {_0} has been closed")]
    ContainerClosed(#[error(not(source))] String),
    #[display("invalid manifest for container {_0}")]
    InvalidManifest(#[error(not(source))] String),
    #[display("downloaded content for {_0} failed verification")]
    Corrupt(#[error(not(source))] String),
    #[display("{_0}")]
    Resource(stow_resource::ErrorKind),
    #[display("storage error: {message}")]
    Storage {
        #[error(not(source))]
        message: String,
        retryable: bool,
    },
    #[display("settings error: {_0}")]
    Settings(#[error(not(source))] String),
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Wrap a resource database error, keeping its kind matchable.
    #[track_caller]
    pub fn resource(err: stow_resource::error::Error) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Resource(inner))
    }

    #[track_caller]
    pub fn storage(err: stow_storage::error::Error) -> Error {
        let message = (*err).to_string();
        let retryable = err.is_retryable();
        err.raise(ErrorKind::Storage { message, retryable })
    }

    #[track_caller]
    pub fn settings(err: stow_settings::error::Error) -> Error {
        let message = (*err).to_string();
        err.raise(ErrorKind::Settings(message))
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Resource(inner) => inner.is_retryable(),
            Self::Storage { retryable, .. } => *retryable,
            Self::Corrupt(_) | Self::Io => true,
            _ => false,
        }
    }
}
