//! Resource database errors.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A resource database error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for resource database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The three resource namespaces. Names are unique within one namespace only.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    #[display("string")]
    String,
    #[display("blob")]
    Blob,
    #[display("file")]
    File,
}

impl ResourceKind {
    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::String => "strings",
            Self::Blob => "blobs",
            Self::File => "files",
        }
    }
}

#[derive(Debug, Clone, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    #[display("database does not exist: {}", _0.display())]
    DbNotFound(#[error(not(source))] PathBuf),
    #[display("database is not open for write: {}", _0.display())]
    ReadOnly(#[error(not(source))] PathBuf),
    #[display("{_0} resource \"{_1}\" does not exist")]
    NotFound(#[error(not(source))] ResourceKind, String),
    #[display("{_0} resource \"{_1}\" already exists")]
    AlreadyExists(#[error(not(source))] ResourceKind, String),
    #[display("error replacing {_0} resource \"{_1}\": it does not exist")]
    ReplaceFailed(#[error(not(source))] ResourceKind, String),
    #[display("no such file: {}", _0.display())]
    NoSuchFile(#[error(not(source))] PathBuf),
    #[display("invalid resource name {_0:?}")]
    InvalidName(#[error(not(source))] String),
    #[display("invalid resource value: {_0}")]
    InvalidValue(#[error(not(source))] &'static str),
    /// The database was written by an incompatible version of this library.
    #[display("database persistence version {found} does not satisfy required {access} version {required}")]
    VersionMismatch {
        #[error(not(source))]
        found: String,
        required: String,
        access: &'static str,
    },
    #[display("invalid version \"{_0}\"")]
    InvalidVersion(#[error(not(source))] String),
    #[display("invalid version range \"{_0}\"")]
    InvalidRange(#[error(not(source))] String),
    #[display("I/O error")]
    Io,
    /// Serialization/deserialization error.
    #[display("invalid resource data")]
    InvalidData,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        // SQLITE_BUSY surfaces as a plain database error.
        matches!(self, Self::Database | Self::Io)
    }
}
