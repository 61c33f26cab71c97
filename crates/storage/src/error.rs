//! Errors raised by storage backends.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error, carrying the location it was raised at.
pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong talking to a backend.
///
/// Container sync cares mostly about two cases: [`NotFound`](Self::NotFound)
/// (no manifest yet, a lock that was already released) and
/// [`AlreadyExists`](Self::AlreadyExists) (someone else holds the write lock).
/// [`Conflict`](Self::Conflict) means a compare-and-swap lost a race.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No blob at this path.
    #[display("blob not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Credentials or file permissions refused the request.
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// A conditional create found the path taken.
    #[display("blob already exists: {}", _0.display())]
    AlreadyExists(#[error(not(source))] PathBuf),
    /// A conditional replace found different contents than expected.
    #[display("blob changed concurrently: {}", _0.display())]
    Conflict(#[error(not(source))] PathBuf),
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// The remote service could not be reached or answered with a failure.
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Absolute, empty, or escapes the backend root.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Whether the same request could succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Network(_) | Self::BackendError(_))
    }
}
