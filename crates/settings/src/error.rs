use derive_more::{Display, Error};
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("settings dictionary \"{_0}\" is not valid JSON")]
    InvalidJson(#[error(not(source))] String),
    #[display("settings dictionary \"{_0}\" must be a JSON object")]
    NotAnObject(#[error(not(source))] String),
    #[display("could not read settings file: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    #[display("setting \"{_0}\" has an unexpected type")]
    WrongType(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
