use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not connect to storage account \"{_0}\"")]
    Account(#[error(not(source))] String),
    #[display("storage account \"{_0}\" needs stow to be built with the `s3` feature")]
    S3Disabled(#[error(not(source))] String),
    #[display("could not load settings")]
    Settings,
    #[display("{_0}")]
    Workspace(#[error(not(source))] String),
    #[display("resource \"{_0}\" not found")]
    NotFound(#[error(not(source))] String),
    #[display("could not write output")]
    Output,
}

impl ErrorKind {
    #[track_caller]
    pub fn workspace(err: stow_workspace::error::Error) -> Error {
        let message = (*err).to_string();
        err.raise(ErrorKind::Workspace(message))
    }
}
