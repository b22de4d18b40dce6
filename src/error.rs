use std::io;
use std::path::PathBuf;

/// Errors raised while putting dual-role ports into host mode.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid node name '{node}': {reason}")]
    InvalidArgument { node: String, reason: &'static str },

    #[error("failed to open file '{path}': {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write 'host' into file '{path}': {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("written bytes unexpected for file '{path}': {written} instead of 4")]
    ShortWrite { path: String, written: usize },

    #[error("failed to close '{path}': {source}")]
    CloseFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to enumerate '{}': {source}", path.display())]
    EnumerationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open base directory '{}': {source}", path.display())]
    InvalidState {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// True when a mode file could not be opened because it does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::OpenFailed { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
