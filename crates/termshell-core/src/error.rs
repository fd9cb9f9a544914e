use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Invalid environment entry (expected KEY=VALUE): {0:?}")]
    InvalidEnvironment(String),

    #[error("Failed to launch shell: {0}")]
    LaunchFailed(String),

    #[error("Launch cancelled")]
    Cancelled,

    #[error("Invalid capability request: {0}")]
    InvalidCapability(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShellError {
    /// Wrap a transport failure that happened while opening a channel.
    ///
    /// Cancellation keeps its identity; every other failure becomes
    /// `LaunchFailed` with the transport's message verbatim.
    pub fn from_launch(err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => ShellError::Cancelled,
            other => ShellError::LaunchFailed(other.to_string()),
        }
    }

    /// Wrap a transport failure on an already established session.
    pub fn from_io(err: TransportError) -> Self {
        match err {
            TransportError::Closed => ShellError::SessionClosed,
            TransportError::Io(e) => ShellError::Io(e),
            other => ShellError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShellError>;
