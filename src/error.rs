use std::path::PathBuf;
use thiserror::Error;

/// Why the remote transport went away mid-job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCause {
    /// Socket-level failure (reset, broken pipe, ...)
    Socket(String),
    /// HTTP/2 protocol-level failure (GOAWAY with error, bad frame, ...)
    Protocol(String),
    /// Peer closed the connection while the job was still running
    Closed,
    /// No bytes moved in either direction for longer than the idle timeout
    IdleTimeout,
}

impl TransportCause {
    /// Classify an h2 stream or connection error.
    pub fn from_h2(err: &h2::Error) -> Self {
        if let Some(io) = err.get_io() {
            TransportCause::Socket(io.to_string())
        } else if err.is_go_away() && err.reason() == Some(h2::Reason::NO_ERROR) {
            TransportCause::Closed
        } else {
            TransportCause::Protocol(err.to_string())
        }
    }
}

impl std::fmt::Display for TransportCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportCause::Socket(msg) => write!(f, "socket error: {}", msg),
            TransportCause::Protocol(msg) => write!(f, "protocol error: {}", msg),
            TransportCause::Closed => write!(f, "connection closed by remote"),
            TransportCause::IdleTimeout => write!(f, "connection idle timeout"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Failed to connect to {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Transport failure: {0}")]
    Transport(TransportCause),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Unexpected server response: {0}")]
    Protocol(String),

    #[error("Remote build failed: {0}")]
    JobFailed(String),

    #[error("Build request rejected by server: {0}")]
    Validation(String),

    #[error("Server returned HTTP status {status} for {path}")]
    HttpStatus { status: u16, path: String },

    #[error("I/O error at {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    pub fn connection(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BuildError::Connection {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::FileIo {
            path: path.into(),
            source,
        }
    }

    /// True for the local filesystem classes (`Io`, `FileIo`).
    pub fn is_io(&self) -> bool {
        matches!(self, BuildError::Io(_) | BuildError::FileIo { .. })
    }
}

// Stream resets and IO failures both mean the session can no longer be trusted.
impl From<h2::Error> for BuildError {
    fn from(err: h2::Error) -> Self {
        BuildError::Transport(TransportCause::from_h2(&err))
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
