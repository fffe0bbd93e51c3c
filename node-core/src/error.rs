//! Error taxonomy shared by the update pipeline and the connectivity stack.

use std::io;

use crate::installer::InstallPhase;

/// Remote endpoint could not be reached or refused the request.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("{url} rejected credentials (HTTP {status})")]
    Unauthorized { url: String, status: u16 },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("reading response from {url} failed: {source}")]
    Body {
        url: String,
        #[source]
        source: io::Error,
    },
}

impl NetworkError {
    pub fn transport(url: &str, reason: impl Into<String>) -> Self {
        Self::Transport {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Maps a non-success HTTP status to the matching variant.
    pub fn from_status(url: &str, status: u16) -> Self {
        match status {
            401 | 403 => Self::Unauthorized {
                url: url.to_string(),
                status,
            },
            _ => Self::Status {
                url: url.to_string(),
                status,
            },
        }
    }
}

/// Payload did not have the expected shape.
#[derive(Debug, thiserror::Error)]
#[error("unexpected payload from {context}: {reason}")]
pub struct ParseError {
    pub context: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(context: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            context: context.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("filesystem full while writing {0}")]
    Full(String),
    #[error("rename {from} -> {to} not supported by the storage driver")]
    RenameUnsupported { from: String, to: String },
    #[error("storage operation on {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Classifies an `io::Error` raised while operating on `path`.
    pub fn from_io(path: &str, err: io::Error) -> Self {
        // ENOSPC (28) and EXDEV (18) have no stable ErrorKind yet.
        match (err.kind(), err.raw_os_error()) {
            (io::ErrorKind::NotFound, _) => Self::NotFound(path.to_string()),
            (_, Some(28)) => Self::Full(path.to_string()),
            _ => Self::Io {
                path: path.to_string(),
                source: err,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Radio driver failures. `Busy` is transient and retried by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("radio busy")]
    Busy,
    #[error("radio interface not started")]
    NotStarted,
    #[error("radio driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing ssid/password")]
    MissingCredentials,
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("credential store unavailable: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("timer {0} unavailable")]
    Unavailable(i32),
    #[error("watchdog could not be armed: {0}")]
    Watchdog(String),
}

/// Any failure on the fetch side of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Staged file does not match what was downloaded.
#[derive(Debug, thiserror::Error)]
#[error("staged file {path} failed verification: {reason}")]
pub struct VerifyError {
    pub path: String,
    pub reason: String,
}

/// Storage failure while swapping the staged tree into place.
///
/// This is the one error the installer does not absorb: depending on
/// `rolled_back` the install root may be missing or partially written.
#[derive(Debug, thiserror::Error)]
#[error("swap failed during {phase:?} (rolled back: {rolled_back}): {source}")]
pub struct SwapError {
    pub phase: InstallPhase,
    pub rolled_back: bool,
    #[source]
    pub source: StorageError,
}
