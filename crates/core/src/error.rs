use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::clock::ClockPosition;

/// Why a `since` clock can no longer be answered incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// A full recrawl happened after the clock was issued.
    Recrawled,
    /// Age-out purged tombstones newer than the clock.
    AgedOut,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::Recrawled => f.write_str("the view was recrawled since it was issued"),
            StaleReason::AgedOut => f.write_str("it predates the retained change history"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    #[error("Access denied: {0}")]
    AccessDenied(PathBuf),

    #[error("Notification source dropped events; a full recrawl is required")]
    Desync,

    #[error("Clock {clock} is stale: {reason}")]
    StaleClock {
        clock: ClockPosition,
        reason: StaleReason,
    },

    #[error("Invalid clock string: {0:?}")]
    InvalidClock(String),

    #[error("Invalid glob pattern {pattern:?}: {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("Path is outside the watched root: {0}")]
    OutsideRoot(PathBuf),

    #[error("Timed out waiting for cookie {0}")]
    CookieTimeout(PathBuf),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ViewError>;

/// Failures reported by a [`FileSystem`](crate::fs::FileSystem) implementation.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    #[error("Access denied: {0}")]
    AccessDenied(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// Classifies an io error observed while touching `path`.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => FsError::AccessDenied(path.to_path_buf()),
            _ => match err.raw_os_error() {
                // ENOTDIR: a path component turned into a file
                Some(20) if cfg!(unix) => FsError::NotFound(path.to_path_buf()),
                _ => FsError::Io {
                    path: path.to_path_buf(),
                    source: err,
                },
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

impl From<FsError> for ViewError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound(path) => ViewError::NotFound(path),
            FsError::AccessDenied(path) => ViewError::AccessDenied(path),
            FsError::Io { source, .. } => ViewError::Io(source),
        }
    }
}
