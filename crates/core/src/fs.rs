use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::FsError;
use crate::model::{FileKind, FileStat};

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
    /// Present when the listing already carried full metadata.
    pub stat: Option<FileStat>,
}

pub trait FileSystem: Send + Sync {
    /// Lists the direct children of `path`.
    fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>, FsError>;

    /// Stats `path` without following a trailing symlink.
    fn stat(&self, path: &Path) -> Result<FileStat, FsError>;

    /// Creates an empty marker file; used for cookie synchronisation.
    fn create_marker(&self, path: &Path) -> Result<(), FsError>;

    fn remove_marker(&self, path: &Path) -> Result<(), FsError>;
}

/// [`FileSystem`] backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>, FsError> {
        // Surface NotFound/AccessDenied on the directory itself rather than
        // an empty listing.
        std::fs::symlink_metadata(path).map_err(|e| FsError::from_io(path, e))?;

        let mut entries = Vec::new();
        for entry in WalkDir::new(path)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => {
                    let io = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory loop"));
                    return Err(FsError::from_io(path, io));
                }
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let stat = entry.metadata().ok().map(|md| FileStat::from_metadata(&md));
            entries.push(DirEntry {
                name,
                kind: entry.file_type().into(),
                stat,
            });
        }
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> Result<FileStat, FsError> {
        std::fs::symlink_metadata(path)
            .map(|md| FileStat::from_metadata(&md))
            .map_err(|e| FsError::from_io(path, e))
    }

    fn create_marker(&self, path: &Path) -> Result<(), FsError> {
        std::fs::write(path, b"").map_err(|e| FsError::from_io(path, e))
    }

    fn remove_marker(&self, path: &Path) -> Result<(), FsError> {
        std::fs::remove_file(path).map_err(|e| FsError::from_io(path, e))
    }
}
