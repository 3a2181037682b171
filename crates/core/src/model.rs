use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Stable handle of a file node inside the tree store arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub(crate) u32);

/// Stable handle of a directory node inside the tree store arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirId(pub(crate) u32);

impl FileId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl DirId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl FileKind {
    pub fn is_dir(self) -> bool {
        matches!(self, FileKind::Dir)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Dir => "dir",
            FileKind::Symlink => "symlink",
            FileKind::Other => "other",
        }
    }
}

impl From<std::fs::FileType> for FileKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            FileKind::Dir
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        }
    }
}

/// What a stat of a path returned; two stats that compare equal mean the
/// entry did not change as far as the view is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub mode: u32,
    pub ino: u64,
}

impl FileStat {
    pub fn from_metadata(md: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let (mode, ino) = {
            use std::os::unix::fs::MetadataExt;
            (md.mode(), md.ino())
        };
        #[cfg(not(unix))]
        let (mode, ino) = (0u32, 0u64);
        Self {
            kind: md.file_type().into(),
            size: md.len(),
            mtime: md.modified().ok(),
            mode,
            ino,
        }
    }
}

/// When a node last changed: the tick and the wall-clock time the change
/// was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeTime {
    pub ticks: u32,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Links {
    pub prev: Option<FileId>,
    pub next: Option<FileId>,
}

/// One filesystem entry as last observed.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub name: String,
    pub parent: DirId,
    /// Last change.
    pub otime: ChangeTime,
    /// First time this node was observed to exist.
    pub ctime: ChangeTime,
    pub exists: bool,
    pub stat: Option<FileStat>,
    pub(crate) suffix: Option<String>,
    pub(crate) in_suffix_list: bool,
    pub(crate) recency: Links,
    pub(crate) suffix_links: Links,
}

impl FileNode {
    pub fn kind(&self) -> Option<FileKind> {
        self.stat.map(|st| st.kind)
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }
}

/// One directory of the watched tree.
#[derive(Debug, Clone)]
pub struct DirNode {
    pub name: String,
    pub path: PathBuf,
    pub parent: Option<DirId>,
    pub files: HashMap<String, FileId>,
    pub dirs: HashMap<String, DirId>,
    /// False once the directory has been marked deleted.
    pub exists: bool,
    pub last_crawl: Option<SystemTime>,
}

impl DirNode {
    pub(crate) fn new(name: String, path: PathBuf, parent: Option<DirId>) -> Self {
        Self {
            name,
            path,
            parent,
            files: HashMap::new(),
            dirs: HashMap::new(),
            exists: true,
            last_crawl: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

/// Lowercased text after the last `.` of a file name, if any.
pub fn name_suffix(name: &str) -> Option<String> {
    match name.rsplit_once('.') {
        Some((_, suffix)) if !suffix.is_empty() => Some(suffix.to_ascii_lowercase()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes_are_lowercased_and_optional() {
        assert_eq!(name_suffix("main.C").as_deref(), Some("c"));
        assert_eq!(name_suffix("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(name_suffix(".bashrc").as_deref(), Some("bashrc"));
        assert_eq!(name_suffix("Makefile"), None);
        assert_eq!(name_suffix("trailing."), None);
    }
}
