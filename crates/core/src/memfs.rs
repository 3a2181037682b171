//! An in-memory [`FileSystem`], used to drive the crawler deterministically.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use crate::error::FsError;
use crate::fs::{DirEntry, FileSystem};
use crate::model::{FileKind, FileStat};

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<PathBuf, FileStat>,
    denied: HashSet<PathBuf>,
    generation: u64,
    next_ino: u64,
}

impl MemoryState {
    fn next_stat(&mut self, kind: FileKind, size: u64) -> FileStat {
        self.generation += 1;
        self.next_ino += 1;
        FileStat {
            kind,
            size,
            mtime: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(self.generation)),
            mode: if kind.is_dir() { 0o40755 } else { 0o100644 },
            ino: self.next_ino,
        }
    }

    fn check_access(&self, path: &Path) -> Result<(), FsError> {
        if self.denied.contains(path) {
            return Err(FsError::AccessDenied(path.to_path_buf()));
        }
        Ok(())
    }
}

/// A tree of files held in memory. Every write gets a fresh mtime so
/// consecutive writes always produce distinct fingerprints.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    state: RwLock<MemoryState>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `path` and any missing ancestors as directories.
    pub fn mkdir_all(&self, path: impl AsRef<Path>) {
        let mut state = self.state.write();
        let mut missing: Vec<PathBuf> = path
            .as_ref()
            .ancestors()
            .take_while(|p| !p.as_os_str().is_empty() && !state.entries.contains_key(*p))
            .map(Path::to_path_buf)
            .collect();
        missing.reverse();
        for dir in missing {
            let stat = state.next_stat(FileKind::Dir, 0);
            state.entries.insert(dir, stat);
        }
    }

    /// Creates or overwrites a regular file, creating parent directories.
    pub fn write(&self, path: impl AsRef<Path>, size: u64) {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.mkdir_all(parent);
        }
        let mut state = self.state.write();
        let stat = state.next_stat(FileKind::File, size);
        state.entries.insert(path.to_path_buf(), stat);
    }

    pub fn symlink(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.mkdir_all(parent);
        }
        let mut state = self.state.write();
        let stat = state.next_stat(FileKind::Symlink, 0);
        state.entries.insert(path.to_path_buf(), stat);
    }

    /// Removes `path` and everything below it.
    pub fn remove(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut state = self.state.write();
        state.entries.retain(|p, _| !p.starts_with(path));
    }

    /// Makes stat and listing of `path` fail with `AccessDenied`.
    pub fn deny(&self, path: impl AsRef<Path>) {
        self.state.write().denied.insert(path.as_ref().to_path_buf());
    }

    pub fn allow(&self, path: impl AsRef<Path>) {
        self.state.write().denied.remove(path.as_ref());
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.state.read().entries.contains_key(path.as_ref())
    }
}

impl FileSystem for MemoryFileSystem {
    fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>, FsError> {
        let state = self.state.read();
        state.check_access(path)?;
        match state.entries.get(path) {
            Some(st) if st.kind.is_dir() => {}
            _ => return Err(FsError::NotFound(path.to_path_buf())),
        }
        let children = state
            .entries
            .range::<Path, _>((std::ops::Bound::Excluded(path), std::ops::Bound::Unbounded))
            .take_while(|(p, _)| p.starts_with(path))
            .filter(|(p, _)| p.parent() == Some(path))
            .map(|(p, st)| DirEntry {
                name: p
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                kind: st.kind,
                stat: None,
            })
            .collect();
        Ok(children)
    }

    fn stat(&self, path: &Path) -> Result<FileStat, FsError> {
        let state = self.state.read();
        state.check_access(path)?;
        state
            .entries
            .get(path)
            .copied()
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))
    }

    fn create_marker(&self, path: &Path) -> Result<(), FsError> {
        let mut state = self.state.write();
        match path.parent() {
            Some(parent) if state.entries.contains_key(parent) => {}
            _ => return Err(FsError::NotFound(path.to_path_buf())),
        }
        let stat = state.next_stat(FileKind::File, 0);
        state.entries.insert(path.to_path_buf(), stat);
        Ok(())
    }

    fn remove_marker(&self, path: &Path) -> Result<(), FsError> {
        self.state
            .write()
            .entries
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn listing_returns_direct_children_only() {
        let fs = MemoryFileSystem::new();
        fs.write("/r/a.txt", 1);
        fs.write("/r/sub/b.txt", 2);
        fs.write("/r/sub2", 3);
        let mut names: Vec<String> = fs
            .list_directory(Path::new("/r"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "sub", "sub2"]);
    }

    #[test]
    fn rewrites_change_the_fingerprint() {
        let fs = MemoryFileSystem::new();
        fs.write("/r/a", 1);
        let first = fs.stat(Path::new("/r/a")).unwrap();
        fs.write("/r/a", 1);
        assert_ne!(first, fs.stat(Path::new("/r/a")).unwrap());
    }

    #[test]
    fn denied_and_missing_paths_fail() {
        let fs = MemoryFileSystem::new();
        fs.mkdir_all("/r/locked");
        fs.deny("/r/locked");
        assert!(matches!(
            fs.list_directory(Path::new("/r/locked")),
            Err(FsError::AccessDenied(_))
        ));
        assert!(fs.stat(Path::new("/r/missing")).unwrap_err().is_not_found());
    }
}
