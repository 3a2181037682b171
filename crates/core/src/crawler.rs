use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::clock::ClockPosition;
use crate::error::FsError;
use crate::fs::DirEntry;
use crate::model::{FileId, FileStat};
use crate::pending::{PendingEntry, PendingFlags};
use crate::store::TreeStore;
use crate::view::InMemoryView;

/// What a completed full crawl left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSummary {
    pub clock: ClockPosition,
    pub files: usize,
    pub dirs: usize,
    pub elapsed: Duration,
}

fn crawl_flags(recursive: bool) -> PendingFlags {
    if recursive {
        PendingFlags::CRAWL_ONLY | PendingFlags::RECURSIVE
    } else {
        PendingFlags::CRAWL_ONLY
    }
}

fn split_path(path: &Path) -> Option<(&Path, &str)> {
    Some((path.parent()?, path.file_name()?.to_str()?))
}

/// The outermost directory on the way from the root to `dir_path` that the
/// view does not hold as a live directory.
fn untracked_ancestor(store: &TreeStore, root: &Path, dir_path: &Path) -> Option<PathBuf> {
    let rel = dir_path.strip_prefix(root).ok()?;
    let mut dir = store.root_dir();
    let mut cur = root.to_path_buf();
    for part in rel.components() {
        let Component::Normal(name) = part else {
            return None;
        };
        let name = name.to_str()?;
        cur.push(name);
        match store.child_dir(dir, name) {
            Some(child) if store[child].exists => dir = child,
            _ => return Some(cur),
        }
    }
    None
}

impl InMemoryView {
    /// Applies every queued entry, including entries queued while doing so.
    /// With `pull_from_root`, entries reported by the notification thread
    /// are moved in first. Returns whether anything was processed.
    pub fn process_pending(&self, pull_from_root: bool) -> bool {
        if pull_from_root {
            self.crawl_queue.append(&self.pending);
        }
        let mut cookies = Vec::new();
        let mut processed = 0usize;
        loop {
            let batch = self.crawl_queue.drain();
            if batch.is_empty() {
                break;
            }
            processed += batch.len();
            for entry in batch {
                self.process_path(entry, &mut cookies);
            }
        }
        // Released only now, so that everything drained alongside a cookie
        // is visible to whoever waits on it.
        for cookie in &cookies {
            self.cookies.notify_observed(cookie);
        }
        if processed > 0 {
            debug!(entries = processed, "processed pending entries");
        }
        processed > 0
    }

    fn process_path(&self, entry: PendingEntry, cookies: &mut Vec<PathBuf>) {
        let path = entry.path.as_path();
        if !path.starts_with(&self.root_path) {
            debug!(path = %path.display(), "ignoring path outside the root");
            return;
        }
        if self.cookies.is_cookie(path) {
            cookies.push(entry.path);
            return;
        }
        if self.ignore.is_ignored(path) || self.ignore.is_vcs_contents(path) {
            return;
        }
        if path == self.root_path || entry.flags.contains(PendingFlags::CRAWL_ONLY) {
            let recursive = entry.flags.contains(PendingFlags::RECURSIVE);
            self.crawl_dir(path, entry.now, recursive, cookies);
        } else {
            self.stat_path(entry);
        }
    }

    fn stat_path(&self, entry: PendingEntry) {
        let PendingEntry {
            path,
            now,
            flags,
            pre_stat,
        } = entry;
        let Some((parent, name)) = split_path(&path) else {
            return;
        };
        let stat = match pre_stat.and_then(|e| e.stat) {
            Some(stat) => Ok(stat),
            None => self.fs.stat(&path),
        };

        let stat = match stat {
            Ok(stat) => stat,
            Err(FsError::NotFound(_)) => {
                let mut store = self.store.write();
                let Some(dir) = store.resolve_dir(parent) else {
                    return;
                };
                if let Some(file) = store.child_file(dir, name) {
                    store.mark_file_deleted(file, now);
                }
                if let Some(child) = store.child_dir(dir, name) {
                    if store[child].exists {
                        store.mark_dir_deleted(child, now, true);
                    }
                }
                return;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "stat failed; keeping previous state");
                return;
            }
        };

        let mut store = self.store.write();
        let untracked = untracked_ancestor(&store, &self.root_path, parent);
        let dir = match store.resolve_dir_create(parent) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot place path in the view");
                return;
            }
        };
        let file = store.get_or_create_file(dir, name, now);
        store.observe_file(file, stat, now);

        let child = store.child_dir(dir, name);
        let crawl = if stat.kind.is_dir() {
            let known = child.is_some_and(|d| store[d].exists);
            if self.ignore.is_vcs_dir(&path) {
                None
            } else if !known || flags.contains(PendingFlags::RECURSIVE) {
                Some(true)
            } else if flags.contains(PendingFlags::VIA_NOTIFY) {
                Some(false)
            } else {
                None
            }
        } else {
            if let Some(child) = child.filter(|&d| store[d].exists) {
                store.mark_dir_deleted(child, now, true);
            }
            None
        };
        drop(store);

        if let Some(ancestor) = untracked {
            // Showed up without an event of its own; stat it and crawl
            // whatever else it holds.
            self.crawl_queue.add(ancestor, now, PendingFlags::RECURSIVE);
        }
        if let Some(recursive) = crawl {
            self.crawl_queue.add(path.clone(), now, crawl_flags(recursive));
        }
    }

    fn crawl_dir(&self, path: &Path, now: SystemTime, recursive: bool, cookies: &mut Vec<PathBuf>) {
        if self.ignore.is_ignored(path) {
            return;
        }
        let listing = match self.fs.list_directory(path) {
            Ok(listing) => listing,
            Err(FsError::NotFound(_)) => {
                self.mark_missing_dir(path, now);
                return;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot list directory; keeping previous state");
                return;
            }
        };

        let mut entries: Vec<DirEntry> = Vec::with_capacity(listing.len());
        for entry in listing {
            let child = path.join(&entry.name);
            if self.cookies.is_cookie(&child) {
                cookies.push(child);
            } else if !self.ignore.is_ignored(&child) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let stats: Vec<(DirEntry, Result<FileStat, FsError>)> = entries
            .into_par_iter()
            .map(|entry| {
                let stat = match entry.stat {
                    Some(stat) => Ok(stat),
                    None => self.fs.stat(&path.join(&entry.name)),
                };
                (entry, stat)
            })
            .collect();

        let mut store = self.store.write();
        let dir = match store.resolve_dir_create(path) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot place directory in the view");
                return;
            }
        };
        store[dir].last_crawl = Some(now);

        let mut seen = HashSet::with_capacity(stats.len());
        let mut subdirs = Vec::new();
        for (entry, stat) in stats {
            let stat = match stat {
                Ok(stat) => stat,
                // Gone between listing and stat: handled as missing below.
                Err(FsError::NotFound(_)) => continue,
                Err(err) => {
                    warn!(path = %path.join(&entry.name).display(), error = %err, "stat failed; keeping previous state");
                    seen.insert(entry.name);
                    continue;
                }
            };
            let file = store.get_or_create_file(dir, &entry.name, now);
            store.observe_file(file, stat, now);

            let child_path = path.join(&entry.name);
            let child = store.child_dir(dir, &entry.name);
            if stat.kind.is_dir() {
                let known = child.is_some_and(|d| store[d].exists);
                if !self.ignore.is_vcs_dir(&child_path) && (recursive || !known) {
                    subdirs.push(child_path);
                }
            } else if let Some(child) = child.filter(|&d| store[d].exists) {
                store.mark_dir_deleted(child, now, true);
            }
            seen.insert(entry.name);
        }

        let mut missing_files: Vec<(String, FileId)> = store[dir]
            .files
            .iter()
            .filter(|(name, _)| !seen.contains(*name))
            .map(|(name, &id)| (name.clone(), id))
            .collect();
        missing_files.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, file) in missing_files {
            store.mark_file_deleted(file, now);
            if let Some(child) = store.child_dir(dir, &name) {
                if store[child].exists {
                    store.mark_dir_deleted(child, now, true);
                }
            }
        }
        drop(store);

        for sub in subdirs {
            self.crawl_queue.add(sub, now, crawl_flags(true));
        }
    }

    /// A directory that could not be listed because it is gone.
    fn mark_missing_dir(&self, path: &Path, now: SystemTime) {
        let mut store = self.store.write();
        if let Some(dir) = store.resolve_dir(path) {
            store.mark_dir_deleted(dir, now, true);
        }
        if let Some((parent, name)) = split_path(path) {
            let entry = store
                .resolve_dir(parent)
                .and_then(|dir| store.child_file(dir, name));
            if let Some(file) = entry {
                store.mark_file_deleted(file, now);
            }
        }
    }

    /// Crawls the whole root, then bumps the root number and resolves the
    /// readiness signal.
    pub fn full_crawl(&self) -> CrawlSummary {
        let start = Instant::now();
        self.readiness.reset();
        info!(root = %self.root_path.display(), "starting full crawl");

        self.crawl_queue.add(
            self.root_path.clone(),
            SystemTime::now(),
            crawl_flags(true),
        );
        self.process_pending(true);

        let summary = {
            let mut store = self.store.write();
            let root_number = store.bump_root_number();
            CrawlSummary {
                clock: ClockPosition::new(root_number, store.most_recent_tick()),
                files: store.file_count(),
                dirs: store.dir_count(),
                elapsed: start.elapsed(),
            }
        };
        self.readiness.mark_ready();
        info!(
            clock = %summary.clock,
            files = summary.files,
            dirs = summary.dirs,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "full crawl complete"
        );
        summary
    }

    /// A synchronous full crawl for one-shot use without background threads.
    pub fn client_mode_crawl(&self) -> CrawlSummary {
        self.full_crawl()
    }
}
