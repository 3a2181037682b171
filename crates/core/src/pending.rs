use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

use crate::fs::DirEntry;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PendingFlags: u8 {
        /// Re-crawl the whole subtree below the path.
        const RECURSIVE = 0b001;
        /// Reported by the notification source.
        const VIA_NOTIFY = 0b010;
        /// Synthesised by the crawler: list the directory instead of
        /// stat-ing the path.
        const CRAWL_ONLY = 0b100;
    }
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub path: PathBuf,
    pub now: SystemTime,
    pub flags: PendingFlags,
    /// Listing entry obtained while crawling the parent, saving a stat.
    pub pre_stat: Option<DirEntry>,
}

#[derive(Debug, Default)]
struct PendingState {
    entries: BTreeMap<PathBuf, PendingEntry>,
    pinged: bool,
}

impl PendingState {
    fn covering_ancestor(&self, path: &Path) -> bool {
        path.ancestors().skip(1).any(|ancestor| {
            self.entries
                .get(ancestor)
                .is_some_and(|e| e.flags.contains(PendingFlags::RECURSIVE))
        })
    }

    fn drop_descendants(&mut self, path: &Path) {
        let descendants: Vec<PathBuf> = self
            .entries
            .range::<Path, _>((std::ops::Bound::Excluded(path), std::ops::Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(path))
            .cloned()
            .collect();
        for key in descendants {
            self.entries.remove(&key);
        }
    }

    fn insert(&mut self, entry: PendingEntry) -> bool {
        if self.covering_ancestor(&entry.path) {
            return false;
        }
        if entry.flags.contains(PendingFlags::RECURSIVE) {
            self.drop_descendants(&entry.path);
        }
        match self.entries.get_mut(&entry.path) {
            Some(existing) => {
                existing.flags |= entry.flags;
                existing.now = existing.now.max(entry.now);
                if entry.pre_stat.is_some() {
                    existing.pre_stat = entry.pre_stat;
                }
                false
            }
            None => {
                self.entries.insert(entry.path.clone(), entry);
                true
            }
        }
    }
}

/// The pending queue. Its lock is independent of the tree store lock.
#[derive(Debug, Default)]
pub struct PendingCollection {
    state: Mutex<PendingState>,
    cond: Condvar,
}

impl PendingCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `path`, coalescing with an existing entry. Returns true if a
    /// new entry was created.
    pub fn add(&self, path: impl Into<PathBuf>, now: SystemTime, flags: PendingFlags) -> bool {
        self.add_entry(PendingEntry {
            path: path.into(),
            now,
            flags,
            pre_stat: None,
        })
    }

    /// Like [`add`](Self::add), attaching a listing entry for the path.
    pub fn add_at(
        &self,
        path: impl Into<PathBuf>,
        now: SystemTime,
        flags: PendingFlags,
        pre_stat: DirEntry,
    ) -> bool {
        self.add_entry(PendingEntry {
            path: path.into(),
            now,
            flags,
            pre_stat: Some(pre_stat),
        })
    }

    pub fn add_entry(&self, entry: PendingEntry) -> bool {
        self.state.lock().insert(entry)
    }

    /// Moves every entry of `other` into this queue under the same
    /// coalescing rules.
    pub fn append(&self, other: &PendingCollection) {
        let drained = other.drain();
        if drained.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for entry in drained {
            state.insert(entry);
        }
    }

    /// Atomically takes every queued entry, in path order.
    pub fn drain(&self) -> Vec<PendingEntry> {
        let entries = std::mem::take(&mut self.state.lock().entries);
        entries.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Wakes a waiter even when nothing is queued.
    pub fn ping(&self) {
        self.state.lock().pinged = true;
        self.cond.notify_all();
    }

    /// Blocks until an entry is queued, [`ping`](Self::ping) is called, or
    /// `timeout` passes. Returns true unless it timed out with nothing to do.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.entries.is_empty() && !state.pinged {
            let _ = self
                .cond
                .wait_while_for(&mut state, |s| s.entries.is_empty() && !s.pinged, timeout);
        }
        let woke = !state.entries.is_empty() || state.pinged;
        state.pinged = false;
        woke
    }

    /// Wakes waiters after entries were added.
    pub fn notify(&self) {
        self.cond.notify_all();
    }
}
