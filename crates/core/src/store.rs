use std::collections::HashMap;
use std::ops::{Index, IndexMut};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::clock::ClockPosition;
use crate::error::{Result, ViewError};
use crate::model::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgeOutStats {
    pub files_purged: usize,
    pub dirs_purged: usize,
}

/// Arena-backed tree of the watched root. Does no locking of its own.
#[derive(Debug)]
pub struct TreeStore {
    root_path: PathBuf,
    files: Vec<Option<FileNode>>,
    free_files: Vec<FileId>,
    dirs: Vec<Option<DirNode>>,
    free_dirs: Vec<DirId>,
    root_dir: DirId,
    /// Head of the recency list.
    latest_file: Option<FileId>,
    /// Tail of the recency list.
    oldest_file: Option<FileId>,
    suffixes: HashMap<String, FileId>,
    most_recent_tick: u32,
    root_number: u32,
    last_age_out_tick: u32,
    last_age_out_timestamp: Option<SystemTime>,
}

impl Index<FileId> for TreeStore {
    type Output = FileNode;

    fn index(&self, id: FileId) -> &FileNode {
        match self.files.get(id.index()) {
            Some(Some(file)) => file,
            _ => panic!("stale file handle {id:?}"),
        }
    }
}

impl IndexMut<FileId> for TreeStore {
    fn index_mut(&mut self, id: FileId) -> &mut FileNode {
        match self.files.get_mut(id.index()) {
            Some(Some(file)) => file,
            _ => panic!("stale file handle {id:?}"),
        }
    }
}

impl Index<DirId> for TreeStore {
    type Output = DirNode;

    fn index(&self, id: DirId) -> &DirNode {
        match self.dirs.get(id.index()) {
            Some(Some(dir)) => dir,
            _ => panic!("stale dir handle {id:?}"),
        }
    }
}

impl IndexMut<DirId> for TreeStore {
    fn index_mut(&mut self, id: DirId) -> &mut DirNode {
        match self.dirs.get_mut(id.index()) {
            Some(Some(dir)) => dir,
            _ => panic!("stale dir handle {id:?}"),
        }
    }
}

impl TreeStore {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        let root_path = root_path.into();
        let name = root_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let root = DirNode::new(name, root_path.clone(), None);
        Self {
            root_path,
            files: Vec::with_capacity(1024),
            free_files: Vec::new(),
            dirs: vec![Some(root)],
            free_dirs: Vec::new(),
            root_dir: DirId(0),
            latest_file: None,
            oldest_file: None,
            suffixes: HashMap::new(),
            most_recent_tick: 0,
            root_number: 0,
            last_age_out_tick: 0,
            last_age_out_timestamp: None,
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn root_dir(&self) -> DirId {
        self.root_dir
    }

    pub fn most_recent_tick(&self) -> u32 {
        self.most_recent_tick
    }

    pub fn root_number(&self) -> u32 {
        self.root_number
    }

    pub fn clock(&self) -> ClockPosition {
        ClockPosition::new(self.root_number, self.most_recent_tick)
    }

    pub fn last_age_out_tick(&self) -> u32 {
        self.last_age_out_tick
    }

    pub fn last_age_out_timestamp(&self) -> Option<SystemTime> {
        self.last_age_out_timestamp
    }

    /// Invalidates every clock issued so far.
    pub(crate) fn bump_root_number(&mut self) -> u32 {
        self.root_number = self.root_number.wrapping_add(1);
        self.root_number
    }

    pub fn get_file(&self, id: FileId) -> Option<&FileNode> {
        self.files.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_dir(&self, id: DirId) -> Option<&DirNode> {
        self.dirs.get(id.index()).and_then(Option::as_ref)
    }

    /// Number of file nodes held, tombstones included.
    pub fn file_count(&self) -> usize {
        self.files.len() - self.free_files.len()
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.len() - self.free_dirs.len()
    }

    pub fn file_path(&self, id: FileId) -> PathBuf {
        let file = &self[id];
        self[file.parent].path.join(&file.name)
    }

    /// Path of `id` relative to the root, `/` separated.
    pub fn relative_path(&self, id: FileId) -> String {
        let file = &self[id];
        let dir = &self[file.parent];
        match dir.path.strip_prefix(&self.root_path) {
            Ok(rel) if rel.as_os_str().is_empty() => file.name.clone(),
            Ok(rel) => format!("{}/{}", rel.to_string_lossy().replace('\\', "/"), file.name),
            Err(_) => file.name.clone(),
        }
    }

    pub fn child_file(&self, dir: DirId, name: &str) -> Option<FileId> {
        self[dir].files.get(name).copied()
    }

    pub fn child_dir(&self, dir: DirId, name: &str) -> Option<DirId> {
        self[dir].dirs.get(name).copied()
    }

    fn relative_components<'p>(&self, path: &'p Path) -> Result<Vec<&'p str>> {
        let rel = path
            .strip_prefix(&self.root_path)
            .map_err(|_| ViewError::OutsideRoot(path.to_path_buf()))?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => match part.to_str() {
                    Some(part) => parts.push(part),
                    None => return Err(ViewError::OutsideRoot(path.to_path_buf())),
                },
                Component::CurDir => {}
                _ => return Err(ViewError::OutsideRoot(path.to_path_buf())),
            }
        }
        Ok(parts)
    }

    /// Walks `path` from the root. Returns `None` if any component is not
    /// tracked.
    pub fn resolve_dir(&self, path: &Path) -> Option<DirId> {
        let parts = self.relative_components(path).ok()?;
        let mut dir = self.root_dir;
        for part in parts {
            dir = self.child_dir(dir, part)?;
        }
        Some(dir)
    }

    /// Walks `path` from the root, creating missing directories. Existing
    /// directories along the way are revived, since a caller that asks for
    /// creation has just observed the path on disk.
    pub fn resolve_dir_create(&mut self, path: &Path) -> Result<DirId> {
        let parts: Vec<String> = self
            .relative_components(path)?
            .into_iter()
            .map(str::to_owned)
            .collect();
        let mut dir = self.root_dir;
        self[dir].exists = true;
        for part in parts {
            dir = self.ensure_child_dir(dir, &part);
        }
        Ok(dir)
    }

    /// Returns the live child directory `name` of `parent`, creating it or
    /// reviving a deleted one.
    pub(crate) fn ensure_child_dir(&mut self, parent: DirId, name: &str) -> DirId {
        if let Some(child) = self.child_dir(parent, name) {
            self[child].exists = true;
            return child;
        }
        let path = self[parent].path.join(name);
        let node = DirNode::new(name.to_string(), path, Some(parent));
        let id = match self.free_dirs.pop() {
            Some(id) => {
                self.dirs[id.index()] = Some(node);
                id
            }
            None => {
                self.dirs.push(Some(node));
                DirId((self.dirs.len() - 1) as u32)
            }
        };
        self[parent].dirs.insert(name.to_string(), id);
        id
    }

    /// Returns the child file `name`, creating a node stamped with the
    /// current tick. A new node is not on any list until it is first marked
    /// changed.
    pub fn get_or_create_file(&mut self, dir: DirId, name: &str, now: SystemTime) -> FileId {
        if let Some(id) = self.child_file(dir, name) {
            return id;
        }
        let stamp = ChangeTime {
            ticks: self.most_recent_tick,
            timestamp: now,
        };
        let node = FileNode {
            name: name.to_string(),
            parent: dir,
            otime: stamp,
            ctime: stamp,
            exists: false,
            stat: None,
            suffix: name_suffix(name),
            in_suffix_list: false,
            recency: Links::default(),
            suffix_links: Links::default(),
        };
        let id = match self.free_files.pop() {
            Some(id) => {
                self.files[id.index()] = Some(node);
                id
            }
            None => {
                self.files.push(Some(node));
                FileId((self.files.len() - 1) as u32)
            }
        };
        self[dir].files.insert(name.to_string(), id);
        id
    }

    /// Bumps the tick, stamps `id` with it and moves it to the front of the
    /// recency list. The stamped time never goes below the current head's,
    /// so timestamps descend along the list together with ticks.
    pub fn mark_file_changed(&mut self, id: FileId, now: SystemTime) {
        self.most_recent_tick = self.most_recent_tick.wrapping_add(1);
        let tick = self.most_recent_tick;
        let timestamp = match self.latest_file {
            Some(head) => now.max(self[head].otime.timestamp),
            None => now,
        };
        self[id].otime = ChangeTime {
            ticks: tick,
            timestamp,
        };

        if self.latest_file != Some(id) {
            self.unlink_recency(id);
            let old_head = self.latest_file;
            self[id].recency = Links {
                prev: None,
                next: old_head,
            };
            match old_head {
                Some(head) => self[head].recency.prev = Some(id),
                None => self.oldest_file = Some(id),
            }
            self.latest_file = Some(id);
        }

        if !self[id].in_suffix_list {
            if let Some(suffix) = self[id].suffix.clone() {
                let old_head = self.suffixes.insert(suffix, id);
                self[id].suffix_links = Links {
                    prev: None,
                    next: old_head,
                };
                if let Some(head) = old_head {
                    self[head].suffix_links.prev = Some(id);
                }
                self[id].in_suffix_list = true;
            }
        }
    }

    fn is_on_recency_list(&self, id: FileId) -> bool {
        self.latest_file == Some(id) || self[id].recency.prev.is_some()
    }

    fn unlink_recency(&mut self, id: FileId) {
        if !self.is_on_recency_list(id) {
            return;
        }
        let Links { prev, next } = self[id].recency;
        match prev {
            Some(prev) => self[prev].recency.next = next,
            None => self.latest_file = next,
        }
        match next {
            Some(next) => self[next].recency.prev = prev,
            None => self.oldest_file = prev,
        }
        self[id].recency = Links::default();
    }

    fn unlink_suffix(&mut self, id: FileId) {
        if !self[id].in_suffix_list {
            return;
        }
        let Links { prev, next } = self[id].suffix_links;
        match prev {
            Some(prev) => self[prev].suffix_links.next = next,
            None => {
                if let Some(suffix) = self[id].suffix.clone() {
                    match next {
                        Some(next) => {
                            self.suffixes.insert(suffix, next);
                        }
                        None => {
                            self.suffixes.remove(&suffix);
                        }
                    }
                }
            }
        }
        if let Some(next) = next {
            self[next].suffix_links.prev = prev;
        }
        let file = &mut self[id];
        file.suffix_links = Links::default();
        file.in_suffix_list = false;
    }

    /// Applies a successful stat of `id`. The node is marked changed when it
    /// did not exist before or its fingerprint differs; returns whether it
    /// was.
    pub fn observe_file(&mut self, id: FileId, stat: FileStat, now: SystemTime) -> bool {
        let file = &self[id];
        if file.exists && file.stat == Some(stat) {
            return false;
        }
        let created = !file.exists;
        let file = &mut self[id];
        file.exists = true;
        file.stat = Some(stat);
        self.mark_file_changed(id, now);
        if created {
            let file = &mut self[id];
            file.ctime = file.otime;
        }
        true
    }

    /// Marks `id` deleted at a fresh tick. No-op for tombstones.
    pub fn mark_file_deleted(&mut self, id: FileId, now: SystemTime) -> bool {
        if !self[id].exists {
            return false;
        }
        self[id].exists = false;
        self.mark_file_changed(id, now);
        true
    }

    /// Marks `dir` and its direct children deleted. With `recursive`, child
    /// directories are processed depth-first and those left with no entries
    /// are unlinked from their parent.
    pub fn mark_dir_deleted(&mut self, dir: DirId, now: SystemTime, recursive: bool) {
        let mut order = Vec::new();
        let mut stack = vec![dir];
        while let Some(d) = stack.pop() {
            order.push(d);
            if recursive {
                let mut children: Vec<(&String, &DirId)> = self[d].dirs.iter().collect();
                children.sort_by(|a, b| b.0.cmp(a.0));
                stack.extend(children.into_iter().map(|(_, id)| *id));
            }
        }

        for &d in &order {
            self[d].exists = false;
            let mut files: Vec<(&String, &FileId)> = self[d].files.iter().collect();
            files.sort_by(|a, b| a.0.cmp(b.0));
            let files: Vec<FileId> = files.into_iter().map(|(_, id)| *id).collect();
            for file in files {
                self.mark_file_deleted(file, now);
            }
        }

        if recursive {
            for &d in order.iter().rev() {
                if d != dir && d != self.root_dir && self[d].is_empty() {
                    self.detach_dir(d);
                }
            }
        }
        debug!(
            path = %self[dir].path.display(),
            recursive,
            dirs = order.len(),
            "marked directory deleted"
        );
    }

    fn detach_dir(&mut self, id: DirId) {
        let (parent, name) = {
            let dir = &self[id];
            (dir.parent, dir.name.clone())
        };
        if let Some(parent) = parent {
            if self[parent].dirs.get(&name) == Some(&id) {
                self[parent].dirs.remove(&name);
            }
        }
        self.dirs[id.index()] = None;
        self.free_dirs.push(id);
    }

    fn purge_file(&mut self, id: FileId) -> usize {
        self.unlink_recency(id);
        self.unlink_suffix(id);
        let (parent, name) = {
            let file = &self[id];
            (file.parent, file.name.clone())
        };
        if self[parent].files.get(&name) == Some(&id) {
            self[parent].files.remove(&name);
        }
        self.files[id.index()] = None;
        self.free_files.push(id);

        let mut dirs_purged = 0;
        // A tombstoned directory entry takes its emptied, deleted dir node
        // with it.
        if let Some(child) = self.child_dir(parent, &name) {
            if !self[child].exists && self[child].is_empty() {
                self.detach_dir(child);
                dirs_purged += 1;
            }
        }
        let mut cur = Some(parent);
        while let Some(dir) = cur {
            if dir == self.root_dir || self[dir].exists || !self[dir].is_empty() {
                break;
            }
            cur = self[dir].parent;
            self.detach_dir(dir);
            dirs_purged += 1;
        }
        dirs_purged
    }

    /// Purges tombstones whose deletion is older than `min_age`, walking the
    /// recency list from its oldest end. Live nodes are never touched.
    pub fn age_out(&mut self, min_age: Duration, now: SystemTime) -> AgeOutStats {
        let mut stats = AgeOutStats::default();
        let Some(cutoff) = now.checked_sub(min_age) else {
            return stats;
        };
        let mut max_tick = None;
        let mut cur = self.oldest_file;
        while let Some(id) = cur {
            let file = &self[id];
            cur = file.recency.prev;
            if file.exists || file.otime.timestamp >= cutoff {
                continue;
            }
            let tick = file.otime.ticks;
            max_tick = Some(max_tick.map_or(tick, |m: u32| m.max(tick)));
            stats.dirs_purged += self.purge_file(id);
            stats.files_purged += 1;
        }
        if let Some(tick) = max_tick {
            self.last_age_out_tick = self.last_age_out_tick.max(tick);
            self.last_age_out_timestamp = Some(cutoff);
        }
        stats
    }

    /// Newest-first walk of the recency list.
    pub fn recent_files(&self) -> RecencyIter<'_> {
        RecencyIter {
            store: self,
            next: self.latest_file,
        }
    }

    /// Walk of the list of files carrying `suffix` (lowercase).
    pub fn suffix_files(&self, suffix: &str) -> SuffixIter<'_> {
        SuffixIter {
            store: self,
            next: self.suffixes.get(suffix).copied(),
        }
    }

    /// Root-relative existence check against the view.
    pub fn any_exists<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().any(|name| {
            let full = self.root_path.join(name.as_ref());
            let (Some(parent), Some(file_name)) = (full.parent(), full.file_name()) else {
                return false;
            };
            let Some(dir) = self.resolve_dir(parent) else {
                return false;
            };
            file_name
                .to_str()
                .and_then(|n| self.child_file(dir, n))
                .is_some_and(|id| self[id].exists)
        })
    }
}

pub struct RecencyIter<'a> {
    store: &'a TreeStore,
    next: Option<FileId>,
}

impl Iterator for RecencyIter<'_> {
    type Item = FileId;

    fn next(&mut self) -> Option<FileId> {
        let id = self.next?;
        self.next = self.store[id].recency.next;
        Some(id)
    }
}

pub struct SuffixIter<'a> {
    store: &'a TreeStore,
    next: Option<FileId>,
}

impl Iterator for SuffixIter<'_> {
    type Item = FileId;

    fn next(&mut self) -> Option<FileId> {
        let id = self.next?;
        self.next = self.store[id].suffix_links.next;
        Some(id)
    }
}
