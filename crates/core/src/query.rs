use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{ClockPosition, ClockSpec};
use crate::error::{Result, StaleReason, ViewError};
use crate::glob::{GlobNode, GlobTree};
use crate::model::{DirId, FileId, FileKind, FileNode};
use crate::store::TreeStore;

/// A file node borrowed from the store while its guard is held.
pub struct FileRef<'a> {
    store: &'a TreeStore,
    id: FileId,
    since: Option<ClockSpec>,
}

impl<'a> FileRef<'a> {
    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn node(&self) -> &'a FileNode {
        &self.store[self.id]
    }

    pub fn name(&self) -> &'a str {
        &self.node().name
    }

    /// Root-relative, `/` separated.
    pub fn relative_path(&self) -> String {
        self.store.relative_path(self.id)
    }

    pub fn path(&self) -> PathBuf {
        self.store.file_path(self.id)
    }

    pub fn exists(&self) -> bool {
        self.node().exists
    }

    pub fn kind(&self) -> Option<FileKind> {
        self.node().kind()
    }

    pub fn suffix(&self) -> Option<&'a str> {
        self.node().suffix()
    }

    /// Whether the file came into existence after the query's `since`.
    pub fn is_new(&self) -> bool {
        let ctime = self.node().ctime;
        match self.since {
            Some(ClockSpec::Clock(pos)) => ctime.ticks > pos.ticks,
            Some(ClockSpec::Timestamp(ts)) => ctime.timestamp > ts,
            None => false,
        }
    }
}

/// An owned copy of what a query reports about one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileResult {
    pub name: String,
    pub exists: bool,
    pub new: bool,
    pub tick: u32,
    pub created_tick: u32,
    pub changed_at: DateTime<Utc>,
    pub kind: Option<FileKind>,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
    pub mode: Option<u32>,
}

impl From<&FileRef<'_>> for FileResult {
    fn from(file: &FileRef<'_>) -> Self {
        let node = file.node();
        Self {
            name: file.relative_path(),
            exists: node.exists,
            new: file.is_new(),
            tick: node.otime.ticks,
            created_tick: node.ctime.ticks,
            changed_at: node.otime.timestamp.into(),
            kind: node.kind(),
            size: node.stat.map(|st| st.size),
            mtime: node.stat.and_then(|st| st.mtime).map(DateTime::<Utc>::from),
            mode: node.stat.map(|st| st.mode),
        }
    }
}

/// Outcome of running one or more generators.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub clock: ClockPosition,
    pub is_fresh_instance: bool,
    pub files: Vec<FileResult>,
    pub num_walked: u64,
}

type Evaluator<'e> = Box<dyn for<'s> FnMut(&FileRef<'s>) -> bool + Send + 'e>;

/// Per-query state shared by every generator the query runs.
pub struct QueryContext<'e> {
    include_deleted: bool,
    since: Option<ClockSpec>,
    evaluator: Evaluator<'e>,
    /// Keyed with the creation tick too: a slot freed by age-out between
    /// two locked steps may come back as a different file.
    seen: HashSet<(FileId, u32)>,
    results: Vec<FileResult>,
    num_walked: u64,
}

impl Default for QueryContext<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'e> QueryContext<'e> {
    /// A context accepting every candidate.
    pub fn new() -> Self {
        Self::with_evaluator(|_| true)
    }

    pub fn with_evaluator<F>(evaluator: F) -> Self
    where
        F: for<'s> FnMut(&FileRef<'s>) -> bool + Send + 'e,
    {
        Self {
            include_deleted: false,
            since: None,
            evaluator: Box::new(evaluator),
            seen: HashSet::new(),
            results: Vec::new(),
            num_walked: 0,
        }
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    pub fn since(mut self, since: ClockSpec) -> Self {
        self.since = Some(since);
        self
    }

    pub fn includes_deleted(&self) -> bool {
        self.include_deleted
    }

    pub fn num_walked(&self) -> u64 {
        self.num_walked
    }

    pub fn results(&self) -> &[FileResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<FileResult> {
        self.results
    }

    /// Restarts collection for a full-tree answer to a stale `since`: the
    /// walk counter is kept, tombstones are no longer wanted and every
    /// surviving file counts as new.
    pub(crate) fn begin_fresh_instance(&mut self, root_number: u32) {
        self.results.clear();
        self.seen.clear();
        self.include_deleted = false;
        self.since = Some(ClockSpec::Clock(ClockPosition::new(root_number, 0)));
    }

    pub(crate) fn process_file(&mut self, store: &TreeStore, id: FileId, dedup: bool) {
        self.num_walked += 1;
        if !self.include_deleted && !store[id].exists {
            return;
        }
        if dedup && !self.seen.insert((id, store[id].ctime.ticks)) {
            return;
        }
        let file = FileRef {
            store,
            id,
            since: self.since,
        };
        if (self.evaluator)(&file) {
            self.results.push(FileResult::from(&file));
        }
    }

    fn wants_dir(&self, store: &TreeStore, dir: DirId) -> bool {
        self.include_deleted || store[dir].exists
    }
}

/// A path for the path generator, relative to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    pub path: String,
    /// Levels of directories to descend below a directory match.
    pub depth: u32,
}

impl PathSpec {
    pub fn new(path: impl Into<String>, depth: u32) -> Self {
        Self {
            path: path.into(),
            depth,
        }
    }
}

/// Files changed after `since`, newest first.
pub fn time_generator(
    store: &TreeStore,
    ctx: &mut QueryContext<'_>,
    since: ClockSpec,
) -> Result<()> {
    if ctx.since.is_none() {
        ctx.since = Some(since);
    }
    match since {
        ClockSpec::Clock(clock) => {
            if clock.root_number != store.root_number() {
                return Err(ViewError::StaleClock {
                    clock,
                    reason: StaleReason::Recrawled,
                });
            }
            if clock.ticks < store.last_age_out_tick() {
                return Err(ViewError::StaleClock {
                    clock,
                    reason: StaleReason::AgedOut,
                });
            }
            for id in store.recent_files() {
                if store[id].otime.ticks <= clock.ticks {
                    break;
                }
                ctx.process_file(store, id, false);
            }
        }
        ClockSpec::Timestamp(ts) => {
            if let Some(aged) = store.last_age_out_timestamp() {
                if ts < aged {
                    return Err(ViewError::StaleClock {
                        clock: store.clock(),
                        reason: StaleReason::AgedOut,
                    });
                }
            }
            for id in store.recent_files() {
                if store[id].otime.timestamp <= ts {
                    break;
                }
                ctx.process_file(store, id, false);
            }
        }
    }
    Ok(())
}

pub fn suffix_generator<S: AsRef<str>>(
    store: &TreeStore,
    ctx: &mut QueryContext<'_>,
    suffixes: &[S],
) -> Result<()> {
    let mut done = HashSet::new();
    for suffix in suffixes {
        let suffix = suffix.as_ref().trim_start_matches('.').to_ascii_lowercase();
        if !done.insert(suffix.clone()) {
            continue;
        }
        for id in store.suffix_files(&suffix) {
            ctx.process_file(store, id, false);
        }
    }
    Ok(())
}

/// Resolves each path directly. A path naming a directory emits the
/// directory's own entry and then its contents down to `depth` levels.
pub fn path_generator(
    store: &TreeStore,
    ctx: &mut QueryContext<'_>,
    paths: &[PathSpec],
) -> Result<()> {
    for spec in paths {
        let rel = spec.path.trim_matches('/');
        if rel.is_empty() || rel == "." {
            dir_generator(store, ctx, store.root_dir(), spec.depth);
            continue;
        }
        let full = store.root_path().join(rel);
        let name = full.file_name().and_then(|n| n.to_str());
        let (Some(parent), Some(name)) = (full.parent(), name) else {
            continue;
        };
        // Resolve the parent and walk down: the name may have been a
        // directory that was replaced by a file.
        let Some(dir) = store.resolve_dir(parent) else {
            continue;
        };
        if let Some(file) = store.child_file(dir, name) {
            ctx.process_file(store, file, true);
        }
        if let Some(child) = store.child_dir(dir, name) {
            dir_generator(store, ctx, child, spec.depth);
        }
    }
    Ok(())
}

/// Depth-first walk of `dir`, descending at most `depth` levels.
pub fn dir_generator(store: &TreeStore, ctx: &mut QueryContext<'_>, dir: DirId, depth: u32) {
    let mut stack = vec![(dir, depth)];
    while let Some((dir, depth)) = stack.pop() {
        if !ctx.wants_dir(store, dir) {
            continue;
        }
        let node = &store[dir];
        for &file in node.files.values() {
            ctx.process_file(store, file, true);
        }
        if depth > 0 {
            stack.extend(node.dirs.values().map(|&child| (child, depth - 1)));
        }
    }
}

pub fn all_files_generator(store: &TreeStore, ctx: &mut QueryContext<'_>) -> Result<()> {
    dir_generator(store, ctx, store.root_dir(), u32::MAX);
    Ok(())
}

pub fn glob_generator(
    store: &TreeStore,
    ctx: &mut QueryContext<'_>,
    globs: &GlobTree,
) -> Result<()> {
    glob_generator_tree(store, ctx, globs, &globs.root, store.root_dir());
    Ok(())
}

/// Matches the children of `node` against the entries of `dir`.
pub(crate) fn glob_generator_tree(
    store: &TreeStore,
    ctx: &mut QueryContext<'_>,
    globs: &GlobTree,
    node: &GlobNode,
    dir: DirId,
) {
    let options = globs.options();
    for child in &node.children {
        if child.is_doublestar() {
            glob_generator_doublestar(store, ctx, globs, child, dir);
            continue;
        }
        if let Some(name) = child.literal() {
            if !child.children.is_empty() {
                if let Some(sub) = store.child_dir(dir, name) {
                    if ctx.wants_dir(store, sub) {
                        glob_generator_tree(store, ctx, globs, child, sub);
                    }
                }
            }
            if child.is_leaf {
                if let Some(file) = store.child_file(dir, name) {
                    ctx.process_file(store, file, true);
                }
            }
            continue;
        }
        if !child.children.is_empty() {
            for (name, &sub) in &store[dir].dirs {
                if ctx.wants_dir(store, sub) && child.matches_name(name, options) {
                    glob_generator_tree(store, ctx, globs, child, sub);
                }
            }
        }
        if child.is_leaf {
            for (name, &file) in &store[dir].files {
                if child.matches_name(name, options) {
                    ctx.process_file(store, file, true);
                } else {
                    ctx.num_walked += 1;
                }
            }
        }
    }
}

/// Walks every directory below `dir` once, matching each file's path
/// relative to `dir` against all continuations of the `**` node.
pub(crate) fn glob_generator_doublestar(
    store: &TreeStore,
    ctx: &mut QueryContext<'_>,
    globs: &GlobTree,
    node: &GlobNode,
    dir: DirId,
) {
    let options = globs.options();
    let mut stack = vec![(dir, String::new())];
    while let Some((dir, prefix)) = stack.pop() {
        let dir_node = &store[dir];
        for (name, &file) in &dir_node.files {
            let rel = format!("{prefix}{name}");
            if node.matches_rest(&rel, options) {
                ctx.process_file(store, file, true);
            } else {
                ctx.num_walked += 1;
            }
        }
        for (name, &sub) in &dir_node.dirs {
            if !ctx.wants_dir(store, sub) {
                continue;
            }
            if !node.enters_dot_dirs(options) && name.starts_with('.') {
                continue;
            }
            stack.push((sub, format!("{prefix}{name}/")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glob::GlobOptions;
    use crate::model::{FileKind, FileStat};
    use pretty_assertions::assert_eq;
    use std::time::{Duration, SystemTime};

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn stat_of(kind: FileKind, size: u64) -> FileStat {
        FileStat {
            kind,
            size,
            mtime: Some(t(size)),
            mode: 0o644,
            ino: size,
        }
    }

    fn stat(size: u64) -> FileStat {
        stat_of(FileKind::File, size)
    }

    /// Adds `rel` as a file, creating directory entries along the way.
    fn add(store: &mut TreeStore, rel: &str) -> FileId {
        let mut dir = store.root_dir();
        let parts: Vec<&str> = rel.split('/').collect();
        let (name, dirs) = parts.split_last().unwrap();
        for part in dirs {
            let entry = store.get_or_create_file(dir, part, t(1));
            if !store[entry].exists {
                store.observe_file(entry, stat_of(FileKind::Dir, 0), t(1));
            }
            dir = store.ensure_child_dir(dir, part);
        }
        let id = store.get_or_create_file(dir, name, t(1));
        let size = store.most_recent_tick() as u64 + 1;
        store.observe_file(id, stat(size), t(1));
        id
    }

    fn names(ctx: QueryContext<'_>) -> Vec<String> {
        let mut names: Vec<String> = ctx.into_results().into_iter().map(|r| r.name).collect();
        names.sort();
        names
    }

    fn sample() -> TreeStore {
        let mut store = TreeStore::new("/root");
        for rel in [
            "main.c",
            "README.md",
            "src/a.c",
            "src/a.h",
            "src/deep/b.c",
            "src/deep/deeper/c.c",
            "src/.hidden/d.c",
            "docs/guide.md",
        ] {
            add(&mut store, rel);
        }
        store
    }

    #[test]
    fn time_generator_reports_changes_after_the_clock() {
        let mut store = TreeStore::new("/root");
        let a = add(&mut store, "a.txt");
        add(&mut store, "b.txt");
        let clock = ClockPosition::new(0, 1);
        store.mark_file_deleted(a, t(2));

        let mut ctx = QueryContext::new().include_deleted(true);
        time_generator(&store, &mut ctx, clock.into()).unwrap();
        let results = ctx.into_results();
        let got: Vec<(String, u32, bool)> = results
            .iter()
            .map(|r| (r.name.clone(), r.tick, r.exists))
            .collect();
        assert_eq!(
            got,
            vec![("a.txt".to_string(), 3, false), ("b.txt".to_string(), 2, true)]
        );
        assert!(results[1].new);
    }

    #[test]
    fn time_generator_skips_tombstones_unless_asked() {
        let mut store = TreeStore::new("/root");
        let a = add(&mut store, "a.txt");
        store.mark_file_deleted(a, t(2));
        let mut ctx = QueryContext::new();
        time_generator(&store, &mut ctx, ClockPosition::new(0, 0).into()).unwrap();
        assert_eq!(ctx.num_walked(), 1);
        assert!(ctx.results().is_empty());
    }

    #[test]
    fn time_generator_rejects_clocks_from_another_root_number() {
        let mut store = sample();
        let clock = store.clock();
        store.bump_root_number();
        let err = time_generator(&store, &mut QueryContext::new(), clock.into()).unwrap_err();
        assert!(matches!(
            err,
            ViewError::StaleClock {
                reason: StaleReason::Recrawled,
                ..
            }
        ));
    }

    #[test]
    fn time_generator_rejects_aged_out_clocks() {
        let mut store = TreeStore::new("/root");
        let a = add(&mut store, "a.txt");
        add(&mut store, "b.txt");
        store.mark_file_deleted(a, t(2));
        store.age_out(Duration::from_secs(1), t(100));
        let err =
            time_generator(&store, &mut QueryContext::new(), ClockPosition::new(0, 1).into())
                .unwrap_err();
        assert!(matches!(
            err,
            ViewError::StaleClock {
                reason: StaleReason::AgedOut,
                ..
            }
        ));
        time_generator(&store, &mut QueryContext::new(), ClockPosition::new(0, 3).into()).unwrap();
    }

    #[test]
    fn time_generator_by_timestamp() {
        let mut store = TreeStore::new("/root");
        let a = add(&mut store, "a.txt");
        add(&mut store, "b.txt");
        store.observe_file(a, stat(99), t(50));
        let mut ctx = QueryContext::new();
        time_generator(&store, &mut ctx, ClockSpec::Timestamp(t(10))).unwrap();
        assert_eq!(names(ctx), vec!["a.txt"]);
    }

    #[test]
    fn suffix_generator_walks_each_suffix_once() {
        let store = sample();
        let mut ctx = QueryContext::new().include_deleted(true);
        suffix_generator(&store, &mut ctx, &["c", ".C", "md"]).unwrap();
        assert_eq!(
            names(ctx),
            vec![
                "README.md",
                "docs/guide.md",
                "main.c",
                "src/.hidden/d.c",
                "src/a.c",
                "src/deep/b.c",
                "src/deep/deeper/c.c",
            ]
        );
    }

    #[test]
    fn path_generator_resolves_files_and_directories() {
        let store = sample();
        let mut ctx = QueryContext::new();
        path_generator(
            &store,
            &mut ctx,
            &[
                PathSpec::new("main.c", 0),
                PathSpec::new("src/deep", 0),
                PathSpec::new("missing/x", 0),
            ],
        )
        .unwrap();
        assert_eq!(names(ctx), vec!["main.c", "src/deep", "src/deep/b.c", "src/deep/deeper"]);

        let mut ctx = QueryContext::new();
        path_generator(&store, &mut ctx, &[PathSpec::new("src/deep", 1)]).unwrap();
        assert_eq!(
            names(ctx),
            vec!["src/deep", "src/deep/b.c", "src/deep/deeper", "src/deep/deeper/c.c"]
        );
    }

    #[test]
    fn all_files_generator_sees_every_entry() {
        let store = sample();
        let mut ctx = QueryContext::new();
        all_files_generator(&store, &mut ctx).unwrap();
        assert_eq!(ctx.num_walked() as usize, store.file_count());
        assert_eq!(ctx.results().len(), store.file_count());
    }

    #[test]
    fn doublestar_glob_finds_files_at_every_depth_once() {
        let store = sample();
        let globs = GlobTree::new(&["**/*.c"], GlobOptions::default()).unwrap();
        let mut ctx = QueryContext::new();
        glob_generator(&store, &mut ctx, &globs).unwrap();
        // every node outside the dot directory is considered exactly once
        assert_eq!(ctx.num_walked() as usize, store.file_count() - 1);
        assert_eq!(
            names(ctx),
            vec!["main.c", "src/a.c", "src/deep/b.c", "src/deep/deeper/c.c"]
        );
    }

    #[test]
    fn glob_generator_follows_literal_and_wildcard_segments() {
        let store = sample();
        let globs = GlobTree::new(
            &["src/*.h", "*.md", "src/deep/**", "src/*.c", "src/a.c"],
            GlobOptions::default(),
        )
        .unwrap();
        let mut ctx = QueryContext::new();
        glob_generator(&store, &mut ctx, &globs).unwrap();
        assert_eq!(
            names(ctx),
            vec![
                "README.md",
                "src/a.c",
                "src/a.h",
                "src/deep/b.c",
                "src/deep/deeper",
                "src/deep/deeper/c.c",
            ]
        );
    }

    #[test]
    fn dot_directories_are_matched_when_included() {
        let store = sample();
        let globs = GlobTree::new(
            &["**/*.c"],
            GlobOptions {
                include_dot_files: true,
                ..Default::default()
            },
        )
        .unwrap();
        let mut ctx = QueryContext::new();
        glob_generator(&store, &mut ctx, &globs).unwrap();
        assert!(names(ctx).contains(&"src/.hidden/d.c".to_string()));
    }

    #[test]
    fn reused_slots_are_not_deduplicated_across_steps() {
        let mut store = TreeStore::new("/root");
        let a = add(&mut store, "a");
        let mut ctx = QueryContext::new();
        path_generator(&store, &mut ctx, &[PathSpec::new("a", 0)]).unwrap();

        store.mark_file_deleted(a, t(2));
        store.age_out(Duration::from_secs(1), t(100));
        let b = add(&mut store, "b");
        assert_eq!(a, b);
        path_generator(&store, &mut ctx, &[PathSpec::new("b", 0)]).unwrap();
        assert_eq!(names(ctx), vec!["a", "b"]);
    }

    #[test]
    fn explicit_leading_dots_match_without_dot_files() {
        let mut store = TreeStore::new("/root");
        for rel in ["a/.github/ci.yml", ".bashrc", ".hidden/x.yml", "b/c.yml"] {
            add(&mut store, rel);
        }
        let globs = GlobTree::new(&["**/.github/*.yml", ".*rc"], GlobOptions::default()).unwrap();
        let mut ctx = QueryContext::new();
        glob_generator(&store, &mut ctx, &globs).unwrap();
        assert_eq!(names(ctx), vec![".bashrc", "a/.github/ci.yml"]);

        let globs = GlobTree::new(&["**/*.yml", "*rc"], GlobOptions::default()).unwrap();
        let mut ctx = QueryContext::new();
        glob_generator(&store, &mut ctx, &globs).unwrap();
        assert_eq!(names(ctx), vec!["b/c.yml"]);
    }

    #[test]
    fn evaluator_filters_candidates() {
        let store = sample();
        let mut ctx = QueryContext::with_evaluator(|f| f.suffix() == Some("h"));
        all_files_generator(&store, &mut ctx).unwrap();
        assert_eq!(names(ctx), vec!["src/a.h"]);
    }
}
