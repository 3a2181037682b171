use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::info;

use crate::clock::{ClockPosition, ClockSpec};
use crate::config::{IgnoreSet, ViewConfig};
use crate::cookie::CookieSync;
use crate::error::{Result, ViewError};
use crate::fs::{FileSystem, OsFileSystem};
use crate::glob::GlobTree;
use crate::pending::PendingCollection;
use crate::query::{self, PathSpec, QueryContext, QueryResult};
use crate::store::{AgeOutStats, TreeStore};
use crate::threads::CrawlReadiness;

pub struct InMemoryView {
    pub(crate) root_path: PathBuf,
    pub(crate) config: ViewConfig,
    pub(crate) ignore: IgnoreSet,
    pub(crate) store: RwLock<TreeStore>,
    /// Fed by the notification thread.
    pub(crate) pending: PendingCollection,
    /// Private to the reconciler.
    pub(crate) crawl_queue: PendingCollection,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) cookies: CookieSync,
    pub(crate) readiness: CrawlReadiness,
    pub(crate) stop: AtomicBool,
    pub(crate) should_recrawl: AtomicBool,
}

impl std::fmt::Debug for InMemoryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryView")
            .field("root_path", &self.root_path)
            .field("clock", &self.current_clock())
            .finish_non_exhaustive()
    }
}

impl InMemoryView {
    pub fn new(
        root_path: impl Into<PathBuf>,
        config: ViewConfig,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        config.validate()?;
        let root_path = root_path.into();
        if !root_path.is_absolute() {
            return Err(ViewError::Config(format!(
                "root must be an absolute path, got {}",
                root_path.display()
            )));
        }
        Ok(Self {
            ignore: IgnoreSet::new(&root_path, &config),
            cookies: CookieSync::new(&root_path, &config.cookie_prefix),
            store: RwLock::new(TreeStore::new(&root_path)),
            pending: PendingCollection::new(),
            crawl_queue: PendingCollection::new(),
            readiness: CrawlReadiness::new(),
            stop: AtomicBool::new(false),
            should_recrawl: AtomicBool::new(false),
            root_path,
            config,
            fs,
        })
    }

    /// A view of a real directory, configured from its `.livetreeconfig`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().canonicalize()?;
        let config = ViewConfig::load_for_root(&root)?;
        Self::new(root, config, Arc::new(OsFileSystem))
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    /// The queue the notification thread feeds; paths added here are
    /// applied by the next `process_pending(true)`.
    pub fn pending(&self) -> &PendingCollection {
        &self.pending
    }

    /// Read access to the store for callers walking it directly.
    pub fn read(&self) -> RwLockReadGuard<'_, TreeStore> {
        self.store.read()
    }

    pub fn current_clock(&self) -> ClockPosition {
        self.store.read().clock()
    }

    pub fn current_clock_string(&self) -> String {
        self.current_clock().to_string()
    }

    pub fn last_age_out_tick(&self) -> u32 {
        self.store.read().last_age_out_tick()
    }

    pub fn last_age_out_timestamp(&self) -> Option<SystemTime> {
        self.store.read().last_age_out_timestamp()
    }

    /// Whether any of the root-relative `names` currently exists in the view.
    pub fn do_any_of_these_files_exist<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.store.read().any_exists(names)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn time_generator(&self, ctx: &mut QueryContext<'_>, since: ClockSpec) -> Result<()> {
        let store = self.store.read();
        query::time_generator(&store, ctx, since)
    }

    pub fn suffix_generator<S: AsRef<str>>(
        &self,
        ctx: &mut QueryContext<'_>,
        suffixes: &[S],
    ) -> Result<()> {
        let mut done = HashSet::new();
        for suffix in suffixes {
            let suffix = suffix.as_ref().trim_start_matches('.').to_ascii_lowercase();
            if !done.insert(suffix.clone()) {
                continue;
            }
            let store = self.store.read();
            query::suffix_generator(&store, ctx, &[suffix])?;
        }
        Ok(())
    }

    pub fn path_generator(&self, ctx: &mut QueryContext<'_>, paths: &[PathSpec]) -> Result<()> {
        for spec in paths {
            let store = self.store.read();
            query::path_generator(&store, ctx, std::slice::from_ref(spec))?;
        }
        Ok(())
    }

    pub fn glob_generator(&self, ctx: &mut QueryContext<'_>, globs: &GlobTree) -> Result<()> {
        let store = self.store.read();
        query::glob_generator(&store, ctx, globs)
    }

    pub fn all_files_generator(&self, ctx: &mut QueryContext<'_>) -> Result<()> {
        let store = self.store.read();
        query::all_files_generator(&store, ctx)
    }

    /// Runs the time generator. A clock invalidated by a recrawl or by
    /// age-out is answered with every live file instead, flagged as a fresh
    /// instance.
    pub fn query_since(&self, mut ctx: QueryContext<'_>, since: ClockSpec) -> Result<QueryResult> {
        let store = self.store.read();
        let clock = store.clock();
        let is_fresh_instance = match query::time_generator(&store, &mut ctx, since) {
            Ok(()) => false,
            Err(ViewError::StaleClock { clock: stale, reason }) => {
                info!(%stale, %reason, "answering with a fresh instance");
                ctx.begin_fresh_instance(store.root_number());
                query::all_files_generator(&store, &mut ctx)?;
                true
            }
            Err(err) => return Err(err),
        };
        drop(store);
        Ok(QueryResult {
            clock,
            is_fresh_instance,
            num_walked: ctx.num_walked(),
            files: ctx.into_results(),
        })
    }

    /// Runs `run` against a fresh context and packages what it collected
    /// with the clock read before the walk.
    pub fn query<'e, F>(&self, mut ctx: QueryContext<'e>, run: F) -> Result<QueryResult>
    where
        F: FnOnce(&Self, &mut QueryContext<'e>) -> Result<()>,
    {
        let clock = self.current_clock();
        run(self, &mut ctx)?;
        Ok(QueryResult {
            clock,
            is_fresh_instance: false,
            num_walked: ctx.num_walked(),
            files: ctx.into_results(),
        })
    }

    /// Purges tombstones older than `min_age`.
    pub fn age_out(&self, min_age: Duration) -> AgeOutStats {
        let stats = self.store.write().age_out(min_age, SystemTime::now());
        if stats.files_purged > 0 {
            info!(
                files = stats.files_purged,
                dirs = stats.dirs_purged,
                "aged out deleted entries"
            );
        }
        stats
    }

    /// Blocks until the current full crawl has completed. Returns false on
    /// timeout.
    pub fn wait_until_ready_to_query(&self, timeout: Duration) -> bool {
        self.readiness.wait(timeout)
    }

    /// Returns once every change the notification source reported before
    /// the call has been applied.
    pub fn sync_to_now(&self, timeout: Duration) -> Result<()> {
        self.cookies.sync(self.fs.as_ref(), timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemoryFileSystem;
    use pretty_assertions::assert_eq;

    fn view(fs: &Arc<MemoryFileSystem>) -> InMemoryView {
        InMemoryView::new("/r", ViewConfig::default(), fs.clone()).unwrap()
    }

    #[test]
    fn relative_roots_are_rejected() {
        let fs = Arc::new(MemoryFileSystem::new());
        let err = InMemoryView::new("rel", ViewConfig::default(), fs).unwrap_err();
        assert!(matches!(err, ViewError::Config(_)));
    }

    #[test]
    fn clock_string_tracks_crawls() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write("/r/a.txt", 1);
        let view = view(&fs);
        assert_eq!(view.current_clock_string(), "c:0:0");
        view.client_mode_crawl();
        // the root entry itself is not a file of the view
        assert_eq!(view.current_clock_string(), "c:1:1");
        assert!(view.do_any_of_these_files_exist(&["a.txt"]));
        assert!(!view.do_any_of_these_files_exist(&["b.txt"]));
    }

    #[test]
    fn stale_clocks_become_fresh_instances() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write("/r/a.txt", 1);
        fs.write("/r/b.txt", 1);
        let view = view(&fs);
        view.client_mode_crawl();
        let before = view.current_clock();

        fs.remove("/r/a.txt");
        view.client_mode_crawl();

        let result = view
            .query_since(QueryContext::new().include_deleted(true), before.into())
            .unwrap();
        assert!(result.is_fresh_instance);
        assert_eq!(result.clock, view.current_clock());
        let names: Vec<(String, bool)> = result.files.iter().map(|f| (f.name.clone(), f.new)).collect();
        assert_eq!(names, vec![("b.txt".to_string(), true)]);
    }

    #[test]
    fn current_clocks_answer_incrementally() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write("/r/a.txt", 1);
        let view = view(&fs);
        view.client_mode_crawl();
        let clock = view.current_clock();

        fs.write("/r/a.txt", 2);
        view.pending
            .add("/r/a.txt", SystemTime::now(), crate::pending::PendingFlags::VIA_NOTIFY);
        view.process_pending(true);

        let result = view.query_since(QueryContext::new(), clock.into()).unwrap();
        assert!(!result.is_fresh_instance);
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].name, "a.txt");
        assert!(!result.files[0].new);
        assert_eq!(result.files[0].size, Some(2));
    }

    #[test]
    fn generators_take_the_lock_per_step() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write("/r/src/a.rs", 1);
        fs.write("/r/src/b.RS", 1);
        fs.write("/r/doc.md", 1);
        let view = view(&fs);
        view.client_mode_crawl();

        let mut ctx = QueryContext::new();
        view.suffix_generator(&mut ctx, &["rs", ".rs", "md"]).unwrap();
        assert_eq!(ctx.results().len(), 3);

        let result = view
            .query(QueryContext::new(), |view, ctx| {
                view.path_generator(ctx, &[PathSpec::new("src/a.rs", 0), PathSpec::new("doc.md", 0)])
            })
            .unwrap();
        assert_eq!(result.files.len(), 2);
    }
}
