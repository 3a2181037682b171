use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use livetree_core::{
    ChannelWatcher, ClockSpec, FileSystem, InMemoryView, MemoryFileSystem, QueryContext,
    ViewConfig, WatchSender,
};
use pretty_assertions::assert_eq;

const ROOT: &str = "/r";

fn config() -> ViewConfig {
    ViewConfig::default()
        .with_settle(Duration::from_millis(5))
        .with_notify_poll(Duration::from_millis(5))
}

fn setup() -> (Arc<MemoryFileSystem>, Arc<InMemoryView>) {
    let fs = Arc::new(MemoryFileSystem::new());
    fs.mkdir_all(ROOT);
    let view = Arc::new(InMemoryView::new(ROOT, config(), fs.clone()).unwrap());
    (fs, view)
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Reports cookie files appearing in the root, standing in for the OS.
fn cookie_reporter(
    fs: Arc<MemoryFileSystem>,
    tx: WatchSender,
    done: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reported = HashSet::new();
        while !done.load(Ordering::SeqCst) {
            if let Ok(entries) = fs.list_directory(Path::new(ROOT)) {
                for entry in entries {
                    if entry.name.starts_with(".livetree-cookie-") && reported.insert(entry.name.clone()) {
                        tx.changed(Path::new(ROOT).join(&entry.name));
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    })
}

#[test]
fn initial_crawl_resolves_readiness() {
    let (fs, view) = setup();
    fs.write("/r/a.txt", 1);
    let (_tx, watcher) = ChannelWatcher::new();
    let threads = view.start_threads(Box::new(watcher)).unwrap();
    assert!(view.wait_until_ready_to_query(Duration::from_secs(10)));
    assert_eq!(view.current_clock().root_number, 1);
    assert!(view.do_any_of_these_files_exist(&["a.txt"]));
    threads.stop();
}

#[test]
fn notified_changes_reach_the_view() {
    let (fs, view) = setup();
    let (tx, watcher) = ChannelWatcher::new();
    let threads = view.start_threads(Box::new(watcher)).unwrap();
    assert!(view.wait_until_ready_to_query(Duration::from_secs(10)));
    let clock = view.current_clock();

    fs.write("/r/dir/new.rs", 3);
    tx.changed("/r/dir");
    wait_for("new.rs", || view.do_any_of_these_files_exist(&["dir/new.rs"]));

    let result = view
        .query_since(QueryContext::new(), ClockSpec::Clock(clock))
        .unwrap();
    let mut names: Vec<String> = result.files.iter().map(|f| f.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["dir", "dir/new.rs"]);
    threads.stop();
}

#[test]
fn desync_recrawls_and_invalidates_clocks() {
    let (fs, view) = setup();
    fs.write("/r/a", 1);
    fs.write("/r/b", 1);
    let (tx, watcher) = ChannelWatcher::new();
    let threads = view.start_threads(Box::new(watcher)).unwrap();
    assert!(view.wait_until_ready_to_query(Duration::from_secs(10)));
    let clock = view.current_clock();

    // A change the notification source never reported.
    fs.remove("/r/a");
    tx.overflow();
    wait_for("recrawl", || view.current_clock().root_number == 2);
    assert!(view.wait_until_ready_to_query(Duration::from_secs(10)));
    assert!(!view.do_any_of_these_files_exist(&["a"]));

    let result = view
        .query_since(QueryContext::new().include_deleted(true), clock.into())
        .unwrap();
    assert!(result.is_fresh_instance);
    let names: Vec<&str> = result.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["b"]);
    threads.stop();
}

#[test]
fn sync_to_now_orders_after_earlier_events() {
    let (fs, view) = setup();
    let (tx, watcher) = ChannelWatcher::new();
    let done = Arc::new(AtomicBool::new(false));
    let reporter = cookie_reporter(fs.clone(), tx.clone(), done.clone());
    let threads = view.start_threads(Box::new(watcher)).unwrap();
    assert!(view.wait_until_ready_to_query(Duration::from_secs(10)));

    for i in 0..20 {
        let rel = format!("f{i}");
        fs.write(Path::new(ROOT).join(&rel), i);
        tx.changed(Path::new(ROOT).join(&rel));
        view.sync_to_now(Duration::from_secs(10)).unwrap();
        assert!(view.do_any_of_these_files_exist(&[rel.as_str()]));
    }

    done.store(true, Ordering::SeqCst);
    reporter.join().unwrap();
    threads.stop();
    // cookies never show up as files
    let mut ctx = QueryContext::new().include_deleted(true);
    view.all_files_generator(&mut ctx).unwrap();
    assert_eq!(ctx.results().len(), 20);
}

#[test]
fn stop_returns_promptly() {
    let (_fs, view) = setup();
    let (_tx, watcher) = ChannelWatcher::new();
    let threads = view.start_threads(Box::new(watcher)).unwrap();
    assert!(view.wait_until_ready_to_query(Duration::from_secs(10)));
    let start = Instant::now();
    threads.stop();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn closed_watcher_leaves_the_view_queryable() {
    let (fs, view) = setup();
    fs.write("/r/x", 1);
    let (tx, watcher) = ChannelWatcher::new();
    drop(tx);
    let threads = view.start_threads(Box::new(watcher)).unwrap();
    assert!(view.wait_until_ready_to_query(Duration::from_secs(10)));
    assert!(view.do_any_of_these_files_exist(&["x"]));
    drop(threads);
}
