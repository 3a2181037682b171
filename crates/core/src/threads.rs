use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{Result, ViewError};
use crate::pending::PendingFlags;
use crate::view::InMemoryView;
use crate::watcher::{WatchPoll, Watcher};

/// Broadcast signal resolved when a full crawl completes and re-armed when
/// the next one starts.
#[derive(Debug, Default)]
pub struct CrawlReadiness {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl CrawlReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        *self.ready.lock() = false;
    }

    pub fn mark_ready(&self) {
        *self.ready.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    /// Returns false if `timeout` passed first.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.lock();
        if !*ready {
            let _ = self
                .cond
                .wait_while_for(&mut ready, |ready| !*ready, timeout);
        }
        *ready
    }
}

/// Handles of the two threads of a view. Dropping it stops and joins them.
#[derive(Debug)]
pub struct ViewThreads {
    view: Arc<InMemoryView>,
    notify: Option<JoinHandle<()>>,
    io: Option<JoinHandle<()>>,
}

impl ViewThreads {
    pub fn view(&self) -> &Arc<InMemoryView> {
        &self.view
    }

    /// Signals both threads and waits for them to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.view.signal_threads();
        for handle in [self.notify.take(), self.io.take()].into_iter().flatten() {
            if handle.join().is_err() {
                error!("view thread panicked");
            }
        }
    }
}

impl Drop for ViewThreads {
    fn drop(&mut self) {
        if self.notify.is_some() || self.io.is_some() {
            self.shutdown();
        }
    }
}

impl InMemoryView {
    /// Starts the notification and io threads.
    pub fn start_threads(self: &Arc<Self>, watcher: Box<dyn Watcher>) -> Result<ViewThreads> {
        self.stop.store(false, Ordering::SeqCst);
        let notify = std::thread::Builder::new()
            .name("livetree-notify".to_string())
            .spawn({
                let view = Arc::clone(self);
                move || view.notify_thread(watcher)
            })?;
        let io = std::thread::Builder::new()
            .name("livetree-io".to_string())
            .spawn({
                let view = Arc::clone(self);
                move || view.io_thread()
            });
        let io = match io {
            Ok(io) => io,
            Err(err) => {
                self.signal_threads();
                let _ = notify.join();
                return Err(err.into());
            }
        };
        Ok(ViewThreads {
            view: Arc::clone(self),
            notify: Some(notify),
            io: Some(io),
        })
    }

    /// Asks both threads to exit; they do so within one poll or settle
    /// period.
    pub fn signal_threads(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.pending.ping();
    }

    fn notify_thread(&self, mut watcher: Box<dyn Watcher>) {
        info!(root = %self.root_path.display(), "notify thread started");
        let poll = self.config.notify_poll();
        while !self.is_stopping() {
            match watcher.next_batch(poll) {
                WatchPoll::Batch(batch) => {
                    let now = SystemTime::now();
                    if batch.overflow {
                        warn!(error = %ViewError::Desync, "scheduling recrawl");
                        self.should_recrawl.store(true, Ordering::SeqCst);
                    }
                    for event in batch.events {
                        if event.path.starts_with(&self.root_path) {
                            self.pending.add(event.path, now, PendingFlags::VIA_NOTIFY);
                        }
                    }
                    self.pending.ping();
                }
                WatchPoll::Timeout => {}
                WatchPoll::Closed => {
                    info!("notification source closed");
                    break;
                }
            }
        }
        debug!("notify thread exiting");
    }

    fn io_thread(&self) {
        info!(root = %self.root_path.display(), "io thread started");
        self.full_crawl();
        let mut last_age_out = Instant::now();
        let settle = self.config.settle();
        while !self.is_stopping() {
            let woke = self.pending.wait(settle);
            if self.is_stopping() {
                break;
            }
            if self.should_recrawl.swap(false, Ordering::SeqCst) {
                warn!(root = %self.root_path.display(), "recrawling after desync");
                self.full_crawl();
            } else if woke || !self.pending.is_empty() {
                self.process_pending(true);
            }
            if let Some(interval) = self.config.gc_interval() {
                if last_age_out.elapsed() >= interval {
                    self.age_out(self.config.gc_age());
                    last_age_out = Instant::now();
                }
            }
        }
        debug!("io thread exiting");
    }
}
