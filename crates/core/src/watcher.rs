use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use notify::event::EventKind;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tracing::{debug, warn};

use crate::error::{Result, ViewError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
    /// The source lost events; the view must be recrawled.
    pub overflow: bool,
}

#[derive(Debug)]
pub enum WatchPoll {
    Batch(WatchBatch),
    Timeout,
    Closed,
}

pub trait Watcher: Send {
    /// Blocks for at most `timeout` waiting for the next batch.
    fn next_batch(&mut self, timeout: Duration) -> WatchPoll;
}

/// Collects everything already buffered behind `first` into one batch.
fn drain_into(first: WatchBatch, rx: &Receiver<WatchBatch>) -> WatchBatch {
    let mut batch = first;
    loop {
        match rx.try_recv() {
            Ok(more) => {
                batch.overflow |= more.overflow;
                batch.events.extend(more.events);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return batch,
        }
    }
}

fn poll_channel(rx: &Receiver<WatchBatch>, timeout: Duration) -> WatchPoll {
    match rx.recv_timeout(timeout) {
        Ok(first) => WatchPoll::Batch(drain_into(first, rx)),
        Err(RecvTimeoutError::Timeout) => WatchPoll::Timeout,
        Err(RecvTimeoutError::Disconnected) => WatchPoll::Closed,
    }
}

/// A watcher fed by hand through a [`WatchSender`].
#[derive(Debug)]
pub struct ChannelWatcher {
    rx: Receiver<WatchBatch>,
}

/// Producer half of a [`ChannelWatcher`]. Dropping every sender closes the
/// watcher.
#[derive(Debug, Clone)]
pub struct WatchSender {
    tx: Sender<WatchBatch>,
}

impl ChannelWatcher {
    pub fn new() -> (WatchSender, ChannelWatcher) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (WatchSender { tx }, ChannelWatcher { rx })
    }
}

impl WatchSender {
    /// Returns false once the watcher is gone.
    pub fn send(&self, events: Vec<WatchEvent>) -> bool {
        self.tx
            .send(WatchBatch {
                events,
                overflow: false,
            })
            .is_ok()
    }

    pub fn changed(&self, path: impl Into<PathBuf>) -> bool {
        self.send(vec![WatchEvent::new(path, WatchEventKind::Modified)])
    }

    pub fn overflow(&self) -> bool {
        self.tx
            .send(WatchBatch {
                events: Vec::new(),
                overflow: true,
            })
            .is_ok()
    }
}

impl Watcher for ChannelWatcher {
    fn next_batch(&mut self, timeout: Duration) -> WatchPoll {
        poll_channel(&self.rx, timeout)
    }
}

/// Recursive watch of a real directory through the platform backend
/// chosen by `notify`.
pub struct NotifyWatcher {
    // Kept alive for as long as events are wanted.
    _inner: RecommendedWatcher,
    rx: Receiver<WatchBatch>,
}

fn translate(event: notify::Event) -> Option<WatchBatch> {
    let overflow = event.need_rescan();
    let kind = match event.kind {
        EventKind::Access(_) => return None,
        EventKind::Create(_) => WatchEventKind::Created,
        EventKind::Modify(_) => WatchEventKind::Modified,
        EventKind::Remove(_) => WatchEventKind::Removed,
        EventKind::Any | EventKind::Other => WatchEventKind::Other,
    };
    if event.paths.is_empty() && !overflow {
        return None;
    }
    Some(WatchBatch {
        events: event
            .paths
            .into_iter()
            .map(|path| WatchEvent { path, kind })
            .collect(),
        overflow,
    })
}

impl NotifyWatcher {
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let batch = match res {
                Ok(event) => match translate(event) {
                    Some(batch) => batch,
                    None => return,
                },
                Err(err) => {
                    warn!(error = %err, "notification backend error; requesting recrawl");
                    WatchBatch {
                        events: Vec::new(),
                        overflow: true,
                    }
                }
            };
            let _ = tx.send(batch);
        })
        .map_err(|err| ViewError::Watcher(err.to_string()))?;
        inner
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| ViewError::Watcher(err.to_string()))?;
        debug!(root = %root.display(), "watching");
        Ok(Self { _inner: inner, rx })
    }
}

impl Watcher for NotifyWatcher {
    fn next_batch(&mut self, timeout: Duration) -> WatchPoll {
        poll_channel(&self.rx, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, Flag};
    use pretty_assertions::assert_eq;

    #[test]
    fn channel_batches_coalesce_buffered_sends() {
        let (tx, mut watcher) = ChannelWatcher::new();
        tx.changed("/r/a");
        tx.overflow();
        tx.changed("/r/b");
        match watcher.next_batch(Duration::from_millis(10)) {
            WatchPoll::Batch(batch) => {
                assert!(batch.overflow);
                let paths: Vec<_> = batch.events.iter().map(|e| e.path.clone()).collect();
                assert_eq!(paths, vec![PathBuf::from("/r/a"), PathBuf::from("/r/b")]);
            }
            other => panic!("unexpected poll result {other:?}"),
        }
        assert!(matches!(
            watcher.next_batch(Duration::from_millis(1)),
            WatchPoll::Timeout
        ));
        drop(tx);
        assert!(matches!(
            watcher.next_batch(Duration::from_millis(1)),
            WatchPoll::Closed
        ));
    }

    #[test]
    fn notify_events_are_translated() {
        let event = notify::Event::new(EventKind::Create(CreateKind::File)).add_path("/r/x".into());
        let batch = translate(event).unwrap();
        assert_eq!(
            batch.events,
            vec![WatchEvent::new("/r/x", WatchEventKind::Created)]
        );
        assert!(!batch.overflow);

        let access = notify::Event::new(EventKind::Access(AccessKind::Any)).add_path("/r/x".into());
        assert!(translate(access).is_none());

        let rescan = notify::Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert!(translate(rescan).unwrap().overflow);
    }
}
