use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, ViewError};
use crate::fs::FileSystem;

#[derive(Debug)]
pub struct CookieSync {
    dir: PathBuf,
    /// Prefix shared by cookies of every process.
    prefix: String,
    /// Prefix of cookies created by this process.
    own_prefix: String,
    serial: AtomicU64,
    waiters: Mutex<HashMap<PathBuf, Sender<()>>>,
}

impl CookieSync {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
            own_prefix: format!("{prefix}{}-", std::process::id()),
            serial: AtomicU64::new(0),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `path` names a cookie file, ours or another process's.
    pub fn is_cookie(&self, path: &Path) -> bool {
        path.parent() == Some(self.dir.as_path())
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&self.prefix))
    }

    pub fn outstanding(&self) -> usize {
        self.waiters.lock().len()
    }

    fn register(&self) -> (PathBuf, Receiver<()>) {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("{}{serial}", self.own_prefix));
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.waiters.lock().insert(path.clone(), tx);
        (path, rx)
    }

    /// Releases the waiter on `path`, if any.
    pub fn notify_observed(&self, path: &Path) {
        if let Some(tx) = self.waiters.lock().remove(path) {
            debug!(cookie = %path.display(), "cookie observed");
            let _ = tx.send(());
        }
    }

    /// Creates a cookie through `fs` and blocks until the reconciler
    /// observes it or `timeout` passes.
    pub fn sync(&self, fs: &dyn FileSystem, timeout: Duration) -> Result<()> {
        let (path, rx) = self.register();
        if let Err(err) = fs.create_marker(&path) {
            self.waiters.lock().remove(&path);
            return Err(err.into());
        }
        let outcome = rx.recv_timeout(timeout);
        if let Err(err) = fs.remove_marker(&path) {
            if !err.is_not_found() {
                warn!(cookie = %path.display(), error = %err, "failed to remove cookie");
            }
        }
        match outcome {
            Ok(()) => Ok(()),
            Err(_) => {
                self.waiters.lock().remove(&path);
                Err(ViewError::CookieTimeout(path))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemoryFileSystem;
    use std::sync::Arc;

    #[test]
    fn recognises_cookie_paths() {
        let cookies = CookieSync::new("/r", ".cookie-");
        assert!(cookies.is_cookie(Path::new("/r/.cookie-1-0")));
        assert!(cookies.is_cookie(Path::new("/r/.cookie-other")));
        assert!(!cookies.is_cookie(Path::new("/r/sub/.cookie-1-0")));
        assert!(!cookies.is_cookie(Path::new("/r/file")));
    }

    #[test]
    fn sync_times_out_without_an_observer() {
        let fs = MemoryFileSystem::new();
        fs.mkdir_all("/r");
        let cookies = CookieSync::new("/r", ".cookie-");
        let err = cookies.sync(&fs, Duration::from_millis(10)).unwrap_err();
        let ViewError::CookieTimeout(path) = err else {
            panic!("unexpected error {err:?}");
        };
        assert!(!fs.exists(&path));
        assert_eq!(cookies.outstanding(), 0);
    }

    #[test]
    fn sync_returns_once_observed() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.mkdir_all("/r");
        let cookies = Arc::new(CookieSync::new("/r", ".cookie-"));
        let observer = {
            let fs = Arc::clone(&fs);
            let cookies = Arc::clone(&cookies);
            std::thread::spawn(move || loop {
                let listing = fs.list_directory(Path::new("/r")).unwrap();
                if let Some(entry) = listing.first() {
                    cookies.notify_observed(&Path::new("/r").join(&entry.name));
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            })
        };
        cookies.sync(&*fs, Duration::from_secs(10)).unwrap();
        observer.join().unwrap();
        assert!(fs.list_directory(Path::new("/r")).unwrap().is_empty());
    }

    #[test]
    fn creating_the_cookie_can_fail() {
        let fs = MemoryFileSystem::new();
        let cookies = CookieSync::new("/missing", ".cookie-");
        assert!(matches!(
            cookies.sync(&fs, Duration::from_millis(10)),
            Err(ViewError::NotFound(_))
        ));
        assert_eq!(cookies.outstanding(), 0);
    }
}
