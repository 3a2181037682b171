pub mod clock;
pub mod config;
pub mod cookie;
pub mod crawler;
pub mod error;
pub mod export;
pub mod fs;
pub mod glob;
pub mod memfs;
pub mod model;
pub mod pending;
pub mod query;
pub mod store;
pub mod threads;
pub mod view;
pub mod watcher;

pub use clock::{ClockPosition, ClockSpec};
pub use config::ViewConfig;
pub use crawler::CrawlSummary;
pub use error::{FsError, Result, StaleReason, ViewError};
pub use fs::{DirEntry, FileSystem, OsFileSystem};
pub use glob::{GlobOptions, GlobTree};
pub use memfs::MemoryFileSystem;
pub use model::*;
pub use pending::{PendingCollection, PendingFlags};
pub use query::{FileRef, FileResult, PathSpec, QueryContext, QueryResult};
pub use store::{AgeOutStats, TreeStore};
pub use threads::ViewThreads;
pub use view::InMemoryView;
pub use watcher::{ChannelWatcher, NotifyWatcher, WatchBatch, WatchEvent, WatchEventKind, WatchSender, Watcher};
