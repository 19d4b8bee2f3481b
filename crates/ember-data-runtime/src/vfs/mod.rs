//! Depot and device abstractions the loader reads through.

use std::io;

use async_trait::async_trait;

use crate::ResourceKey;

mod dir_depot;
pub use dir_depot::DirDepot;

mod mem_depot;
pub use mem_depot::{MemoryDepot, MemoryFile};

mod depot_device;
pub use depot_device::DepotDevice;

/// Size and timestamp of a depot file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// File size in bytes.
    pub size: u64,
    /// Depot-defined timestamp value. Compared for exact equality by the
    /// dependency tracker, so the unit only has to be stable, not wall
    /// clock.
    pub timestamp: u64,
}

/// Change notification delivered by a depot, keyed by normalized virtual
/// path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DepotEvent {
    /// Content of an existing file changed.
    FileChanged(String),
    /// A file appeared.
    FileAdded(String),
    /// A file disappeared.
    FileRemoved(String),
    /// A directory appeared.
    DirectoryAdded(String),
    /// A directory disappeared.
    DirectoryRemoved(String),
}

/// Random-access readable byte source backing one container file.
#[async_trait]
pub trait AsyncFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; short reads past the end of file are not errors.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Total file size in bytes.
    fn len(&self) -> u64;

    /// True for a zero-length file.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The physical file system the pipeline reads sources from and watches
/// for changes.
///
/// The watcher itself is an external collaborator; backends only expose
/// the notification stream it feeds.
#[async_trait]
pub trait Depot: Send + Sync {
    /// Size and timestamp of a file, or `None` when it does not exist.
    fn file_info(&self, path: &str) -> Option<FileInfo>;

    /// Timestamp of a file, or `None` when it does not exist.
    fn file_timestamp(&self, path: &str) -> Option<u64> {
        self.file_info(path).map(|info| info.timestamp)
    }

    /// Opens a file for random-access async reading.
    async fn open(&self, path: &str) -> Option<Box<dyn AsyncFile>>;

    /// Reads a whole file synchronously. Used by cookers running on
    /// dedicated threads that must not suspend.
    fn read_file(&self, path: &str) -> Option<Vec<u8>>;

    /// Names of the files directly inside `directory` (no recursion).
    fn enum_files_at(&self, directory: &str) -> Vec<String>;

    /// Names of the directories directly inside `directory`.
    fn enum_directories_at(&self, directory: &str) -> Vec<String>;

    /// Subscribes to the change-notification stream.
    fn subscribe(&self) -> crossbeam_channel::Receiver<DepotEvent>;
}

/// One loader backend. Devices are tried in registration order by the
/// registry; the first one that produces a file wins.
#[async_trait]
pub trait Device: Send + Sync {
    /// Opens the container backing `key`, if this device can serve it.
    async fn open(&self, key: &ResourceKey) -> Option<Box<dyn AsyncFile>>;

    /// Timestamp used for cache staleness checks of `key`, if this device
    /// can serve it.
    fn timestamp(&self, key: &ResourceKey) -> Option<u64>;
}
