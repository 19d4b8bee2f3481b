use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AsyncFile, Depot, DepotEvent, FileInfo};

struct MemoryEntry {
    data: Arc<Vec<u8>>,
    timestamp: u64,
}

/// In-memory depot backend with settable timestamps and injectable change
/// events. Test scaffolding for the loader, tracker and cook queue.
pub struct MemoryDepot {
    files: Mutex<HashMap<String, MemoryEntry>>,
    subscribers: Mutex<Vec<crossbeam_channel::Sender<DepotEvent>>>,
}

impl MemoryDepot {
    /// Creates an empty depot.
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Stores a file at `path` with an explicit timestamp, emitting the
    /// matching added/changed event.
    pub fn write_file(&self, path: &str, data: impl Into<Vec<u8>>, timestamp: u64) {
        let replaced = self
            .files
            .lock()
            .insert(
                path.to_owned(),
                MemoryEntry {
                    data: Arc::new(data.into()),
                    timestamp,
                },
            )
            .is_some();

        self.broadcast(if replaced {
            DepotEvent::FileChanged(path.to_owned())
        } else {
            DepotEvent::FileAdded(path.to_owned())
        });
    }

    /// Rewrites only the timestamp of an existing file, emitting a changed
    /// event.
    pub fn touch(&self, path: &str, timestamp: u64) {
        if let Some(entry) = self.files.lock().get_mut(path) {
            entry.timestamp = timestamp;
        }
        self.broadcast(DepotEvent::FileChanged(path.to_owned()));
    }

    /// Removes a file, emitting a removed event.
    pub fn remove_file(&self, path: &str) {
        if self.files.lock().remove(path).is_some() {
            self.broadcast(DepotEvent::FileRemoved(path.to_owned()));
        }
    }

    fn broadcast(&self, event: DepotEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for MemoryDepot {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Depot for MemoryDepot {
    fn file_info(&self, path: &str) -> Option<FileInfo> {
        self.files.lock().get(path).map(|entry| FileInfo {
            size: entry.data.len() as u64,
            timestamp: entry.timestamp,
        })
    }

    async fn open(&self, path: &str) -> Option<Box<dyn AsyncFile>> {
        let data = self.files.lock().get(path)?.data.clone();
        Some(Box::new(MemoryFile::new(data)))
    }

    fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).map(|entry| entry.data.to_vec())
    }

    fn enum_files_at(&self, directory: &str) -> Vec<String> {
        let files = self.files.lock();
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|path| {
                let rest = path.strip_prefix(directory)?;
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_owned())
            })
            .collect();
        names.sort();
        names
    }

    fn enum_directories_at(&self, directory: &str) -> Vec<String> {
        let files = self.files.lock();
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|path| {
                let rest = path.strip_prefix(directory)?;
                rest.split_once('/').map(|(first, _)| first.to_owned())
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn subscribe(&self) -> crossbeam_channel::Receiver<DepotEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }
}

/// Random-access view over an in-memory byte buffer.
pub struct MemoryFile {
    data: Arc<Vec<u8>>,
}

impl MemoryFile {
    /// Wraps a shared buffer.
    pub fn new(data: Arc<Vec<u8>>) -> Self {
        Self { data }
    }

    /// Wraps an owned buffer.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }
}

#[async_trait]
impl AsyncFile for MemoryFile {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = (offset as usize).min(self.data.len());
        let end = (start + buf.len()).min(self.data.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(end - start)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
