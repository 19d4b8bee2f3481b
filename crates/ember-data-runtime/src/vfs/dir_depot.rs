use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::{AsyncFile, Depot, DepotEvent, FileInfo};

/// Depot backend mounted on a physical directory.
///
/// Change notifications are fed by an external watcher through the
/// `notify_*` entry points and fanned out to every subscriber.
pub struct DirDepot {
    root: PathBuf,
    subscribers: Mutex<Vec<crossbeam_channel::Sender<DepotEvent>>>,
}

impl DirDepot {
    /// Mounts `root` as the depot root.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_owned(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn broadcast(&self, event: DepotEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Entry point for an external file watcher.
    pub fn notify_file_changed(&self, path: &str) {
        info!("File {} was reported as changed", path);
        self.broadcast(DepotEvent::FileChanged(path.to_owned()));
    }

    /// Entry point for an external file watcher.
    pub fn notify_file_added(&self, path: &str) {
        info!("File {} was reported as added", path);
        self.broadcast(DepotEvent::FileAdded(path.to_owned()));
    }

    /// Entry point for an external file watcher.
    pub fn notify_file_removed(&self, path: &str) {
        info!("File {} was reported as removed", path);
        self.broadcast(DepotEvent::FileRemoved(path.to_owned()));
    }

    /// Entry point for an external file watcher.
    pub fn notify_directory_added(&self, path: &str) {
        self.broadcast(DepotEvent::DirectoryAdded(path.to_owned()));
    }

    /// Entry point for an external file watcher.
    pub fn notify_directory_removed(&self, path: &str) {
        self.broadcast(DepotEvent::DirectoryRemoved(path.to_owned()));
    }
}

fn timestamp_of(metadata: &fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |duration| duration.as_nanos() as u64)
}

#[async_trait]
impl Depot for DirDepot {
    fn file_info(&self, path: &str) -> Option<FileInfo> {
        let metadata = fs::metadata(self.resolve(path)).ok()?;
        if !metadata.is_file() {
            return None;
        }
        Some(FileInfo {
            size: metadata.len(),
            timestamp: timestamp_of(&metadata),
        })
    }

    async fn open(&self, path: &str) -> Option<Box<dyn AsyncFile>> {
        let file = fs::File::open(self.resolve(path)).ok()?;
        let len = file.metadata().ok()?.len();
        Some(Box::new(DirFile {
            file: Mutex::new(file),
            len,
        }))
    }

    fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        fs::read(self.resolve(path)).ok()
    }

    fn enum_files_at(&self, directory: &str) -> Vec<String> {
        enum_entries(&self.resolve(directory), true)
    }

    fn enum_directories_at(&self, directory: &str) -> Vec<String> {
        enum_entries(&self.resolve(directory), false)
    }

    fn subscribe(&self) -> crossbeam_channel::Receiver<DepotEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }
}

fn enum_entries(directory: &Path, files: bool) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(entries) = fs::read_dir(directory) {
        for entry in entries.flatten() {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file == files {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
    }
    names.sort();
    names
}

struct DirFile {
    file: Mutex<fs::File>,
    len: u64,
}

#[async_trait]
impl AsyncFile for DirFile {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(read) => total += read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    fn len(&self) -> u64 {
        self.len
    }
}
