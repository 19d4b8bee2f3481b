use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ember_data_runtime::container::{
    save_container, ContainerError, CookMetadata, SaveContext, SaveObject,
};
use ember_data_runtime::Resource;
use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

/// One cooked resource waiting to be serialized to storage.
pub struct SaveJob {
    /// The cooked object; becomes export 0 of the container.
    pub root: Box<dyn Resource>,
    /// Metadata record stored next to it, as a child export.
    pub metadata: CookMetadata,
    /// Destination path of the cooked container.
    pub destination: PathBuf,
}

/// Handle to a queued save, usable to cancel it before its write begins.
pub struct SaveTicket {
    cancelled: Arc<AtomicBool>,
}

impl SaveTicket {
    /// Marks the job canceled. Honored only while the write has not yet
    /// started; a write in progress always runs to completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct QueuedSave {
    job: SaveJob,
    cancelled: Arc<AtomicBool>,
}

enum SaveCommand {
    Save(QueuedSave),
    Exit,
}

#[derive(Default)]
struct PendingCounter {
    count: Mutex<usize>,
    done: Condvar,
}

impl PendingCounter {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.done.notify_all();
        }
    }
}

/// Single-consumer background thread serializing cooked resources off the
/// hot path.
///
/// Jobs are processed in FIFO order. Dropping the thread lets a write
/// that already started finish, then drops everything still queued.
pub struct SaveThread {
    tx: crossbeam_channel::Sender<SaveCommand>,
    pending: Arc<PendingCounter>,
    exit: Arc<AtomicBool>,
    scheduled: AtomicUsize,
    thread: Option<JoinHandle<()>>,
}

impl SaveThread {
    /// Spawns the consumer thread.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<SaveCommand>();
        let pending = Arc::new(PendingCounter::default());
        let exit = Arc::new(AtomicBool::new(false));

        let thread = {
            let pending = pending.clone();
            let exit = exit.clone();
            std::thread::Builder::new()
                .name("resource-save".into())
                .spawn(move || consume(&rx, &pending, &exit))
                .expect("failed to spawn the save thread")
        };

        Self {
            tx,
            pending,
            exit,
            scheduled: AtomicUsize::new(0),
            thread: Some(thread),
        }
    }

    /// Enqueues a save. Returns a ticket that can cancel the job until its
    /// write begins.
    pub fn schedule_save(&self, job: SaveJob) -> SaveTicket {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.pending.add();
        self.scheduled.fetch_add(1, Ordering::SeqCst);

        if self
            .tx
            .send(SaveCommand::Save(QueuedSave {
                job,
                cancelled: cancelled.clone(),
            }))
            .is_err()
        {
            self.pending.finish();
        }

        SaveTicket { cancelled }
    }

    /// Number of saves ever scheduled on this thread.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    /// Blocks the calling thread until the queue drains. Never called from
    /// a cooperative task.
    pub fn wait_until_done(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.done.wait(&mut count);
        }
    }
}

impl Default for SaveThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SaveThread {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::SeqCst);
        let _ = self.tx.send(SaveCommand::Exit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn consume(
    rx: &crossbeam_channel::Receiver<SaveCommand>,
    pending: &PendingCounter,
    exit: &AtomicBool,
) {
    while let Ok(command) = rx.recv() {
        match command {
            SaveCommand::Save(queued) => {
                if exit.load(Ordering::SeqCst) || queued.cancelled.load(Ordering::SeqCst) {
                    pending.finish();
                    continue;
                }
                match write_job(&queued.job) {
                    Ok(size) => info!(
                        "Saved '{}' ({} bytes)",
                        queued.job.destination.display(),
                        size
                    ),
                    Err(err) => error!(
                        "Failed to save '{}': {}",
                        queued.job.destination.display(),
                        err
                    ),
                }
                pending.finish();
            }
            SaveCommand::Exit => {
                // everything still queued is dropped
                while let Ok(SaveCommand::Save(_)) = rx.try_recv() {
                    pending.finish();
                }
                break;
            }
        }
    }
}

/// Serializes a cooked object plus its metadata record into a container
/// image with the protected layout enabled.
pub(crate) fn serialize_cooked(
    root: &dyn Resource,
    metadata: &CookMetadata,
) -> Result<Vec<u8>, ContainerError> {
    save_container(
        &SaveContext {
            protected_layout: true,
        },
        &[
            SaveObject {
                object: root,
                parent: None,
            },
            SaveObject {
                object: metadata,
                parent: Some(0),
            },
        ],
    )
}

fn write_job(job: &SaveJob) -> Result<usize, crate::Error> {
    let bytes = serialize_cooked(job.root.as_ref(), &job.metadata)?;
    if let Some(parent) = job.destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&job.destination, &bytes)?;
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use ember_data_runtime::container::{PayloadReader, PayloadWriter};

    use super::*;

    struct TextAsset(String);

    impl Resource for TextAsset {
        fn type_name(&self) -> &str {
            "TextAsset"
        }
        fn write_binary(&self, writer: &mut PayloadWriter<'_>) -> Result<(), ContainerError> {
            writer.write_str(&self.0);
            Ok(())
        }
        fn read_binary(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ContainerError> {
            self.0 = reader.read_string()?;
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Blocks serialization until the gate channel is signaled, to make
    /// queue-timing tests deterministic.
    struct GatedAsset {
        started: crossbeam_channel::Sender<()>,
        gate: crossbeam_channel::Receiver<()>,
    }

    impl Resource for GatedAsset {
        fn type_name(&self) -> &str {
            "TextAsset"
        }
        fn write_binary(&self, writer: &mut PayloadWriter<'_>) -> Result<(), ContainerError> {
            let _ = self.started.send(());
            let _ = self.gate.recv();
            writer.write_str("gated");
            Ok(())
        }
        fn read_binary(&mut self, _reader: &mut PayloadReader<'_>) -> Result<(), ContainerError> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn job(destination: PathBuf, root: Box<dyn Resource>) -> SaveJob {
        SaveJob {
            root,
            metadata: CookMetadata::default(),
            destination,
        }
    }

    #[test]
    fn saves_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("cooked/a.test");

        let thread = SaveThread::new();
        thread.schedule_save(job(destination.clone(), Box::new(TextAsset("x".into()))));
        thread.wait_until_done();

        assert!(destination.exists());
        assert_eq!(thread.scheduled_count(), 1);
    }

    #[test]
    fn cancellation_before_the_write_begins_drops_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked.test");
        let cancelled_path = dir.path().join("cancelled.test");

        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);

        let thread = SaveThread::new();
        // the consumer stalls inside the first job's serialization
        thread.schedule_save(job(
            blocked.clone(),
            Box::new(GatedAsset {
                started: started_tx,
                gate: gate_rx,
            }),
        ));
        started_rx.recv().unwrap();
        let ticket =
            thread.schedule_save(job(cancelled_path.clone(), Box::new(TextAsset("y".into()))));
        ticket.cancel();

        gate_tx.send(()).unwrap();
        thread.wait_until_done();

        assert!(blocked.exists());
        assert!(!cancelled_path.exists());
    }

    #[test]
    fn drop_lets_the_started_job_finish() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("finished.test");

        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
        let thread = SaveThread::new();
        thread.schedule_save(job(
            destination.clone(),
            Box::new(GatedAsset {
                started: started_tx,
                gate: gate_rx,
            }),
        ));

        // the write is in flight; tearing the thread down must let it
        // finish
        started_rx.recv().unwrap();
        let gate = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            gate_tx.send(()).unwrap();
        });
        drop(thread);

        assert!(destination.exists());
        gate.join().unwrap();
    }
}
