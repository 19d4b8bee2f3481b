use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ember_data_compiler::{CookContext, CookLog, CookerHandle, CookerRegistry};
use ember_data_runtime::container::{
    extension_for_class, extract_referenced_resources, load_dependencies, load_metadata,
    CookMetadata, SourceDependency,
};
use ember_data_runtime::vfs::{Depot, MemoryFile};
use ember_data_runtime::{ResourceKey, ResourcePath, ResourceType, TypeRegistry};
use tracing::{error, info, warn};

use crate::{DependencyTracker, Error, SaveJob, SaveThread};

/// A run aborts once more keys than this have failed: that many failures
/// are evidence of systemic breakage, not isolated asset problems.
pub const MAX_TOTAL_FAILURES: u32 = 100;

/// Progress/cancellation hook of a cook run.
pub trait CookProgress {
    /// Called after each processed key.
    fn report(&mut self, _processed: u32, _message: &str) {}

    /// Polled between keys; returning true abandons the run.
    fn cancelled(&self) -> bool {
        false
    }
}

/// No-op progress sink.
pub struct NoProgress;

impl CookProgress for NoProgress {}

/// Options and flags of a [`CookQueue`].
pub struct CookOptions {
    output_root: PathBuf,
    capture_logs: bool,
    keep_all_logs: bool,
    seed_extension: String,
    seed_class: ResourceType,
}

impl CookOptions {
    /// Creates default options cooking into `output_root`.
    pub fn new(output_root: impl AsRef<Path>) -> Self {
        Self {
            output_root: output_root.as_ref().to_owned(),
            capture_logs: true,
            keep_all_logs: false,
            seed_extension: "seed".to_owned(),
            seed_class: ResourceType::new(ember_data_runtime::RESOURCE_BASE_TYPE),
        }
    }

    /// Emit cooker diagnostics to the normal log instead of capturing
    /// them into sidecar files.
    #[must_use]
    pub fn verbose_logs(mut self) -> Self {
        self.capture_logs = false;
        self
    }

    /// Keep sidecar logs of successful cooks instead of discarding them.
    #[must_use]
    pub fn keep_all_logs(mut self) -> Self {
        self.keep_all_logs = true;
        self
    }

    /// File extension the seed scan looks for.
    #[must_use]
    pub fn seed_extension(mut self, extension: impl Into<String>) -> Self {
        self.seed_extension = extension.into();
        self
    }

    /// Class scanned seed files are scheduled as.
    #[must_use]
    pub fn seed_class(mut self, class: ResourceType) -> Self {
        self.seed_class = class;
        self
    }
}

/// Counters of one cook run.
#[derive(Clone, Copy, Debug, Default)]
pub struct CookStats {
    /// Keys popped off the work-list, duplicates included.
    pub visited: u32,
    /// Keys whose cooked output was still valid.
    pub up_to_date: u32,
    /// Keys cooked this run.
    pub cooked: u32,
    /// Keys whose cook failed.
    pub failed: u32,
}

/// Work-list engine that recursively discovers dependencies of a cook
/// target, skips up-to-date artifacts and dispatches the remainder to the
/// background save thread.
pub struct CookQueue {
    depot: Arc<dyn Depot>,
    types: Arc<TypeRegistry>,
    cookers: Arc<CookerRegistry>,
    tracker: Arc<DependencyTracker>,
    save_thread: SaveThread,
    options: CookOptions,
    scheduled: VecDeque<ResourceKey>,
    scheduled_set: HashSet<ResourceKey>,
    all_seen: HashSet<ResourceKey>,
    all_cooked: HashSet<(ResourcePath, ResourceType)>,
    stats: CookStats,
    cook_file_index: u32,
}

impl CookQueue {
    /// Creates a queue with its own background save thread.
    pub fn new(
        depot: Arc<dyn Depot>,
        types: Arc<TypeRegistry>,
        cookers: Arc<CookerRegistry>,
        tracker: Arc<DependencyTracker>,
        options: CookOptions,
    ) -> Self {
        info!("Cooking output directory: '{}'", options.output_root.display());
        Self {
            depot,
            types,
            cookers,
            tracker,
            save_thread: SaveThread::new(),
            options,
            scheduled: VecDeque::new(),
            scheduled_set: HashSet::new(),
            all_seen: HashSet::new(),
            all_cooked: HashSet::new(),
            stats: CookStats::default(),
            cook_file_index: 0,
        }
    }

    /// The background save thread of this queue.
    pub fn save_thread(&self) -> &SaveThread {
        &self.save_thread
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> CookStats {
        self.stats
    }

    /// True when `(path, cooked class)` was cooked during this run.
    pub fn was_cooked(&self, path: &ResourcePath, class: &ResourceType) -> bool {
        self.all_cooked.contains(&(path.clone(), class.clone()))
    }

    /// Enqueues a root cook target. A key already scheduled this run is
    /// ignored.
    pub fn schedule_job(&mut self, key: ResourceKey) -> bool {
        if !self.scheduled_set.insert(key.clone()) {
            info!("Cook job '{}' is already scheduled", key);
            return false;
        }
        self.scheduled.push_back(key);
        true
    }

    /// Scans the depot for seed files and schedules each. Returns the
    /// number of seeds found.
    pub fn collect_seed_files(&mut self) -> u32 {
        let mut seeds = Vec::new();
        let mut directories_visited = 0;
        self.scan_directory_for_seed_files("", &mut seeds, &mut directories_visited);
        info!(
            "Found {} seed lists in {} depot directories",
            seeds.len(),
            directories_visited
        );

        let mut scheduled = 0;
        for path in seeds {
            let key = ResourceKey::new(path, self.options.seed_class.clone());
            if self.schedule_job(key) {
                scheduled += 1;
            }
        }
        scheduled
    }

    fn scan_directory_for_seed_files(
        &self,
        directory: &str,
        out: &mut Vec<ResourcePath>,
        directories_visited: &mut u32,
    ) {
        *directories_visited += 1;
        let suffix = format!(".{}", self.options.seed_extension);

        for name in self.depot.enum_files_at(directory) {
            if name.ends_with(&suffix) {
                out.push(ResourcePath::new(format!("{directory}{name}")));
            }
        }
        for name in self.depot.enum_directories_at(directory) {
            self.scan_directory_for_seed_files(&format!("{directory}{name}/"), out, directories_visited);
        }
    }

    /// Pops one scheduled seed and fully processes its cook tree. Returns
    /// `Ok(false)` once the queue is empty.
    pub fn process_next_job(&mut self, progress: &mut dyn CookProgress) -> Result<bool, Error> {
        let Some(seed) = self.scheduled.pop_front() else {
            return Ok(false);
        };
        self.process_seed(&seed, progress)?;
        Ok(true)
    }

    /// Collects seeds, processes every scheduled job and waits for the
    /// save queue to drain.
    pub fn run(&mut self, progress: &mut dyn CookProgress) -> Result<CookStats, Error> {
        self.collect_seed_files();
        while self.process_next_job(progress)? {}
        self.save_thread.wait_until_done();

        info!(
            "Visited {} files, {} up to date, {} cooked and {} failed",
            self.stats.visited, self.stats.up_to_date, self.stats.cooked, self.stats.failed
        );
        Ok(self.stats)
    }

    fn process_seed(
        &mut self,
        seed: &ResourceKey,
        progress: &mut dyn CookProgress,
    ) -> Result<(), Error> {
        let mut queue: Vec<ResourceKey> = vec![seed.clone()];
        let mut local_processed = 0_u32;

        while let Some(key) = queue.pop() {
            if progress.cancelled() {
                return Err(Error::Cancelled);
            }

            local_processed += 1;
            self.stats.visited += 1;

            // never cook the same key twice in one session
            if !self.all_seen.insert(key.clone()) {
                continue;
            }

            let Some((cooker, cooked_class)) = self.cookers.find_cooker(&key) else {
                warn!(
                    "Resource '{}' is not cookable and will be skipped. Why is it referenced though?",
                    key
                );
                continue;
            };

            let Some(output_path) = self.cooked_output_path(&key, &cooked_class) else {
                warn!("Resource '{}' is not cookable (no valid cooked extension)", key);
                continue;
            };

            let artifact_key = key.with_class(cooked_class.clone());

            // the cook can only be skipped if the output exists and its
            // recorded dependencies still check out
            if output_path.exists() {
                match self.load_output_metadata(&output_path) {
                    Some(metadata) => {
                        if self.check_up_to_date(&artifact_key, &cooker, &metadata) {
                            // the skipped artifact's own recorded
                            // dependencies still get their trees walked
                            self.queue_existing_dependencies(&output_path, &mut queue);
                            self.stats.up_to_date += 1;
                            continue;
                        }
                    }
                    None => {
                        warn!(
                            "Failed to load metadata for output file '{}'. It might be corrupted, recooking.",
                            output_path.display()
                        );
                    }
                }
            }

            if self.cook_file(&key, &cooker, &cooked_class, &output_path, &mut queue) {
                self.stats.cooked += 1;
            } else {
                self.stats.failed += 1;
                if self.stats.failed > MAX_TOTAL_FAILURES {
                    error!(
                        "More than {} files failed cooking, something must be VERY wrong. Stopping now.",
                        MAX_TOTAL_FAILURES
                    );
                    return Err(Error::TooManyFailures(self.stats.failed));
                }
            }

            progress.report(local_processed, key.path().as_str());
        }

        info!(
            "Processed {} source files for seed file '{}'",
            local_processed,
            seed.path()
        );
        Ok(())
    }

    fn check_up_to_date(
        &self,
        artifact_key: &ResourceKey,
        cooker: &CookerHandle,
        metadata: &CookMetadata,
    ) -> bool {
        if metadata.cooker_class != cooker.name() {
            info!(
                "Cooker for '{}' changed from '{}' to '{}'",
                artifact_key, metadata.cooker_class, cooker.name()
            );
            return false;
        }
        if metadata.cooker_version != cooker.version() {
            info!(
                "Cooker '{}' changed version from {} -> {}",
                metadata.cooker_class,
                metadata.cooker_version,
                cooker.version()
            );
            return false;
        }

        self.tracker
            .notify_dependencies_changed(artifact_key, metadata.source_dependencies.clone());
        self.tracker.check_up_to_date(artifact_key)
    }

    fn load_output_metadata(&self, output_path: &Path) -> Option<CookMetadata> {
        let bytes = fs::read(output_path).ok()?;
        let file = MemoryFile::from_bytes(bytes);
        futures::executor::block_on(load_metadata(&file, &self.types))
            .ok()
            .flatten()
    }

    fn queue_existing_dependencies(&self, output_path: &Path, queue: &mut Vec<ResourceKey>) {
        let Ok(bytes) = fs::read(output_path) else {
            return;
        };
        let file = MemoryFile::from_bytes(bytes);
        match futures::executor::block_on(load_dependencies(&file, &self.types)) {
            Ok(dependencies) => {
                info!(
                    "Loaded {} existing dependencies from '{}'",
                    dependencies.len(),
                    output_path.display()
                );
                for dependency in dependencies {
                    queue.push(dependency.key);
                }
            }
            Err(err) => {
                warn!(
                    "Failed to list dependencies of '{}': {}",
                    output_path.display(),
                    err
                );
            }
        }
    }

    fn cooked_output_path(&self, key: &ResourceKey, cooked_class: &ResourceType) -> Option<PathBuf> {
        cooked_output_path(&self.options.output_root, &self.types, key, cooked_class)
    }

    fn cook_file(
        &mut self,
        key: &ResourceKey,
        cooker: &CookerHandle,
        cooked_class: &ResourceType,
        output_path: &Path,
        queue: &mut Vec<ResourceKey>,
    ) -> bool {
        // promote the key to its true cooked class, ie Texture:lena.png
        // cooks as StaticTexture:lena.png
        let cook_key = key.with_class(cooked_class.clone());
        if !self
            .all_cooked
            .insert((cook_key.path().clone(), cooked_class.clone()))
        {
            return true;
        }

        info!("Cooking file {}: {}", self.cook_file_index, cook_key);
        self.cook_file_index += 1;

        let mut capture = CookLogCapture::new(output_path, self.options.capture_logs);
        let mut log = CookLog::default();
        let mut context = CookContext::new(self.depot.as_ref(), &self.types, &mut log);
        let result = cooker.cook(&cook_key, &mut context);

        let mut dependencies = context.into_source_dependencies();
        if dependencies.is_empty() {
            // a cooker that records nothing still depends on its own
            // source file
            if let Some(info) = self.depot.file_info(key.path().as_str()) {
                dependencies.push(SourceDependency {
                    path: key.path().as_str().to_owned(),
                    timestamp: info.timestamp,
                    size: info.size,
                });
            }
        }
        capture.append(log.lines());

        match result {
            Ok(cooked) => {
                if !self.options.keep_all_logs {
                    capture.discard();
                }

                self.tracker
                    .notify_dependencies_changed(&cook_key, dependencies.clone());

                match extract_referenced_resources(cooked.as_ref()) {
                    Ok(references) => {
                        if !references.is_empty() {
                            info!(
                                "Found {} referenced resources, adding them to cook list",
                                references.len()
                            );
                            for reference in references {
                                if !self.all_seen.contains(&reference) {
                                    queue.push(reference);
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!("Failed to extract references of '{}': {}", cook_key, err);
                    }
                }

                self.save_thread.schedule_save(SaveJob {
                    root: cooked,
                    metadata: CookMetadata {
                        cooker_class: cooker.name().to_owned(),
                        cooker_version: cooker.version(),
                        source_dependencies: dependencies,
                    },
                    destination: output_path.to_owned(),
                });
                true
            }
            Err(err) => {
                error!("Failed to cook file '{}': {}", cook_key, err);
                capture.append(&[format!("ERROR: {err}")]);
                // the sidecar log of a failed cook is retained
                false
            }
        }
    }
}

/// Deterministic cooked-output location of `(key, cooked class)` under
/// `output_root`: `<outputRoot>/cooked/<basePath><fileName>.<extension>`.
pub fn cooked_output_path(
    output_root: &Path,
    types: &TypeRegistry,
    key: &ResourceKey,
    cooked_class: &ResourceType,
) -> Option<PathBuf> {
    let extension = extension_for_class(types, cooked_class)?;
    Some(
        output_root
            .join("cooked")
            .join(format!("{}.{}", key.path(), extension)),
    )
}

/// Captures one cook's diagnostics into the artifact's sidecar log file.
struct CookLogCapture {
    log_path: PathBuf,
    file: Option<fs::File>,
}

impl CookLogCapture {
    fn new(output_path: &Path, capture: bool) -> Self {
        let mut log_path = output_path.as_os_str().to_owned();
        log_path.push(".log");
        let log_path = PathBuf::from(log_path);

        let file = capture
            .then(|| {
                if let Some(parent) = log_path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                fs::File::create(&log_path).ok()
            })
            .flatten();

        Self { log_path, file }
    }

    fn append(&mut self, lines: &[String]) {
        if let Some(file) = &mut self.file {
            for line in lines {
                if writeln!(file, "{line}").is_err() {
                    self.file = None;
                    break;
                }
            }
        } else {
            for line in lines {
                info!("[cook] {}", line);
            }
        }
    }

    fn discard(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.log_path);
        }
    }
}
