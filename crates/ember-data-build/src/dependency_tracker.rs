use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ember_data_runtime::container::SourceDependency;
use ember_data_runtime::vfs::{Depot, DepotEvent};
use ember_data_runtime::ResourceKey;
use parking_lot::Mutex;
use tracing::info;

/// Shared source-file node: the set of artifacts depending on one file.
///
/// Nodes live in a directory-tree index built lazily per path segment, so
/// a file-changed notification fans out in O(dependents) and
/// directory-level invalidation stays cheap.
#[derive(Default)]
struct SourceFileNode {
    users: HashSet<ResourceKey>,
}

#[derive(Default)]
struct DirectoryNode {
    directories: HashMap<String, DirectoryNode>,
    files: HashMap<String, SourceFileNode>,
}

impl DirectoryNode {
    fn file_mut(&mut self, path: &str, create: bool) -> Option<&mut SourceFileNode> {
        let mut node = self;
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();

        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                return if create {
                    Some(node.files.entry(segment.to_owned()).or_default())
                } else {
                    node.files.get_mut(segment)
                };
            }
            node = if create {
                node.directories.entry(segment.to_owned()).or_default()
            } else {
                node.directories.get_mut(segment)?
            };
        }
        None
    }

    /// Removes `artifact` from the file node at `path`, pruning nodes left
    /// without users. Returns true when this directory became empty.
    fn remove_user(&mut self, path: &str, artifact: &ResourceKey) -> bool {
        match path.split_once('/') {
            Some((segment, rest)) => {
                if let Some(child) = self.directories.get_mut(segment) {
                    if child.remove_user(rest, artifact) {
                        self.directories.remove(segment);
                    }
                }
            }
            None => {
                if let Some(file) = self.files.get_mut(path) {
                    file.users.remove(artifact);
                    if file.users.is_empty() {
                        self.files.remove(path);
                    }
                }
            }
        }
        self.directories.is_empty() && self.files.is_empty()
    }

    fn directory(&self, path: &str) -> Option<&DirectoryNode> {
        let mut node = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.directories.get(segment)?;
        }
        Some(node)
    }

    fn collect_users(&self, out: &mut HashSet<ResourceKey>) {
        for file in self.files.values() {
            out.extend(file.users.iter().cloned());
        }
        for directory in self.directories.values() {
            directory.collect_users(out);
        }
    }
}

struct ArtifactState {
    dependencies: Vec<SourceDependency>,
}

#[derive(Default)]
struct TrackerState {
    artifacts: HashMap<ResourceKey, ArtifactState>,
    root: DirectoryNode,
    /// Artifacts whose sources changed since the last drain. Insertion is
    /// exactly-once per change: a second notification before the drain is
    /// a no-op.
    changed: HashSet<ResourceKey>,
}

/// Maps cooked artifacts to the source files they were produced from and
/// answers "is this cooked artifact still valid?" against the live file
/// system.
pub struct DependencyTracker {
    depot: Arc<dyn Depot>,
    events: crossbeam_channel::Receiver<DepotEvent>,
    state: Mutex<TrackerState>,
}

impl DependencyTracker {
    /// Creates a tracker subscribed to the depot's change-notification
    /// stream.
    pub fn new(depot: Arc<dyn Depot>) -> Self {
        let events = depot.subscribe();
        Self {
            depot,
            events,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Replaces the dependency set of an artifact.
    ///
    /// Both edge directions mutate under the same lock scope, so a source
    /// node can never keep a dangling user after a dependency list is
    /// replaced.
    pub fn notify_dependencies_changed(
        &self,
        artifact: &ResourceKey,
        dependencies: Vec<SourceDependency>,
    ) {
        let mut state = self.state.lock();
        let state = &mut *state;

        if let Some(previous) = state.artifacts.remove(artifact) {
            for dependency in &previous.dependencies {
                state.root.remove_user(&dependency.path, artifact);
            }
        }

        for dependency in &dependencies {
            if let Some(file) = state.root.file_mut(&dependency.path, true) {
                file.users.insert(artifact.clone());
            }
        }

        state
            .artifacts
            .insert(artifact.clone(), ArtifactState { dependencies });
    }

    /// Validates every recorded source timestamp against the live file
    /// system.
    ///
    /// "Up to date" requires the current timestamp to equal the recorded
    /// one *exactly* — any drift, including a file restored to an older
    /// mtime than was recorded, is a change. Unnecessary recooks are
    /// preferred over stale artifacts.
    pub fn check_up_to_date(&self, artifact: &ResourceKey) -> bool {
        let dependencies = {
            let state = self.state.lock();
            match state.artifacts.get(artifact) {
                Some(artifact) => artifact.dependencies.clone(),
                None => return false,
            }
        };

        for dependency in &dependencies {
            let Some(info) = self.depot.file_info(&dependency.path) else {
                info!("Dependency file '{}' no longer exists", dependency.path);
                return false;
            };
            if info.timestamp != dependency.timestamp {
                info!("Dependency file '{}' has changed", dependency.path);
                return false;
            }
            if dependency.size != 0 && info.size != dependency.size {
                info!("Dependency file '{}' changed size", dependency.path);
                return false;
            }
        }
        true
    }

    /// Fans a file-changed notification out to every dependent artifact.
    pub fn notify_file_changed(&self, path: &str) {
        let mut state = self.state.lock();
        let state = &mut *state;
        if let Some(file) = state.root.file_mut(path, false) {
            for user in &file.users {
                state.changed.insert(user.clone());
            }
        }
    }

    /// Marks every artifact depending on anything under `path` as changed.
    pub fn notify_directory_removed(&self, path: &str) {
        let mut affected = HashSet::new();
        let mut state = self.state.lock();
        if let Some(directory) = state.root.directory(path) {
            directory.collect_users(&mut affected);
        }
        state.changed.extend(affected);
    }

    /// Atomically takes and clears the changed-artifact set.
    pub fn drain_changed_artifacts(&self) -> Vec<ResourceKey> {
        self.state.lock().changed.drain().collect()
    }

    /// Drains the depot change-notification stream into the changed set.
    pub fn pump_events(&self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                DepotEvent::FileChanged(path) | DepotEvent::FileRemoved(path) => {
                    self.notify_file_changed(&path);
                }
                DepotEvent::DirectoryRemoved(path) => {
                    self.notify_directory_removed(&path);
                }
                DepotEvent::FileAdded(_) | DepotEvent::DirectoryAdded(_) => {}
            }
        }
    }

    #[cfg(test)]
    fn source_file_users(&self, path: &str) -> usize {
        let mut state = self.state.lock();
        state
            .root
            .file_mut(path, false)
            .map_or(0, |file| file.users.len())
    }
}
