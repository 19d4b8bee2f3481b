use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ember_data_compiler::{CookContext, CookLog, CookerRegistry};
use ember_data_runtime::container::{load_metadata, CookMetadata, SourceDependency};
use ember_data_runtime::vfs::{AsyncFile, Depot, Device, MemoryFile};
use ember_data_runtime::{ResourceKey, TypeRegistry};
use tracing::{error, info, warn};

use crate::{cooked_output_path, serialize_cooked, DependencyTracker};

/// Loader device that cooks resources as they are being requested.
///
/// Before serving a cooked container it validates the artifact's recorded
/// cooker and dependency state; a stale or missing artifact goes through
/// the cooker right here, inside the load. Selected at registry
/// construction, next to (or instead of) the plain depot device.
pub struct BuildDevice {
    depot: Arc<dyn Depot>,
    types: Arc<TypeRegistry>,
    cookers: Arc<CookerRegistry>,
    tracker: Arc<DependencyTracker>,
    output_root: PathBuf,
    force_recook: bool,
}

impl BuildDevice {
    /// Creates a build device cooking into `output_root`.
    pub fn new(
        depot: Arc<dyn Depot>,
        types: Arc<TypeRegistry>,
        cookers: Arc<CookerRegistry>,
        tracker: Arc<DependencyTracker>,
        output_root: impl Into<PathBuf>,
        force_recook: bool,
    ) -> Self {
        Self {
            depot,
            types,
            cookers,
            tracker,
            output_root: output_root.into(),
            force_recook,
        }
    }

    async fn existing_artifact(
        &self,
        artifact_key: &ResourceKey,
        output_path: &std::path::Path,
        cooker_name: &str,
        cooker_version: u32,
    ) -> Option<Vec<u8>> {
        let bytes = tokio::fs::read(output_path).await.ok()?;

        let metadata = load_metadata(&MemoryFile::from_bytes(bytes.clone()), &self.types)
            .await
            .ok()
            .flatten()?;
        if metadata.cooker_class != cooker_name || metadata.cooker_version != cooker_version {
            info!(
                "Cooked artifact '{}' was produced by '{}' v{}, recooking",
                artifact_key, metadata.cooker_class, metadata.cooker_version
            );
            return None;
        }

        self.tracker
            .notify_dependencies_changed(artifact_key, metadata.source_dependencies);
        if !self.tracker.check_up_to_date(artifact_key) {
            return None;
        }
        Some(bytes)
    }
}

#[async_trait]
impl Device for BuildDevice {
    async fn open(&self, key: &ResourceKey) -> Option<Box<dyn AsyncFile>> {
        let (cooker, cooked_class) = self.cookers.find_cooker(key)?;
        let output_path = cooked_output_path(&self.output_root, &self.types, key, &cooked_class)?;
        let artifact_key = key.with_class(cooked_class);

        if !self.force_recook {
            if let Some(bytes) = self
                .existing_artifact(&artifact_key, &output_path, cooker.name(), cooker.version())
                .await
            {
                return Some(Box::new(MemoryFile::from_bytes(bytes)));
            }
        }

        // stale or missing, cook it now
        let mut log = CookLog::default();
        let mut context = CookContext::new(self.depot.as_ref(), &self.types, &mut log);
        let cooked = match cooker.cook(&artifact_key, &mut context) {
            Ok(cooked) => cooked,
            Err(err) => {
                error!("Failed to cook file '{}': {}", artifact_key, err);
                return None;
            }
        };

        let mut dependencies = context.into_source_dependencies();
        if dependencies.is_empty() {
            if let Some(info) = self.depot.file_info(key.path().as_str()) {
                dependencies.push(SourceDependency {
                    path: key.path().as_str().to_owned(),
                    timestamp: info.timestamp,
                    size: info.size,
                });
            }
        }

        let metadata = CookMetadata {
            cooker_class: cooker.name().to_owned(),
            cooker_version: cooker.version(),
            source_dependencies: dependencies,
        };

        let bytes = match serialize_cooked(cooked.as_ref(), &metadata) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Failed to serialize cooked '{}': {}", artifact_key, err);
                return None;
            }
        };

        if let Some(parent) = output_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(err) = tokio::fs::write(&output_path, &bytes).await {
            // still servable from memory this session
            warn!(
                "Failed to store cooked output '{}': {}",
                output_path.display(),
                err
            );
        }

        self.tracker
            .notify_dependencies_changed(&artifact_key, metadata.source_dependencies.clone());

        Some(Box::new(MemoryFile::from_bytes(bytes)))
    }

    fn timestamp(&self, key: &ResourceKey) -> Option<u64> {
        // staleness of a built resource follows its *source* file
        self.depot.file_timestamp(key.path().as_str())
    }
}
