use std::sync::Arc;

use ember_data_runtime::container::SourceDependency;
use ember_data_runtime::vfs::Depot;
use ember_data_runtime::{Resource, ResourceKey, ResourceType, TypeRegistry};
use thiserror::Error;

/// Version of the generic cook pipeline itself.
///
/// Folded into every recorded cooker version, so bumping it invalidates
/// every cooked artifact on disk.
pub const DATA_COOK_VERSION: u32 = 1;

/// Cooker error. A failing cooker fails its own key only; siblings keep
/// processing.
#[derive(Error, Debug)]
pub enum CookError {
    /// The source file could not be read from the depot.
    #[error("source file '{0}' could not be read")]
    SourceNotFound(String),

    /// The source file was read but could not be understood.
    #[error("source file '{0}' is malformed: {1}")]
    MalformedSource(String, String),

    /// The cooker ran but produced no output object.
    #[error("cooker produced no output for '{0}'")]
    NoOutput(ResourceKey),

    /// Anything else the cooker wants to surface.
    #[error("{0}")]
    Failed(String),
}

/// Diagnostic sink one cook invocation writes into.
///
/// The cook queue captures the collected lines into the artifact's sidecar
/// log: discarded on success (unless all logs are kept), retained on
/// failure so a human can inspect exactly what the cooker emitted.
#[derive(Default)]
pub struct CookLog {
    lines: Vec<String>,
}

impl CookLog {
    /// Records one diagnostic line.
    pub fn record(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// The captured lines, in emission order.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// Context of one cook invocation.
pub struct CookContext<'a> {
    /// Depot the source files are read from.
    pub depot: &'a dyn Depot,
    /// Type reflection service.
    pub types: &'a TypeRegistry,
    /// Captured diagnostics of this invocation.
    pub log: &'a mut CookLog,
    source_dependencies: Vec<SourceDependency>,
}

impl<'a> CookContext<'a> {
    /// Creates a cook context.
    pub fn new(depot: &'a dyn Depot, types: &'a TypeRegistry, log: &'a mut CookLog) -> Self {
        Self {
            depot,
            types,
            log,
            source_dependencies: Vec::new(),
        }
    }

    /// Records a source file the cooked artifact depends on, capturing its
    /// current depot timestamp and size. Every recorded dependency ends up
    /// in the artifact's metadata record and drives the up-to-date check.
    pub fn add_source_dependency(&mut self, path: &str) {
        let info = self.depot.file_info(path);
        self.source_dependencies.push(SourceDependency {
            path: path.to_owned(),
            timestamp: info.map_or(0, |info| info.timestamp),
            size: info.map_or(0, |info| info.size),
        });
    }

    /// Convenience: reads a source file and records it as a dependency.
    pub fn read_source(&mut self, path: &str) -> Result<Vec<u8>, CookError> {
        self.add_source_dependency(path);
        self.depot
            .read_file(path)
            .ok_or_else(|| CookError::SourceNotFound(path.to_owned()))
    }

    /// The dependencies recorded so far, in cook order.
    pub fn source_dependencies(&self) -> &[SourceDependency] {
        &self.source_dependencies
    }

    /// Takes the recorded dependencies.
    pub fn into_source_dependencies(self) -> Vec<SourceDependency> {
        self.source_dependencies
    }
}

/// One asset-specific cooker backend.
///
/// Implementations are registered with a [`crate::CookerRegistry`] and
/// selected per key; the pipeline itself never inspects cooked payloads.
pub trait Cooker: Send + Sync {
    /// Stable cooker name, recorded in cooked metadata.
    fn name(&self) -> &str;

    /// Cooker version. A version change invalidates every artifact this
    /// cooker produced.
    fn version(&self) -> u32;

    /// Whether `key` is cookable by this backend and, if so, the concrete
    /// class the cooked output will have.
    fn can_cook(&self, key: &ResourceKey) -> Option<ResourceType>;

    /// Cooks one resource. `Err` fails this key only.
    fn cook(
        &self,
        key: &ResourceKey,
        context: &mut CookContext<'_>,
    ) -> Result<Box<dyn Resource>, CookError>;
}

/// Shared cooker handle.
pub type CookerHandle = Arc<dyn Cooker>;
