use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::format::{
    ChunkType, ContainerError, ExportEntry, FileTables, HEADER_SIZE, IMPORT_FLAG_EAGER,
};
use super::metadata::{CookMetadata, COOK_METADATA_TYPE};
use super::payload::PayloadReader;
use crate::vfs::AsyncFile;
use crate::{
    HandleUntyped, PropertyHandle, Resource, ResourceKey, ResourcePath, ResourceType, TypeHandle,
    TypeRegistry, RESOURCE_BASE_TYPE,
};

const DEFAULT_LOAD_BUFFER_SIZE: u64 = 8 << 20;
const BLOCK_SIZE: u64 = 4096;

/// Parameters of one container load.
pub struct FileLoadingContext {
    /// Load eager imports recursively through the provided
    /// [`ImportLoader`].
    pub load_imports: bool,
    /// When set, construct only the first export whose type matches this
    /// class and skip everything else.
    pub selective_class: Option<String>,
    /// Depot path the container was opened from, for log context.
    pub resource_path: Option<ResourcePath>,
}

impl Default for FileLoadingContext {
    fn default() -> Self {
        Self {
            load_imports: true,
            selective_class: None,
            resource_path: None,
        }
    }
}

/// Resolves imports of a container being loaded, typically by suspending
/// on the owning registry's `load` path.
#[async_trait]
pub trait ImportLoader: Send + Sync {
    /// Loads one imported resource. `None` degrades the import to an
    /// unresolved reference; it never aborts the container load.
    async fn load_import(&self, key: &ResourceKey) -> Option<HandleUntyped>;
}

/// An import table entry resolved against the live type registry and
/// loader.
#[derive(Default)]
pub struct ResolvedImport {
    /// Resolved class of the reference, if the type still exists.
    pub class: Option<TypeHandle>,
    /// Referenced resource identity, if the class resolved.
    pub key: Option<ResourceKey>,
    /// The import was flagged for loading with the container.
    pub eager: bool,
    /// The loaded resource, for eager imports that resolved.
    pub loaded: Option<HandleUntyped>,
}

/// Transient resolved-reference table, built once per load and consumed by
/// every payload deserialization of that load.
#[derive(Default)]
pub struct ResolvedReferences {
    pub(crate) names: Vec<Option<Arc<str>>>,
    pub(crate) type_names: Vec<Option<Arc<str>>>,
    pub(crate) types: Vec<Option<TypeHandle>>,
    pub(crate) properties: Vec<Option<PropertyHandle>>,
    pub(crate) imports: Vec<ResolvedImport>,
}

impl ResolvedReferences {
    /// Resolved imports of the load.
    pub fn imports(&self) -> &[ResolvedImport] {
        &self.imports
    }
}

/// Outcome of a successful container load.
pub struct LoadResult {
    /// Constructed objects in export table order. Skipped exports stay
    /// `None`.
    pub objects: Vec<Option<Box<dyn Resource>>>,
    /// Export indices of parentless objects; index 0 is the document root
    /// on a non-selective load.
    pub roots: Vec<u32>,
    /// The resolved-reference table of the load.
    pub references: ResolvedReferences,
}

impl LoadResult {
    /// Takes ownership of the first root object.
    pub fn take_root(&mut self) -> Option<Box<dyn Resource>> {
        let index = *self.roots.first()? as usize;
        self.objects.get_mut(index)?.take()
    }
}

/// Reads and validates the header and chunk tables of a container.
pub async fn load_tables(file: &dyn AsyncFile) -> Result<FileTables, ContainerError> {
    let mut header_buf = [0_u8; HEADER_SIZE];
    let read = file.read_at(0, &mut header_buf).await?;
    if read < HEADER_SIZE {
        return Err(ContainerError::TruncatedRead {
            offset: 0,
            wanted: HEADER_SIZE as u64,
            got: read as u64,
        });
    }

    // bounds (including the 64 MiB table ceiling) are validated before any
    // allocation happens
    let header = super::format::Header::read(&header_buf)?;

    let mut tables_data = vec![0_u8; header.headers_end as usize];
    let read = file.read_at(0, &mut tables_data).await?;
    if (read as u64) < header.headers_end {
        return Err(ContainerError::TruncatedRead {
            offset: 0,
            wanted: header.headers_end,
            got: read as u64,
        });
    }

    FileTables::parse(&tables_data)
}

fn resolve_names(tables: &FileTables, refs: &mut ResolvedReferences) -> Result<(), ContainerError> {
    let count = tables.chunk_count(ChunkType::Names) as usize;
    refs.names = Vec::with_capacity(count);
    for entry in tables.names() {
        let text = tables.string_at(entry.string_offset)?;
        refs.names
            .push((!text.is_empty()).then(|| Arc::<str>::from(text)));
    }
    Ok(())
}

fn resolve_types(tables: &FileTables, types: &TypeRegistry, refs: &mut ResolvedReferences) {
    let count = tables.chunk_count(ChunkType::Types) as usize;
    refs.types = Vec::with_capacity(count);
    refs.type_names = Vec::with_capacity(count);

    for entry in tables.types() {
        let type_name = refs.names[entry.name_index as usize].clone();
        refs.type_names.push(type_name.clone());

        let resolved = type_name.as_deref().and_then(|name| {
            let resolved = types.find_type(name);
            if resolved.is_none() {
                warn!(
                    "FileLoad: Unknown type '{}' used in serialization. Type may have been removed or renamed. File may load with errors or not at all.",
                    name
                );
            }
            resolved
        });
        refs.types.push(resolved);
    }
}

fn resolve_properties(tables: &FileTables, refs: &mut ResolvedReferences) {
    refs.properties = Vec::with_capacity(tables.chunk_count(ChunkType::Properties) as usize);

    for entry in tables.properties() {
        let class = refs.types[entry.type_index as usize].clone();
        let name = refs.names[entry.name_index as usize].clone();

        let resolved = match (class, name) {
            (Some(class), Some(name)) => {
                let property = class.find_property(&name);
                if property.is_none() {
                    warn!(
                        "FileLoad: Missing property '{}' from type '{}' used in serialization. Property may have been removed or renamed. File may load with some small errors.",
                        name,
                        class.name()
                    );
                }
                property
            }
            _ => None,
        };
        refs.properties.push(resolved);
    }
}

async fn resolve_imports(
    tables: &FileTables,
    context: &FileLoadingContext,
    loader: Option<&dyn ImportLoader>,
    refs: &mut ResolvedReferences,
) -> Result<(), ContainerError> {
    let count = tables.chunk_count(ChunkType::Imports) as usize;
    refs.imports = Vec::with_capacity(count);

    let mut to_load: Vec<usize> = Vec::new();
    for (index, entry) in tables.imports().iter().enumerate() {
        if index == 0 {
            refs.imports.push(ResolvedImport::default());
            continue;
        }

        let class = refs.types[entry.type_index as usize].clone();
        let class_name = refs.type_names[entry.type_index as usize].clone();
        let path = ResourcePath::new(tables.resolve_path(entry.path_index)?);
        let key = class_name
            .as_deref()
            .map(|name| ResourceKey::new(path, ResourceType::new(name)));
        let eager = entry.flags & IMPORT_FLAG_EAGER != 0;

        if eager && context.load_imports && loader.is_some() && key.is_some() {
            to_load.push(index);
        }
        refs.imports.push(ResolvedImport {
            class,
            key,
            eager,
            loaded: None,
        });
    }

    // fan out all eager imports at once and join before any payload byte
    // is deserialized
    if let Some(loader) = loader {
        if !to_load.is_empty() {
            let loads = to_load.iter().map(|index| {
                let key = refs.imports[*index].key.clone().unwrap();
                async move { loader.load_import(&key).await }
            });
            let loaded = futures::future::join_all(loads).await;

            for (index, resource) in to_load.into_iter().zip(loaded) {
                if resource.is_none() {
                    let key = refs.imports[index].key.as_ref().unwrap();
                    warn!("Loader: Missing reference to file '{}'", key);
                }
                refs.imports[index].loaded = resource;
            }
        }
    }

    Ok(())
}

fn resolve_exports(
    tables: &FileTables,
    context: &FileLoadingContext,
    refs: &ResolvedReferences,
) -> (Vec<Option<Box<dyn Resource>>>, Vec<u32>) {
    let count = tables.chunk_count(ChunkType::Exports) as usize;
    let mut objects: Vec<Option<Box<dyn Resource>>> = Vec::with_capacity(count);
    let mut roots = Vec::new();
    let mut selected = false;

    for (index, entry) in tables.exports().iter().enumerate() {
        let class = refs.types[entry.type_index as usize].as_ref();
        let class_name = refs.type_names[entry.type_index as usize]
            .as_deref()
            .unwrap_or("");

        let creatable = class.map_or(false, |class| {
            !class.is_abstract() && class.is_a(RESOURCE_BASE_TYPE)
        });
        if !creatable {
            warn!(
                "Object '{}' is using invalid type '{}' that is not a creatable class",
                index, class_name
            );
            objects.push(None);
            continue;
        }
        let class = class.unwrap();

        if let Some(filter) = &context.selective_class {
            // metadata-only loads construct exactly one matching export
            if selected || !class.is_a(filter) {
                objects.push(None);
                continue;
            }
            selected = true;
            roots.push(index as u32);
            objects.push(class.create());
            continue;
        }

        if entry.parent_index != 0 {
            // skip loading if the parent object failed to load
            if objects[entry.parent_index as usize - 1].is_none() {
                objects.push(None);
                continue;
            }
        } else {
            roots.push(index as u32);
        }

        objects.push(class.create());
    }

    (objects, roots)
}

pub(crate) fn determine_load_buffer_size(
    objects_end: u64,
    exports: &[ExportEntry],
    constructed: &[bool],
    whole_file: bool,
) -> u64 {
    // whole payload region fits under the default ceiling, load it in one
    // batch
    if whole_file && objects_end <= DEFAULT_LOAD_BUFFER_SIZE {
        return objects_end;
    }

    // otherwise the buffer must at least fit the biggest object actually
    // selected for loading, plus one block of slack for misalignment
    let mut max_object_size = 0_u64;
    for (entry, constructed) in exports.iter().zip(constructed) {
        if *constructed {
            max_object_size = max_object_size.max(u64::from(entry.data_size));
        }
    }

    (max_object_size + BLOCK_SIZE).max(DEFAULT_LOAD_BUFFER_SIZE)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Batch {
    pub first: usize,
    pub end: usize,
    pub start_offset: u64,
    pub end_offset: u64,
}

pub(crate) fn plan_batches(
    exports: &[ExportEntry],
    constructed: &[bool],
    buffer_size: u64,
) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut index = 0;

    while index < exports.len() {
        if !constructed[index] {
            index += 1;
            continue;
        }

        let first = index;
        // aligned down to the I/O block size
        let start_offset = (exports[index].data_offset / BLOCK_SIZE) * BLOCK_SIZE;
        let mut end_offset = exports[index].data_offset + u64::from(exports[index].data_size);
        index += 1;

        while index < exports.len() {
            if constructed[index] {
                let current_end =
                    exports[index].data_offset + u64::from(exports[index].data_size);
                if current_end > start_offset + buffer_size {
                    break;
                }
                end_offset = current_end;
            }
            index += 1;
        }

        batches.push(Batch {
            first,
            end: index,
            start_offset,
            end_offset,
        });
    }

    batches
}

/// Loads a container: validates the tables, resolves every reference,
/// constructs the selected exports, then streams payload bytes in bounded
/// batches and deserializes each object in table order.
pub async fn load_container(
    file: &dyn AsyncFile,
    types: &TypeRegistry,
    imports: Option<&dyn ImportLoader>,
    context: &FileLoadingContext,
) -> Result<LoadResult, ContainerError> {
    let tables = load_tables(file).await?;
    load_container_with_tables(file, &tables, types, imports, context).await
}

pub(crate) async fn load_container_with_tables(
    file: &dyn AsyncFile,
    tables: &FileTables,
    types: &TypeRegistry,
    imports: Option<&dyn ImportLoader>,
    context: &FileLoadingContext,
) -> Result<LoadResult, ContainerError> {
    let protected_layout = tables.header().protected_layout();

    // resolving also constructs every object selected for loading, so a
    // later payload can reference an earlier in-memory object
    let mut refs = ResolvedReferences::default();
    resolve_names(tables, &mut refs)?;
    resolve_types(tables, types, &mut refs);
    resolve_properties(tables, &mut refs);
    resolve_imports(tables, context, imports, &mut refs).await?;
    let (mut objects, roots) = resolve_exports(tables, context, &refs);

    let constructed: Vec<bool> = objects.iter().map(Option::is_some).collect();
    let exports = tables.exports();

    let buffer_size = determine_load_buffer_size(
        tables.header().objects_end,
        exports,
        &constructed,
        context.selective_class.is_none(),
    );
    let mut buffer = vec![0_u8; buffer_size as usize];

    for batch in plan_batches(exports, &constructed, buffer_size) {
        let load_size = batch.end_offset - batch.start_offset;
        debug_assert!(load_size <= buffer_size);

        let read = file
            .read_at(batch.start_offset, &mut buffer[..load_size as usize])
            .await?;
        if (read as u64) < load_size {
            return Err(ContainerError::TruncatedRead {
                offset: batch.start_offset,
                wanted: load_size,
                got: read as u64,
            });
        }

        for index in batch.first..batch.end {
            let Some(object) = objects[index].as_mut() else {
                continue;
            };
            let entry = &exports[index];
            let start = (entry.data_offset - batch.start_offset) as usize;
            let payload = &buffer[start..start + entry.data_size as usize];

            if protected_layout && crc32fast::hash(payload) != entry.crc {
                warn!(
                    "LoadFile: Invalid CRC for object {} in '{}'",
                    index,
                    context
                        .resource_path
                        .as_ref()
                        .map_or("<unknown>", ResourcePath::as_str)
                );
                return Err(ContainerError::ChecksumMismatch {
                    index: index as u32,
                });
            }

            let mut reader = PayloadReader::new(payload, &refs);
            object.read_binary(&mut reader)?;
        }
    }

    for object in objects.iter_mut().flatten() {
        object.post_load();
    }

    Ok(LoadResult {
        objects,
        roots,
        references: refs,
    })
}

/// An external reference recorded in a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerDependency {
    /// Identity of the referenced resource.
    pub key: ResourceKey,
    /// The reference is loaded eagerly with the container.
    pub eager: bool,
}

/// Lists the external references of a container without reading any
/// object payload.
pub async fn load_dependencies(
    file: &dyn AsyncFile,
    types: &TypeRegistry,
) -> Result<Vec<ContainerDependency>, ContainerError> {
    let tables = load_tables(file).await?;

    let context = FileLoadingContext {
        load_imports: false,
        ..FileLoadingContext::default()
    };

    let mut refs = ResolvedReferences::default();
    resolve_names(&tables, &mut refs)?;
    resolve_types(&tables, types, &mut refs);
    resolve_imports(&tables, &context, None, &mut refs).await?;

    Ok(refs
        .imports
        .iter()
        .filter_map(|import| {
            import.key.clone().map(|key| ContainerDependency {
                key,
                eager: import.eager,
            })
        })
        .collect())
}

/// Loads only the cook metadata record of a cooked container.
///
/// This is a selective load: no other export is resolved, constructed or
/// read, so the up-to-date check stays cheap no matter how large the
/// cooked payload is.
pub async fn load_metadata(
    file: &dyn AsyncFile,
    types: &TypeRegistry,
) -> Result<Option<CookMetadata>, ContainerError> {
    let context = FileLoadingContext {
        load_imports: false,
        selective_class: Some(COOK_METADATA_TYPE.to_owned()),
        resource_path: None,
    };

    let mut result = load_container(file, types, None, &context).await?;
    Ok(result
        .take_root()
        .and_then(|object| object.downcast_ref::<CookMetadata>().cloned()))
}
