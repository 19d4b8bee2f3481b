use std::collections::HashMap;

use byteorder::{LittleEndian, WriteBytesExt};

use super::format::{
    ChunkInfo, ChunkType, ContainerError, ExportEntry, Header, ImportEntry, NameEntry, PathEntry,
    PropertyEntry, TypeEntry, CHUNK_COUNT, CONTAINER_VERSION, FLAG_PROTECTED_LAYOUT, HEADER_SIZE,
    IMPORT_FLAG_EAGER,
};
use super::payload::PayloadWriter;
use crate::{Resource, ResourceKey, ResourcePath, ResourceType};

/// Interning builder for the chunk tables of one container.
///
/// Index 0 of the name, type, property, path and import tables is the null
/// entry, so a zero index in any payload always means "no reference".
pub struct FileTablesBuilder {
    strings: Vec<u8>,
    string_map: HashMap<String, u32>,
    names: Vec<NameEntry>,
    name_map: HashMap<String, u32>,
    types: Vec<TypeEntry>,
    type_map: HashMap<String, u32>,
    properties: Vec<PropertyEntry>,
    property_map: HashMap<(u32, u32), u32>,
    paths: Vec<PathEntry>,
    path_map: HashMap<(u32, String), u32>,
    imports: Vec<ImportEntry>,
    import_map: HashMap<ResourceKey, u32>,
    import_keys: Vec<ResourceKey>,
    exports: Vec<ExportEntry>,
}

impl FileTablesBuilder {
    pub(crate) fn new() -> Self {
        Self {
            strings: vec![0],
            string_map: HashMap::new(),
            names: vec![NameEntry::default()],
            name_map: HashMap::new(),
            types: vec![TypeEntry::default()],
            type_map: HashMap::new(),
            properties: vec![PropertyEntry::default()],
            property_map: HashMap::new(),
            paths: vec![PathEntry::default()],
            path_map: HashMap::new(),
            imports: vec![ImportEntry::default()],
            import_map: HashMap::new(),
            import_keys: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub(crate) fn map_string(&mut self, value: &str) -> u32 {
        if value.is_empty() {
            return 0;
        }
        if let Some(offset) = self.string_map.get(value) {
            return *offset;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(value.as_bytes());
        self.strings.push(0);
        self.string_map.insert(value.to_owned(), offset);
        offset
    }

    pub(crate) fn map_name(&mut self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        if let Some(index) = self.name_map.get(name) {
            return *index;
        }
        let string_offset = self.map_string(name);
        let index = self.names.len() as u32;
        self.names.push(NameEntry { string_offset });
        self.name_map.insert(name.to_owned(), index);
        index
    }

    pub(crate) fn map_type(&mut self, type_name: &str) -> u32 {
        if type_name.is_empty() {
            return 0;
        }
        if let Some(index) = self.type_map.get(type_name) {
            return *index;
        }
        let name_index = self.map_name(type_name);
        let index = self.types.len() as u32;
        self.types.push(TypeEntry { name_index });
        self.type_map.insert(type_name.to_owned(), index);
        index
    }

    pub(crate) fn map_property(&mut self, type_name: &str, property_name: &str) -> u32 {
        let type_index = self.map_type(type_name);
        let name_index = self.map_name(property_name);
        if let Some(index) = self.property_map.get(&(type_index, name_index)) {
            return *index;
        }
        let index = self.properties.len() as u32;
        self.properties.push(PropertyEntry {
            type_index,
            name_index,
        });
        self.property_map.insert((type_index, name_index), index);
        index
    }

    pub(crate) fn map_path(&mut self, path: &ResourcePath) -> u32 {
        let mut parent = 0_u32;
        for segment in path.as_str().split('/').filter(|s| !s.is_empty()) {
            let map_key = (parent, segment.to_owned());
            parent = if let Some(index) = self.path_map.get(&map_key) {
                *index
            } else {
                let string_offset = self.map_string(segment);
                let index = self.paths.len() as u32;
                self.paths.push(PathEntry {
                    parent_index: parent,
                    string_offset,
                });
                self.path_map.insert(map_key, index);
                index
            };
        }
        parent
    }

    pub(crate) fn map_import(&mut self, key: &ResourceKey, eager: bool) -> u32 {
        if let Some(index) = self.import_map.get(key).copied() {
            // once any referencing object wants the import eagerly, it
            // stays eager
            if eager {
                self.imports[index as usize].flags |= IMPORT_FLAG_EAGER;
            }
            return index;
        }

        let type_index = self.map_type(key.class().name());
        let path_index = self.map_path(key.path());
        let index = self.imports.len() as u32;
        self.imports.push(ImportEntry {
            type_index,
            path_index,
            flags: if eager { IMPORT_FLAG_EAGER } else { 0 },
        });
        self.import_map.insert(key.clone(), index);
        self.import_keys.push(key.clone());
        index
    }

    pub(crate) fn import_keys(&self) -> &[ResourceKey] {
        &self.import_keys
    }

    fn table_sizes(&self) -> [usize; CHUNK_COUNT] {
        [
            self.strings.len(),
            self.names.len() * 4,
            self.types.len() * 4,
            self.properties.len() * 8,
            self.paths.len() * 8,
            self.imports.len() * 12,
            self.exports.len() * 24,
        ]
    }

    fn counts(&self) -> [u32; CHUNK_COUNT] {
        [
            self.strings.len() as u32,
            self.names.len() as u32,
            self.types.len() as u32,
            self.properties.len() as u32,
            self.paths.len() as u32,
            self.imports.len() as u32,
            self.exports.len() as u32,
        ]
    }
}

/// Saving parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct SaveContext {
    /// Write per-object CRCs and set the protected-layout header flag.
    pub protected_layout: bool,
}

/// One object to store in a container. Parents must be listed before their
/// children; `parent` is an index into the same slice.
pub struct SaveObject<'a> {
    /// The object to serialize.
    pub object: &'a dyn Resource,
    /// Index of the parent object within the save list, if any.
    pub parent: Option<u32>,
}

/// Serializes `objects` into a complete container file image.
///
/// The object at index 0 becomes the document root. Table construction is
/// deterministic: identical input produces identical bytes.
pub fn save_container(
    context: &SaveContext,
    objects: &[SaveObject<'_>],
) -> Result<Vec<u8>, ContainerError> {
    if objects.is_empty() {
        return Err(ContainerError::Serialization(
            "cannot save a container with no objects".into(),
        ));
    }

    let mut builder = FileTablesBuilder::new();
    let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(objects.len());

    for (index, entry) in objects.iter().enumerate() {
        if let Some(parent) = entry.parent {
            if parent as usize >= index {
                return Err(ContainerError::Serialization(format!(
                    "object {index} is listed before its parent {parent}"
                )));
            }
        }

        let type_index = builder.map_type(entry.object.type_name());

        let mut writer = PayloadWriter::new(&mut builder);
        entry.object.write_binary(&mut writer)?;
        let bytes = writer.into_bytes();

        builder.exports.push(ExportEntry {
            type_index,
            parent_index: entry.parent.map_or(0, |parent| parent + 1),
            data_offset: 0, // patched below once the table layout is known
            data_size: bytes.len() as u32,
            crc: crc32fast::hash(&bytes),
        });
        payloads.push(bytes);
    }

    // table layout
    let sizes = builder.table_sizes();
    let counts = builder.counts();
    let mut chunks = [ChunkInfo::default(); CHUNK_COUNT];
    let mut offset = HEADER_SIZE;
    for chunk in 0..CHUNK_COUNT {
        chunks[chunk] = ChunkInfo {
            offset: offset as u32,
            count: counts[chunk],
        };
        offset += sizes[chunk];
    }
    let headers_end = offset as u64;

    // payload layout
    let mut data_offset = headers_end;
    for (export, payload) in builder.exports.iter_mut().zip(&payloads) {
        export.data_offset = data_offset;
        data_offset += payload.len() as u64;
    }
    let objects_end = data_offset;

    let header = Header {
        version: CONTAINER_VERSION,
        flags: if context.protected_layout {
            FLAG_PROTECTED_LAYOUT
        } else {
            0
        },
        headers_end,
        objects_end,
        chunks,
    };

    let mut out = Vec::with_capacity(objects_end as usize);
    header.write(&mut out);

    out.extend_from_slice(&builder.strings);
    for name in &builder.names {
        out.write_u32::<LittleEndian>(name.string_offset).unwrap();
    }
    for ty in &builder.types {
        out.write_u32::<LittleEndian>(ty.name_index).unwrap();
    }
    for property in &builder.properties {
        out.write_u32::<LittleEndian>(property.type_index).unwrap();
        out.write_u32::<LittleEndian>(property.name_index).unwrap();
    }
    for path in &builder.paths {
        out.write_u32::<LittleEndian>(path.parent_index).unwrap();
        out.write_u32::<LittleEndian>(path.string_offset).unwrap();
    }
    for import in &builder.imports {
        out.write_u32::<LittleEndian>(import.type_index).unwrap();
        out.write_u32::<LittleEndian>(import.path_index).unwrap();
        out.write_u32::<LittleEndian>(import.flags).unwrap();
    }
    for export in &builder.exports {
        out.write_u32::<LittleEndian>(export.type_index).unwrap();
        out.write_u32::<LittleEndian>(export.parent_index).unwrap();
        out.write_u64::<LittleEndian>(export.data_offset).unwrap();
        out.write_u32::<LittleEndian>(export.data_size).unwrap();
        out.write_u32::<LittleEndian>(export.crc).unwrap();
    }

    debug_assert_eq!(out.len() as u64, headers_end);
    for payload in &payloads {
        out.extend_from_slice(payload);
    }

    Ok(out)
}

/// Serializes `object` against a throwaway table set and returns every
/// resource key it references. The cook queue uses this to discover the
/// outgoing references of a freshly cooked object.
pub fn extract_referenced_resources(
    object: &dyn Resource,
) -> Result<Vec<ResourceKey>, ContainerError> {
    let mut builder = FileTablesBuilder::new();
    let mut writer = PayloadWriter::new(&mut builder);
    object.write_binary(&mut writer)?;
    drop(writer);
    Ok(builder.import_keys.clone())
}

/// Looks up the cooked-artifact file extension registered for a resource
/// class.
pub fn extension_for_class(
    types: &crate::TypeRegistry,
    class: &ResourceType,
) -> Option<String> {
    types
        .find_type(class.name())
        .and_then(|handle| handle.extension().map(str::to_owned))
}
