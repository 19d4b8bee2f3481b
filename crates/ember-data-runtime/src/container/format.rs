use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Magic bytes opening every container file.
pub const CONTAINER_MAGIC: [u8; 4] = *b"EMCF";

/// Current container format version.
pub const CONTAINER_VERSION: u32 = 1;

/// Header flag: every object payload carries an individual CRC32 that is
/// verified before deserialization.
pub const FLAG_PROTECTED_LAYOUT: u32 = 1 << 0;

/// Import flag: the referenced resource is loaded as part of loading this
/// container. Without it the import is path-only.
pub const IMPORT_FLAG_EAGER: u32 = 1 << 0;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8 + CHUNK_COUNT * 8;

/// Ceiling on the table region of a container. Anything claiming more is
/// rejected as corrupt before any allocation happens.
pub const TABLES_MAX_SIZE: u64 = 64 << 20;

pub(crate) const CHUNK_COUNT: usize = 7;

/// Error raised by container reading, writing and validation.
///
/// Structural variants are always fatal to the single load or save
/// operation; semantic problems (unknown type, missing property) never
/// surface here — they degrade to null entries with a logged warning.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// The file does not start with the container magic.
    #[error("not a container file (bad magic)")]
    BadMagic,

    /// The container was written by an unsupported format version.
    #[error("unsupported container version {0}")]
    UnsupportedVersion(u32),

    /// A structural check on the header or chunk tables failed.
    #[error("invalid file tables: {0}")]
    InvalidTables(String),

    /// The byte source ended before the requested range.
    #[error("truncated read at offset {offset}: wanted {wanted} bytes, got {got}")]
    TruncatedRead {
        /// Byte offset of the read.
        offset: u64,
        /// Bytes requested.
        wanted: u64,
        /// Bytes actually read.
        got: u64,
    },

    /// A protected-layout payload failed its CRC check.
    #[error("payload checksum mismatch for export {index}")]
    ChecksumMismatch {
        /// Export table index of the corrupt object.
        index: u32,
    },

    /// A string table entry is not valid UTF-8.
    #[error("string table entry at offset {0} is not valid UTF-8")]
    InvalidString(u32),

    /// An object payload could not be (de)serialized.
    #[error("object serialization error: {0}")]
    Serialization(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Chunk table kinds, in their fixed on-disk order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ChunkType {
    /// Raw NUL-terminated byte blobs, referenced by byte offset.
    Strings = 0,
    /// Interned identifier entries.
    Names = 1,
    /// Type name entries.
    Types = 2,
    /// (type, name) property entries.
    Properties = 3,
    /// Parent-linked path tree entries.
    Paths = 4,
    /// External resource references.
    Imports = 5,
    /// Serialized object entries.
    Exports = 6,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ChunkInfo {
    pub offset: u32,
    /// Record count, or byte length for the string chunk.
    pub count: u32,
}

/// Fixed-size container header.
#[derive(Clone, Debug)]
pub struct Header {
    /// Format version the file was written with.
    pub version: u32,
    /// Flag bits, see [`FLAG_PROTECTED_LAYOUT`].
    pub flags: u32,
    /// Byte offset one past the chunk tables.
    pub headers_end: u64,
    /// Byte offset one past the object payload region.
    pub objects_end: u64,
    pub(crate) chunks: [ChunkInfo; CHUNK_COUNT],
}

impl Header {
    /// Parses and validates the fixed-size header.
    pub fn read(buf: &[u8]) -> Result<Self, ContainerError> {
        if buf.len() < HEADER_SIZE {
            return Err(ContainerError::TruncatedRead {
                offset: 0,
                wanted: HEADER_SIZE as u64,
                got: buf.len() as u64,
            });
        }

        let mut cursor = Cursor::new(buf);
        let mut magic = [0_u8; 4];
        std::io::Read::read_exact(&mut cursor, &mut magic)?;
        if magic != CONTAINER_MAGIC {
            return Err(ContainerError::BadMagic);
        }

        let version = cursor.read_u32::<LittleEndian>()?;
        if version == 0 || version > CONTAINER_VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }

        let flags = cursor.read_u32::<LittleEndian>()?;
        let headers_end = cursor.read_u64::<LittleEndian>()?;
        let objects_end = cursor.read_u64::<LittleEndian>()?;

        let mut chunks = [ChunkInfo::default(); CHUNK_COUNT];
        for chunk in &mut chunks {
            chunk.offset = cursor.read_u32::<LittleEndian>()?;
            chunk.count = cursor.read_u32::<LittleEndian>()?;
        }

        if headers_end < HEADER_SIZE as u64 || headers_end > TABLES_MAX_SIZE {
            return Err(ContainerError::InvalidTables(format!(
                "invalid size of file tables ({headers_end})"
            )));
        }
        if objects_end < headers_end {
            return Err(ContainerError::InvalidTables(format!(
                "object region end {objects_end} before tables end {headers_end}"
            )));
        }

        Ok(Self {
            version,
            flags,
            headers_end,
            objects_end,
            chunks,
        })
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&CONTAINER_MAGIC);
        out.write_u32::<LittleEndian>(self.version).unwrap();
        out.write_u32::<LittleEndian>(self.flags).unwrap();
        out.write_u64::<LittleEndian>(self.headers_end).unwrap();
        out.write_u64::<LittleEndian>(self.objects_end).unwrap();
        for chunk in &self.chunks {
            out.write_u32::<LittleEndian>(chunk.offset).unwrap();
            out.write_u32::<LittleEndian>(chunk.count).unwrap();
        }
    }

    /// True when object payloads carry individual checksums.
    pub fn protected_layout(&self) -> bool {
        self.flags & FLAG_PROTECTED_LAYOUT != 0
    }
}

/// Interned identifier entry: index into the string table.
#[derive(Clone, Copy, Debug, Default)]
pub struct NameEntry {
    /// Byte offset into the string chunk.
    pub string_offset: u32,
}

/// Type entry: resolved to a live type handle at load time.
#[derive(Clone, Copy, Debug, Default)]
pub struct TypeEntry {
    /// Index into the name table.
    pub name_index: u32,
}

/// Property entry: resolved to a live property handle at load time.
#[derive(Clone, Copy, Debug, Default)]
pub struct PropertyEntry {
    /// Owning type, as an index into the type table.
    pub type_index: u32,
    /// Property name, as an index into the name table.
    pub name_index: u32,
}

/// Path tree entry. Full paths are reconstructed by walking parents and
/// concatenating segments with `/`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PathEntry {
    /// Parent entry index; 0 is the tree root.
    pub parent_index: u32,
    /// Segment text, as a byte offset into the string chunk.
    pub string_offset: u32,
}

/// External resource reference.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImportEntry {
    /// Class of the referenced resource, as a type table index.
    pub type_index: u32,
    /// Referenced path, as a path table index.
    pub path_index: u32,
    /// Flag bits, see [`IMPORT_FLAG_EAGER`].
    pub flags: u32,
}

/// One serialized object.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExportEntry {
    /// Object class, as a type table index.
    pub type_index: u32,
    /// 1-based index of the parent export, or 0 for a root. Always points
    /// to an earlier export.
    pub parent_index: u32,
    /// Payload byte offset from the start of the file.
    pub data_offset: u64,
    /// Payload byte length.
    pub data_size: u32,
    /// CRC32 of the payload bytes.
    pub crc: u32,
}

const NAME_ENTRY_SIZE: usize = 4;
const TYPE_ENTRY_SIZE: usize = 4;
const PROPERTY_ENTRY_SIZE: usize = 8;
const PATH_ENTRY_SIZE: usize = 8;
const IMPORT_ENTRY_SIZE: usize = 12;
const EXPORT_ENTRY_SIZE: usize = 24;

pub(crate) const ENTRY_SIZES: [usize; CHUNK_COUNT] = [
    1,
    NAME_ENTRY_SIZE,
    TYPE_ENTRY_SIZE,
    PROPERTY_ENTRY_SIZE,
    PATH_ENTRY_SIZE,
    IMPORT_ENTRY_SIZE,
    EXPORT_ENTRY_SIZE,
];

/// Parsed and validated chunk tables of one container.
pub struct FileTables {
    header: Header,
    strings: Vec<u8>,
    names: Vec<NameEntry>,
    types: Vec<TypeEntry>,
    properties: Vec<PropertyEntry>,
    paths: Vec<PathEntry>,
    imports: Vec<ImportEntry>,
    exports: Vec<ExportEntry>,
}

impl FileTables {
    /// Parses the whole table region (header included) and validates every
    /// cross-table index. Any failed check rejects the container — there is
    /// no partial structural recovery.
    pub fn parse(data: &[u8]) -> Result<Self, ContainerError> {
        let header = Header::read(data)?;
        if (data.len() as u64) < header.headers_end {
            return Err(ContainerError::TruncatedRead {
                offset: 0,
                wanted: header.headers_end,
                got: data.len() as u64,
            });
        }

        let chunk_slice = |chunk: ChunkType| -> Result<&[u8], ContainerError> {
            let info = header.chunks[chunk as usize];
            let size = info.count as u64 * ENTRY_SIZES[chunk as usize] as u64;
            let start = u64::from(info.offset);
            if info.count != 0 && (start < HEADER_SIZE as u64 || start + size > header.headers_end)
            {
                return Err(ContainerError::InvalidTables(format!(
                    "chunk {chunk:?} range [{start}, {}) escapes the table region",
                    start + size
                )));
            }
            Ok(&data[start as usize..(start + size) as usize])
        };

        let strings = chunk_slice(ChunkType::Strings)?.to_vec();

        let names = read_records(chunk_slice(ChunkType::Names)?, |c| {
            Ok(NameEntry {
                string_offset: c.read_u32::<LittleEndian>()?,
            })
        })?;
        let types = read_records(chunk_slice(ChunkType::Types)?, |c| {
            Ok(TypeEntry {
                name_index: c.read_u32::<LittleEndian>()?,
            })
        })?;
        let properties = read_records(chunk_slice(ChunkType::Properties)?, |c| {
            Ok(PropertyEntry {
                type_index: c.read_u32::<LittleEndian>()?,
                name_index: c.read_u32::<LittleEndian>()?,
            })
        })?;
        let paths = read_records(chunk_slice(ChunkType::Paths)?, |c| {
            Ok(PathEntry {
                parent_index: c.read_u32::<LittleEndian>()?,
                string_offset: c.read_u32::<LittleEndian>()?,
            })
        })?;
        let imports = read_records(chunk_slice(ChunkType::Imports)?, |c| {
            Ok(ImportEntry {
                type_index: c.read_u32::<LittleEndian>()?,
                path_index: c.read_u32::<LittleEndian>()?,
                flags: c.read_u32::<LittleEndian>()?,
            })
        })?;
        let exports = read_records(chunk_slice(ChunkType::Exports)?, |c| {
            Ok(ExportEntry {
                type_index: c.read_u32::<LittleEndian>()?,
                parent_index: c.read_u32::<LittleEndian>()?,
                data_offset: c.read_u64::<LittleEndian>()?,
                data_size: c.read_u32::<LittleEndian>()?,
                crc: c.read_u32::<LittleEndian>()?,
            })
        })?;

        let tables = Self {
            header,
            strings,
            names,
            types,
            properties,
            paths,
            imports,
            exports,
        };
        tables.validate()?;
        Ok(tables)
    }

    fn validate(&self) -> Result<(), ContainerError> {
        let invalid = |what: String| Err(ContainerError::InvalidTables(what));

        for (i, name) in self.names.iter().enumerate() {
            if name.string_offset as usize >= self.strings.len() {
                return invalid(format!("name {i} string offset out of range"));
            }
        }
        for (i, ty) in self.types.iter().enumerate() {
            if ty.name_index as usize >= self.names.len() {
                return invalid(format!("type {i} name index out of range"));
            }
        }
        for (i, property) in self.properties.iter().enumerate() {
            if property.type_index as usize >= self.types.len() {
                return invalid(format!("property {i} type index out of range"));
            }
            if property.name_index as usize >= self.names.len() {
                return invalid(format!("property {i} name index out of range"));
            }
        }
        for (i, path) in self.paths.iter().enumerate().skip(1) {
            if path.parent_index as usize >= i {
                return invalid(format!("path {i} parent does not precede it"));
            }
            if path.string_offset as usize >= self.strings.len() {
                return invalid(format!("path {i} string offset out of range"));
            }
        }
        for (i, import) in self.imports.iter().enumerate().skip(1) {
            if import.type_index as usize >= self.types.len() {
                return invalid(format!("import {i} type index out of range"));
            }
            if import.path_index == 0 || import.path_index as usize >= self.paths.len() {
                return invalid(format!("import {i} path index out of range"));
            }
        }
        for (i, export) in self.exports.iter().enumerate() {
            if export.type_index as usize >= self.types.len() {
                return invalid(format!("export {i} type index out of range"));
            }
            // parents must come first so the tree builds in one forward pass
            if export.parent_index != 0 && export.parent_index as usize > i {
                return invalid(format!("export {i} parent reference is not to an earlier export"));
            }
            let start = export.data_offset;
            let end = start + u64::from(export.data_size);
            if start < self.header.headers_end || end > self.header.objects_end {
                return invalid(format!("export {i} payload span escapes the object region"));
            }
        }

        Ok(())
    }

    /// Parsed header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Record count of a chunk (byte length for the string chunk).
    pub fn chunk_count(&self, chunk: ChunkType) -> u32 {
        match chunk {
            ChunkType::Strings => self.strings.len() as u32,
            ChunkType::Names => self.names.len() as u32,
            ChunkType::Types => self.types.len() as u32,
            ChunkType::Properties => self.properties.len() as u32,
            ChunkType::Paths => self.paths.len() as u32,
            ChunkType::Imports => self.imports.len() as u32,
            ChunkType::Exports => self.exports.len() as u32,
        }
    }

    /// Name table.
    pub fn names(&self) -> &[NameEntry] {
        &self.names
    }

    /// Type table.
    pub fn types(&self) -> &[TypeEntry] {
        &self.types
    }

    /// Property table.
    pub fn properties(&self) -> &[PropertyEntry] {
        &self.properties
    }

    /// Path table.
    pub fn paths(&self) -> &[PathEntry] {
        &self.paths
    }

    /// Import table.
    pub fn imports(&self) -> &[ImportEntry] {
        &self.imports
    }

    /// Export table.
    pub fn exports(&self) -> &[ExportEntry] {
        &self.exports
    }

    /// NUL-terminated string at a byte offset into the string chunk.
    pub fn string_at(&self, offset: u32) -> Result<&str, ContainerError> {
        let start = offset as usize;
        if start >= self.strings.len() {
            return Err(ContainerError::InvalidTables(format!(
                "string offset {offset} out of range"
            )));
        }
        let tail = &self.strings[start..];
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).map_err(|_| ContainerError::InvalidString(offset))
    }

    /// Reconstructs a full import path by walking path table parents.
    pub fn resolve_path(&self, index: u32) -> Result<String, ContainerError> {
        let mut segments = Vec::new();
        let mut current = index;
        while current != 0 {
            let entry = self.paths[current as usize];
            segments.push(self.string_at(entry.string_offset)?);
            // validated: parents strictly precede children, so this walk
            // terminates
            current = entry.parent_index;
        }
        segments.reverse();
        Ok(segments.join("/"))
    }
}

fn read_records<T>(
    mut data: &[u8],
    mut read: impl FnMut(&mut &[u8]) -> Result<T, std::io::Error>,
) -> Result<Vec<T>, ContainerError> {
    let mut records = Vec::new();
    while !data.is_empty() {
        records.push(read(&mut data)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{save_container, SaveContext, SaveObject};
    use crate::test_resource::TestAsset;

    fn sample_container() -> Vec<u8> {
        let root = TestAsset::with_content("root");
        save_container(
            &SaveContext::default(),
            &[SaveObject {
                object: &root,
                parent: None,
            }],
        )
        .unwrap()
    }

    #[test]
    fn parses_own_output() {
        let bytes = sample_container();
        let tables = FileTables::parse(&bytes).unwrap();
        assert_eq!(tables.chunk_count(ChunkType::Exports), 1);
        assert_eq!(tables.header().version, CONTAINER_VERSION);
        assert!(tables.header().headers_end >= HEADER_SIZE as u64);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_container();
        bytes[0] = b'X';
        assert!(matches!(
            FileTables::parse(&bytes),
            Err(ContainerError::BadMagic)
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = sample_container();
        bytes[4..8].copy_from_slice(&99_u32.to_le_bytes());
        assert!(matches!(
            FileTables::parse(&bytes),
            Err(ContainerError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn rejects_oversized_table_region() {
        let mut bytes = sample_container();
        let huge = TABLES_MAX_SIZE + 1;
        bytes[12..20].copy_from_slice(&huge.to_le_bytes());
        assert!(matches!(
            FileTables::parse(&bytes),
            Err(ContainerError::InvalidTables(_))
        ));
    }

    #[test]
    fn rejects_forward_parent_reference() {
        let parent = TestAsset::with_content("parent");
        let child = TestAsset::with_content("child");
        let bytes = save_container(
            &SaveContext::default(),
            &[
                SaveObject {
                    object: &parent,
                    parent: None,
                },
                SaveObject {
                    object: &child,
                    parent: Some(0),
                },
            ],
        )
        .unwrap();

        let tables = FileTables::parse(&bytes).unwrap();
        let exports_info = tables.header().chunks[ChunkType::Exports as usize];

        // patch export 0 to claim export 1 as its parent
        let mut corrupt = bytes;
        let entry_start = exports_info.offset as usize;
        corrupt[entry_start + 4..entry_start + 8].copy_from_slice(&2_u32.to_le_bytes());

        assert!(matches!(
            FileTables::parse(&corrupt),
            Err(ContainerError::InvalidTables(_))
        ));
    }
}
