use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::builder::FileTablesBuilder;
use super::format::ContainerError;
use super::loader::{ResolvedImport, ResolvedReferences};
use crate::{PropertyHandle, ResourceKey};

/// Serialization sink for one object payload.
///
/// Primitive values are written inline; names, properties and imports are
/// interned into the owning [`FileTablesBuilder`] and written as table
/// indices.
pub struct PayloadWriter<'a> {
    builder: &'a mut FileTablesBuilder,
    buf: Vec<u8>,
}

impl<'a> PayloadWriter<'a> {
    pub(crate) fn new(builder: &'a mut FileTablesBuilder) -> Self {
        Self {
            builder,
            buf: Vec::new(),
        }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Writes a raw byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.write_u32::<LittleEndian>(value).unwrap();
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64(&mut self, value: u64) {
        self.buf.write_u64::<LittleEndian>(value).unwrap();
    }

    /// Writes a little-endian `f32`.
    pub fn write_f32(&mut self, value: f32) {
        self.buf.write_f32::<LittleEndian>(value).unwrap();
    }

    /// Writes a length-prefixed byte blob.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a length-prefixed string.
    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Interns an identifier and writes its name table index.
    pub fn write_name(&mut self, name: &str) {
        let index = self.builder.map_name(name);
        self.write_u32(index);
    }

    /// Interns a property reference and writes its property table index.
    pub fn write_property(&mut self, type_name: &str, property_name: &str) {
        let index = self.builder.map_property(type_name, property_name);
        self.write_u32(index);
    }

    /// Interns an external resource reference and writes its import table
    /// index. Eager imports are loaded as part of loading the container.
    pub fn write_import(&mut self, key: &ResourceKey, eager: bool) {
        let index = self.builder.map_import(key, eager);
        self.write_u32(index);
    }

    /// Writes a reference to another export of the same container, by
    /// export table index. `None` writes the null reference.
    pub fn write_export_ref(&mut self, index: Option<u32>) {
        self.write_u32(index.map_or(0, |index| index + 1));
    }
}

/// Deserialization source for one object payload.
///
/// The resolved-reference table built during load is the single source of
/// truth for every indexed value; unresolved entries surface as `None`.
pub struct PayloadReader<'a> {
    data: &'a [u8],
    refs: &'a ResolvedReferences,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(data: &'a [u8], refs: &'a ResolvedReferences) -> Self {
        Self { data, refs }
    }

    fn truncated(&self, wanted: u64) -> ContainerError {
        ContainerError::TruncatedRead {
            offset: 0,
            wanted,
            got: self.data.len() as u64,
        }
    }

    /// Bytes left in the payload.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Reads a raw byte.
    pub fn read_u8(&mut self) -> Result<u8, ContainerError> {
        self.data
            .read_u8()
            .map_err(|_| self.truncated(1))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, ContainerError> {
        self.data
            .read_u32::<LittleEndian>()
            .map_err(|_| self.truncated(4))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, ContainerError> {
        self.data
            .read_u64::<LittleEndian>()
            .map_err(|_| self.truncated(8))
    }

    /// Reads a little-endian `f32`.
    pub fn read_f32(&mut self) -> Result<f32, ContainerError> {
        self.data
            .read_f32::<LittleEndian>()
            .map_err(|_| self.truncated(4))
    }

    /// Reads a length-prefixed byte blob.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], ContainerError> {
        let length = self.read_u32()? as usize;
        if length > self.data.len() {
            return Err(self.truncated(length as u64));
        }
        let (bytes, rest) = self.data.split_at(length);
        self.data = rest;
        Ok(bytes)
    }

    /// Reads a length-prefixed string.
    pub fn read_string(&mut self) -> Result<String, ContainerError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ContainerError::Serialization("string payload is not UTF-8".into()))
    }

    /// Reads a name table index and resolves it. Unresolved or null
    /// entries read as `None`.
    pub fn read_name(&mut self) -> Result<Option<Arc<str>>, ContainerError> {
        let index = self.read_u32()? as usize;
        Ok(self.refs.names.get(index).cloned().flatten())
    }

    /// Reads a property table index and resolves it to a live property
    /// handle. A property removed or renamed upstream reads as `None`.
    pub fn read_property(&mut self) -> Result<Option<PropertyHandle>, ContainerError> {
        let index = self.read_u32()? as usize;
        Ok(self.refs.properties.get(index).cloned().flatten())
    }

    /// Reads an import table index and resolves it. The null import reads
    /// as `None`.
    pub fn read_import(&mut self) -> Result<Option<&'a ResolvedImport>, ContainerError> {
        let index = self.read_u32()? as usize;
        if index == 0 {
            return Ok(None);
        }
        Ok(self.refs.imports.get(index))
    }

    /// Reads a reference to another export of the same container. The
    /// referenced export always precedes the reading object in table
    /// order.
    pub fn read_export_ref(&mut self) -> Result<Option<u32>, ContainerError> {
        let index = self.read_u32()?;
        Ok((index != 0).then(|| index - 1))
    }
}
