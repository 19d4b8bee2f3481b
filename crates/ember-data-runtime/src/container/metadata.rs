use std::any::Any;

use serde::{Deserialize, Serialize};

use super::format::ContainerError;
use super::payload::{PayloadReader, PayloadWriter};
use crate::Resource;

/// Class name the cook metadata record is registered under.
pub const COOK_METADATA_TYPE: &str = "CookMetadata";

/// One source file a cooked artifact was produced from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDependency {
    /// Normalized depot path of the source file.
    pub path: String,
    /// Depot timestamp captured when the artifact was cooked. Compared for
    /// exact equality by the up-to-date check.
    pub timestamp: u64,
    /// Source size in bytes at cook time; 0 disables the size check.
    pub size: u64,
}

/// Metadata record stored in every cooked container.
///
/// Loadable with the metadata-only filter without constructing any other
/// export — this record is all the up-to-date check ever reads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CookMetadata {
    /// Name of the cooker that produced the artifact.
    pub cooker_class: String,
    /// Version of that cooker at cook time.
    pub cooker_version: u32,
    /// Source files the artifact depends on, in cook order.
    pub source_dependencies: Vec<SourceDependency>,
}

impl Resource for CookMetadata {
    fn type_name(&self) -> &str {
        COOK_METADATA_TYPE
    }

    fn write_binary(&self, writer: &mut PayloadWriter<'_>) -> Result<(), ContainerError> {
        let bytes = bincode::serialize(self)
            .map_err(|err| ContainerError::Serialization(err.to_string()))?;
        writer.write_bytes(&bytes);
        Ok(())
    }

    fn read_binary(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ContainerError> {
        let bytes = reader.read_bytes()?;
        *self =
            bincode::deserialize(bytes).map_err(|err| ContainerError::Serialization(err.to_string()))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
