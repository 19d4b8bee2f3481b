use std::any::Any;

use crate::container::{ContainerError, PayloadReader, PayloadWriter};
use crate::{Resource, ResourceKey, TypeDescriptor, TypeRegistry};

pub(crate) const TEST_ASSET_TYPE: &str = "TestAsset";

/// Minimal asset type used across the crate's tests: a text payload, an
/// optional bulk blob and outgoing references in both flavors.
#[derive(Default)]
pub(crate) struct TestAsset {
    pub content: String,
    pub blob: Vec<u8>,
    pub eager_references: Vec<ResourceKey>,
    pub lazy_references: Vec<ResourceKey>,
    pub post_loaded: bool,
}

impl TestAsset {
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_blob(content: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            content: content.into(),
            blob,
            ..Self::default()
        }
    }
}

impl Resource for TestAsset {
    fn type_name(&self) -> &str {
        TEST_ASSET_TYPE
    }

    fn write_binary(&self, writer: &mut PayloadWriter<'_>) -> Result<(), ContainerError> {
        writer.write_property(TEST_ASSET_TYPE, "content");
        writer.write_str(&self.content);
        writer.write_bytes(&self.blob);

        writer.write_u32(self.eager_references.len() as u32);
        for key in &self.eager_references {
            writer.write_import(key, true);
        }
        writer.write_u32(self.lazy_references.len() as u32);
        for key in &self.lazy_references {
            writer.write_import(key, false);
        }
        Ok(())
    }

    fn read_binary(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ContainerError> {
        // tolerant of the property having been renamed upstream
        let _property = reader.read_property()?;
        self.content = reader.read_string()?;
        self.blob = reader.read_bytes()?.to_vec();

        let eager_count = reader.read_u32()?;
        for _ in 0..eager_count {
            if let Some(import) = reader.read_import()? {
                if let Some(key) = &import.key {
                    self.eager_references.push(key.clone());
                }
            }
        }
        let lazy_count = reader.read_u32()?;
        for _ in 0..lazy_count {
            if let Some(import) = reader.read_import()? {
                if let Some(key) = &import.key {
                    self.lazy_references.push(key.clone());
                }
            }
        }
        Ok(())
    }

    fn post_load(&mut self) {
        self.post_loaded = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) fn register_test_types(registry: &TypeRegistry) {
    registry.register_resource(
        TypeDescriptor::new(TEST_ASSET_TYPE, || Box::new(TestAsset::default()))
            .with_property("content")
            .with_extension("test"),
    );
}
