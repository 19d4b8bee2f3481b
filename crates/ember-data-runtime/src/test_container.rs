#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::Arc;

    use crate::container::{
        determine_load_buffer_size, load_container, load_dependencies, load_metadata,
        plan_batches, save_container, ContainerError, CookMetadata, ExportEntry,
        FileLoadingContext, PayloadReader, PayloadWriter, SaveContext, SaveObject,
        SourceDependency,
    };
    use crate::test_resource::{register_test_types, TestAsset, TEST_ASSET_TYPE};
    use crate::vfs::MemoryFile;
    use crate::{Resource, ResourceKey, ResourcePath, ResourceType, TypeRegistry};

    fn types() -> Arc<TypeRegistry> {
        let types = Arc::new(TypeRegistry::new());
        register_test_types(&types);
        types
    }

    fn key(path: &str) -> ResourceKey {
        ResourceKey::new(ResourcePath::new(path), ResourceType::new(TEST_ASSET_TYPE))
    }

    fn protected() -> SaveContext {
        SaveContext {
            protected_layout: true,
        }
    }

    #[tokio::test]
    async fn round_trip_with_references() {
        let mut asset = TestAsset::with_blob("payload", vec![7_u8; 512]);
        asset.eager_references.push(key("textures/child.test"));
        asset.lazy_references.push(key("textures/lazy.test"));

        let bytes = save_container(
            &protected(),
            &[SaveObject {
                object: &asset,
                parent: None,
            }],
        )
        .unwrap();

        let file = MemoryFile::from_bytes(bytes);
        let mut result = load_container(
            &file,
            &types(),
            None,
            &FileLoadingContext {
                load_imports: false,
                ..FileLoadingContext::default()
            },
        )
        .await
        .unwrap();

        let root = result.take_root().unwrap();
        let loaded = root.downcast_ref::<TestAsset>().unwrap();
        assert_eq!(loaded.content, "payload");
        assert_eq!(loaded.blob, vec![7_u8; 512]);
        assert_eq!(loaded.eager_references, vec![key("textures/child.test")]);
        assert_eq!(loaded.lazy_references, vec![key("textures/lazy.test")]);
        assert!(loaded.post_loaded);
    }

    #[tokio::test]
    async fn dependency_listing_reads_no_payload() {
        let mut asset = TestAsset::with_content("x");
        asset.eager_references.push(key("a.test"));
        asset.lazy_references.push(key("b.test"));

        let bytes = save_container(
            &protected(),
            &[SaveObject {
                object: &asset,
                parent: None,
            }],
        )
        .unwrap();

        let file = MemoryFile::from_bytes(bytes);
        let dependencies = load_dependencies(&file, &types()).await.unwrap();
        assert_eq!(dependencies.len(), 2);
        assert!(dependencies
            .iter()
            .any(|dep| dep.key == key("a.test") && dep.eager));
        assert!(dependencies
            .iter()
            .any(|dep| dep.key == key("b.test") && !dep.eager));
    }

    #[tokio::test]
    async fn metadata_only_load_constructs_a_single_export() {
        let root = TestAsset::with_blob("root", vec![1_u8; 64]);
        let metadata = CookMetadata {
            cooker_class: "TestCooker".to_owned(),
            cooker_version: 3,
            source_dependencies: vec![SourceDependency {
                path: "textures/a.png".to_owned(),
                timestamp: 42,
                size: 16,
            }],
        };

        let bytes = save_container(
            &protected(),
            &[
                SaveObject {
                    object: &root,
                    parent: None,
                },
                SaveObject {
                    object: &metadata,
                    parent: Some(0),
                },
            ],
        )
        .unwrap();

        let file = MemoryFile::from_bytes(bytes);
        let loaded = load_metadata(&file, &types()).await.unwrap().unwrap();
        assert_eq!(loaded, metadata);
    }

    #[tokio::test]
    async fn crc_mismatch_aborts_the_whole_load() {
        let asset = TestAsset::with_blob("content", vec![3_u8; 256]);
        let mut bytes = save_container(
            &protected(),
            &[SaveObject {
                object: &asset,
                parent: None,
            }],
        )
        .unwrap();

        // flip one byte inside the payload region
        let last = bytes.len() - 10;
        bytes[last] ^= 0x01;

        let file = MemoryFile::from_bytes(bytes);
        let result = load_container(&file, &types(), None, &FileLoadingContext::default()).await;
        assert!(matches!(
            result,
            Err(ContainerError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn unprotected_layout_skips_crc() {
        let asset = TestAsset::with_content("content");
        let bytes = save_container(
            &SaveContext {
                protected_layout: false,
            },
            &[SaveObject {
                object: &asset,
                parent: None,
            }],
        )
        .unwrap();

        let file = MemoryFile::from_bytes(bytes);
        let mut result = load_container(&file, &types(), None, &FileLoadingContext::default())
            .await
            .unwrap();
        assert!(result.take_root().is_some());
    }

    /// An asset type that exists only on the writing side, standing in for
    /// a type that was removed from the registry after the container was
    /// written.
    struct GhostAsset;

    impl Resource for GhostAsset {
        fn type_name(&self) -> &str {
            "GhostType"
        }
        fn write_binary(&self, writer: &mut PayloadWriter<'_>) -> Result<(), ContainerError> {
            writer.write_str("ghost");
            Ok(())
        }
        fn read_binary(&mut self, _reader: &mut PayloadReader<'_>) -> Result<(), ContainerError> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn unknown_export_type_degrades_without_failing_the_load() {
        let root = TestAsset::with_content("root");
        let ghost = GhostAsset;
        let orphan = TestAsset::with_content("orphan of the ghost");

        let bytes = save_container(
            &protected(),
            &[
                SaveObject {
                    object: &root,
                    parent: None,
                },
                SaveObject {
                    object: &ghost,
                    parent: Some(0),
                },
                // parented to the ghost, so it must be skipped too
                SaveObject {
                    object: &orphan,
                    parent: Some(1),
                },
            ],
        )
        .unwrap();

        let file = MemoryFile::from_bytes(bytes);
        let mut result = load_container(&file, &types(), None, &FileLoadingContext::default())
            .await
            .unwrap();

        assert!(result.objects[1].is_none());
        assert!(result.objects[2].is_none());
        let root = result.take_root().unwrap();
        assert_eq!(root.downcast_ref::<TestAsset>().unwrap().content, "root");
    }

    fn synthetic_export(offset: u64, size: u32) -> ExportEntry {
        ExportEntry {
            type_index: 1,
            parent_index: 0,
            data_offset: offset,
            data_size: size,
            crc: 0,
        }
    }

    #[test]
    fn batch_buffer_fits_the_largest_selected_object() {
        const BLOCK: u64 = 4096;
        const DEFAULT_CEILING: u64 = 8 << 20;

        let base = 65_536_u64;
        let exports = [
            synthetic_export(base, 100),
            synthetic_export(base + 100, 5_000_000),
            synthetic_export(base + 100 + 5_000_000, 200),
        ];
        let constructed = [true, true, true];
        let objects_end = base + 100 + 5_000_000 + 200;

        // payload region fits under the ceiling, whole-file mode wins
        let whole = determine_load_buffer_size(objects_end, &exports, &constructed, true);
        assert_eq!(whole, objects_end);

        // selective mode must still fit the largest object plus one block
        let size = determine_load_buffer_size(objects_end, &exports, &constructed, false);
        assert!(size >= 5_000_000 + BLOCK);
        assert_eq!(size, DEFAULT_CEILING);

        for batch in plan_batches(&exports, &constructed, size) {
            assert!(batch.end_offset - batch.start_offset <= size);
        }
    }

    #[test]
    fn oversized_objects_grow_the_buffer_past_the_ceiling() {
        let exports = [
            synthetic_export(4096, 100),
            synthetic_export(4196, 9_000_000),
            synthetic_export(9_004_196, 200),
        ];
        let constructed = [true, true, true];
        let objects_end = 9_004_396;

        let size = determine_load_buffer_size(objects_end, &exports, &constructed, true);
        assert_eq!(size, 9_000_000 + 4096);

        let batches = plan_batches(&exports, &constructed, size);
        for batch in &batches {
            assert!(batch.end_offset - batch.start_offset <= size);
        }
        // every selected object lands in exactly one batch
        let covered: usize = batches.iter().map(|batch| batch.end - batch.first).sum();
        assert!(covered >= exports.len());
    }

    #[test]
    fn skipped_objects_split_batches_but_are_never_read() {
        let exports = [
            synthetic_export(4096, 100),
            synthetic_export(4196, 100),
            synthetic_export(4296, 100),
        ];
        let constructed = [true, false, true];

        let batches = plan_batches(&exports, &constructed, 8 << 20);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].first, 0);
        assert_eq!(batches[0].end, 3);
    }

    #[tokio::test]
    async fn truncated_container_is_structural_failure() {
        let asset = TestAsset::with_content("content");
        let bytes = save_container(
            &protected(),
            &[SaveObject {
                object: &asset,
                parent: None,
            }],
        )
        .unwrap();

        let file = MemoryFile::from_bytes(bytes[..bytes.len() / 2].to_vec());
        let result = load_container(&file, &types(), None, &FileLoadingContext::default()).await;
        assert!(result.is_err());
    }
}
