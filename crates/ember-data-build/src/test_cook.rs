#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::collections::HashMap;
    use std::sync::Arc;

    use ember_data_compiler::{
        CookContext, CookError, Cooker, CookerRegistry, DATA_COOK_VERSION,
    };
    use ember_data_runtime::container::{ContainerError, PayloadReader, PayloadWriter};
    use ember_data_runtime::vfs::{Depot, MemoryDepot};
    use ember_data_runtime::{
        AssetRegistryOptions, Resource, ResourceKey, ResourcePath, ResourceType, TypeDescriptor,
        TypeRegistry,
    };
    use parking_lot::Mutex;

    use crate::{
        BuildDevice, CookOptions, CookQueue, DependencyTracker, Error, NoProgress, ReloadDriver,
    };

    const COOKED_TYPE: &str = "CookedAsset";

    /// Cooked output of the test cooker: a text payload plus eager
    /// references to further source files.
    #[derive(Default)]
    struct CookedAsset {
        content: String,
        references: Vec<ResourceKey>,
    }

    impl Resource for CookedAsset {
        fn type_name(&self) -> &str {
            COOKED_TYPE
        }

        fn write_binary(&self, writer: &mut PayloadWriter<'_>) -> Result<(), ContainerError> {
            writer.write_str(&self.content);
            writer.write_u32(self.references.len() as u32);
            for key in &self.references {
                writer.write_import(key, true);
            }
            Ok(())
        }

        fn read_binary(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ContainerError> {
            self.content = reader.read_string()?;
            let count = reader.read_u32()?;
            for _ in 0..count {
                if let Some(import) = reader.read_import()? {
                    if let Some(key) = &import.key {
                        self.references.push(key.clone());
                    }
                }
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn cooked_class() -> ResourceType {
        ResourceType::new(COOKED_TYPE)
    }

    fn source_key(path: &str) -> ResourceKey {
        ResourceKey::new(ResourcePath::new(path), cooked_class())
    }

    /// Cooks `*.src` and `*.seed` text files: the first line is the
    /// payload, every further line references another source file.
    struct TextCooker {
        version: u32,
        cook_counts: Arc<Mutex<HashMap<String, u32>>>,
    }

    impl Cooker for TextCooker {
        fn name(&self) -> &str {
            "TextCooker"
        }

        fn version(&self) -> u32 {
            self.version
        }

        fn can_cook(&self, key: &ResourceKey) -> Option<ResourceType> {
            matches!(key.path().extension(), "src" | "seed").then(cooked_class)
        }

        fn cook(
            &self,
            key: &ResourceKey,
            context: &mut CookContext<'_>,
        ) -> Result<Box<dyn Resource>, CookError> {
            let path = key.path().as_str().to_owned();
            *self.cook_counts.lock().entry(path.clone()).or_insert(0) += 1;
            context.log.record(format!("cooking {path}"));

            let bytes = context.read_source(&path)?;
            let text = String::from_utf8_lossy(&bytes);
            let mut lines = text.lines();
            let content = lines.next().unwrap_or("").to_owned();
            let references = lines
                .filter(|line| !line.trim().is_empty())
                .map(source_key)
                .collect();

            Ok(Box::new(CookedAsset {
                content,
                references,
            }))
        }
    }

    struct FailCooker;

    impl Cooker for FailCooker {
        fn name(&self) -> &str {
            "FailCooker"
        }
        fn version(&self) -> u32 {
            DATA_COOK_VERSION
        }
        fn can_cook(&self, key: &ResourceKey) -> Option<ResourceType> {
            (key.path().extension() == "bad").then(cooked_class)
        }
        fn cook(
            &self,
            key: &ResourceKey,
            context: &mut CookContext<'_>,
        ) -> Result<Box<dyn Resource>, CookError> {
            context.log.record(format!("about to fail {key}"));
            Err(CookError::Failed("synthetic cooker failure".into()))
        }
    }

    struct Fixture {
        depot: Arc<MemoryDepot>,
        types: Arc<TypeRegistry>,
        cookers: Arc<CookerRegistry>,
        tracker: Arc<DependencyTracker>,
        cook_counts: Arc<Mutex<HashMap<String, u32>>>,
    }

    fn fixture_with_version(version: u32) -> Fixture {
        let depot = Arc::new(MemoryDepot::new());
        let types = Arc::new(TypeRegistry::new());
        types.register_resource(
            TypeDescriptor::new(COOKED_TYPE, || Box::new(CookedAsset::default()))
                .with_extension("cooked"),
        );

        let cook_counts = Arc::new(Mutex::new(HashMap::new()));
        let mut cookers = CookerRegistry::new();
        cookers.register(Arc::new(TextCooker {
            version,
            cook_counts: cook_counts.clone(),
        }));
        cookers.register(Arc::new(FailCooker));

        let tracker = Arc::new(DependencyTracker::new(depot.clone() as Arc<dyn Depot>));

        Fixture {
            depot,
            types,
            cookers: Arc::new(cookers),
            tracker,
            cook_counts,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_version(DATA_COOK_VERSION)
    }

    impl Fixture {
        fn queue(&self, output_root: &std::path::Path) -> CookQueue {
            CookQueue::new(
                self.depot.clone() as Arc<dyn Depot>,
                self.types.clone(),
                self.cookers.clone(),
                self.tracker.clone(),
                CookOptions::new(output_root),
            )
        }

        fn cook_count(&self, path: &str) -> u32 {
            self.cook_counts.lock().get(path).copied().unwrap_or(0)
        }

        fn write_diamond(&self) {
            self.depot.write_file("a.src", "A\nb.src\nc.src", 10);
            self.depot.write_file("b.src", "B\nd.src", 10);
            self.depot.write_file("c.src", "C\nd.src", 10);
            self.depot.write_file("d.src", "D", 10);
        }
    }

    #[test]
    fn diamond_dependencies_cook_each_file_once() {
        let fixture = fixture();
        fixture.write_diamond();
        let output = tempfile::tempdir().unwrap();

        let mut queue = fixture.queue(output.path());
        queue.schedule_job(source_key("a.src"));
        let stats = queue.run(&mut NoProgress).unwrap();

        assert_eq!(stats.cooked, 4);
        assert_eq!(stats.failed, 0);
        for path in ["a.src", "b.src", "c.src", "d.src"] {
            assert_eq!(fixture.cook_count(path), 1, "{path} cooked more than once");
            assert!(output.path().join(format!("cooked/{path}.cooked")).exists());
        }
        assert_eq!(queue.save_thread().scheduled_count(), 4);
    }

    #[test]
    fn one_job_one_save_and_rescheduling_is_a_noop() {
        let fixture = fixture();
        fixture.depot.write_file("seed.src", "S", 10);
        let output = tempfile::tempdir().unwrap();

        let mut queue = fixture.queue(output.path());
        assert!(queue.schedule_job(source_key("seed.src")));
        assert!(!queue.schedule_job(source_key("seed.src")));

        assert!(queue.process_next_job(&mut NoProgress).unwrap());
        assert_eq!(queue.save_thread().scheduled_count(), 1);
        assert!(queue.was_cooked(&ResourcePath::new("seed.src"), &cooked_class()));

        // the duplicate was never queued
        assert!(!queue.process_next_job(&mut NoProgress).unwrap());
    }

    #[test]
    fn second_run_skips_up_to_date_but_walks_the_whole_tree() {
        let fixture = fixture();
        fixture.write_diamond();
        let output = tempfile::tempdir().unwrap();

        let mut first = fixture.queue(output.path());
        first.schedule_job(source_key("a.src"));
        first.run(&mut NoProgress).unwrap();

        let mut second = fixture.queue(output.path());
        second.schedule_job(source_key("a.src"));
        let stats = second.run(&mut NoProgress).unwrap();

        assert_eq!(stats.cooked, 0);
        // the up-to-date artifacts still had their recorded dependencies
        // walked
        assert_eq!(stats.up_to_date, 4);
        assert!(stats.visited >= 4);
        for path in ["a.src", "b.src", "c.src", "d.src"] {
            assert_eq!(fixture.cook_count(path), 1);
        }
    }

    #[test]
    fn changed_source_recooks_only_its_artifact() {
        let fixture = fixture();
        fixture.write_diamond();
        let output = tempfile::tempdir().unwrap();

        let mut first = fixture.queue(output.path());
        first.schedule_job(source_key("a.src"));
        first.run(&mut NoProgress).unwrap();

        fixture.depot.touch("b.src", 11);

        let mut second = fixture.queue(output.path());
        second.schedule_job(source_key("a.src"));
        let stats = second.run(&mut NoProgress).unwrap();

        assert_eq!(stats.cooked, 1);
        assert_eq!(stats.up_to_date, 3);
        assert_eq!(fixture.cook_count("b.src"), 2);
        assert_eq!(fixture.cook_count("d.src"), 1);
    }

    #[test]
    fn cooker_version_change_invalidates_every_artifact() {
        let fixture = fixture();
        fixture.write_diamond();
        let output = tempfile::tempdir().unwrap();

        let mut first = fixture.queue(output.path());
        first.schedule_job(source_key("a.src"));
        first.run(&mut NoProgress).unwrap();

        // same depot and tracker, only the cooker version differs
        let bumped = Fixture {
            depot: fixture.depot.clone(),
            types: fixture.types.clone(),
            tracker: fixture.tracker.clone(),
            ..fixture_with_version(DATA_COOK_VERSION + 1)
        };

        let mut second = bumped.queue(output.path());
        second.schedule_job(source_key("a.src"));
        let stats = second.run(&mut NoProgress).unwrap();

        assert_eq!(stats.cooked, 4);
        assert_eq!(stats.up_to_date, 0);
    }

    #[test]
    fn failure_ceiling_aborts_the_run() {
        let fixture = fixture();
        let output = tempfile::tempdir().unwrap();

        let mut queue = fixture.queue(output.path());
        for index in 0..150 {
            queue.schedule_job(source_key(&format!("broken_{index}.bad")));
        }

        let mut outcome = None;
        loop {
            match queue.process_next_job(&mut NoProgress) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    outcome = Some(err);
                    break;
                }
            }
        }

        assert!(matches!(outcome, Some(Error::TooManyFailures(101))));
        assert_eq!(queue.stats().failed, 101);
    }

    #[test]
    fn sidecar_log_is_retained_only_on_failure() {
        let fixture = fixture();
        fixture.depot.write_file("good.src", "G", 10);
        fixture.depot.write_file("broken.bad", "B", 10);
        let output = tempfile::tempdir().unwrap();

        let mut queue = fixture.queue(output.path());
        queue.schedule_job(source_key("good.src"));
        queue.schedule_job(source_key("broken.bad"));
        let stats = queue.run(&mut NoProgress).unwrap();

        assert_eq!(stats.cooked, 1);
        assert_eq!(stats.failed, 1);

        assert!(!output.path().join("cooked/good.src.cooked.log").exists());
        let failed_log = output.path().join("cooked/broken.bad.cooked.log");
        let contents = std::fs::read_to_string(failed_log).unwrap();
        assert!(contents.contains("about to fail"));
        assert!(contents.contains("ERROR"));
    }

    #[test]
    fn seed_scan_schedules_every_seed_file() {
        let fixture = fixture();
        fixture.depot.write_file("root.seed", "ROOT\na.src", 10);
        fixture.depot.write_file("levels/extra.seed", "EXTRA", 10);
        fixture.depot.write_file("a.src", "A", 10);
        let output = tempfile::tempdir().unwrap();

        let mut queue = fixture.queue(output.path());
        let stats = queue.run(&mut NoProgress).unwrap();

        assert_eq!(stats.cooked, 3);
        assert_eq!(fixture.cook_count("root.seed"), 1);
        assert_eq!(fixture.cook_count("levels/extra.seed"), 1);
        assert_eq!(fixture.cook_count("a.src"), 1);
    }

    #[tokio::test]
    async fn build_device_cooks_on_demand_and_reloads_on_change() {
        let fixture = fixture();
        fixture.depot.write_file("a.src", "A", 10);
        let output = tempfile::tempdir().unwrap();

        let registry = AssetRegistryOptions::new(fixture.types.clone())
            .add_device(Box::new(BuildDevice::new(
                fixture.depot.clone() as Arc<dyn Depot>,
                fixture.types.clone(),
                fixture.cookers.clone(),
                fixture.tracker.clone(),
                output.path(),
                false,
            )))
            .create();

        let key = source_key("a.src");
        let handle = registry.load_async(&key).await.unwrap();
        assert_eq!(handle.get::<CookedAsset>().unwrap().content, "A");
        assert_eq!(fixture.cook_count("a.src"), 1);
        assert!(output.path().join("cooked/a.src.cooked").exists());

        // a second load serves the cached instance
        let again = registry.load_async(&key).await.unwrap();
        assert!(ember_data_runtime::HandleUntyped::same_instance(
            &handle, &again
        ));
        assert_eq!(fixture.cook_count("a.src"), 1);

        // change the source; the reload driver picks it up and recooks
        fixture.depot.write_file("a.src", "A2", 11);

        let driver = ReloadDriver::new(fixture.tracker.clone());
        let mut applied = Vec::new();
        driver
            .update(&registry, |previous, current| {
                applied.push((
                    previous.get::<CookedAsset>().unwrap().content.clone(),
                    current.get::<CookedAsset>().unwrap().content.clone(),
                ));
            })
            .await;

        assert_eq!(applied, vec![("A".to_owned(), "A2".to_owned())]);
        assert_eq!(fixture.cook_count("a.src"), 2);

        let reloaded = registry.acquire_if_loaded(&key).unwrap();
        assert_eq!(reloaded.get::<CookedAsset>().unwrap().content, "A2");
    }
}
