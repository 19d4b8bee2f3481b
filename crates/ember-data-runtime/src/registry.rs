use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::Shared;
use futures::{Future, FutureExt};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::container::{load_container, FileLoadingContext, ImportLoader};
use crate::vfs::Device;
use crate::{HandleUntyped, ReferenceUntyped, ResourceKey, TypeRegistry};

/// Error type for the asset registry.
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    /// No registered device could serve the resource.
    #[error("resource '{0}' was not found on any device")]
    NotFound(ResourceKey),

    /// The container was found but failed to load.
    #[error("resource '{0}' failed to load: {1}")]
    LoadFailed(ResourceKey, String),

    /// The container loaded but holds no constructible root object.
    #[error("container for '{0}' holds no loadable root object")]
    MissingRoot(ResourceKey),

    /// The registry was dropped while the load was in flight.
    #[error("registry was dropped while a load was in flight")]
    Shutdown,
}

/// Notification fired by the registry. Reload *application* does not go
/// through here — it is pulled from the FIFO reload queue by the
/// designated thread, see [`AssetRegistry::drain_reload_events`].
#[derive(Clone, Debug)]
pub enum ResourceEvent {
    /// A load started for a key with no in-flight job.
    LoadingStarted(ResourceKey),
    /// A load finished successfully.
    Loaded(ResourceKey),
    /// A load failed; the reason is already logged.
    LoadFailed(ResourceKey, String),
    /// The last strong handle to a resource was dropped.
    Unloaded(ResourceKey),
    /// A newer instance of a loaded resource finished loading.
    Reloaded(ResourceKey),
}

struct CacheEntry {
    resource: ReferenceUntyped,
    /// Device timestamp captured at load time; `None` when the backing
    /// device had none to offer.
    timestamp: Option<u64>,
}

type SharedLoadFuture =
    Shared<Pin<Box<dyn Future<Output = Result<HandleUntyped, RegistryError>> + Send>>>;

/// Options which can be used to configure the creation of
/// [`AssetRegistry`].
pub struct AssetRegistryOptions {
    types: Arc<TypeRegistry>,
    devices: Vec<Box<dyn Device>>,
}

impl AssetRegistryOptions {
    /// Starts a blank set of options around a type registry.
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self {
            types,
            devices: vec![],
        }
    }

    /// Adds a device that can serve containers. Devices are consulted in
    /// registration order.
    #[must_use]
    pub fn add_device(mut self, device: Box<dyn Device>) -> Self {
        self.devices.push(device);
        self
    }

    /// Creates the registry.
    pub fn create(self) -> Arc<AssetRegistry> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (unload_tx, unload_rx) = crossbeam_channel::unbounded();

        Arc::new_cyclic(|weak_self| AssetRegistry {
            weak_self: weak_self.clone(),
            types: self.types,
            devices: self.devices,
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            reload_queue: Mutex::new(VecDeque::new()),
            events_tx,
            events_rx,
            unload_tx,
            unload_rx,
        })
    }
}

/// Owner of the set of currently-loaded and currently-loading resources.
///
/// For any key at most one loading job exists at a time: a second
/// concurrent caller awaits the existing job's shared future and observes
/// the same resulting object (or the same failure). A cache hit is only
/// honored while the backing file's timestamp is not newer than the one
/// recorded at load time.
pub struct AssetRegistry {
    weak_self: Weak<AssetRegistry>,
    types: Arc<TypeRegistry>,
    devices: Vec<Box<dyn Device>>,
    cache: Mutex<HashMap<ResourceKey, CacheEntry>>,
    pending: Mutex<HashMap<ResourceKey, SharedLoadFuture>>,
    reload_queue: Mutex<VecDeque<(HandleUntyped, HandleUntyped)>>,
    events_tx: crossbeam_channel::Sender<ResourceEvent>,
    events_rx: crossbeam_channel::Receiver<ResourceEvent>,
    unload_tx: crossbeam_channel::Sender<ResourceKey>,
    unload_rx: crossbeam_channel::Receiver<ResourceKey>,
}

impl AssetRegistry {
    /// The type reflection service the registry resolves against.
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// The notification stream. Intended for a single logical consumer.
    pub fn events(&self) -> crossbeam_channel::Receiver<ResourceEvent> {
        self.events_rx.clone()
    }

    fn send_event(&self, event: ResourceEvent) {
        let _ = self.events_tx.send(event);
    }

    fn device_timestamp(&self, key: &ResourceKey) -> Option<u64> {
        self.devices.iter().find_map(|device| device.timestamp(key))
    }

    /// Returns the loaded resource without ever suspending, or `None` when
    /// it is not currently loaded.
    pub fn acquire_if_loaded(&self, key: &ResourceKey) -> Option<HandleUntyped> {
        self.cache
            .lock()
            .get(key)
            .and_then(|entry| entry.resource.upgrade())
    }

    /// True when the resource is currently loaded.
    pub fn is_loaded(&self, key: &ResourceKey) -> bool {
        self.acquire_if_loaded(key).is_some()
    }

    /// Cache hit that also re-validates the recorded timestamp against the
    /// live file system. A newer backing file turns the hit into a miss.
    fn acquire_if_fresh(&self, key: &ResourceKey) -> Option<HandleUntyped> {
        let (handle, recorded) = {
            let cache = self.cache.lock();
            let entry = cache.get(key)?;
            (entry.resource.upgrade()?, entry.timestamp)
        };

        match (recorded, self.device_timestamp(key)) {
            (Some(recorded), Some(current)) if current > recorded => {
                info!(
                    "Resource '{}' backing file is newer than the loaded copy, reloading",
                    key
                );
                None
            }
            _ => Some(handle),
        }
    }

    /// Loads a resource, suspending the calling task. Concurrent calls for
    /// the same key share one underlying load.
    pub async fn load_async(&self, key: &ResourceKey) -> Result<HandleUntyped, RegistryError> {
        if let Some(handle) = self.acquire_if_fresh(key) {
            return Ok(handle);
        }
        self.load_shared(key).await
    }

    /// Forces a fresh load of a resource, bypassing the cache. Used by the
    /// reload driver once the dependency tracker reports a change.
    pub async fn reload(&self, key: &ResourceKey) -> Result<HandleUntyped, RegistryError> {
        self.load_shared(key).await
    }

    async fn load_shared(&self, key: &ResourceKey) -> Result<HandleUntyped, RegistryError> {
        let future = {
            let mut pending = self.pending.lock();
            if let Some(existing) = pending.get(key) {
                existing.clone()
            } else {
                let future = self.new_load_request(key);
                pending.insert(key.clone(), future.clone());
                future
            }
        };

        let result = future.await;
        self.pending.lock().remove(key);
        result
    }

    fn new_load_request(&self, key: &ResourceKey) -> SharedLoadFuture {
        let weak = self.weak_self.clone();
        let key = key.clone();
        async move {
            let registry = weak.upgrade().ok_or(RegistryError::Shutdown)?;
            registry.load_resource_once(&key).await
        }
        .boxed()
        .shared()
    }

    async fn load_resource_once(&self, key: &ResourceKey) -> Result<HandleUntyped, RegistryError> {
        self.send_event(ResourceEvent::LoadingStarted(key.clone()));

        let previous = self.acquire_if_loaded(key);

        let result = self.load_from_devices(key).await;
        match result {
            Ok(handle) => {
                self.send_event(ResourceEvent::Loaded(key.clone()));

                if let Some(previous) = previous {
                    if !HandleUntyped::same_instance(&previous, &handle) {
                        // applied later, in FIFO order, from the thread
                        // draining the reload queue
                        self.reload_queue
                            .lock()
                            .push_back((previous, handle.clone()));
                        self.send_event(ResourceEvent::Reloaded(key.clone()));
                    }
                }
                Ok(handle)
            }
            Err(err) => {
                self.send_event(ResourceEvent::LoadFailed(key.clone(), err.to_string()));
                Err(err)
            }
        }
    }

    async fn load_from_devices(&self, key: &ResourceKey) -> Result<HandleUntyped, RegistryError> {
        for device in &self.devices {
            let Some(file) = device.open(key).await else {
                continue;
            };
            let timestamp = device.timestamp(key);

            let context = FileLoadingContext {
                load_imports: true,
                selective_class: None,
                resource_path: Some(key.path().clone()),
            };

            let mut result = load_container(file.as_ref(), &self.types, Some(self), &context)
                .await
                .map_err(|err| {
                    error!("Error loading {}: {}", key, err);
                    RegistryError::LoadFailed(key.clone(), err.to_string())
                })?;

            let root = result
                .take_root()
                .ok_or_else(|| RegistryError::MissingRoot(key.clone()))?;

            if let Some(root_type) = self.types.find_type(root.type_name()) {
                if !root_type.is_a(key.class().name()) {
                    warn!(
                        "Resource '{}' loaded as '{}' which is not a '{}'",
                        key,
                        root_type.name(),
                        key.class()
                    );
                }
            }

            let handle = HandleUntyped::new(key.clone(), root, Some(self.unload_tx.clone()));
            self.cache.lock().insert(
                key.clone(),
                CacheEntry {
                    resource: handle.downgrade(),
                    timestamp,
                },
            );
            return Ok(handle);
        }

        Err(RegistryError::NotFound(key.clone()))
    }

    /// Prunes cache entries whose last strong handle was dropped and fires
    /// the matching unload notifications.
    pub fn collect_dropped_handles(&self) -> Vec<ResourceKey> {
        let mut all_removed = vec![];
        while let Ok(key) = self.unload_rx.try_recv() {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(&key) {
                // a new handle may have been created for the key since the
                // drop notification was queued
                if entry.resource.upgrade().is_none() {
                    cache.remove(&key);
                    drop(cache);
                    self.send_event(ResourceEvent::Unloaded(key.clone()));
                    all_removed.push(key);
                }
            }
        }
        all_removed
    }

    /// Atomically takes the queued `(previous, current)` reload pairs, in
    /// FIFO order. Only the designated reload thread may call this; the
    /// "apply reload" side effects never race with normal traversal.
    pub fn drain_reload_events(&self) -> Vec<(HandleUntyped, HandleUntyped)> {
        self.reload_queue.lock().drain(..).collect()
    }
}

#[async_trait]
impl ImportLoader for AssetRegistry {
    async fn load_import(&self, key: &ResourceKey) -> Option<HandleUntyped> {
        self.load_async(key).await.ok()
    }
}
