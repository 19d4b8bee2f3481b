use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use crate::{Resource, ResourceKey};

/// `Arc<Inner>` is responsible for sending an 'unload' message when the
/// last strong reference is dropped.
struct Inner {
    key: ResourceKey,
    resource: Box<dyn Resource>,
    unload_tx: Option<crossbeam_channel::Sender<ResourceKey>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(tx) = &self.unload_tx {
            let _ = tx.send(self.key.clone());
        }
    }
}

/// Non-owning reference to a loaded resource.
///
/// The registry's cache holds these; only external strong handles keep a
/// resource alive.
pub struct ReferenceUntyped {
    inner: Weak<Inner>,
}

impl ReferenceUntyped {
    /// Attempts to upgrade to an owning [`HandleUntyped`]. Returns `None`
    /// if the resource has since been dropped.
    pub fn upgrade(&self) -> Option<HandleUntyped> {
        self.inner.upgrade().map(|inner| HandleUntyped { inner })
    }

    /// Number of strong handles currently keeping the resource alive.
    pub fn strong_count(&self) -> usize {
        self.inner.strong_count()
    }
}

/// Type-less owning handle to a loaded resource.
#[derive(Clone)]
pub struct HandleUntyped {
    inner: Arc<Inner>,
}

impl HandleUntyped {
    pub(crate) fn new(
        key: ResourceKey,
        resource: Box<dyn Resource>,
        unload_tx: Option<crossbeam_channel::Sender<ResourceKey>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                key,
                resource,
                unload_tx,
            }),
        }
    }

    /// Identity the resource was loaded under.
    pub fn key(&self) -> &ResourceKey {
        &self.inner.key
    }

    /// The loaded object.
    pub fn resource(&self) -> &dyn Resource {
        &*self.inner.resource
    }

    /// The loaded object downcast to its concrete type.
    pub fn get<T: Resource>(&self) -> Option<&T> {
        self.inner.resource.downcast_ref::<T>()
    }

    /// Creates the cache-side non-owning reference.
    pub fn downgrade(&self) -> ReferenceUntyped {
        ReferenceUntyped {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// True when both handles refer to the same loaded instance, not
    /// merely the same key.
    pub fn same_instance(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl PartialEq for HandleUntyped {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl fmt::Debug for HandleUntyped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleUntyped({})", self.inner.key)
    }
}

/// Typed owning handle to a loaded resource of type `T`.
pub struct Handle<T: Resource> {
    inner: Arc<Inner>,
    _pd: PhantomData<fn() -> T>,
}

impl<T: Resource> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _pd: PhantomData,
        }
    }
}

impl<T: Resource> From<HandleUntyped> for Handle<T> {
    fn from(handle: HandleUntyped) -> Self {
        Self {
            inner: handle.inner,
            _pd: PhantomData,
        }
    }
}

impl<T: Resource> Handle<T> {
    /// Identity the resource was loaded under.
    pub fn key(&self) -> &ResourceKey {
        &self.inner.key
    }

    /// The loaded object, or `None` when the handle was created from a
    /// mismatched untyped handle.
    pub fn get(&self) -> Option<&T> {
        self.inner.resource.downcast_ref::<T>()
    }
}

impl<T: Resource> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}
