use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::container::{ContainerError, PayloadReader, PayloadWriter};

/// Base class every loadable resource type derives from.
pub const RESOURCE_BASE_TYPE: &str = "Resource";

/// A serialized object instance living inside a container.
///
/// Implementations read and write their payload against the container's
/// resolved-reference table: names, properties and imports are referenced
/// by table index, never inline.
pub trait Resource: Any + Send + Sync {
    /// Class name of this object, as registered in the [`TypeRegistry`].
    fn type_name(&self) -> &str;

    /// Serializes the object payload.
    fn write_binary(&self, writer: &mut PayloadWriter<'_>) -> Result<(), ContainerError>;

    /// Deserializes the object payload.
    fn read_binary(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), ContainerError>;

    /// Called once after every object of the container has been
    /// deserialized, in export table order.
    fn post_load(&mut self) {}

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn Resource {
    /// Returns a reference to the concrete type, if it matches.
    pub fn downcast_ref<T: Resource>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Returns a mutable reference to the concrete type, if it matches.
    pub fn downcast_mut<T: Resource>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// A property recorded on a registered type.
#[derive(Debug)]
pub struct PropertyDescriptor {
    name: Arc<str>,
}

impl PropertyDescriptor {
    /// Creates a property descriptor.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().into(),
        }
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Shared handle to a resolved property.
pub type PropertyHandle = Arc<PropertyDescriptor>;

/// Description of a constructible (or abstract) type known to the
/// reflection service.
pub struct TypeDescriptor {
    name: Arc<str>,
    base: Option<TypeHandle>,
    is_abstract: bool,
    extension: Option<Arc<str>>,
    factory: Option<fn() -> Box<dyn Resource>>,
    properties: Vec<PropertyHandle>,
}

impl TypeDescriptor {
    /// Starts a descriptor for a concrete type with a default-instance
    /// factory.
    pub fn new(name: impl AsRef<str>, factory: fn() -> Box<dyn Resource>) -> Self {
        Self {
            name: name.as_ref().into(),
            base: None,
            is_abstract: false,
            extension: None,
            factory: Some(factory),
            properties: Vec::new(),
        }
    }

    /// Starts a descriptor for an abstract type. Abstract types can appear
    /// in containers as bases and import classes but are never constructed.
    pub fn new_abstract(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().into(),
            base: None,
            is_abstract: true,
            extension: None,
            factory: None,
            properties: Vec::new(),
        }
    }

    /// Declares a property on the type.
    #[must_use]
    pub fn with_property(mut self, name: impl AsRef<str>) -> Self {
        self.properties.push(Arc::new(PropertyDescriptor::new(name)));
        self
    }

    /// Declares the file extension cooked artifacts of this class use.
    #[must_use]
    pub fn with_extension(mut self, extension: impl AsRef<str>) -> Self {
        self.extension = Some(extension.as_ref().into());
        self
    }

    /// Type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the type cannot be constructed.
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Cooked-artifact file extension, if the class declares one.
    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// Walks the base chain looking for `base_name`.
    pub fn is_a(&self, base_name: &str) -> bool {
        if &*self.name == base_name {
            return true;
        }
        let mut current = self.base.as_ref();
        while let Some(base) = current {
            if base.name() == base_name {
                return true;
            }
            current = base.base.as_ref();
        }
        false
    }

    /// Constructs a default instance, or `None` for abstract types.
    pub fn create(&self) -> Option<Box<dyn Resource>> {
        self.factory.map(|factory| factory())
    }

    /// Looks up a property declared on this type or any of its bases.
    pub fn find_property(&self, name: &str) -> Option<PropertyHandle> {
        if let Some(property) = self.properties.iter().find(|p| p.name() == name) {
            return Some(property.clone());
        }
        self.base.as_ref().and_then(|base| base.find_property(name))
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("abstract", &self.is_abstract)
            .finish()
    }
}

/// Shared handle to a resolved type.
pub type TypeHandle = Arc<TypeDescriptor>;

/// Explicitly constructed type reflection service.
///
/// Owned by the process bootstrap and passed by reference into the loader,
/// cooker and tracker instead of being reachable through ambient global
/// state.
pub struct TypeRegistry {
    types: RwLock<HashMap<Arc<str>, TypeHandle>>,
}

impl TypeRegistry {
    /// Creates a registry pre-seeded with the abstract resource base type
    /// and the built-in cook metadata record.
    pub fn new() -> Self {
        let registry = Self {
            types: RwLock::new(HashMap::new()),
        };
        registry.register(TypeDescriptor::new_abstract(RESOURCE_BASE_TYPE));
        registry.register_resource(TypeDescriptor::new(
            crate::container::COOK_METADATA_TYPE,
            || Box::new(crate::container::CookMetadata::default()),
        ));
        registry
    }

    /// Registers a type without a base class.
    pub fn register(&self, descriptor: TypeDescriptor) -> TypeHandle {
        let handle: TypeHandle = Arc::new(descriptor);
        self.types
            .write()
            .insert(handle.name.clone(), handle.clone());
        handle
    }

    /// Registers a type deriving from `base`, which must already be
    /// registered.
    pub fn register_with_base(
        &self,
        mut descriptor: TypeDescriptor,
        base: &str,
    ) -> Option<TypeHandle> {
        let base = self.find_type(base)?;
        descriptor.base = Some(base);
        Some(self.register(descriptor))
    }

    /// Registers a concrete resource type deriving from the resource base.
    pub fn register_resource(&self, descriptor: TypeDescriptor) -> TypeHandle {
        self.register_with_base(descriptor, RESOURCE_BASE_TYPE)
            .expect("resource base type is always registered")
    }

    /// Resolves a type name to a live handle. Unknown names resolve to
    /// `None`; the caller decides whether that degrades or fails.
    pub fn find_type(&self, name: &str) -> Option<TypeHandle> {
        self.types.read().get(name).cloned()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
