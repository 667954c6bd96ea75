//! # Type Registry
//!
//! Maps host type identities to their descriptors. Registration happens once
//! per type; afterwards the descriptors are shared read-only by any number of
//! runtime instances, possibly across threads.
//!
//! Uses DashMap so registrations and lookups never contend on a global lock.

use std::any::TypeId;
use std::sync::Arc;
use std::sync::LazyLock;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::declare::EnumBuilder;
use crate::declare::TypeBuilder;
use crate::descriptor::TypeDescriptor;
use crate::value::Object;

static GLOBAL: LazyLock<Arc<TypeRegistry>> = LazyLock::new(|| Arc::new(TypeRegistry::new()));

#[derive(Debug, Clone)]
pub enum Error {
    /// The type already has a descriptor.
    DuplicateRegistration { type_name: String },
    /// The type was never registered.
    UnregisteredType { type_name: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateRegistration { type_name } => write!(f, "type '{}' is already registered", type_name),
            Self::UnregisteredType { type_name } => write!(f, "type '{}' is not a registered type", type_name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Default)]
pub struct TypeRegistry {
    types: DashMap<TypeId, Arc<TypeDescriptor>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by instances that are not given their own.
    pub fn global() -> Arc<TypeRegistry> {
        GLOBAL.clone()
    }

    pub fn register<T: 'static>(&self, builder: TypeBuilder<T>) -> Result<Arc<TypeDescriptor>> {
        self.insert(builder.build())
    }

    pub fn register_enum<E>(&self, builder: EnumBuilder<E>) -> Result<Arc<TypeDescriptor>>
    where
        E: Copy + PartialEq + Send + Sync + 'static,
    {
        self.insert(builder.build())
    }

    /// Registers an already built descriptor.
    pub fn insert(&self, descriptor: TypeDescriptor) -> Result<Arc<TypeDescriptor>> {
        match self.types.entry(descriptor.type_id()) {
            Entry::Occupied(_) => Err(Error::DuplicateRegistration { type_name: descriptor.name().to_string() }),
            Entry::Vacant(slot) => {
                let descriptor = Arc::new(descriptor);
                tracing::debug!(
                    type_name = descriptor.name(),
                    constructors = descriptor.constructors().len(),
                    operators = descriptor.operators().len(),
                    "registered type"
                );
                slot.insert(descriptor.clone());
                Ok(descriptor)
            }
        }
    }

    pub fn get(&self, type_id: TypeId) -> Option<Arc<TypeDescriptor>> {
        self.types.get(&type_id).map(|entry| entry.value().clone())
    }

    pub fn lookup<T: 'static>(&self) -> Result<Arc<TypeDescriptor>> {
        self.get(TypeId::of::<T>()).ok_or_else(|| Error::UnregisteredType {
            type_name: crate::value::short_name(std::any::type_name::<T>()).to_string(),
        })
    }

    /// Descriptor for the runtime type of `object`.
    pub fn lookup_object(&self, object: &Object) -> Result<Arc<TypeDescriptor>> {
        self.get(object.type_id())
            .ok_or_else(|| Error::UnregisteredType { type_name: object.type_name().to_string() })
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.types.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
