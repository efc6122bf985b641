//! Property descriptor catalog.
//!
//! Classifies every tracked property of a type as plain, reference or
//! association. Tables are built lazily on first request and kept for the
//! lifetime of the catalog; they never change afterwards.

mod descriptor;

pub use descriptor::{Property, PropertyDescriptor, TypeDescriptor};

use crate::error::{Result, StoreError};
use crate::tracked::{Entity, Trackable};
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct CatalogInner {
    by_type: HashMap<TypeId, Arc<TypeDescriptor>>,
    by_name: HashMap<&'static str, Arc<TypeDescriptor>>,
}

/// Cache of [`TypeDescriptor`]s keyed by runtime type.
#[derive(Default)]
pub struct Catalog {
    inner: RwLock<CatalogInner>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor for `T`, building it on first request.
    pub fn describe<T: Entity>(&self) -> Arc<TypeDescriptor> {
        self.get_or_build(TypeId::of::<T>(), TypeDescriptor::of::<T>)
    }

    /// Descriptor for the runtime type of `obj`.
    pub fn describe_object(&self, obj: &dyn Trackable) -> Arc<TypeDescriptor> {
        let type_id = obj.as_any().type_id();
        self.get_or_build(type_id, || obj.describe())
    }

    /// Descriptor for a type by name. Only types that have been described
    /// before can be resolved this way.
    pub fn lookup(&self, type_name: &str) -> Result<Arc<TypeDescriptor>> {
        self.inner
            .read()
            .by_name
            .get(type_name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownType(type_name.to_string()))
    }

    /// Number of described types.
    pub fn len(&self) -> usize {
        self.inner.read().by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_or_build(
        &self,
        type_id: TypeId,
        build: impl FnOnce() -> TypeDescriptor,
    ) -> Arc<TypeDescriptor> {
        if let Some(descriptor) = self.inner.read().by_type.get(&type_id) {
            return Arc::clone(descriptor);
        }

        let mut inner = self.inner.write();
        if let Some(descriptor) = inner.by_type.get(&type_id) {
            return Arc::clone(descriptor);
        }

        let descriptor = Arc::new(build());
        tracing::trace!(
            type_name = descriptor.type_name(),
            properties = descriptor.properties().len(),
            "described type"
        );
        inner.by_type.insert(type_id, Arc::clone(&descriptor));
        inner
            .by_name
            .insert(descriptor.type_name(), Arc::clone(&descriptor));
        descriptor
    }
}
