//! Domain type registry.
//!
//! A closed, bidirectional mapping between entity types and the small integer
//! tags used in record paths and broadcast frames. Built once at
//! configuration time; it cannot grow afterwards.

use crate::catalog::TypeDescriptor;
use crate::error::{Result, StoreError};
use crate::tracked::{Entity, Trackable};
use crate::types::{ObjectId, TypeTag};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

fn blank<T: Entity>(id: ObjectId) -> Box<dyn Trackable> {
    Box::new(T::with_id(id))
}

/// One registered type.
#[derive(Clone)]
pub struct TypeEntry {
    tag: TypeTag,
    type_name: &'static str,
    type_id: TypeId,
    updatable: bool,
    blank: fn(ObjectId) -> Box<dyn Trackable>,
    describe: fn() -> TypeDescriptor,
}

impl TypeEntry {
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn updatable(&self) -> bool {
        self.updatable
    }

    /// A default-valued instance with the given identity.
    pub fn instantiate(&self, id: ObjectId) -> Box<dyn Trackable> {
        (self.blank)(id)
    }

    pub fn describe(&self) -> TypeDescriptor {
        (self.describe)()
    }
}

impl fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeEntry")
            .field("tag", &self.tag)
            .field("type_name", &self.type_name)
            .field("updatable", &self.updatable)
            .finish()
    }
}

/// Builder for a [`TypeRegistry`].
#[derive(Default)]
pub struct TypeRegistryBuilder {
    entries: Vec<TypeEntry>,
}

impl TypeRegistryBuilder {
    /// Register `T` under `tag`. Conflicts are reported by [`build`](Self::build).
    pub fn register<T: Entity>(mut self, tag: i32) -> Self {
        self.entries.push(TypeEntry {
            tag: TypeTag(tag),
            type_name: T::TYPE_NAME,
            type_id: TypeId::of::<T>(),
            updatable: T::UPDATABLE,
            blank: blank::<T>,
            describe: TypeDescriptor::of::<T>,
        });
        self
    }

    pub fn build(self) -> Result<TypeRegistry> {
        let mut registry = TypeRegistry {
            entries: Vec::with_capacity(self.entries.len()),
            by_tag: HashMap::new(),
            by_name: HashMap::new(),
            by_type: HashMap::new(),
        };

        for entry in self.entries {
            let index = registry.entries.len();
            if registry.by_tag.insert(entry.tag, index).is_some() {
                return Err(StoreError::InvalidOperation(format!(
                    "type tag {} registered twice",
                    entry.tag
                )));
            }
            if registry.by_name.insert(entry.type_name, index).is_some()
                || registry.by_type.insert(entry.type_id, index).is_some()
            {
                return Err(StoreError::InvalidOperation(format!(
                    "type {} registered twice",
                    entry.type_name
                )));
            }
            registry.entries.push(entry);
        }

        Ok(registry)
    }
}

/// Closed type <-> tag table.
#[derive(Clone, Debug)]
pub struct TypeRegistry {
    entries: Vec<TypeEntry>,
    by_tag: HashMap<TypeTag, usize>,
    by_name: HashMap<&'static str, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Tag of a registered type.
    pub fn tag_of<T: Entity>(&self) -> Result<TypeTag> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|&i| self.entries[i].tag)
            .ok_or_else(|| StoreError::UnknownType(T::TYPE_NAME.to_string()))
    }

    /// Tag of a registered type, by name.
    pub fn tag(&self, type_name: &str) -> Result<TypeTag> {
        self.entry_by_name(type_name).map(TypeEntry::tag)
    }

    /// Tag of the runtime type of `obj`.
    pub fn tag_for(&self, obj: &dyn Trackable) -> Result<TypeTag> {
        self.by_type
            .get(&obj.as_any().type_id())
            .map(|&i| self.entries[i].tag)
            .ok_or_else(|| StoreError::UnknownType(obj.type_name().to_string()))
    }

    /// Name of the type registered under `tag`.
    pub fn type_name(&self, tag: TypeTag) -> Result<&'static str> {
        self.entry(tag).map(TypeEntry::type_name)
    }

    pub fn entry(&self, tag: TypeTag) -> Result<&TypeEntry> {
        self.by_tag
            .get(&tag)
            .map(|&i| &self.entries[i])
            .ok_or(StoreError::UnknownTag(tag))
    }

    pub fn entry_by_name(&self, type_name: &str) -> Result<&TypeEntry> {
        self.by_name
            .get(type_name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| StoreError::UnknownType(type_name.to_string()))
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.by_tag.contains_key(&tag)
    }

    /// Registered tags, in registration order.
    pub fn tags(&self) -> impl Iterator<Item = TypeTag> + '_ {
        self.entries.iter().map(|e| e.tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
