//! Per-type property tables.
//!
//! A [`Property<T>`] is the typed capability: a name, a classification and a
//! getter/setter pair over `T`. [`TypeDescriptor::of`] erases those into
//! [`PropertyDescriptor`]s that operate on `&dyn Trackable`.

use crate::error::{Result, StoreError};
use crate::tracked::{Entity, Trackable};
use crate::types::{ObjectId, PropertyKind, PropertyValue, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

enum Access<T> {
    Plain {
        get: fn(&T) -> Value,
        set: fn(&mut T, Value) -> Result<()>,
    },
    Reference {
        get: fn(&T) -> Option<ObjectId>,
        set: fn(&mut T, Option<ObjectId>),
    },
    Association {
        get: fn(&T) -> &Vec<ObjectId>,
        get_mut: fn(&mut T) -> &mut Vec<ObjectId>,
    },
}

impl<T> Clone for Access<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Access<T> {}

/// One entry of an entity's property table.
pub struct Property<T> {
    name: &'static str,
    tracked: bool,
    access: Access<T>,
}

impl<T> Property<T> {
    /// Scalar data persisted inline.
    pub fn plain(
        name: &'static str,
        get: fn(&T) -> Value,
        set: fn(&mut T, Value) -> Result<()>,
    ) -> Self {
        Self {
            name,
            tracked: true,
            access: Access::Plain { get, set },
        }
    }

    /// A single nested tracked instance.
    pub fn reference(
        name: &'static str,
        get: fn(&T) -> Option<ObjectId>,
        set: fn(&mut T, Option<ObjectId>),
    ) -> Self {
        Self {
            name,
            tracked: true,
            access: Access::Reference { get, set },
        }
    }

    /// An ordered collection of tracked instances.
    pub fn association(
        name: &'static str,
        get: fn(&T) -> &Vec<ObjectId>,
        get_mut: fn(&mut T) -> &mut Vec<ObjectId>,
    ) -> Self {
        Self {
            name,
            tracked: true,
            access: Access::Association { get, get_mut },
        }
    }

    /// Exclude this property from tracking and persistence.
    pub fn untracked(mut self) -> Self {
        self.tracked = false;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> PropertyKind {
        match self.access {
            Access::Plain { .. } => PropertyKind::Plain,
            Access::Reference { .. } => PropertyKind::Reference,
            Access::Association { .. } => PropertyKind::Association,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked
    }
}

trait ErasedAccess: Send + Sync {
    fn get(&self, obj: &dyn Any) -> Option<PropertyValue>;
    fn set(&self, obj: &mut dyn Any, value: PropertyValue) -> Option<Result<()>>;
    fn list<'a>(&self, obj: &'a dyn Any) -> Option<&'a Vec<ObjectId>>;
    fn list_mut<'a>(&self, obj: &'a mut dyn Any) -> Option<&'a mut Vec<ObjectId>>;
}

struct TypedAccess<T>(Access<T>);

impl<T: Entity> ErasedAccess for TypedAccess<T> {
    fn get(&self, obj: &dyn Any) -> Option<PropertyValue> {
        let obj = obj.downcast_ref::<T>()?;
        Some(match self.0 {
            Access::Plain { get, .. } => PropertyValue::Plain(get(obj)),
            Access::Reference { get, .. } => PropertyValue::Reference(get(obj)),
            Access::Association { get, .. } => PropertyValue::Association(get(obj).clone()),
        })
    }

    fn set(&self, obj: &mut dyn Any, value: PropertyValue) -> Option<Result<()>> {
        let obj = obj.downcast_mut::<T>()?;
        Some(match (self.0, value) {
            (Access::Plain { set, .. }, PropertyValue::Plain(v)) => set(obj, v),
            (Access::Reference { set, .. }, PropertyValue::Reference(target)) => {
                set(obj, target);
                Ok(())
            }
            (Access::Association { get_mut, .. }, PropertyValue::Association(items)) => {
                *get_mut(obj) = items;
                Ok(())
            }
            // Kind checked by the caller.
            _ => Ok(()),
        })
    }

    fn list<'a>(&self, obj: &'a dyn Any) -> Option<&'a Vec<ObjectId>> {
        match self.0 {
            Access::Association { get, .. } => obj.downcast_ref::<T>().map(get),
            _ => None,
        }
    }

    fn list_mut<'a>(&self, obj: &'a mut dyn Any) -> Option<&'a mut Vec<ObjectId>> {
        match self.0 {
            Access::Association { get_mut, .. } => obj.downcast_mut::<T>().map(get_mut),
            _ => None,
        }
    }
}

/// Type-erased accessor for one tracked property.
#[derive(Clone)]
pub struct PropertyDescriptor {
    name: &'static str,
    kind: PropertyKind,
    owner: &'static str,
    access: Arc<dyn ErasedAccess>,
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .finish()
    }
}

impl PropertyDescriptor {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// Name of the type this property belongs to.
    pub fn owner(&self) -> &'static str {
        self.owner
    }

    pub fn is_reference(&self) -> bool {
        self.kind == PropertyKind::Reference
    }

    pub fn is_association(&self) -> bool {
        self.kind == PropertyKind::Association
    }

    fn foreign(&self, obj: &dyn Trackable) -> StoreError {
        StoreError::InvalidOperation(format!(
            "{}.{} applied to an instance of {}",
            self.owner,
            self.name,
            obj.type_name()
        ))
    }

    fn expect_kind(&self, expected: PropertyKind) -> Result<()> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(StoreError::InvalidDescriptorUse {
                property: self.name,
                expected,
                actual: self.kind,
            })
        }
    }

    /// Read the current value.
    pub fn get(&self, obj: &dyn Trackable) -> Result<PropertyValue> {
        self.access
            .get(obj.as_any())
            .ok_or_else(|| self.foreign(obj))
    }

    /// Overwrite the current value. The value must match the property kind.
    pub fn set(&self, obj: &mut dyn Trackable, value: PropertyValue) -> Result<()> {
        self.expect_kind(value.kind())?;
        let foreign = self.foreign(obj);
        self.access.set(obj.as_any_mut(), value).ok_or(foreign)?
    }

    pub fn plain_value(&self, obj: &dyn Trackable) -> Result<Value> {
        self.expect_kind(PropertyKind::Plain)?;
        match self.get(obj)? {
            PropertyValue::Plain(v) => Ok(v),
            _ => Err(self.foreign(obj)),
        }
    }

    /// Target of a reference property.
    pub fn reference_value(&self, obj: &dyn Trackable) -> Result<Option<ObjectId>> {
        self.expect_kind(PropertyKind::Reference)?;
        match self.get(obj)? {
            PropertyValue::Reference(target) => Ok(target),
            _ => Err(self.foreign(obj)),
        }
    }

    /// Items of an association property.
    pub fn association_value<'a>(&self, obj: &'a dyn Trackable) -> Result<&'a Vec<ObjectId>> {
        self.expect_kind(PropertyKind::Association)?;
        self.access
            .list(obj.as_any())
            .ok_or_else(|| self.foreign(obj))
    }

    /// Mutable items of an association property.
    pub fn association_mut<'a>(
        &self,
        obj: &'a mut dyn Trackable,
    ) -> Result<&'a mut Vec<ObjectId>> {
        self.expect_kind(PropertyKind::Association)?;
        let foreign = self.foreign(obj);
        self.access.list_mut(obj.as_any_mut()).ok_or(foreign)
    }
}

/// The tracked properties of one type, in persistence order.
#[derive(Clone, Debug)]
pub struct TypeDescriptor {
    type_name: &'static str,
    updatable: bool,
    properties: Vec<PropertyDescriptor>,
}

impl TypeDescriptor {
    /// Build the table for `T`, dropping untracked properties.
    pub fn of<T: Entity>() -> Self {
        let properties = T::properties()
            .into_iter()
            .filter(Property::is_tracked)
            .map(|property| PropertyDescriptor {
                name: property.name,
                kind: property.kind(),
                owner: T::TYPE_NAME,
                access: Arc::new(TypedAccess(property.access)),
            })
            .collect();

        Self {
            type_name: T::TYPE_NAME,
            updatable: T::UPDATABLE,
            properties,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn updatable(&self) -> bool {
        self.updatable
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Like [`property`](Self::property), failing with `UnknownProperty`.
    pub fn require(&self, name: &str) -> Result<&PropertyDescriptor> {
        self.property(name).ok_or_else(|| StoreError::UnknownProperty {
            type_name: self.type_name,
            property: name.to_string(),
        })
    }

    pub fn of_kind(&self, kind: PropertyKind) -> impl Iterator<Item = &PropertyDescriptor> + '_ {
        self.properties.iter().filter(move |p| p.kind == kind)
    }

    /// Every tracked instance directly reachable from `obj`, with the
    /// property that reaches it. Null references are skipped.
    pub fn children(&self, obj: &dyn Trackable) -> Result<Vec<(&'static str, ObjectId)>> {
        let mut children = Vec::new();
        for property in &self.properties {
            match property.kind {
                PropertyKind::Plain => {}
                PropertyKind::Reference => {
                    if let Some(target) = property.reference_value(obj)? {
                        children.push((property.name, target));
                    }
                }
                PropertyKind::Association => {
                    for item in property.association_value(obj)? {
                        children.push((property.name, *item));
                    }
                }
            }
        }
        Ok(children)
    }
}
