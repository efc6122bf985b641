//! The change-tracked instance contract.
//!
//! Domain types implement [`Entity`], which is typed and carries the per-type
//! property table. Everything that walks the object graph works through the
//! object-safe [`Trackable`] view, which every `Entity` gets for free.
//!
//! Instances never notify anyone themselves. Mutations are applied through the
//! [`ObjectStore`](crate::ObjectStore), which produces a [`Mutation`] for each
//! change and hands it to the notification hub.

use crate::catalog::{Property, TypeDescriptor};
use crate::error::{Result, StoreError};
use crate::types::{ObjectId, ObjectKey, PropertyValue};
use std::any::Any;
use std::fmt;

/// A domain type whose instances can be tracked and persisted.
pub trait Entity: Any + Send + Sync + fmt::Debug + Sized {
    /// Fully qualified name, unique within a registry.
    const TYPE_NAME: &'static str;

    /// When false every persist of this type goes through `add`, never
    /// `update`.
    const UPDATABLE: bool = true;

    /// Stable identity of this instance.
    fn id(&self) -> ObjectId;

    /// An instance with the given identity and default field values. Used
    /// when materializing a record from disk.
    fn with_id(id: ObjectId) -> Self;

    /// The property table, in persistence order.
    fn properties() -> Vec<Property<Self>>;
}

/// Object-safe view of an [`Entity`].
pub trait Trackable: Any + Send + Sync + fmt::Debug {
    fn object_id(&self) -> ObjectId;

    fn type_name(&self) -> &'static str;

    /// Build the descriptor table for this instance's type. Callers should go
    /// through the [`Catalog`](crate::Catalog), which builds it once.
    fn describe(&self) -> TypeDescriptor;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Entity> Trackable for T {
    fn object_id(&self) -> ObjectId {
        Entity::id(self)
    }

    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn describe(&self) -> TypeDescriptor {
        TypeDescriptor::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An ordered edit of an association list.
///
/// `Move` follows observable-collection semantics: the item is removed at
/// `from` and reinserted at `to` in the shortened list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListEdit {
    Insert { index: usize, item: ObjectId },
    Remove { index: usize, item: ObjectId },
    Move { from: usize, to: usize },
}

impl ListEdit {
    /// The edit that undoes this one.
    pub fn inverse(&self) -> ListEdit {
        match *self {
            ListEdit::Insert { index, item } => ListEdit::Remove { index, item },
            ListEdit::Remove { index, item } => ListEdit::Insert { index, item },
            ListEdit::Move { from, to } => ListEdit::Move { from: to, to: from },
        }
    }

    /// Validate against a list without touching it.
    pub fn check(&self, property: &'static str, list: &[ObjectId]) -> Result<()> {
        let len = list.len();
        let out_of_bounds = |index| StoreError::IndexOutOfBounds {
            property,
            index,
            len,
        };

        match *self {
            ListEdit::Insert { index, .. } if index > len => Err(out_of_bounds(index)),
            ListEdit::Remove { index, .. } if index >= len => Err(out_of_bounds(index)),
            ListEdit::Remove { index, item } if list[index] != item => {
                Err(StoreError::InvalidOperation(format!(
                    "{property}[{index}] holds {}, not {item}",
                    list[index]
                )))
            }
            ListEdit::Move { from, .. } if from >= len => Err(out_of_bounds(from)),
            ListEdit::Move { to, .. } if to >= len => Err(out_of_bounds(to)),
            _ => Ok(()),
        }
    }

    /// Apply to a list, validating first.
    pub fn apply(&self, property: &'static str, list: &mut Vec<ObjectId>) -> Result<()> {
        self.check(property, list)?;
        match *self {
            ListEdit::Insert { index, item } => list.insert(index, item),
            ListEdit::Remove { index, .. } => {
                list.remove(index);
            }
            ListEdit::Move { from, to } => {
                let item = list.remove(from);
                list.insert(to, item);
            }
        }
        Ok(())
    }

    /// Item that enters the list through this edit, if any.
    pub fn inserted(&self) -> Option<ObjectId> {
        match *self {
            ListEdit::Insert { item, .. } => Some(item),
            _ => None,
        }
    }
}

/// What happened to a property.
#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// The whole value was replaced.
    Set {
        old: PropertyValue,
        new: PropertyValue,
    },
    /// An association list was edited in place.
    Edit(ListEdit),
}

/// A single property change of a single instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub key: ObjectKey,
    pub property: &'static str,
    pub kind: MutationKind,
}

impl Mutation {
    pub fn id(&self) -> ObjectId {
        self.key.id
    }

    /// Tracked instances that this mutation makes reachable.
    pub fn incoming(&self) -> Vec<ObjectId> {
        match &self.kind {
            MutationKind::Set { new, .. } => new.children(),
            MutationKind::Edit(edit) => edit.inserted().into_iter().collect(),
        }
    }

    /// Tracked instances that this mutation makes unreachable through
    /// `property`.
    pub fn outgoing(&self) -> Vec<ObjectId> {
        match &self.kind {
            MutationKind::Set { old, .. } => old.children(),
            MutationKind::Edit(ListEdit::Remove { item, .. }) => vec![*item],
            MutationKind::Edit(_) => Vec::new(),
        }
    }
}
