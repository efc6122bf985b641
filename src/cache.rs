//! Identity cache.
//!
//! An arena of live instances addressed by [`ObjectId`]. At most one slot
//! exists per id, so resolving the same record twice always lands on the same
//! instance.

use crate::error::{Result, StoreError};
use crate::tracked::Trackable;
use crate::types::{Digest, ObjectId, ObjectKey, TypeTag};
use std::collections::HashMap;

/// One live instance.
#[derive(Debug)]
pub struct Slot {
    pub tag: TypeTag,
    pub instance: Box<dyn Trackable>,
    /// Whether a record for this instance exists on disk.
    pub persisted: bool,
    /// Digest of the encoded record last written or loaded.
    pub digest: Option<Digest>,
}

impl Slot {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.tag, self.instance.object_id())
    }
}

#[derive(Debug, Default)]
pub struct IdentityCache {
    slots: Vec<Option<Slot>>,
    index: HashMap<ObjectId, usize>,
    free: Vec<usize>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an instance. Fails if its id already has a slot.
    pub fn insert(&mut self, slot: Slot) -> Result<()> {
        let id = slot.instance.object_id();
        if self.index.contains_key(&id) {
            return Err(StoreError::DuplicateInstance(id));
        }

        let position = match self.free.pop() {
            Some(position) => {
                self.slots[position] = Some(slot);
                position
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, position);
        Ok(())
    }

    pub fn get(&self, id: ObjectId) -> Option<&Slot> {
        let position = *self.index.get(&id)?;
        self.slots[position].as_ref()
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Slot> {
        let position = *self.index.get(&id)?;
        self.slots[position].as_mut()
    }

    /// Like [`get`](Self::get), failing with `NotFound`.
    pub fn require(&self, id: ObjectId) -> Result<&Slot> {
        self.get(id).ok_or_else(|| not_cached(id))
    }

    pub fn require_mut(&mut self, id: ObjectId) -> Result<&mut Slot> {
        self.get_mut(id).ok_or_else(|| not_cached(id))
    }

    /// Evict an instance, freeing its slot for reuse.
    pub fn remove(&mut self, id: ObjectId) -> Option<Slot> {
        let position = self.index.remove(&id)?;
        self.free.push(position);
        self.slots[position].take()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Live slots, in arena order.
    pub fn iter(&self) -> impl Iterator<Item = &Slot> + '_ {
        self.slots.iter().flatten()
    }
}

fn not_cached(id: ObjectId) -> StoreError {
    StoreError::NotFound {
        type_name: "instance".to_string(),
        id,
    }
}
