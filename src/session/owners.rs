//! Child to owner relationships of the attached graph.

use crate::types::ObjectId;
use std::collections::{HashMap, HashSet};

/// For every attached instance, the instances holding it and the property
/// they hold it through. A child held twice by the same list appears twice.
#[derive(Debug, Default)]
pub(crate) struct OwnerTable {
    owners: HashMap<ObjectId, Vec<(ObjectId, &'static str)>>,
}

impl OwnerTable {
    pub fn link(&mut self, child: ObjectId, owner: ObjectId, property: &'static str) {
        self.owners.entry(child).or_default().push((owner, property));
    }

    /// Drop one occurrence of `owner.property -> child`.
    pub fn unlink(&mut self, child: ObjectId, owner: ObjectId, property: &'static str) {
        let Some(links) = self.owners.get_mut(&child) else {
            return;
        };
        if let Some(position) = links.iter().position(|link| *link == (owner, property)) {
            links.remove(position);
        }
        if links.is_empty() {
            self.owners.remove(&child);
        }
    }

    pub fn owners_of(&self, child: ObjectId) -> &[(ObjectId, &'static str)] {
        self.owners.get(&child).map_or(&[], Vec::as_slice)
    }

    /// Remove `id` both as a child and as an owner.
    pub fn forget(&mut self, id: ObjectId) {
        self.owners.remove(&id);
        self.owners.retain(|_, links| {
            links.retain(|(owner, _)| *owner != id);
            !links.is_empty()
        });
    }

    /// Every instance that reaches `id` through one or more owner links.
    pub fn transitive_owners(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut seen = HashSet::from([id]);
        let mut found = Vec::new();
        let mut pending = vec![id];

        while let Some(child) = pending.pop() {
            for (owner, _) in self.owners_of(child) {
                if seen.insert(*owner) {
                    found.push(*owner);
                    pending.push(*owner);
                }
            }
        }

        found
    }

    pub fn clear(&mut self) {
        self.owners.clear();
    }
}
