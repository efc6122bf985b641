//! Tracking state of one session and the graph walks over it.

use super::owners::OwnerTable;
use crate::changes::{ChangeLog, ChangeState};
use crate::error::{Result, StoreError};
use crate::notify::Subscription;
use crate::store::ObjectStore;
use crate::tracked::{Mutation, MutationKind};
use crate::types::{ObjectId, ObjectKey, SessionId};
use std::collections::{HashMap, HashSet};

/// Keys written or removed by a commit, in the order they hit the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub added: Vec<ObjectKey>,
    pub updated: Vec<ObjectKey>,
    pub deleted: Vec<ObjectKey>,
}

impl CommitReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of records touched.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }

    pub(crate) fn note(&mut self, step: Step, key: ObjectKey) {
        match step {
            Step::Add(_) => self.added.push(key),
            Step::Update(_) => self.updated.push(key),
            Step::Delete(_) => self.deleted.push(key),
        }
    }
}

/// One unit of commit I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Add(ObjectId),
    Update(ObjectId),
    Delete(ObjectId),
}

#[derive(Debug, Default)]
pub(crate) struct Tracking {
    pub root: Option<ObjectId>,
    pub states: HashMap<ObjectId, ChangeState>,
    pub logs: HashMap<ObjectId, ChangeLog>,
    pub owners: OwnerTable,
    /// Instances with a mutation somewhere below them.
    pub touched: HashSet<ObjectId>,
    /// Store notifications, present while a root is open.
    pub subscription: Option<Subscription>,
}

impl Tracking {
    pub fn state(&self, id: ObjectId) -> ChangeState {
        self.states.get(&id).copied().unwrap_or_default()
    }

    pub fn is_attached(&self, id: ObjectId) -> bool {
        self.states.contains_key(&id)
    }

    /// Attach `start` and everything reachable from it that is not attached
    /// yet. Returns the newly attached ids.
    pub fn attach(
        &mut self,
        store: &ObjectStore,
        session: SessionId,
        start: ObjectId,
        owner: Option<(ObjectId, &'static str)>,
    ) -> Result<Vec<ObjectId>> {
        let mut pending = vec![(start, owner)];
        let mut attached = Vec::new();

        while let Some((id, owner)) = pending.pop() {
            if let Some((owner, property)) = owner {
                self.owners.link(id, owner, property);
            }
            if self.is_attached(id) {
                continue;
            }

            let children = store.children(id)?;
            store.claim(session, id)?;
            let state = if store.is_persisted(id) {
                ChangeState::Unchanged
            } else {
                ChangeState::New
            };
            self.states.insert(id, state);
            attached.push(id);
            tracing::debug!(%session, %id, %state, "attached instance");

            for (property, child) in children.into_iter().rev() {
                pending.push((child, Some((id, property))));
            }
        }

        Ok(attached)
    }

    /// Fold one completed mutation into the tracking state.
    pub fn absorb(
        &mut self,
        store: &ObjectStore,
        session: SessionId,
        mutation: &Mutation,
    ) -> Result<()> {
        let id = mutation.id();
        let state = self.state(id);
        if !state.is_attached() {
            return Ok(());
        }

        if matches!(state, ChangeState::Unchanged | ChangeState::Changed) {
            let log = self.logs.entry(id).or_default();
            match &mutation.kind {
                MutationKind::Set { old, new } => {
                    log.record(mutation.property, old.clone(), new.clone())
                }
                MutationKind::Edit(edit) => log.record_edit(mutation.property, edit.clone()),
            }
            if log.has_changes() {
                self.states.insert(id, ChangeState::Changed);
            }
        }

        for child in mutation.outgoing() {
            self.owners.unlink(child, id, mutation.property);
        }
        self.touched.extend(self.owners.transitive_owners(id));

        for child in mutation.incoming() {
            self.attach(store, session, child, Some((id, mutation.property)))?;
        }

        tracing::trace!(%session, %id, property = mutation.property, "absorbed mutation");
        Ok(())
    }

    /// Attached instances reachable from `start`, children before parents.
    /// `avoid` is never entered.
    pub fn post_order(
        &self,
        store: &ObjectStore,
        start: ObjectId,
        avoid: Option<ObjectId>,
    ) -> Result<Vec<ObjectId>> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = vec![(start, false)];

        while let Some((id, expanded)) = pending.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if Some(id) == avoid || !self.is_attached(id) || !visited.insert(id) {
                continue;
            }

            pending.push((id, true));
            for (_, child) in store.children(id)?.into_iter().rev() {
                if !visited.contains(&child) {
                    pending.push((child, false));
                }
            }
        }

        Ok(order)
    }

    /// Commit I/O for every attached instance. Writes come children first,
    /// deletions last.
    pub fn plan(&self, store: &ObjectStore) -> Result<Vec<Step>> {
        let root = self.root.ok_or(StoreError::NoTransaction)?;

        let mut order = self.post_order(store, root, None)?;
        let reached: HashSet<ObjectId> = order.iter().copied().collect();
        let mut unreached: Vec<ObjectId> = self
            .states
            .keys()
            .filter(|id| !reached.contains(id))
            .copied()
            .collect();
        unreached.sort();

        for id in unreached {
            if self.state(id) == ChangeState::New {
                tracing::debug!(%id, "abandoning unreachable new instance");
            } else {
                order.push(id);
            }
        }

        let mut writes = Vec::new();
        let mut deletes = Vec::new();
        for id in order {
            let dirty = self.logs.get(&id).map_or(false, |log| !log.is_empty());
            match self.state(id) {
                ChangeState::New => writes.push(Step::Add(id)),
                ChangeState::Deleted => deletes.push(Step::Delete(id)),
                ChangeState::Changed => writes.push(Self::write_step(store, id)?),
                ChangeState::Unchanged if dirty => writes.push(Self::write_step(store, id)?),
                ChangeState::Unchanged | ChangeState::Unattached => {}
            }
        }

        writes.extend(deletes);
        Ok(writes)
    }

    fn write_step(store: &ObjectStore, id: ObjectId) -> Result<Step> {
        let key = store.key_of(id)?;
        if store.registry().entry(key.tag)?.updatable() {
            Ok(Step::Update(id))
        } else {
            Ok(Step::Add(id))
        }
    }

    /// Record that `step` reached the store.
    pub fn settle(&mut self, step: Step) {
        match step {
            Step::Add(id) | Step::Update(id) => {
                self.states.insert(id, ChangeState::Unchanged);
                self.logs.remove(&id);
            }
            Step::Delete(id) => {
                self.states.remove(&id);
                self.logs.remove(&id);
                self.owners.forget(id);
                self.touched.remove(&id);
            }
        }
    }

    /// Stop tracking `ids`.
    pub fn forget(&mut self, ids: &[ObjectId]) {
        for id in ids {
            self.states.remove(id);
            self.logs.remove(id);
            self.owners.forget(*id);
            self.touched.remove(id);
        }
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.states.clear();
        self.logs.clear();
        self.owners.clear();
        self.touched.clear();
    }
}
