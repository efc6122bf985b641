//! Tracking sessions (units of work).
//!
//! A session attaches the graph reachable from a root instance, watches the
//! store's notification stream for mutations of attached instances, and on
//! commit writes exactly the records that need writing. Rollback restores
//! every tracked property to its value at attach time.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(ObjectStore::open_or_create(config, registry)?);
//! let root = store.insert(city)?;
//!
//! let session = store.session();
//! session.start(root)?;
//! store.set(root, "name", Value::from("Bergen"))?;
//! let report = session.commit()?;
//! ```

mod owners;
mod unit;

pub use unit::CommitReport;

use crate::changes::{ChangeLog, ChangeState, EditOp};
use crate::error::{Result, StoreError};
use crate::journal::JournalOp;
use crate::notify::{Notification, SubscriptionConfig};
use crate::store::{CommitMode, ObjectStore};
use crate::types::{ObjectId, PropertyKind, PropertyValue, SessionId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::Arc;
use unit::{Step, Tracking};

/// Unit of work over an [`ObjectStore`].
///
/// Mutations made through the store are picked up the next time any session
/// method runs. Only one session per store may have an open root.
pub struct Session {
    id: SessionId,
    store: Arc<ObjectStore>,
    inner: Mutex<Tracking>,
}

impl Session {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            id: store.next_session_id(),
            store,
            inner: Mutex::new(Tracking::default()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Attach the graph reachable from `root` and open the session.
    pub fn start(&self, root: ObjectId) -> Result<()> {
        let mut tracking = self.lock()?;
        if tracking.root.is_some() {
            return Err(StoreError::TransactionAlreadyRunning);
        }

        self.store.open_session(self.id, root)?;
        tracking.subscription = Some(self.store.subscribe(SubscriptionConfig::unbounded()));
        tracking.root = Some(root);

        match tracking.attach(&self.store, self.id, root, None) {
            Ok(attached) => {
                tracing::info!(
                    session = %self.id,
                    %root,
                    attached = attached.len(),
                    "session started"
                );
                Ok(())
            }
            Err(e) => {
                self.close_locked(&mut tracking);
                Err(e)
            }
        }
    }

    /// Persist every new, changed and deleted instance, then close.
    ///
    /// In direct mode a failure part way leaves the session open. Steps
    /// that already reached the store are settled; calling `commit` again
    /// retries the rest.
    pub fn commit(&self) -> Result<CommitReport> {
        let mut tracking = self.lock()?;
        let steps = tracking.plan(&self.store)?;

        let mut report = CommitReport::default();
        match self.store.commit_mode() {
            CommitMode::Direct => {
                for step in steps {
                    let key = match step {
                        Step::Add(id) => self.store.add(id)?,
                        Step::Update(id) => self.store.update(id)?,
                        Step::Delete(id) => {
                            let key = self.store.key_of(id)?;
                            self.store.delete_key(key)?;
                            key
                        }
                    };
                    report.note(step, key);
                    tracking.settle(step);
                }
            }
            CommitMode::Journaled => {
                let mut batch = Vec::with_capacity(steps.len());
                let mut keys = Vec::with_capacity(steps.len());
                for step in &steps {
                    let op = match *step {
                        Step::Add(id) | Step::Update(id) => JournalOp::Put(self.store.capture(id)?),
                        Step::Delete(id) => JournalOp::Remove(self.store.key_of(id)?),
                    };
                    keys.push(op.key());
                    batch.push(op);
                }

                self.store.commit_batch(batch)?;
                for (step, key) in steps.into_iter().zip(keys) {
                    report.note(step, key);
                    tracking.settle(step);
                }
            }
        }

        tracing::info!(
            session = %self.id,
            added = report.added.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            "session committed"
        );
        self.close_locked(&mut tracking);
        Ok(report)
    }

    /// Restore every tracked property to its value at attach time, then
    /// close. New instances stay in the identity cache unpersisted.
    pub fn rollback(&self) -> Result<()> {
        let mut tracking = self.lock()?;
        let root = tracking.root.ok_or(StoreError::NoTransaction)?;

        let mut order = tracking.post_order(&self.store, root, None)?;
        let reached: HashSet<ObjectId> = order.iter().copied().collect();
        let mut rest: Vec<ObjectId> = tracking
            .logs
            .keys()
            .filter(|id| !reached.contains(id))
            .copied()
            .collect();
        rest.sort();
        order.extend(rest);

        let mut reverted = 0;
        for id in order {
            if let Some(log) = tracking.logs.get(&id) {
                self.revert(id, log)?;
                reverted += 1;
            }
        }

        tracing::info!(session = %self.id, reverted, "session rolled back");
        self.close_locked(&mut tracking);
        Ok(())
    }

    /// Undo association edits back to front, then restore the other
    /// properties. None of this is announced.
    fn revert(&self, id: ObjectId, log: &ChangeLog) -> Result<()> {
        for edit in log.edits().iter().rev() {
            match &edit.op {
                EditOp::List(list_edit) => {
                    self.store
                        .restore_edit(id, edit.property, &list_edit.inverse())?
                }
                EditOp::Replace { old, .. } => self.store.restore_value(
                    id,
                    edit.property,
                    PropertyValue::Association(old.clone()),
                )?,
            }
        }

        for (property, change) in log.changes() {
            if change.old.kind() != PropertyKind::Association {
                self.store.restore_value(id, property, change.old.clone())?;
            }
        }

        tracing::debug!(%id, "reverted instance");
        Ok(())
    }

    /// Stop tracking `id` and everything reachable from it that the root
    /// does not reach some other way.
    pub fn detach(&self, id: ObjectId) -> Result<()> {
        let mut tracking = self.lock()?;
        if !tracking.is_attached(id) {
            return Err(StoreError::NotAttached(id));
        }
        if tracking.root == Some(id) {
            return Err(StoreError::InvalidOperation(
                "the root of an open session cannot be detached".into(),
            ));
        }

        let below = tracking.post_order(&self.store, id, None)?;
        let kept: HashSet<ObjectId> = match tracking.root {
            Some(root) => tracking
                .post_order(&self.store, root, Some(id))?
                .into_iter()
                .collect(),
            None => HashSet::new(),
        };
        let detached: Vec<ObjectId> = below.into_iter().filter(|x| !kept.contains(x)).collect();

        tracking.forget(&detached);
        for detached_id in &detached {
            self.store.release(self.id, *detached_id);
        }

        tracing::debug!(session = %self.id, %id, detached = detached.len(), "detached subgraph");
        Ok(())
    }

    /// Mark an attached instance for removal on commit.
    ///
    /// Fails with `InvalidOperation` while another attached instance still
    /// points at it; clear those references first, or delete the owners.
    pub fn delete(&self, id: ObjectId) -> Result<()> {
        let mut tracking = self.lock()?;
        if !tracking.is_attached(id) {
            return Err(StoreError::NotAttached(id));
        }

        let holder = tracking
            .owners
            .owners_of(id)
            .iter()
            .find(|(owner, _)| *owner != id && tracking.state(*owner) != ChangeState::Deleted);
        if let Some((owner, property)) = holder {
            return Err(StoreError::InvalidOperation(format!(
                "{id} is still referenced by {owner} through {property}"
            )));
        }

        tracking.states.insert(id, ChangeState::Deleted);
        tracing::debug!(session = %self.id, %id, "marked instance deleted");
        Ok(())
    }

    /// Detach everything without writing.
    pub fn close(&self) {
        let mut tracking = self.synced();
        self.close_locked(&mut tracking);
    }

    // --- Queries ---

    pub fn is_open(&self) -> bool {
        self.inner.lock().root.is_some()
    }

    pub fn root(&self) -> Option<ObjectId> {
        self.inner.lock().root
    }

    pub fn is_attached(&self, id: ObjectId) -> bool {
        self.synced().is_attached(id)
    }

    /// Every attached id, sorted.
    pub fn attached(&self) -> Vec<ObjectId> {
        let tracking = self.synced();
        let mut ids: Vec<ObjectId> = tracking.states.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn state(&self, id: ObjectId) -> ChangeState {
        self.synced().state(id)
    }

    /// Whether the instance's own row is dirty.
    pub fn has_changes(&self, id: ObjectId) -> bool {
        self.synced()
            .logs
            .get(&id)
            .map_or(false, ChangeLog::has_changes)
    }

    /// Snapshot of the change log.
    pub fn changes(&self, id: ObjectId) -> Option<ChangeLog> {
        self.synced().logs.get(&id).cloned()
    }

    /// Attached targets of the reference properties of `id`.
    pub fn references(&self, id: ObjectId) -> Result<Vec<(&'static str, ObjectId)>> {
        let tracking = self.lock()?;
        let descriptor = self.store.descriptor(id)?;

        let mut references = Vec::new();
        for property in descriptor.of_kind(PropertyKind::Reference) {
            if let PropertyValue::Reference(Some(target)) = self.store.value(id, property.name())? {
                if tracking.is_attached(target) {
                    references.push((property.name(), target));
                }
            }
        }
        Ok(references)
    }

    /// Attached items of the association properties of `id`.
    pub fn associations(&self, id: ObjectId) -> Result<Vec<(&'static str, Vec<ObjectId>)>> {
        let tracking = self.lock()?;
        let descriptor = self.store.descriptor(id)?;

        let mut associations = Vec::new();
        for property in descriptor.of_kind(PropertyKind::Association) {
            if let PropertyValue::Association(items) = self.store.value(id, property.name())? {
                let items = items
                    .into_iter()
                    .filter(|item| tracking.is_attached(*item))
                    .collect();
                associations.push((property.name(), items));
            }
        }
        Ok(associations)
    }

    /// Items added to `property` of `id` since attach.
    pub fn inserted_items(&self, id: ObjectId, property: &str) -> Vec<ObjectId> {
        self.synced()
            .logs
            .get(&id)
            .map(|log| log.inserted_items(property))
            .unwrap_or_default()
    }

    /// Items removed from `property` of `id` since attach.
    pub fn removed_items(&self, id: ObjectId, property: &str) -> Vec<ObjectId> {
        self.synced()
            .logs
            .get(&id)
            .map(|log| log.removed_items(property))
            .unwrap_or_default()
    }

    /// Whether something reachable from `id` was mutated.
    pub fn subgraph_changed(&self, id: ObjectId) -> bool {
        self.synced().touched.contains(&id)
    }

    // --- Internals ---

    /// Lock the tracking state after folding in pending notifications.
    fn lock(&self) -> Result<MutexGuard<'_, Tracking>> {
        let mut tracking = self.inner.lock();
        self.pump(&mut tracking)?;
        Ok(tracking)
    }

    /// Like [`lock`](Self::lock) for callers that cannot report errors.
    fn synced(&self) -> MutexGuard<'_, Tracking> {
        let mut tracking = self.inner.lock();
        if let Err(e) = self.pump(&mut tracking) {
            tracing::warn!(session = %self.id, error = %e, "failed to absorb notifications");
        }
        tracking
    }

    /// Absorb every queued notification. All of them are consumed even if
    /// one fails; the first error is returned.
    fn pump(&self, tracking: &mut Tracking) -> Result<()> {
        let Some(subscription) = &tracking.subscription else {
            return Ok(());
        };
        let notifications = subscription.drain();
        let mut first_error = None;

        for notification in notifications {
            match notification {
                Notification::Changed(mutation) => {
                    if let Err(e) = tracking.absorb(&self.store, self.id, &mutation) {
                        first_error.get_or_insert(e);
                    }
                }
                Notification::Dropped { reason } => {
                    tracing::warn!(session = %self.id, ?reason, "notification stream dropped");
                }
                Notification::Changing { .. } => {}
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close_locked(&self, tracking: &mut Tracking) {
        let attached = tracking.states.len();
        tracking.clear();
        if let Some(subscription) = tracking.subscription.take() {
            self.store.unsubscribe(subscription.id);
        }
        self.store.close_session(self.id);
        tracing::debug!(session = %self.id, attached, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut tracking = self.inner.lock();
        if tracking.root.is_some() {
            tracing::warn!(session = %self.id, "session dropped while open, discarding changes");
        }
        self.close_locked(&mut tracking);
    }
}
