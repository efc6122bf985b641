//! Object store tying the record files, identity cache and notifications
//! together.

use crate::cache::{IdentityCache, Slot};
use crate::catalog::{Catalog, TypeDescriptor};
use crate::error::{Result, StoreError};
use crate::journal::{CommitJournal, JournalOp};
use crate::notify::{NotificationHub, Subscription, SubscriptionConfig, SubscriptionId};
use crate::records::{RecordFiles, StoredRecord};
use crate::registry::TypeRegistry;
use crate::session::Session;
use crate::tracked::{Entity, ListEdit, Mutation, MutationKind, Trackable};
use crate::types::{
    Digest, ObjectId, ObjectKey, PropertyValue, SessionId, StoreStats, TypeTag, Value,
};
use crate::wire;
use fs2::FileExt;
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use serde_json::json;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// How a session's commit reaches the record files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitMode {
    /// One write per record. A failure part way leaves earlier writes in place.
    #[default]
    Direct,
    /// The whole batch is logged to the commit journal first and replayed on
    /// reopen if the process dies before it is applied.
    Journaled,
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Decoded records kept in memory by the record file layer.
    pub record_cache_size: usize,

    pub commit_mode: CommitMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            create_if_missing: true,
            record_cache_size: 1000,
            commit_mode: CommitMode::Direct,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"UOW\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const JOURNAL_FILE: &str = "commit.journal";

#[derive(Default)]
struct Counters {
    loads: AtomicU64,
    adds: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    skipped_writes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Which session is open and which instances it has attached.
#[derive(Default)]
struct SessionGate {
    open: Option<SessionId>,
    claims: HashMap<ObjectId, SessionId>,
}

/// Identity-cached, reference-resolving store of tracked instances.
///
/// Every live instance sits in the identity cache exactly once. Reads hand
/// out guards into the cache; mutations go through [`set`](Self::set),
/// [`modify`](Self::modify) and the list operations so that every change is
/// announced to the notification hub.
pub struct ObjectStore {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    registry: TypeRegistry,
    catalog: Catalog,
    files: RecordFiles,
    cache: RwLock<IdentityCache>,

    /// Present in journaled mode only.
    journal: Option<CommitJournal>,

    hub: NotificationHub,
    gate: Mutex<SessionGate>,
    next_session: AtomicU64,

    /// Set once `get_all` has scanned every record file.
    scanned: AtomicBool,

    counters: Counters,
}

impl ObjectStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig, registry: TypeRegistry) -> Result<Self> {
        if config.path.exists() {
            Self::open(config, registry)
        } else if config.create_if_missing {
            Self::create(config, registry)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig, registry: TypeRegistry) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        fs::create_dir_all(config.path.join("records"))?;

        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        Self::assemble(config, registry, lock_file)
    }

    /// Open an existing store, replaying any interrupted journaled commit.
    pub fn open(config: StoreConfig, registry: TypeRegistry) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        Self::assemble(config, registry, lock_file)
    }

    fn assemble(config: StoreConfig, registry: TypeRegistry, lock_file: File) -> Result<Self> {
        let files = RecordFiles::new(config.path.join("records"), config.record_cache_size)?;

        let journal_path = config.path.join(JOURNAL_FILE);
        let journal = if config.commit_mode == CommitMode::Journaled || journal_path.exists() {
            let journal = CommitJournal::open(&journal_path)?;
            Self::recover(&files, &journal)?;
            Some(journal)
        } else {
            None
        };
        let journal = journal.filter(|_| config.commit_mode == CommitMode::Journaled);

        tracing::info!(
            path = %config.path.display(),
            mode = ?config.commit_mode,
            types = registry.len(),
            "opened object store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            registry,
            catalog: Catalog::new(),
            files,
            cache: RwLock::new(IdentityCache::new()),
            journal,
            hub: NotificationHub::new(),
            gate: Mutex::new(SessionGate::default()),
            next_session: AtomicU64::new(1),
            scanned: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// Apply journal batches that never got their commit marker.
    fn recover(files: &RecordFiles, journal: &CommitJournal) -> Result<()> {
        let pending = journal.pending()?;
        if pending.is_empty() {
            return journal.clear();
        }

        tracing::warn!(batches = pending.len(), "replaying interrupted commits");
        for entry in &pending {
            for op in &entry.batch {
                match op {
                    JournalOp::Put(record) => {
                        files.write(record, None)?;
                    }
                    JournalOp::Remove(key) => {
                        files.remove(*key)?;
                    }
                }
            }
            journal.commit(entry.seq)?;
        }
        journal.clear()?;
        tracing::info!(batches = pending.len(), "journal recovery complete");

        Ok(())
    }

    /// Start a new tracking session against this store.
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // --- Notifications ---

    pub fn subscribe(&self, config: SubscriptionConfig) -> Subscription {
        self.hub.subscribe(config)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.hub.unsubscribe(id);
    }

    /// Live subscriptions, open sessions included.
    pub fn subscription_count(&self) -> usize {
        self.hub.subscription_count()
    }

    // --- Identity Cache ---

    /// Admit a new in-memory instance. Fails with `DuplicateInstance` if an
    /// instance with the same id is already live.
    pub fn insert<T: Entity>(&self, entity: T) -> Result<ObjectId> {
        let tag = self.registry.tag_of::<T>()?;
        let id = entity.id();
        let persisted = self.files.exists(ObjectKey::new(tag, id));

        self.cache.write().insert(Slot {
            tag,
            instance: Box::new(entity),
            persisted,
            digest: None,
        })?;

        tracing::debug!(%id, type_name = T::TYPE_NAME, persisted, "inserted instance");
        Ok(id)
    }

    /// The live instance for `id`, loading it and everything it references
    /// on first access.
    ///
    /// The guard holds a read lock on the identity cache; drop it before
    /// calling back into the store.
    pub fn get<T: Entity>(&self, id: ObjectId) -> Result<MappedRwLockReadGuard<'_, T>> {
        let tag = self.registry.tag_of::<T>()?;
        self.load(ObjectKey::new(tag, id))?;

        let cache = self.cache.read();
        RwLockReadGuard::try_map(cache, |cache| {
            cache
                .get(id)
                .and_then(|slot| slot.instance.as_any().downcast_ref::<T>())
        })
        .map_err(|_| StoreError::NotFound {
            type_name: T::TYPE_NAME.to_string(),
            id,
        })
    }

    /// Run `f` against the live instance for `id`.
    pub fn read<T: Entity, R>(&self, id: ObjectId, f: impl FnOnce(&T) -> R) -> Result<R> {
        let instance = self.get::<T>(id)?;
        Ok(f(&instance))
    }

    /// Ids of every persisted instance of `T`.
    ///
    /// The first call scans every record file and loads it into the identity
    /// cache. The result is a snapshot.
    pub fn get_all<T: Entity>(&self) -> Result<Vec<ObjectId>> {
        let tag = self.registry.tag_of::<T>()?;

        if !self.scanned.load(Ordering::Acquire) {
            let keys = self.files.list()?;
            for key in &keys {
                if self.registry.contains(key.tag) {
                    self.load(*key)?;
                } else {
                    tracing::warn!(%key, "skipping record of unregistered type");
                }
            }
            self.scanned.store(true, Ordering::Release);
            tracing::debug!(records = keys.len(), "scanned record files");
        }

        let cache = self.cache.read();
        Ok(cache
            .iter()
            .filter(|slot| slot.tag == tag && slot.persisted)
            .map(|slot| slot.instance.object_id())
            .collect())
    }

    /// Whether `id` is live in the identity cache.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.cache.read().contains(id)
    }

    /// Whether a record exists on disk for the live instance `id`.
    pub fn is_persisted(&self, id: ObjectId) -> bool {
        self.cache.read().get(id).map_or(false, |slot| slot.persisted)
    }

    pub fn key_of(&self, id: ObjectId) -> Result<ObjectKey> {
        Ok(self.cache.read().require(id)?.key())
    }

    /// Descriptor table for the live instance `id`.
    pub fn descriptor(&self, id: ObjectId) -> Result<Arc<TypeDescriptor>> {
        let cache = self.cache.read();
        let slot = cache.require(id)?;
        Ok(self.catalog.describe_object(slot.instance.as_ref()))
    }

    /// Current value of one tracked property.
    pub fn value(&self, id: ObjectId, property: &str) -> Result<PropertyValue> {
        let cache = self.cache.read();
        let slot = cache.require(id)?;
        let descriptor = self.catalog.describe_object(slot.instance.as_ref());
        descriptor.require(property)?.get(slot.instance.as_ref())
    }

    /// Tracked instances directly reachable from `id`.
    pub fn children(&self, id: ObjectId) -> Result<Vec<(&'static str, ObjectId)>> {
        let cache = self.cache.read();
        let slot = cache.require(id)?;
        let descriptor = self.catalog.describe_object(slot.instance.as_ref());
        descriptor.children(slot.instance.as_ref())
    }

    /// Materialize `key` and everything it reaches, unless already live.
    ///
    /// Each instance enters the cache before its edges are followed, which
    /// is what makes cyclic record graphs terminate. On failure every
    /// instance admitted by this call is evicted again.
    fn load(&self, key: ObjectKey) -> Result<()> {
        if self.cache.read().contains(key.id) {
            return Ok(());
        }

        let mut cache = self.cache.write();
        if cache.contains(key.id) {
            return Ok(());
        }

        let mut pending = vec![key];
        let mut admitted = Vec::new();
        while let Some(next) = pending.pop() {
            if cache.contains(next.id) {
                continue;
            }
            match self.materialize(&mut cache, next) {
                Ok(edges) => {
                    admitted.push(next.id);
                    pending.extend(edges);
                }
                Err(e) => {
                    for id in admitted {
                        cache.remove(id);
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!(%key, loaded = admitted.len(), "loaded record graph");
        Ok(())
    }

    /// Read one record into the cache and return the edges still to load.
    fn materialize(&self, cache: &mut IdentityCache, key: ObjectKey) -> Result<Vec<ObjectKey>> {
        let loaded = self
            .files
            .read(key)?
            .ok_or_else(|| self.not_found(key))?;

        let entry = self.registry.entry(key.tag)?;
        let mut instance = entry.instantiate(key.id);
        let descriptor = self.catalog.describe_object(instance.as_ref());

        loaded.record.restore(&descriptor, instance.as_mut())?;

        let mut edges = Vec::new();
        for edge in loaded.record.edges() {
            if cache.contains(edge.id) {
                continue;
            }
            if !self.files.exists(edge.key()) {
                tracing::warn!(record = %key, target = %edge.key(), "referenced record is missing");
                return Err(self.not_found(edge.key()));
            }
            edges.push(edge.key());
        }

        cache.insert(Slot {
            tag: key.tag,
            instance,
            persisted: true,
            digest: Some(loaded.digest),
        })?;
        Counters::bump(&self.counters.loads);

        Ok(edges)
    }

    // --- Mutation ---

    /// Assign a tracked property.
    ///
    /// Announces `Changing` before and `Changed` after the write. Assigning
    /// the current value is a no-op. Every instance the new value points at
    /// must already be live.
    pub fn set(&self, id: ObjectId, property: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let value = value.into();
        let mut cache = self.cache.write();
        Self::require_live(&cache, &value.children())?;

        let slot = cache.require_mut(id)?;
        let key = slot.key();
        let descriptor = self.catalog.describe_object(slot.instance.as_ref());
        let descriptor_entry = descriptor.require(property)?;
        if descriptor_entry.kind() != value.kind() {
            return Err(StoreError::InvalidDescriptorUse {
                property: descriptor_entry.name(),
                expected: value.kind(),
                actual: descriptor_entry.kind(),
            });
        }

        let old = descriptor_entry.get(slot.instance.as_ref())?;
        if old == value {
            return Ok(());
        }

        self.hub.changing(key, descriptor_entry.name());
        descriptor_entry.set(slot.instance.as_mut(), value.clone())?;
        drop(cache);

        self.hub.changed(Mutation {
            key,
            property: descriptor_entry.name(),
            kind: MutationKind::Set { old, new: value },
        });
        Ok(())
    }

    /// Mutate an instance through its concrete type.
    ///
    /// Every tracked property is compared before and after `f`; each one that
    /// differs is announced as a separate mutation once `f` returns. If the
    /// new values point at an instance that is not live, all changes are
    /// reverted and the call fails. `f` must not change the instance's id.
    pub fn modify<T: Entity, R>(&self, id: ObjectId, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let descriptor = self.catalog.describe::<T>();
        let not_found = || StoreError::NotFound {
            type_name: T::TYPE_NAME.to_string(),
            id,
        };

        let mut cache = self.cache.write();
        let slot = cache.get_mut(id).ok_or_else(not_found)?;
        let key = slot.key();
        let instance = slot
            .instance
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(not_found)?;

        let before = Self::snapshot(&descriptor, &*instance)?;
        let result = f(instance);
        let after = Self::snapshot(&descriptor, &*instance)?;

        let changed: Vec<usize> = (0..before.len()).filter(|&i| before[i] != after[i]).collect();
        let incoming: Vec<ObjectId> = changed.iter().flat_map(|&i| after[i].children()).collect();

        if let Err(e) = Self::require_live(&cache, &incoming) {
            let slot = cache.require_mut(id)?;
            for &i in &changed {
                descriptor.properties()[i].set(slot.instance.as_mut(), before[i].clone())?;
            }
            return Err(e);
        }
        drop(cache);

        for i in changed {
            let property = descriptor.properties()[i].name();
            self.hub.changing(key, property);
            self.hub.changed(Mutation {
                key,
                property,
                kind: MutationKind::Set {
                    old: before[i].clone(),
                    new: after[i].clone(),
                },
            });
        }

        Ok(result)
    }

    /// Insert `item` into an association at `index`.
    pub fn insert_item(
        &self,
        id: ObjectId,
        property: &str,
        index: usize,
        item: ObjectId,
    ) -> Result<()> {
        self.edit_list(id, property, |_, _| Ok(ListEdit::Insert { index, item }))?;
        Ok(())
    }

    /// Append `item` to an association.
    pub fn push_item(&self, id: ObjectId, property: &str, item: ObjectId) -> Result<()> {
        self.edit_list(id, property, |_, list| {
            Ok(ListEdit::Insert {
                index: list.len(),
                item,
            })
        })?;
        Ok(())
    }

    /// Remove the item at `index` from an association and return it.
    pub fn remove_item(&self, id: ObjectId, property: &str, index: usize) -> Result<ObjectId> {
        let edit = self.edit_list(id, property, |name, list| {
            let item = *list.get(index).ok_or(StoreError::IndexOutOfBounds {
                property: name,
                index,
                len: list.len(),
            })?;
            Ok(ListEdit::Remove { index, item })
        })?;

        match edit {
            ListEdit::Remove { item, .. } => Ok(item),
            other => Err(StoreError::InvalidOperation(format!(
                "expected a removal, got {other:?}"
            ))),
        }
    }

    /// Move the item at `from` so that it ends up at `to`.
    pub fn move_item(&self, id: ObjectId, property: &str, from: usize, to: usize) -> Result<()> {
        self.edit_list(id, property, |_, _| Ok(ListEdit::Move { from, to }))?;
        Ok(())
    }

    fn edit_list(
        &self,
        id: ObjectId,
        property: &str,
        build: impl FnOnce(&'static str, &[ObjectId]) -> Result<ListEdit>,
    ) -> Result<ListEdit> {
        let mut cache = self.cache.write();
        let slot = cache.require(id)?;
        let key = slot.key();
        let descriptor = self.catalog.describe_object(slot.instance.as_ref());
        let descriptor_entry = descriptor.require(property)?;
        let name = descriptor_entry.name();

        let list = descriptor_entry.association_value(slot.instance.as_ref())?;
        let edit = build(name, list)?;
        edit.check(name, list)?;
        if matches!(edit, ListEdit::Move { from, to } if from == to) {
            return Ok(edit);
        }
        if let Some(item) = edit.inserted() {
            Self::require_live(&cache, &[item])?;
        }

        self.hub.changing(key, name);
        let slot = cache.require_mut(id)?;
        edit.apply(name, descriptor_entry.association_mut(slot.instance.as_mut())?)?;
        drop(cache);

        self.hub.changed(Mutation {
            key,
            property: name,
            kind: MutationKind::Edit(edit.clone()),
        });
        Ok(edit)
    }

    /// Overwrite a property without announcing it.
    pub(crate) fn restore_value(
        &self,
        id: ObjectId,
        property: &str,
        value: PropertyValue,
    ) -> Result<()> {
        let mut cache = self.cache.write();
        let slot = cache.require_mut(id)?;
        let descriptor = self.catalog.describe_object(slot.instance.as_ref());
        descriptor.require(property)?.set(slot.instance.as_mut(), value)
    }

    /// Apply a list edit without announcing it.
    pub(crate) fn restore_edit(&self, id: ObjectId, property: &str, edit: &ListEdit) -> Result<()> {
        let mut cache = self.cache.write();
        let slot = cache.require_mut(id)?;
        let descriptor = self.catalog.describe_object(slot.instance.as_ref());
        let descriptor_entry = descriptor.require(property)?;
        edit.apply(
            descriptor_entry.name(),
            descriptor_entry.association_mut(slot.instance.as_mut())?,
        )
    }

    // --- Records ---

    /// Flatten the live instance `id` into a record.
    pub fn capture(&self, id: ObjectId) -> Result<StoredRecord> {
        let cache = self.cache.read();
        self.capture_in(&cache, id)
    }

    /// Write a record for `id`, replacing any existing one.
    pub fn add(&self, id: ObjectId) -> Result<ObjectKey> {
        let mut cache = self.cache.write();
        let record = self.capture_in(&cache, id)?;
        let outcome = self.files.write(&record, None)?;
        Self::settle(&mut cache, id, outcome.digest)?;

        Counters::bump(&self.counters.adds);
        tracing::debug!(key = %record.key(), "added record");
        Ok(record.key())
    }

    /// Rewrite the record for `id`. Skips the write when nothing changed
    /// since the record was last written or loaded. Fails for types that are
    /// not updatable.
    pub fn update(&self, id: ObjectId) -> Result<ObjectKey> {
        let mut cache = self.cache.write();
        let slot = cache.require(id)?;
        let entry = self.registry.entry(slot.tag)?;
        if !entry.updatable() {
            return Err(StoreError::InvalidOperation(format!(
                "{} is not updatable",
                entry.type_name()
            )));
        }
        let previous = slot.digest;

        let record = self.capture_in(&cache, id)?;
        let outcome = self.files.write(&record, previous)?;
        Self::settle(&mut cache, id, outcome.digest)?;

        if outcome.written {
            Counters::bump(&self.counters.updates);
            tracing::debug!(key = %record.key(), "updated record");
        } else {
            Counters::bump(&self.counters.skipped_writes);
            tracing::trace!(key = %record.key(), "record unchanged, write skipped");
        }
        Ok(record.key())
    }

    /// Remove the record of `T` with `id` and evict the live instance.
    /// Returns whether a record existed.
    pub fn delete<T: Entity>(&self, id: ObjectId) -> Result<bool> {
        let tag = self.registry.tag_of::<T>()?;
        self.delete_key(ObjectKey::new(tag, id))
    }

    /// Remove the record at `key` and evict the live instance.
    pub fn delete_key(&self, key: ObjectKey) -> Result<bool> {
        let mut cache = self.cache.write();
        let existed = self.files.remove(key)?;
        if cache.get(key.id).map_or(false, |slot| slot.tag == key.tag) {
            cache.remove(key.id);
        }

        Counters::bump(&self.counters.deletes);
        tracing::debug!(%key, existed, "deleted record");
        Ok(existed)
    }

    /// Apply a whole commit batch through the journal.
    ///
    /// A batch that fails part way is marked abandoned so that a later
    /// reopen never replays it over newer commits. Once a batch is applied
    /// the journal is truncated.
    pub(crate) fn commit_batch(&self, batch: Vec<JournalOp>) -> Result<()> {
        let journal = self
            .journal
            .as_ref()
            .ok_or_else(|| StoreError::InvalidOperation("store is not journaled".into()))?;

        let mut cache = self.cache.write();

        // Anything still pending here is a failed batch whose abandon marker
        // never reached the disk.
        for stale in journal.pending()? {
            tracing::warn!(seq = stale.seq, "abandoning stale journal batch");
            journal.abandon(stale.seq)?;
        }

        let seq = journal.log(batch.clone())?;
        if let Err(e) = self.apply_batch(&mut cache, &batch) {
            tracing::warn!(seq, error = %e, "journaled batch failed, abandoning");
            if let Err(mark) = journal.abandon(seq) {
                tracing::warn!(seq, error = %mark, "failed to mark batch abandoned");
            }
            return Err(e);
        }

        journal.commit(seq)?;
        journal.clear()?;
        tracing::debug!(seq, ops = batch.len(), "journaled batch applied");
        Ok(())
    }

    fn apply_batch(&self, cache: &mut IdentityCache, batch: &[JournalOp]) -> Result<()> {
        for op in batch {
            match op {
                JournalOp::Put(record) => {
                    let (previous, persisted) = cache
                        .get(record.id)
                        .map_or((None, false), |slot| (slot.digest, slot.persisted));
                    let outcome = self.files.write(record, previous)?;
                    Self::settle(cache, record.id, outcome.digest)?;

                    let counter = match (outcome.written, persisted) {
                        (false, _) => &self.counters.skipped_writes,
                        (true, false) => &self.counters.adds,
                        (true, true) => &self.counters.updates,
                    };
                    Counters::bump(counter);
                }
                JournalOp::Remove(key) => {
                    self.files.remove(*key)?;
                    if cache.get(key.id).map_or(false, |slot| slot.tag == key.tag) {
                        cache.remove(key.id);
                    }
                    Counters::bump(&self.counters.deletes);
                }
            }
        }
        Ok(())
    }

    pub fn commit_mode(&self) -> CommitMode {
        self.config.commit_mode
    }

    // --- Sessions ---

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::SeqCst))
    }

    /// Mark `session` as the open session with `root`.
    pub(crate) fn open_session(&self, session: SessionId, root: ObjectId) -> Result<()> {
        let mut gate = self.gate.lock();
        if gate.open == Some(session) {
            return Err(StoreError::TransactionAlreadyRunning);
        }
        if gate.claims.contains_key(&root) {
            return Err(StoreError::AlreadyAttached(root));
        }
        if gate.open.is_some() {
            return Err(StoreError::TransactionAlreadyRunning);
        }
        gate.open = Some(session);
        Ok(())
    }

    /// Record that `session` tracks `id`.
    pub(crate) fn claim(&self, session: SessionId, id: ObjectId) -> Result<()> {
        let mut gate = self.gate.lock();
        match gate.claims.get(&id) {
            Some(owner) if *owner != session => Err(StoreError::AlreadyAttached(id)),
            Some(_) => Ok(()),
            None => {
                gate.claims.insert(id, session);
                Ok(())
            }
        }
    }

    pub(crate) fn release(&self, session: SessionId, id: ObjectId) {
        let mut gate = self.gate.lock();
        if gate.claims.get(&id) == Some(&session) {
            gate.claims.remove(&id);
        }
    }

    /// Drop every claim of `session` and close it if it is the open one.
    pub(crate) fn close_session(&self, session: SessionId) {
        let mut gate = self.gate.lock();
        gate.claims.retain(|_, owner| *owner != session);
        if gate.open == Some(session) {
            gate.open = None;
        }
    }

    /// The session currently holding the store, if any.
    pub fn open_session_id(&self) -> Option<SessionId> {
        self.gate.lock().open
    }

    /// Whether any session tracks `id`.
    pub fn is_attached(&self, id: ObjectId) -> bool {
        self.gate.lock().claims.contains_key(&id)
    }

    // --- Diagnostics ---

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            cached_instances: self.cache.read().len() as u64,
            persisted_records: self.files.list()?.len() as u64,
            loads: self.counters.loads.load(Ordering::Relaxed),
            adds: self.counters.adds.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            skipped_writes: self.counters.skipped_writes.load(Ordering::Relaxed),
        })
    }

    /// JSON view of a live instance.
    pub fn export_json(&self, id: ObjectId) -> Result<serde_json::Value> {
        let cache = self.cache.read();
        let slot = cache.require(id)?;
        let descriptor = self.catalog.describe_object(slot.instance.as_ref());

        let mut fields = serde_json::Map::new();
        let mut references = serde_json::Map::new();
        let mut associations = serde_json::Map::new();
        for property in descriptor.properties() {
            let name = property.name().to_string();
            match property.get(slot.instance.as_ref())? {
                PropertyValue::Plain(value) => {
                    fields.insert(name, value_json(&value));
                }
                PropertyValue::Reference(target) => {
                    let target = target.map_or(serde_json::Value::Null, |t| json!(t.to_string()));
                    references.insert(name, target);
                }
                PropertyValue::Association(items) => {
                    let items: Vec<String> = items.iter().map(ObjectId::to_string).collect();
                    associations.insert(name, json!(items));
                }
            }
        }

        Ok(json!({
            "type": descriptor.type_name(),
            "tag": slot.tag.0,
            "id": id.to_string(),
            "persisted": slot.persisted,
            "fields": fields,
            "references": references,
            "associations": associations,
        }))
    }

    pub fn export_json_pretty(&self, id: ObjectId) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_json(id)?)?)
    }

    /// Broadcast frame for the live instance `id`.
    pub fn frame(&self, id: ObjectId) -> Result<Vec<u8>> {
        wire::encode_record(&self.capture(id)?)
    }

    // --- Private Helpers ---

    fn capture_in(&self, cache: &IdentityCache, id: ObjectId) -> Result<StoredRecord> {
        let slot = cache.require(id)?;
        let descriptor = self.catalog.describe_object(slot.instance.as_ref());
        StoredRecord::capture(slot.key(), &descriptor, slot.instance.as_ref(), |child| {
            cache
                .get(child)
                .map(|s| s.tag)
                .ok_or_else(|| not_live(child))
        })
    }

    fn settle(cache: &mut IdentityCache, id: ObjectId, digest: Digest) -> Result<()> {
        let slot = cache.require_mut(id)?;
        slot.persisted = true;
        slot.digest = Some(digest);
        Ok(())
    }

    fn snapshot(descriptor: &TypeDescriptor, obj: &dyn Trackable) -> Result<Vec<PropertyValue>> {
        descriptor
            .properties()
            .iter()
            .map(|property| property.get(obj))
            .collect()
    }

    fn require_live(cache: &IdentityCache, ids: &[ObjectId]) -> Result<()> {
        match ids.iter().find(|id| !cache.contains(**id)) {
            Some(id) => Err(not_live(*id)),
            None => Ok(()),
        }
    }

    fn not_found(&self, key: ObjectKey) -> StoreError {
        StoreError::NotFound {
            type_name: self
                .registry
                .type_name(key.tag)
                .unwrap_or("unregistered")
                .to_string(),
            id: key.id,
        }
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

fn not_live(id: ObjectId) -> StoreError {
    StoreError::NotFound {
        type_name: "live instance".to_string(),
        id,
    }
}

fn value_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(v) => json!(v),
        Value::Int(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Text(v) => json!(v),
        Value::Bytes(v) => json!(hex::encode(v)),
        Value::Id(v) => json!(v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{registry, Leaf, Node};
    use crate::notify::{Notification, NotificationFilter};
    use crate::types::PropertyKind;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("store"),
            create_if_missing: true,
            record_cache_size: 100,
            commit_mode: CommitMode::Direct,
        }
    }

    fn test_store(dir: &TempDir) -> ObjectStore {
        ObjectStore::create(test_config(dir), registry()).unwrap()
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        assert!(store.path().join("MANIFEST").exists());
        assert!(store.path().join("records").is_dir());
        assert!(!store.path().join(JOURNAL_FILE).exists());
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let _store = ObjectStore::create(config.clone(), registry()).unwrap();

        let result = ObjectStore::open(config, registry());
        assert!(matches!(result, Err(StoreError::Locked)));
    }

    #[test]
    fn test_not_initialized() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        assert!(matches!(
            ObjectStore::open_or_create(config, registry()),
            Err(StoreError::NotInitialized)
        ));
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let leaf = Leaf::new(1);
        store.insert(leaf.clone()).unwrap();
        assert!(matches!(
            store.insert(leaf),
            Err(StoreError::DuplicateInstance(_))
        ));
    }

    #[test]
    fn test_persistence_with_references() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let mut parent = Node::new("parent");
        let child = Node::new("child");
        let leaf = Node::new("leaf");
        parent.next = Some(child.id);
        parent.children = vec![leaf.id, child.id];
        let (parent_id, child_id, leaf_id) = (parent.id, child.id, leaf.id);

        {
            let store = ObjectStore::create(config.clone(), registry()).unwrap();
            store.insert(child).unwrap();
            store.insert(leaf).unwrap();
            store.insert(parent).unwrap();
            store.add(child_id).unwrap();
            store.add(leaf_id).unwrap();
            store.add(parent_id).unwrap();
        }

        let store = ObjectStore::open(config, registry()).unwrap();
        {
            let parent = store.get::<Node>(parent_id).unwrap();
            assert_eq!(parent.label, "parent");
            assert_eq!(parent.next, Some(child_id));
            assert_eq!(parent.children, vec![leaf_id, child_id]);
        }

        // The whole reachable graph came in with the parent.
        assert!(store.contains(child_id));
        assert!(store.contains(leaf_id));
        assert_eq!(store.stats().unwrap().loads, 3);
        assert_eq!(store.read::<Node, _>(child_id, |n| n.label.clone()).unwrap(), "child");
    }

    #[test]
    fn test_cyclic_records_load() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let mut a = Node::new("a");
        let mut b = Node::new("b");
        a.next = Some(b.id);
        b.next = Some(a.id);
        let (a_id, b_id) = (a.id, b.id);

        {
            let store = ObjectStore::create(config.clone(), registry()).unwrap();
            store.insert(a).unwrap();
            store.insert(b).unwrap();
            store.add(a_id).unwrap();
            store.add(b_id).unwrap();
        }

        let store = ObjectStore::open(config, registry()).unwrap();
        assert_eq!(store.get::<Node>(b_id).unwrap().next, Some(a_id));
        assert_eq!(store.get::<Node>(a_id).unwrap().next, Some(b_id));
        assert_eq!(store.stats().unwrap().loads, 2);
    }

    #[test]
    fn test_get_wrong_type_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let id = store.insert(Leaf::new(1)).unwrap();
        assert!(matches!(
            store.get::<Node>(id),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.get::<Leaf>(ObjectId::new()),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_get_all_scans_once() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let ids: Vec<ObjectId> = {
            let store = ObjectStore::create(config.clone(), registry()).unwrap();
            let ids: Vec<_> = (0..3)
                .map(|i| store.insert(Leaf::new(i)).unwrap())
                .collect();
            for id in &ids {
                store.add(*id).unwrap();
            }
            let node = store.insert(Node::new("other")).unwrap();
            store.add(node).unwrap();
            ids
        };

        let store = ObjectStore::open(config, registry()).unwrap();
        let mut found = store.get_all::<Leaf>().unwrap();
        found.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(found, expected);
        assert_eq!(store.get_all::<Node>().unwrap().len(), 1);
        assert_eq!(store.stats().unwrap().loads, 4);
    }

    #[test]
    fn test_set_announces_before_and_after() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let subscription = store.subscribe(SubscriptionConfig {
            filter: NotificationFilter::all(),
            ..Default::default()
        });

        let id = store.insert(Node::new("a")).unwrap();
        store.set(id, "label", Value::from("b")).unwrap();
        store.set(id, "label", Value::from("b")).unwrap();

        let received = subscription.drain();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0], Notification::Changing { property: "label", .. }));
        match &received[1] {
            Notification::Changed(mutation) => {
                assert_eq!(mutation.id(), id);
                assert_eq!(
                    mutation.kind,
                    MutationKind::Set {
                        old: PropertyValue::Plain(Value::from("a")),
                        new: PropertyValue::Plain(Value::from("b")),
                    }
                );
            }
            other => panic!("Expected Changed, got {:?}", other),
        }
    }

    #[test]
    fn test_set_checks_kind_and_targets() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let id = store.insert(Node::new("a")).unwrap();

        let err = store.set(id, "next", Value::Int(1)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidDescriptorUse {
                property: "next",
                expected: PropertyKind::Plain,
                actual: PropertyKind::Reference,
            }
        ));
        assert_eq!(err.to_string(), "Property next is reference, not plain");
        assert!(matches!(
            store.set(id, "missing", Value::Int(1)),
            Err(StoreError::UnknownProperty { .. })
        ));
        assert!(matches!(
            store.set(id, "next", Some(ObjectId::new())),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_modify_announces_each_changed_property() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let id = store.insert(Node::new("a")).unwrap();
        let other = store.insert(Node::new("b")).unwrap();
        let subscription = store.subscribe(SubscriptionConfig::default());

        store
            .modify(id, |n: &mut Node| {
                n.weight = 7;
                n.next = Some(other);
                n.scratch = 3;
            })
            .unwrap();

        let properties: Vec<_> = subscription
            .drain()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Changed(m) => Some(m.property),
                _ => None,
            })
            .collect();
        assert_eq!(properties, vec!["weight", "next"]);
    }

    #[test]
    fn test_modify_reverts_on_unknown_target() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let id = store.insert(Node::new("a")).unwrap();

        let result = store.modify(id, |n: &mut Node| {
            n.weight = 5;
            n.children.push(ObjectId::new());
        });
        assert!(matches!(result, Err(StoreError::NotFound { .. })));

        let node = store.get::<Node>(id).unwrap();
        assert_eq!(node.weight, 0);
        assert!(node.children.is_empty());
    }

    #[test]
    fn test_list_operations() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let id = store.insert(Node::new("list")).unwrap();
        let items: Vec<_> = (0..3)
            .map(|i| store.insert(Node::new(&i.to_string())).unwrap())
            .collect();

        for item in &items {
            store.push_item(id, "children", *item).unwrap();
        }
        store.move_item(id, "children", 0, 2).unwrap();
        let removed = store.remove_item(id, "children", 0).unwrap();
        assert_eq!(removed, items[1]);
        store.insert_item(id, "children", 0, items[1]).unwrap();

        assert_eq!(
            store.value(id, "children").unwrap(),
            PropertyValue::Association(vec![items[1], items[2], items[0]])
        );
        assert!(matches!(
            store.remove_item(id, "children", 9),
            Err(StoreError::IndexOutOfBounds { index: 9, len: 3, .. })
        ));
        assert!(matches!(
            store.push_item(id, "label", items[0]),
            Err(StoreError::InvalidDescriptorUse { .. })
        ));
    }

    #[test]
    fn test_update_skips_unchanged_record() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let id = store.insert(Node::new("a")).unwrap();

        store.add(id).unwrap();
        store.update(id).unwrap();
        store.set(id, "weight", Value::Int(2)).unwrap();
        store.update(id).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.adds, 1);
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.skipped_writes, 1);
        assert_eq!(stats.persisted_records, 1);
    }

    #[test]
    fn test_update_rejected_for_non_updatable_type() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let id = store.insert(Leaf::new(1)).unwrap();

        assert!(matches!(
            store.update(id),
            Err(StoreError::InvalidOperation(_))
        ));
        store.add(id).unwrap();
    }

    #[test]
    fn test_delete_evicts_and_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let id = store.insert(Leaf::new(1)).unwrap();
        store.add(id).unwrap();

        assert!(store.delete::<Leaf>(id).unwrap());
        assert!(!store.contains(id));
        assert!(matches!(
            store.get::<Leaf>(id),
            Err(StoreError::NotFound { .. })
        ));
        assert!(!store.delete::<Leaf>(id).unwrap());
    }

    #[test]
    fn test_missing_reference_fails_load() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let mut parent = Node::new("parent");
        let child = Node::new("child");
        parent.next = Some(child.id);
        let (parent_id, child_id) = (parent.id, child.id);

        {
            let store = ObjectStore::create(config.clone(), registry()).unwrap();
            store.insert(child).unwrap();
            store.insert(parent).unwrap();
            store.add(parent_id).unwrap();
        }

        let store = ObjectStore::open(config, registry()).unwrap();
        assert!(matches!(
            store.get::<Node>(parent_id),
            Err(StoreError::NotFound { id, .. }) if id == child_id
        ));
        assert!(!store.contains(parent_id));
        assert!(!store.contains(child_id));
    }

    #[test]
    fn test_journal_replayed_on_open() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            commit_mode: CommitMode::Journaled,
            ..test_config(&dir)
        };

        let leaf = Leaf::new(42);
        let id = leaf.id;
        {
            let store = ObjectStore::create(config.clone(), registry()).unwrap();
            store.insert(leaf).unwrap();
            let record = store.capture(id).unwrap();
            drop(store);

            // Logged but never applied.
            let journal = CommitJournal::open(config.path.join(JOURNAL_FILE)).unwrap();
            journal.log(vec![JournalOp::Put(record)]).unwrap();
        }

        let store = ObjectStore::open(config, registry()).unwrap();
        assert_eq!(store.get::<Leaf>(id).unwrap().value, 42);
        let journal = store.journal.as_ref().unwrap();
        assert!(!journal.has_pending().unwrap());
    }

    #[test]
    fn test_export_json_and_frame() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let child = store.insert(Node::new("child")).unwrap();
        let mut node = Node::new("root");
        node.weight = 3;
        node.next = Some(child);
        let id = store.insert(node).unwrap();

        let exported = store.export_json(id).unwrap();
        assert_eq!(exported["type"], "fixtures.Node");
        assert_eq!(exported["fields"]["weight"], 3);
        assert_eq!(exported["references"]["next"], child.to_string());
        assert!(exported["fields"].get("scratch").is_none());

        let frame = store.frame(id).unwrap();
        let record = wire::decode_record(store.registry(), &frame).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.tag, TypeTag(1));
    }
}
