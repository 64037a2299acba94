//! Collections and the object references they hand out.
//!
//! ```text
//!  open(name, type) ──► cache hit? ── yes ──► same ObjectRef
//!                           │ no
//!                           ▼
//!                   empty value + get-object
//!
//!  remote update ──► new_update ──► pending[id] (merged)
//!                        │              │
//!                        ▼              │ pull(level)
//!                 notify handlers       ▼
//!                                 merged into cache
//! ```
//!
//! Remote state never changes a cached object behind the caller's back: it
//! waits in the pending table until [`Collection::pull`].

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::adapter::{NetworkAdapter, UpdateSink};
use crate::clock::ClockEnvironment;
use crate::crdt::{Crdt, CrdtRegistry, ReplicatedObject};
use crate::error::{ClientError, ClientResult};
use crate::ids::{ClientId, CollectionId, ObjectId, Timestamp};
use crate::session::{Coordinator, SessionInner};
use crate::transaction::Transaction;

/// Requested consistency of reads and transactions.
///
/// Only [`ConsistencyLevel::None`] is implemented; the stronger levels are
/// accepted and currently behave the same.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsistencyLevel {
    #[default]
    None,
    Snapshot,
    Strong,
}

/// Callback fired when a remote update for an open object is buffered.
pub type NotificationHandler = Arc<dyn Fn(Timestamp, &ObjectId) + Send + Sync>;

static NEXT_REF: AtomicU64 = AtomicU64::new(1);

struct ObjectCell {
    key: u64,
    value: RwLock<Box<dyn ReplicatedObject>>,
}

/// Shared handle on a cached replicated object.
///
/// Clones point at the same value. Closures passed to [`read`](Self::read)
/// and [`write`](Self::write) run under the object's lock and must not call
/// back into the collection.
#[derive(Clone)]
pub struct ObjectRef {
    cell: Arc<ObjectCell>,
}

impl ObjectRef {
    fn new(value: Box<dyn ReplicatedObject>) -> Self {
        Self {
            cell: Arc::new(ObjectCell {
                key: NEXT_REF.fetch_add(1, Ordering::Relaxed),
                value: RwLock::new(value),
            }),
        }
    }

    pub(crate) fn key(&self) -> u64 {
        self.cell.key
    }

    pub fn type_tag(&self) -> &'static str {
        self.cell.value.read().type_tag()
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Read the value as `T`.
    pub fn read<T: Crdt, R>(&self, f: impl FnOnce(&T) -> R) -> ClientResult<R> {
        let guard = self.cell.value.read();
        let value = guard
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| mismatch::<T>(guard.type_tag()))?;
        Ok(f(value))
    }

    /// Mutate the value as `T` inside `tx`.
    ///
    /// The object is recorded as dirty in `tx` and `f` receives a fresh
    /// timestamp from the session clock.
    pub fn write<T: Crdt, R>(
        &self,
        tx: &Transaction,
        f: impl FnOnce(&mut T, Timestamp) -> R,
    ) -> ClientResult<R> {
        let found = self.type_tag();
        if found != T::TYPE_TAG {
            return Err(mismatch::<T>(found));
        }
        tx.on_write(self)?;
        let ts = tx.tick();

        let mut guard = self.cell.value.write();
        let found = guard.type_tag();
        let value = guard
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| mismatch::<T>(found))?;
        Ok(f(value, ts))
    }

    /// Current transport document.
    pub fn to_wire(&self) -> ClientResult<String> {
        self.cell.value.read().to_wire()
    }

    fn merge(&self, delta: &dyn ReplicatedObject) -> ClientResult<()> {
        self.cell.value.write().merge(delta)
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRef")
            .field("key", &self.cell.key)
            .field("value", &*self.cell.value.read())
            .finish()
    }
}

fn mismatch<T: Crdt>(found: &str) -> ClientError {
    ClientError::TypeMismatch {
        expected: T::TYPE_TAG.to_string(),
        found: found.to_string(),
    }
}

struct OpenEntry {
    read_only: bool,
    handlers: Vec<NotificationHandler>,
}

#[derive(Default)]
struct CollectionState {
    closed: bool,
    objects: HashMap<ObjectId, ObjectRef>,
    by_ref: HashMap<u64, ObjectId>,
    open: HashMap<ObjectId, OpenEntry>,
    pending: HashMap<ObjectId, Box<dyn ReplicatedObject>>,
}

impl CollectionState {
    fn install(&mut self, id: ObjectId, object: ObjectRef) {
        self.by_ref.insert(object.key(), id.clone());
        self.objects.insert(id, object);
    }
}

pub(crate) struct CollectionInner {
    id: CollectionId,
    read_only: bool,
    client: ClientId,
    adapter: Arc<NetworkAdapter>,
    clock: Arc<ClockEnvironment>,
    registry: Arc<CrdtRegistry>,
    coordinator: Arc<Coordinator>,
    session: Weak<SessionInner>,
    state: Mutex<CollectionState>,
}

/// A named set of replicated objects opened by a session.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.inner.id)
            .field("read_only", &self.inner.read_only)
            .finish_non_exhaustive()
    }
}

pub(crate) struct CollectionParts {
    pub id: CollectionId,
    pub read_only: bool,
    pub client: ClientId,
    pub adapter: Arc<NetworkAdapter>,
    pub clock: Arc<ClockEnvironment>,
    pub registry: Arc<CrdtRegistry>,
    pub coordinator: Arc<Coordinator>,
    pub session: Weak<SessionInner>,
}

impl Collection {
    pub(crate) fn new(parts: CollectionParts) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                id: parts.id,
                read_only: parts.read_only,
                client: parts.client,
                adapter: parts.adapter,
                clock: parts.clock,
                registry: parts.registry,
                coordinator: parts.coordinator,
                session: parts.session,
                state: Mutex::new(CollectionState::default()),
            }),
        }
    }

    pub fn id(&self) -> &CollectionId {
        &self.inner.id
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Open (or reopen) the object `name` of type `type_tag`.
    ///
    /// The first open creates an empty value and requests the remote state;
    /// later opens of the same object return the same reference. A handler,
    /// if given, is called whenever a remote update for the object arrives.
    pub fn open(
        &self,
        name: &str,
        type_tag: &str,
        read_only: bool,
        handler: Option<NotificationHandler>,
    ) -> ClientResult<ObjectRef> {
        if self.inner.coordinator.transaction_active() {
            return Err(ClientError::TransactionInProgress);
        }

        let id = ObjectId::new(self.inner.id.clone(), type_tag, name);
        let object = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ClientError::CollectionClosed);
            }
            if self.inner.read_only && !read_only {
                return Err(ClientError::ReadOnlyViolation(format!(
                    "collection {} is read-only",
                    self.inner.id
                )));
            }

            if let Some(entry) = state.open.get_mut(&id) {
                if entry.read_only != read_only {
                    return Err(ClientError::ConflictingMode(id.to_string()));
                }
                entry.handlers.extend(handler);
                return state
                    .objects
                    .get(&id)
                    .cloned()
                    .ok_or(ClientError::NotManaged);
            }

            let object = match state.objects.get(&id) {
                Some(object) => object.clone(),
                None => {
                    let object = ObjectRef::new(self.inner.registry.create(type_tag)?);
                    state.install(id.clone(), object.clone());
                    object
                }
            };
            state.open.insert(
                id.clone(),
                OpenEntry {
                    read_only,
                    handlers: handler.into_iter().collect(),
                },
            );
            object
        };

        log::debug!("Opened {id} (read_only={read_only})");
        self.inner.adapter.get_object(id, self.sink());
        Ok(object)
    }

    /// Merge every buffered remote update into the cache.
    ///
    /// Safe to call at any time; a second call with nothing new buffered
    /// changes nothing.
    pub fn pull(&self, level: ConsistencyLevel) -> ClientResult<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(ClientError::CollectionClosed);
        }
        if level != ConsistencyLevel::None {
            log::debug!("Pull at {level:?} served as {:?}", ConsistencyLevel::None);
        }

        let pending = std::mem::take(&mut state.pending);
        for (id, delta) in pending {
            match state.objects.get(&id) {
                Some(object) => {
                    if let Err(e) = object.merge(delta.as_ref()) {
                        log::warn!("Discarding update for {id}: {e}");
                    }
                }
                None => {
                    log::debug!("Installing {id} from buffered update");
                    state.install(id, ObjectRef::new(delta));
                }
            }
        }
        Ok(())
    }

    /// Re-request the remote state of `object`. Returns false if the
    /// reference is not managed by this collection.
    pub fn force_get(&self, object: &ObjectRef) -> bool {
        let id = {
            let state = self.inner.state.lock();
            match state.by_ref.get(&object.key()) {
                Some(id) if !state.closed => id.clone(),
                _ => return false,
            }
        };
        self.inner.adapter.get_object(id, self.sink());
        true
    }

    /// Buffer a remote update and notify the object's handlers.
    pub fn new_update(&self, id: &ObjectId, delta: Box<dyn ReplicatedObject>) {
        self.inner.new_update(id, delta);
    }

    pub fn get_object(&self, id: &ObjectId) -> Option<ObjectRef> {
        self.inner.state.lock().objects.get(id).cloned()
    }

    pub fn get_object_uid(&self, object: &ObjectRef) -> Option<ObjectId> {
        self.inner.state.lock().by_ref.get(&object.key()).cloned()
    }

    /// Whether `object` is open here for writing.
    pub fn is_writable(&self, object: &ObjectRef) -> bool {
        let state = self.inner.state.lock();
        state
            .by_ref
            .get(&object.key())
            .and_then(|id| state.open.get(id))
            .is_some_and(|entry| !entry.read_only)
    }

    /// Number of buffered, not yet pulled updates.
    pub fn pending_updates(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Close the collection, dropping its cache. Idempotent.
    ///
    /// The owning session unsubscribes and stops the realtime channel.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            *state = CollectionState {
                closed: true,
                ..Default::default()
            };
        }
        log::info!("Closed collection {}", self.inner.id);
        if let Some(session) = self.inner.session.upgrade() {
            session.collection_closed(&self.inner.id);
        }
    }

    /// Hand a document received from the service to this collection.
    pub(crate) fn deliver(&self, id: &ObjectId, document: &str) {
        self.inner.deliver(id, document);
    }

    pub(crate) fn client(&self) -> ClientId {
        self.inner.client
    }

    fn sink(&self) -> Arc<dyn UpdateSink> {
        self.inner.clone()
    }
}

impl CollectionInner {
    fn new_update(&self, id: &ObjectId, delta: Box<dyn ReplicatedObject>) {
        let handlers = {
            let mut state = self.state.lock();
            if state.closed {
                log::debug!("Dropping update for {id}: collection closed");
                return;
            }
            match state.pending.get_mut(id) {
                Some(buffered) => {
                    if let Err(e) = buffered.merge(delta.as_ref()) {
                        log::warn!("Replacing buffered update for {id}: {e}");
                        state.pending.insert(id.clone(), delta);
                    }
                }
                None => {
                    state.pending.insert(id.clone(), delta);
                }
            }
            if state.objects.contains_key(id) {
                state
                    .open
                    .get(id)
                    .map(|entry| entry.handlers.clone())
                    .unwrap_or_default()
            } else {
                Vec::new()
            }
        };

        let now = self.clock.now();
        for handler in handlers {
            handler(now, id);
        }
    }
}

impl UpdateSink for CollectionInner {
    fn deliver(&self, id: &ObjectId, document: &str) {
        if id.collection != self.id {
            log::warn!("Ignoring update for {id}: not in collection {}", self.id);
            return;
        }
        match self.registry.decode(&id.type_tag, document) {
            Ok(delta) => self.new_update(id, delta),
            Err(e) => log::error!("Cannot decode update for {id}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::crdt::PNCounter;
    use crate::loopback::LoopbackService;
    use tokio::runtime::Handle;

    fn collection(read_only: bool) -> (Collection, Arc<Coordinator>) {
        let service = Arc::new(LoopbackService::new());
        let adapter = Arc::new(NetworkAdapter::new(
            service,
            "db",
            "http://loopback",
            RetryPolicy::fast(),
            Handle::current(),
        ));
        let client = ClientId::generate();
        let coordinator = Arc::new(Coordinator::new());
        let collection = Collection::new(CollectionParts {
            id: "c".into(),
            read_only,
            client,
            adapter,
            clock: Arc::new(ClockEnvironment::new(client)),
            registry: Arc::new(CrdtRegistry::with_defaults()),
            coordinator: coordinator.clone(),
            session: Weak::new(),
        });
        (collection, coordinator)
    }

    fn counter_delta(amount: u64) -> Box<dyn ReplicatedObject> {
        let clock = ClockEnvironment::new(ClientId::generate());
        let mut counter = PNCounter::default();
        counter.increment(amount, clock.tick());
        Box::new(counter)
    }

    fn counter_value(object: &ObjectRef) -> i64 {
        object.read(|c: &PNCounter| c.get()).unwrap()
    }

    #[tokio::test]
    async fn test_open_returns_same_reference() {
        let (collection, _) = collection(false);
        let a = collection.open("x", "PNCounter", false, None).unwrap();
        let b = collection.open("x", "PNCounter", false, None).unwrap();
        assert!(a.ptr_eq(&b));

        let id = collection.get_object_uid(&a).unwrap();
        assert_eq!(id, ObjectId::new("c".into(), "PNCounter", "x"));
        assert!(collection.get_object(&id).unwrap().ptr_eq(&a));
        assert!(collection.is_writable(&a));
    }

    #[tokio::test]
    async fn test_reopen_with_other_mode_conflicts() {
        let (collection, _) = collection(false);
        collection.open("x", "PNCounter", false, None).unwrap();
        assert!(matches!(
            collection.open("x", "PNCounter", true, None),
            Err(ClientError::ConflictingMode(_))
        ));
    }

    #[tokio::test]
    async fn test_read_only_collection_rejects_writable_open() {
        let (collection, _) = collection(true);
        assert!(matches!(
            collection.open("x", "PNCounter", false, None),
            Err(ClientError::ReadOnlyViolation(_))
        ));
        let object = collection.open("x", "PNCounter", true, None).unwrap();
        assert!(!collection.is_writable(&object));
    }

    #[tokio::test]
    async fn test_open_unknown_type() {
        let (collection, _) = collection(false);
        assert!(matches!(
            collection.open("x", "ORSet", false, None),
            Err(ClientError::UnknownType(_))
        ));
    }

    #[tokio::test]
    async fn test_open_during_transaction_is_rejected() {
        let (collection, coordinator) = collection(false);
        let _slot = coordinator.begin_transaction().unwrap();
        assert_eq!(
            collection.open("x", "PNCounter", false, None).unwrap_err(),
            ClientError::TransactionInProgress
        );
    }

    #[tokio::test]
    async fn test_updates_wait_for_pull() {
        let (collection, _) = collection(false);
        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = notified.clone();
        let handler: NotificationHandler =
            Arc::new(move |_: Timestamp, id: &ObjectId| sink.lock().push(id.clone()));

        let object = collection.open("x", "PNCounter", false, Some(handler)).unwrap();
        let id = collection.get_object_uid(&object).unwrap();

        collection.new_update(&id, counter_delta(5));
        collection.new_update(&id, counter_delta(2));
        assert_eq!(notified.lock().len(), 2);
        assert_eq!(collection.pending_updates(), 1);
        assert_eq!(counter_value(&object), 0);

        collection.pull(ConsistencyLevel::None).unwrap();
        assert_eq!(counter_value(&object), 7);

        // Nothing new buffered: a second pull is a no-op.
        collection.pull(ConsistencyLevel::None).unwrap();
        assert_eq!(counter_value(&object), 7);
    }

    #[tokio::test]
    async fn test_pull_installs_unopened_objects() {
        let (collection, _) = collection(false);
        let id = ObjectId::new("c".into(), "PNCounter", "y");
        collection.new_update(&id, counter_delta(3));
        assert!(collection.get_object(&id).is_none());

        collection.pull(ConsistencyLevel::Strong).unwrap();
        let object = collection.get_object(&id).unwrap();
        assert_eq!(counter_value(&object), 3);

        // A later open returns the installed object.
        let opened = collection.open("y", "PNCounter", false, None).unwrap();
        assert!(opened.ptr_eq(&object));
    }

    #[tokio::test]
    async fn test_deliver_decodes_documents() {
        let (collection, _) = collection(false);
        let object = collection.open("x", "PNCounter", false, None).unwrap();
        let id = collection.get_object_uid(&object).unwrap();

        let wire = counter_delta(4).to_wire().unwrap();
        collection.deliver(&id, &wire);
        collection.deliver(&id, "not json");
        collection.pull(ConsistencyLevel::None).unwrap();
        assert_eq!(counter_value(&object), 4);
    }

    #[tokio::test]
    async fn test_close_drops_everything() {
        let (collection, _) = collection(false);
        let object = collection.open("x", "PNCounter", false, None).unwrap();
        let id = collection.get_object_uid(&object).unwrap();

        collection.close();
        collection.close();
        assert!(collection.is_closed());
        assert!(collection.get_object_uid(&object).is_none());
        assert!(!collection.force_get(&object));

        collection.new_update(&id, counter_delta(1));
        assert_eq!(collection.pending_updates(), 0);
        assert_eq!(
            collection.open("x", "PNCounter", false, None).unwrap_err(),
            ClientError::CollectionClosed
        );
    }

    #[tokio::test]
    async fn test_read_with_wrong_type() {
        let (collection, _) = collection(false);
        let object = collection.open("x", "PNCounter", false, None).unwrap();
        let err = object
            .read(|r: &crate::crdt::LwwRegister| r.get().map(str::to_string))
            .unwrap_err();
        assert!(matches!(err, ClientError::TypeMismatch { .. }));
    }
}
