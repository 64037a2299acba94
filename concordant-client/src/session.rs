//! Sessions and the process-wide coordinator.
//!
//! ```text
//!   Coordinator ── at most one ──► Session ── at most one ──► Collection
//!        │                            │                           │
//!        │ one active transaction     ├── NetworkAdapter (HTTP)   └── ObjectRef*
//!        └────────────────────────────┴── RealtimeChannel (while a collection is open)
//! ```
//!
//! A session owns the clock, the adapter and the realtime channel. Opening
//! its collection subscribes to remote updates and starts the channel;
//! closing the collection (or the session) undoes both.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::adapter::{AdapterStats, NetworkAdapter};
use crate::clock::ClockEnvironment;
use crate::codec::UpdateFrame;
use crate::collection::{Collection, CollectionParts, ConsistencyLevel, ObjectRef};
use crate::config::ClientConfig;
use crate::crdt::{Crdt, CrdtRegistry};
use crate::error::{ClientError, ClientResult};
use crate::http::{HttpClient, ReqwestClient};
use crate::ids::{ClientId, CollectionId, ObjectId, Timestamp};
use crate::realtime::{
    ChannelParams, ConnectionState, RealtimeChannel, RealtimeHandler, ServiceWorker,
    TransportKind,
};
use crate::transaction::Transaction;

/// Holds the active-session and active-transaction slots.
///
/// Use [`Coordinator::global`] for the process-wide instance, or a fresh
/// [`Coordinator::new`] to run several independent sessions side by side.
#[derive(Debug, Default)]
pub struct Coordinator {
    session: Mutex<Option<ClientId>>,
    transaction: AtomicBool,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide coordinator.
    pub fn global() -> Arc<Coordinator> {
        static GLOBAL: OnceLock<Arc<Coordinator>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Coordinator::new())).clone()
    }

    /// Client id of the connected session, if any.
    pub fn active_session(&self) -> Option<ClientId> {
        *self.session.lock()
    }

    pub fn transaction_active(&self) -> bool {
        self.transaction.load(Ordering::SeqCst)
    }

    fn begin_session(&self, client: ClientId) -> ClientResult<()> {
        let mut slot = self.session.lock();
        if slot.is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        *slot = Some(client);
        Ok(())
    }

    fn end_session(&self, client: ClientId) {
        let mut slot = self.session.lock();
        if *slot == Some(client) {
            *slot = None;
        }
    }

    /// Claim the transaction slot. Released when the guard drops.
    pub(crate) fn begin_transaction(&self) -> ClientResult<TransactionSlot<'_>> {
        self.transaction
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ClientError::TransactionInProgress)?;
        Ok(TransactionSlot { coordinator: self })
    }
}

/// Guard over the active-transaction slot.
pub(crate) struct TransactionSlot<'a> {
    coordinator: &'a Coordinator,
}

impl Drop for TransactionSlot<'_> {
    fn drop(&mut self) {
        self.coordinator.transaction.store(false, Ordering::SeqCst);
    }
}

/// Configures and connects a [`Session`].
pub struct SessionBuilder {
    config: ClientConfig,
    http: Option<Arc<dyn HttpClient>>,
    worker: Option<Arc<dyn ServiceWorker>>,
    registry: CrdtRegistry,
}

impl SessionBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            http: None,
            worker: None,
            registry: CrdtRegistry::with_defaults(),
        }
    }

    /// Use `http` instead of the default `reqwest` client.
    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Worker tried before the websocket (unless the config disables it).
    pub fn service_worker(mut self, worker: Arc<dyn ServiceWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Make another replicated type openable.
    pub fn register<T: Crdt>(mut self) -> Self {
        self.registry.register::<T>();
        self
    }

    /// Connect on the current tokio runtime.
    pub fn connect(self, coordinator: &Arc<Coordinator>) -> ClientResult<Session> {
        let runtime = Handle::try_current()
            .map_err(|e| ClientError::Runtime(format!("no tokio runtime: {e}")))?;
        let http = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestClient::new(
                &self.config.credential,
                self.config.request_timeout,
            )?),
        };

        let client_id = ClientId::generate();
        coordinator.begin_session(client_id)?;

        let adapter = Arc::new(NetworkAdapter::new(
            http,
            self.config.database.clone(),
            self.config.service_address.clone(),
            self.config.retry.clone(),
            runtime,
        ));
        drop(adapter.connect());

        let worker = if self.config.use_service_worker {
            self.worker
        } else {
            None
        };
        log::info!(
            "Session {client_id} connected to {} ({})",
            self.config.service_address,
            self.config.database
        );

        Ok(Session {
            inner: Arc::new(SessionInner {
                coordinator: coordinator.clone(),
                config: self.config,
                client_id,
                clock: Arc::new(ClockEnvironment::new(client_id)),
                registry: Arc::new(self.registry),
                adapter,
                worker,
                collection: Mutex::new(None),
                realtime: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

pub(crate) struct SessionInner {
    coordinator: Arc<Coordinator>,
    config: ClientConfig,
    client_id: ClientId,
    clock: Arc<ClockEnvironment>,
    registry: Arc<CrdtRegistry>,
    adapter: Arc<NetworkAdapter>,
    worker: Option<Arc<dyn ServiceWorker>>,
    collection: Mutex<Option<Collection>>,
    realtime: Mutex<Option<RealtimeChannel>>,
    closed: AtomicBool,
}

impl SessionInner {
    pub(crate) fn clock(&self) -> &ClockEnvironment {
        &self.clock
    }

    pub(crate) fn adapter(&self) -> &Arc<NetworkAdapter> {
        &self.adapter
    }

    fn open_collection(&self) -> Option<Collection> {
        self.collection.lock().clone()
    }

    pub(crate) fn get_object_uid(&self, object: &ObjectRef) -> ClientResult<ObjectId> {
        self.open_collection()
            .and_then(|c| c.get_object_uid(object))
            .ok_or(ClientError::NotManaged)
    }

    pub(crate) fn is_writable(&self, object: &ObjectRef) -> ClientResult<bool> {
        let collection = self.open_collection().ok_or(ClientError::NotManaged)?;
        if collection.get_object_uid(object).is_none() {
            return Err(ClientError::NotManaged);
        }
        Ok(collection.is_writable(object))
    }

    /// Called by a collection once it has closed.
    pub(crate) fn collection_closed(&self, id: &CollectionId) {
        {
            let mut slot = self.collection.lock();
            if slot.as_ref().is_some_and(|c| c.id() == id) {
                *slot = None;
            }
        }
        drop(self.adapter.unsubscribe(id, self.client_id));
        if let Some(mut channel) = self.realtime.lock().take() {
            channel.close();
        }
    }
}

/// Routes realtime events into the session's open collection.
struct SessionEvents {
    session: Weak<SessionInner>,
}

impl RealtimeHandler for SessionEvents {
    fn on_frame(&self, frame: UpdateFrame) {
        let Some(collection) = self.session.upgrade().and_then(|s| s.open_collection()) else {
            return;
        };
        match frame.object_id() {
            Ok(id) => collection.deliver(&id, &frame.document),
            Err(e) => log::error!("Dropping realtime update with bad id: {e}"),
        }
    }

    fn on_connected(&self, transport: TransportKind) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if let Some(collection) = session.open_collection() {
            log::debug!("Re-subscribing {} over {transport:?}", collection.id());
            drop(session.adapter.subscribe(collection.id(), session.client_id));
        }
    }

    fn on_controller_change(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let Some(collection) = session.open_collection() else {
            return;
        };
        let adapter = session.adapter.clone();
        let id = collection.id().clone();
        let client = collection.client();
        adapter.runtime().clone().spawn(async move {
            let _ = adapter.unsubscribe(&id, client).await;
            let _ = adapter.subscribe(&id, client).await;
        });
    }
}

/// A connection to one remote database.
///
/// Dropping the session closes it.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connect with the default HTTP client and bundled object types.
    pub fn connect(coordinator: &Arc<Coordinator>, config: ClientConfig) -> ClientResult<Session> {
        SessionBuilder::new(config).connect(coordinator)
    }

    pub fn builder(config: ClientConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    pub fn database(&self) -> &str {
        &self.inner.config.database
    }

    pub fn service_address(&self) -> &str {
        &self.inner.config.service_address
    }

    pub fn clock(&self) -> &ClockEnvironment {
        &self.inner.clock
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Open the session's collection.
    ///
    /// Subscribes to its remote updates and starts the realtime channel.
    pub fn open_collection(&self, name: &str, read_only: bool) -> ClientResult<Collection> {
        if self.inner.coordinator.transaction_active() {
            return Err(ClientError::TransactionInProgress);
        }
        if self.is_closed() {
            return Err(ClientError::SessionClosed);
        }

        let id = CollectionId::new(name);
        let collection = {
            let mut slot = self.inner.collection.lock();
            if let Some(open) = slot.as_ref() {
                return Err(ClientError::CollectionAlreadyOpen(open.id().to_string()));
            }
            let collection = Collection::new(CollectionParts {
                id: id.clone(),
                read_only,
                client: self.inner.client_id,
                adapter: self.inner.adapter.clone(),
                clock: self.inner.clock.clone(),
                registry: self.inner.registry.clone(),
                coordinator: self.inner.coordinator.clone(),
                session: Arc::downgrade(&self.inner),
            });
            *slot = Some(collection.clone());
            collection
        };

        drop(self.inner.adapter.subscribe(&id, self.inner.client_id));
        let channel = RealtimeChannel::start(
            ChannelParams {
                database: self.inner.config.database.clone(),
                client_id: self.inner.client_id,
                websocket_url: self.inner.config.websocket_url(),
                reconnect_delay: self.inner.config.reconnect_delay,
                worker: self.inner.worker.clone(),
                handler: Arc::new(SessionEvents {
                    session: Arc::downgrade(&self.inner),
                }),
            },
            self.inner.adapter.runtime(),
        );
        *self.inner.realtime.lock() = Some(channel);

        log::info!("Opened collection {id} (read_only={read_only})");
        Ok(collection)
    }

    /// Id of the open collection, if any.
    pub fn open_collection_id(&self) -> Option<CollectionId> {
        self.inner.open_collection().map(|c| c.id().clone())
    }

    /// Run `body` as a transaction and commit its writes.
    ///
    /// Fails with [`ClientError::TransactionInProgress`] if another
    /// transaction is active on the coordinator. On success every object the
    /// body wrote is pushed in full; on error nothing is pushed. The
    /// transaction slot is released in every case.
    pub fn transaction<R, E, F>(&self, level: ConsistencyLevel, body: F) -> Result<R, E>
    where
        F: FnOnce(&Transaction) -> Result<R, E>,
        E: From<ClientError>,
    {
        if self.is_closed() {
            return Err(ClientError::SessionClosed.into());
        }
        let _slot = self.inner.coordinator.begin_transaction()?;
        let tx = Transaction::new(self.inner.clone(), level);
        let value = body(&tx)?;
        let pushed = tx.commit()?;
        log::debug!("Transaction committed, {pushed} object(s) pushed");
        Ok(value)
    }

    /// Identifier of `object` in the open collection.
    pub fn get_object_uid(&self, object: &ObjectRef) -> ClientResult<ObjectId> {
        self.inner.get_object_uid(object)
    }

    /// Whether `object` is open for writing.
    pub fn is_writable(&self, object: &ObjectRef) -> ClientResult<bool> {
        self.inner.is_writable(object)
    }

    /// Session-wide pull is not supported; pull the collection instead.
    pub fn pull(&self, _level: ConsistencyLevel) -> ClientResult<()> {
        Err(ClientError::UnsupportedOperation("session pull"))
    }

    pub fn pull_at(&self, _level: ConsistencyLevel, _at: Timestamp) -> ClientResult<()> {
        Err(ClientError::UnsupportedOperation("session pull at timestamp"))
    }

    /// State of the realtime channel while a collection is open.
    pub fn realtime_state(&self) -> Option<ConnectionState> {
        self.inner.realtime.lock().as_ref().map(RealtimeChannel::state)
    }

    pub fn realtime_transport(&self) -> Option<TransportKind> {
        self.inner
            .realtime
            .lock()
            .as_ref()
            .and_then(RealtimeChannel::transport)
    }

    pub fn adapter_stats(&self) -> AdapterStats {
        self.inner.adapter.stats()
    }

    /// Wait until every committed write has been delivered.
    pub async fn flush(&self) {
        self.inner.adapter.flush().await;
    }

    /// Delete the remote database. Meant for teardown.
    pub async fn delete_remote(&self) -> ClientResult<()> {
        join(self.inner.adapter.delete()).await
    }

    /// Close the open collection, stop the channel and free the coordinator.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let collection = self.inner.collection.lock().take();
        if let Some(collection) = collection {
            collection.close();
        }
        if let Some(mut channel) = self.inner.realtime.lock().take() {
            channel.close();
        }
        self.inner.coordinator.end_session(self.inner.client_id);
        log::info!("Session {} closed", self.inner.client_id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn join(handle: JoinHandle<ClientResult<()>>) -> ClientResult<()> {
    handle
        .await
        .map_err(|e| ClientError::Runtime(format!("task failed: {e}")))?
}
