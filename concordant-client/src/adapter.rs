//! Network adapter to the remote service.
//!
//! Every call runs as its own task on the session's runtime and never blocks
//! the caller:
//! - fetches are coalesced per object ([`FetchState`]), so at most one
//!   `get-object` round trip per object is outstanding at a time, and a
//!   request made during a round trip is answered by exactly one more;
//! - pushes retry with a fixed delay until delivered, so a committed write
//!   is never dropped;
//! - namespace and subscription calls are best effort and only logged.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::codec::{
    unescape, AppRequest, GetObjectRequest, SubscriptionRequest, UpdateObjectRequest, WireCodec,
};
use crate::config::RetryPolicy;
use crate::error::ClientResult;
use crate::http::HttpClient;
use crate::ids::{ClientId, CollectionId, ObjectId};

/// Receiver of fetched or pushed-in documents.
pub trait UpdateSink: Send + Sync {
    /// A document for `id` arrived from the service.
    fn deliver(&self, id: &ObjectId, document: &str);
}

/// Per-object fetch coalescing state. Absence from the table means idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// One round trip outstanding.
    InFlight,
    /// One round trip outstanding and one more owed after it.
    InFlightWithPending,
}

/// Coalescing entry: the state plus the sink of the most recent request,
/// which receives whatever the outstanding round trips bring back.
struct FetchEntry {
    state: FetchState,
    sink: Arc<dyn UpdateSink>,
}

impl FetchState {
    /// Transition on a new fetch request. Returns the next state and whether
    /// a round trip must be started now.
    pub fn on_request(current: Option<Self>) -> (Self, bool) {
        match current {
            None => (FetchState::InFlight, true),
            Some(_) => (FetchState::InFlightWithPending, false),
        }
    }

    /// Transition when a round trip completes. `None` means idle; otherwise
    /// another round trip is due.
    pub fn on_complete(self) -> Option<Self> {
        match self {
            FetchState::InFlight => None,
            FetchState::InFlightWithPending => Some(FetchState::InFlight),
        }
    }
}

/// Counters for monitoring adapter traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub fetch_round_trips: u64,
    pub push_attempts: u64,
    pub pushes_delivered: u64,
}

#[derive(Default)]
struct AtomicAdapterStats {
    fetch_round_trips: AtomicU64,
    push_attempts: AtomicU64,
    pushes_delivered: AtomicU64,
}

/// HTTP operations against one remote namespace.
pub struct NetworkAdapter {
    http: Arc<dyn HttpClient>,
    database: String,
    service_address: String,
    retry: RetryPolicy,
    runtime: Handle,
    fetches: Mutex<HashMap<ObjectId, FetchEntry>>,
    stats: AtomicAdapterStats,
    outstanding_pushes: AtomicUsize,
    pushes_idle: Notify,
}

impl NetworkAdapter {
    pub fn new(
        http: Arc<dyn HttpClient>,
        database: impl Into<String>,
        service_address: impl Into<String>,
        retry: RetryPolicy,
        runtime: Handle,
    ) -> Self {
        Self {
            http,
            database: database.into(),
            service_address: service_address.into(),
            retry,
            runtime,
            fetches: Mutex::new(HashMap::new()),
            stats: AtomicAdapterStats::default(),
            outstanding_pushes: AtomicUsize::new(0),
            pushes_idle: Notify::new(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn service_address(&self) -> &str {
        &self.service_address
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Traffic counters snapshot.
    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            fetch_round_trips: self.stats.fetch_round_trips.load(Ordering::Relaxed),
            push_attempts: self.stats.push_attempts.load(Ordering::Relaxed),
            pushes_delivered: self.stats.pushes_delivered.load(Ordering::Relaxed),
        }
    }

    /// Current coalescing state for `id` (`None` when idle).
    pub fn fetch_state(&self, id: &ObjectId) -> Option<FetchState> {
        self.fetches.lock().get(id).map(|entry| entry.state)
    }

    /// Create the remote namespace. Idempotent server-side; not retried.
    pub fn connect(self: &Arc<Self>) -> JoinHandle<ClientResult<()>> {
        let body = AppRequest {
            app_name: self.database.clone(),
        };
        self.best_effort("create-app", body)
    }

    /// Remove the remote namespace (teardown only).
    pub fn delete(self: &Arc<Self>) -> JoinHandle<ClientResult<()>> {
        let body = AppRequest {
            app_name: self.database.clone(),
        };
        self.best_effort("delete-app", body)
    }

    pub fn subscribe(
        self: &Arc<Self>,
        collection: &CollectionId,
        client: ClientId,
    ) -> JoinHandle<ClientResult<()>> {
        self.best_effort("subscribe", self.subscription(collection, client))
    }

    pub fn unsubscribe(
        self: &Arc<Self>,
        collection: &CollectionId,
        client: ClientId,
    ) -> JoinHandle<ClientResult<()>> {
        self.best_effort("unsubscribe", self.subscription(collection, client))
    }

    /// Fetch the current document of `id` and hand it to `sink`.
    ///
    /// Coalesced: while a round trip for `id` is outstanding, further
    /// requests collapse into a single follow-up round trip. Results go to
    /// the sink of the latest request, so a sink replaced mid-flight (a
    /// reopened collection) still gets the document.
    pub fn get_object(self: &Arc<Self>, id: ObjectId, sink: Arc<dyn UpdateSink>) {
        {
            let mut fetches = self.fetches.lock();
            let (state, start) = FetchState::on_request(fetches.get(&id).map(|e| e.state));
            fetches.insert(id.clone(), FetchEntry { state, sink });
            if !start {
                log::debug!("Fetch of {id} coalesced into outstanding round trip");
                return;
            }
        }

        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            loop {
                if let Some(document) = this.fetch_with_retry(&id).await {
                    if let Some(sink) = this.current_sink(&id) {
                        sink.deliver(&id, &document);
                    }
                }
                if !this.complete_round(&id) {
                    break;
                }
            }
        });
    }

    /// Push the full document of `id`, retrying until delivered.
    ///
    /// The returned handle resolves once the service acknowledged the push
    /// (or the optional attempt cap was reached); callers may drop it.
    pub fn update_object(
        self: &Arc<Self>,
        id: ObjectId,
        document: String,
    ) -> JoinHandle<ClientResult<()>> {
        self.outstanding_pushes.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = this.push_until_delivered(&id, document).await;
            if this.outstanding_pushes.fetch_sub(1, Ordering::SeqCst) == 1 {
                this.pushes_idle.notify_waiters();
            }
            result
        })
    }

    /// Pushes not yet delivered (or given up).
    pub fn outstanding_pushes(&self) -> usize {
        self.outstanding_pushes.load(Ordering::SeqCst)
    }

    /// Wait until every push issued so far has finished.
    pub async fn flush(&self) {
        loop {
            let idle = self.pushes_idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.outstanding_pushes() == 0 {
                return;
            }
            idle.await;
        }
    }

    fn current_sink(&self, id: &ObjectId) -> Option<Arc<dyn UpdateSink>> {
        self.fetches.lock().get(id).map(|entry| Arc::clone(&entry.sink))
    }

    fn complete_round(&self, id: &ObjectId) -> bool {
        let mut fetches = self.fetches.lock();
        let next = fetches.get(id).and_then(|entry| entry.state.on_complete());
        match next {
            Some(next) => {
                if let Some(entry) = fetches.get_mut(id) {
                    entry.state = next;
                }
                true
            }
            None => {
                fetches.remove(id);
                false
            }
        }
    }

    async fn fetch_with_retry(&self, id: &ObjectId) -> Option<String> {
        for attempt in 1..=self.retry.fetch_max_attempts {
            match self.fetch_once(id).await {
                Ok(Some(document)) => return Some(document),
                Ok(None) => {
                    log::debug!("Object {id} does not exist remotely yet");
                    return None;
                }
                Err(e) if attempt < self.retry.fetch_max_attempts => {
                    log::warn!("Fetch of {id} failed (attempt {attempt}): {e}");
                    tokio::time::sleep(self.retry.fetch_delay).await;
                }
                Err(e) => {
                    log::warn!("Giving up fetch of {id} after {attempt} attempts: {e}");
                }
            }
        }
        None
    }

    async fn fetch_once(&self, id: &ObjectId) -> ClientResult<Option<String>> {
        let body = GetObjectRequest {
            app_name: self.database.clone(),
            id: WireCodec::encode(id)?,
        };
        self.stats.fetch_round_trips.fetch_add(1, Ordering::Relaxed);
        let response = self.post("get-object", &body).await?;
        if response.trim().is_empty() {
            return Ok(None);
        }
        let document = unescape(&response)?;
        Ok((!document.is_empty()).then_some(document))
    }

    async fn push_until_delivered(&self, id: &ObjectId, document: String) -> ClientResult<()> {
        // Serializing the body escapes `document` once more: the service
        // receives `escape(document)` as the field's literal.
        let body = UpdateObjectRequest {
            app_name: self.database.clone(),
            id: WireCodec::encode(id)?,
            document,
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.stats.push_attempts.fetch_add(1, Ordering::Relaxed);
            match self.post("update-object", &body).await {
                Ok(_) => {
                    self.stats.pushes_delivered.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Pushed {id} after {attempt} attempt(s)");
                    return Ok(());
                }
                Err(e) => {
                    if self.retry.push_max_attempts.is_some_and(|max| attempt >= max) {
                        log::error!("Dropping push of {id} after {attempt} attempts: {e}");
                        return Err(e);
                    }
                    log::warn!("Push of {id} failed (attempt {attempt}): {e}");
                    tokio::time::sleep(self.retry.push_delay).await;
                }
            }
        }
    }

    fn subscription(&self, collection: &CollectionId, client: ClientId) -> SubscriptionRequest {
        SubscriptionRequest {
            app_name: self.database.clone(),
            collection_uid: collection.clone(),
            user_id: client,
        }
    }

    fn best_effort<B>(self: &Arc<Self>, endpoint: &'static str, body: B) -> JoinHandle<ClientResult<()>>
    where
        B: Serialize + Send + Sync + 'static,
    {
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            match this.post(endpoint, &body).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    log::warn!("{endpoint} for {} failed: {e}", this.database);
                    Err(e)
                }
            }
        })
    }

    async fn post<B: Serialize>(&self, endpoint: &str, body: &B) -> ClientResult<String> {
        let url = format!(
            "{}/api/{endpoint}",
            self.service_address.trim_end_matches('/')
        );
        let body = serde_json::to_string(body)?;
        log::debug!("POST {url}");
        self.http.post_json(&url, body).await
    }
}
