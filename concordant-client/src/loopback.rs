//! In-process stand-in for the remote service.
//!
//! [`LoopbackService`] answers the adapter's HTTP calls from memory and also
//! acts as the local worker bus: clients registered through
//! [`ServiceWorker::register`] receive an update envelope whenever an object
//! of a collection they subscribed to is pushed. Documents are stored
//! verbatim and returned escaped, exactly as the real service does.
//!
//! Fault injection (`fail_next`, `set_offline`, `set_fetch_latency`) makes
//! retry and coalescing behavior observable in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::codec::{
    escape, AppRequest, GetObjectRequest, Handshake, SubscriptionRequest, UpdateFrame,
    UpdateObjectRequest, WireCodec, WorkerMessage,
};
use crate::error::{ClientError, ClientResult};
use crate::http::HttpClient;
use crate::ids::{ClientId, CollectionId, ObjectId};
use crate::realtime::ServiceWorker;

struct Registration {
    database: String,
    inbox: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct ServiceState {
    apps: HashSet<String>,
    documents: HashMap<(String, ObjectId), String>,
    subscriptions: HashSet<(String, CollectionId, ClientId)>,
    workers: HashMap<ClientId, Registration>,
    calls: HashMap<String, usize>,
    failures: HashMap<String, usize>,
    offline: bool,
    reject_workers: bool,
    fetch_latency: Duration,
}

/// In-memory remote service and worker bus.
#[derive(Default)]
pub struct LoopbackService {
    state: Mutex<ServiceState>,
}

impl LoopbackService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `get-object` answer by `latency`.
    pub fn set_fetch_latency(&self, latency: Duration) {
        self.state.lock().fetch_latency = latency;
    }

    /// Fail the next `count` calls to `endpoint` with a retryable error.
    pub fn fail_next(&self, endpoint: &str, count: usize) {
        self.state.lock().failures.insert(endpoint.to_string(), count);
    }

    /// Fail every call while set.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Refuse further worker registrations.
    pub fn set_reject_workers(&self, reject: bool) {
        self.state.lock().reject_workers = reject;
    }

    /// Calls received for `endpoint`, failed ones included.
    pub fn call_count(&self, endpoint: &str) -> usize {
        self.state.lock().calls.get(endpoint).copied().unwrap_or(0)
    }

    pub fn has_app(&self, database: &str) -> bool {
        self.state.lock().apps.contains(database)
    }

    /// Stored document of `id`, as it was pushed.
    pub fn document(&self, database: &str, id: &ObjectId) -> Option<String> {
        self.state
            .lock()
            .documents
            .get(&(database.to_string(), id.clone()))
            .cloned()
    }

    /// Store a document as if another client had pushed it, notifying
    /// subscribed workers.
    pub fn put_document(&self, database: &str, id: &ObjectId, document: &str) {
        let mut state = self.state.lock();
        Self::store(&mut state, database, id, document);
    }

    pub fn is_subscribed(&self, database: &str, collection: &CollectionId, client: ClientId) -> bool {
        self.state
            .lock()
            .subscriptions
            .contains(&(database.to_string(), collection.clone(), client))
    }

    pub fn registered_workers(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// Announce a controller change to every registered client.
    pub fn controller_change(&self) {
        let state = self.state.lock();
        let Ok(message) = WorkerMessage::ControllerChange.encode() else {
            return;
        };
        for registration in state.workers.values() {
            let _ = registration.inbox.send(message.clone());
        }
    }

    /// Drop every worker registration, closing the clients' inboxes.
    pub fn shutdown_workers(&self) {
        self.state.lock().workers.clear();
    }

    fn store(state: &mut ServiceState, database: &str, id: &ObjectId, document: &str) {
        state.apps.insert(database.to_string());
        state
            .documents
            .insert((database.to_string(), id.clone()), document.to_string());

        let message = UpdateFrame::new(id, document)
            .and_then(|frame| frame.encode())
            .and_then(|data| WorkerMessage::Update(data).encode());
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                log::error!("Cannot encode update for {id}: {e}");
                return;
            }
        };

        let ServiceState {
            subscriptions,
            workers,
            ..
        } = state;
        for (db, collection, client) in subscriptions.iter() {
            if db != database || collection != &id.collection {
                continue;
            }
            if let Some(registration) = workers.get(client) {
                if registration.database == database {
                    let _ = registration.inbox.send(message.clone());
                }
            }
        }
    }

    /// Record the call and apply injected faults.
    fn admit(&self, endpoint: &str) -> ClientResult<Duration> {
        let mut state = self.state.lock();
        *state.calls.entry(endpoint.to_string()).or_insert(0) += 1;
        if state.offline {
            return Err(ClientError::network(format!("{endpoint}: service offline")));
        }
        if let Some(remaining) = state.failures.get_mut(endpoint) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::network(format!("{endpoint}: injected failure")));
            }
        }
        Ok(if endpoint == "get-object" {
            state.fetch_latency
        } else {
            Duration::ZERO
        })
    }

    fn handle(&self, endpoint: &str, body: &str) -> ClientResult<String> {
        let mut state = self.state.lock();
        match endpoint {
            "create-app" => {
                let request: AppRequest = parse(body)?;
                state.apps.insert(request.app_name);
                Ok(String::new())
            }
            "delete-app" => {
                let request: AppRequest = parse(body)?;
                state.apps.remove(&request.app_name);
                state.documents.retain(|(db, _), _| db != &request.app_name);
                state.subscriptions.retain(|(db, _, _)| db != &request.app_name);
                Ok(String::new())
            }
            "get-object" => {
                let request: GetObjectRequest = parse(body)?;
                let id = WireCodec::decode(&request.id)?;
                Ok(state
                    .documents
                    .get(&(request.app_name, id))
                    .map(|document| escape(document))
                    .unwrap_or_default())
            }
            "update-object" => {
                let request: UpdateObjectRequest = parse(body)?;
                let id = WireCodec::decode(&request.id)?;
                Self::store(&mut state, &request.app_name, &id, &request.document);
                Ok(String::new())
            }
            "subscribe" => {
                let request: SubscriptionRequest = parse(body)?;
                state.subscriptions.insert((
                    request.app_name,
                    request.collection_uid,
                    request.user_id,
                ));
                Ok(String::new())
            }
            "unsubscribe" => {
                let request: SubscriptionRequest = parse(body)?;
                state.subscriptions.remove(&(
                    request.app_name,
                    request.collection_uid,
                    request.user_id,
                ));
                Ok(String::new())
            }
            other => Err(ClientError::network_fatal(format!("no such endpoint: {other}"))),
        }
    }
}

fn parse<T: DeserializeOwned>(body: &str) -> ClientResult<T> {
    serde_json::from_str(body).map_err(|e| ClientError::network_fatal(format!("bad request: {e}")))
}

#[async_trait]
impl HttpClient for LoopbackService {
    async fn post_json(&self, url: &str, body: String) -> ClientResult<String> {
        let endpoint = url
            .rsplit_once("/api/")
            .map(|(_, endpoint)| endpoint)
            .ok_or_else(|| ClientError::network_fatal(format!("not an api url: {url}")))?;

        let latency = self.admit(endpoint)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.handle(endpoint, &body)
    }
}

impl ServiceWorker for LoopbackService {
    fn register(
        &self,
        handshake: &Handshake,
        inbox: mpsc::UnboundedSender<String>,
    ) -> ClientResult<()> {
        let mut state = self.state.lock();
        if state.reject_workers {
            return Err(ClientError::UnsupportedOperation("service worker registration"));
        }
        state.workers.insert(
            handshake.user_id,
            Registration {
                database: handshake.app_name.clone(),
                inbox,
            },
        );
        Ok(())
    }

    fn unregister(&self, client: ClientId) {
        self.state.lock().workers.remove(&client);
    }
}
