//! Realtime delivery of remote updates.
//!
//! Two transports, tried in order:
//! 1. a registration-based local worker ([`ServiceWorker`]) that can keep
//!    receiving pushes across reloads;
//! 2. a websocket to the service, used when no worker is available or its
//!    registration is rejected.
//!
//! ```text
//!   Disconnected ──start──► Connecting ──handshake sent──► Connected
//!        ▲                      ▲                              │
//!        │ close                │ after reconnect_delay        │ close frame / error
//!        │                      └──────── Reconnecting ◄───────┘
//! ```
//!
//! Every (re)connection sends a [`Handshake`] and then calls
//! [`RealtimeHandler::on_connected`] so the session can re-subscribe its
//! open collection. Closing the channel stops the reconnect loop for good.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::codec::{Handshake, UpdateFrame, WorkerMessage};
use crate::error::{ClientError, ClientResult};
use crate::ids::ClientId;

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Transport currently carrying the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Worker,
    WebSocket,
}

/// Local intercepting worker reachable through a message bus.
///
/// Messages on the bus are [`WorkerMessage`] envelopes in text form.
pub trait ServiceWorker: Send + Sync {
    /// Register `handshake.user_id` for pushes delivered to `inbox`.
    ///
    /// An error means the worker is unavailable or refused the registration;
    /// the channel then falls back to the websocket.
    fn register(&self, handshake: &Handshake, inbox: mpsc::UnboundedSender<String>)
        -> ClientResult<()>;

    fn unregister(&self, client: ClientId);
}

/// Receiver of channel events, implemented by the session.
pub trait RealtimeHandler: Send + Sync {
    /// A remote update arrived.
    fn on_frame(&self, frame: UpdateFrame);

    /// The channel (re)connected; subscriptions should be re-issued.
    fn on_connected(&self, transport: TransportKind);

    /// A new worker took control of the bus; subscriptions must be refreshed.
    fn on_controller_change(&self);
}

/// Everything the channel task needs to run.
pub struct ChannelParams {
    pub database: String,
    pub client_id: ClientId,
    pub websocket_url: String,
    pub reconnect_delay: Duration,
    pub worker: Option<Arc<dyn ServiceWorker>>,
    pub handler: Arc<dyn RealtimeHandler>,
}

/// Handle on a running realtime channel. Dropping it closes the channel.
pub struct RealtimeChannel {
    state: Arc<Mutex<ConnectionState>>,
    transport: Arc<Mutex<Option<TransportKind>>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// How a single websocket session ended.
enum SessionEnd {
    Shutdown,
    Closed,
}

/// Shared state written by the channel task.
#[derive(Clone)]
struct Status {
    state: Arc<Mutex<ConnectionState>>,
    transport: Arc<Mutex<Option<TransportKind>>>,
    shutdown: watch::Receiver<bool>,
}

impl Status {
    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set(&self, state: ConnectionState, transport: Option<TransportKind>) {
        // Checked under the state lock, which `close` holds while signalling:
        // once closed, the handle owns the final state.
        let mut current = self.state.lock();
        if self.is_shutdown() {
            return;
        }
        *current = state;
        *self.transport.lock() = transport;
    }
}

impl RealtimeChannel {
    /// Spawn the channel task on `runtime`.
    pub fn start(params: ChannelParams, runtime: &Handle) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
        let transport = Arc::new(Mutex::new(None));
        let status = Status {
            state: state.clone(),
            transport: transport.clone(),
            shutdown: shutdown_rx,
        };

        let task = runtime.spawn(run(params, status));
        Self {
            state,
            transport,
            shutdown,
            task,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn transport(&self) -> Option<TransportKind> {
        *self.transport.lock()
    }

    /// Stop the channel. No reconnect happens after this returns.
    pub fn close(&mut self) {
        if *self.shutdown.borrow() {
            return;
        }
        // The task exits at its next await point, releasing the worker
        // registration or the socket itself.
        let mut state = self.state.lock();
        let _ = self.shutdown.send(true);
        *state = ConnectionState::Disconnected;
        *self.transport.lock() = None;
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(params: ChannelParams, status: Status) {
    let handshake = Handshake {
        app_name: params.database.clone(),
        user_id: params.client_id,
    };

    if let Some(worker) = params.worker.clone() {
        status.set(ConnectionState::Connecting, None);
        let (inbox, messages) = mpsc::unbounded_channel();
        match worker.register(&handshake, inbox) {
            Ok(()) => {
                log::info!("Realtime channel registered with service worker");
                status.set(ConnectionState::Connected, Some(TransportKind::Worker));
                params.handler.on_connected(TransportKind::Worker);
                let shut_down = run_worker(messages, &params, status.clone()).await;
                worker.unregister(params.client_id);
                if shut_down {
                    status.set(ConnectionState::Disconnected, None);
                    return;
                }
                log::warn!("Service worker went away, falling back to websocket");
            }
            Err(e) => {
                log::info!("Service worker registration rejected ({e}), using websocket");
            }
        }
    }

    run_websocket(&params, &handshake, status.clone()).await;
    status.set(ConnectionState::Disconnected, None);
}

/// Pump worker bus messages. Returns true on shutdown, false if the bus closed.
async fn run_worker(
    mut messages: mpsc::UnboundedReceiver<String>,
    params: &ChannelParams,
    mut status: Status,
) -> bool {
    loop {
        tokio::select! {
            changed = status.shutdown.changed() => {
                if changed.is_err() || status.is_shutdown() {
                    return true;
                }
            }
            message = messages.recv() => {
                let Some(text) = message else {
                    return false;
                };
                match WorkerMessage::decode(&text) {
                    Ok(WorkerMessage::Update(data)) => match UpdateFrame::decode(&data) {
                        Ok(frame) => params.handler.on_frame(frame),
                        Err(e) => log::error!("Dropping worker update: {e}"),
                    },
                    Ok(WorkerMessage::ControllerChange) => {
                        log::info!("Service worker controller changed, refreshing subscriptions");
                        params.handler.on_controller_change();
                    }
                    Err(e) => log::error!("Unknown message from service worker: {e}"),
                }
            }
        }
    }
}

async fn run_websocket(params: &ChannelParams, handshake: &Handshake, status: Status) {
    let mut first = true;
    loop {
        if status.is_shutdown() {
            return;
        }
        let state = if first {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        status.set(state, None);
        first = false;

        match connect_once(params, handshake, status.clone()).await {
            Ok(SessionEnd::Shutdown) => return,
            Ok(SessionEnd::Closed) => {
                log::info!("Realtime websocket closed by server");
            }
            Err(e) => {
                log::warn!("Realtime websocket failed: {e}");
            }
        }

        status.set(ConnectionState::Reconnecting, None);
        let mut shutdown = status.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(params.reconnect_delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn connect_once(
    params: &ChannelParams,
    handshake: &Handshake,
    mut status: Status,
) -> ClientResult<SessionEnd> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(params.websocket_url.as_str())
        .await
        .map_err(|e| ClientError::network(format!("connect {}: {e}", params.websocket_url)))?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let hello = serde_json::to_string(handshake)?;
    ws_writer
        .send(Message::Text(hello.into()))
        .await
        .map_err(|e| ClientError::network(format!("handshake: {e}")))?;

    log::info!("Realtime websocket connected to {}", params.websocket_url);
    status.set(ConnectionState::Connected, Some(TransportKind::WebSocket));
    params.handler.on_connected(TransportKind::WebSocket);

    loop {
        tokio::select! {
            changed = status.shutdown.changed() => {
                if changed.is_err() || status.is_shutdown() {
                    let _ = ws_writer.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match UpdateFrame::decode(text.as_str()) {
                        Ok(frame) => params.handler.on_frame(frame),
                        Err(e) => log::error!("Dropping websocket update: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                    // Control frames are answered by tungstenite itself.
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(other)) => {
                        return Err(ClientError::Protocol(format!(
                            "unexpected frame type: {other:?}"
                        )));
                    }
                    Some(Err(e)) => return Err(ClientError::network(e.to_string())),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ObjectId;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<UpdateFrame>>,
        connects: Mutex<Vec<TransportKind>>,
        controller_changes: Mutex<u32>,
    }

    impl RealtimeHandler for Recorder {
        fn on_frame(&self, frame: UpdateFrame) {
            self.frames.lock().push(frame);
        }

        fn on_connected(&self, transport: TransportKind) {
            self.connects.lock().push(transport);
        }

        fn on_controller_change(&self) {
            *self.controller_changes.lock() += 1;
        }
    }

    /// Worker that accepts registration and hands the inbox to the test.
    #[derive(Default)]
    struct TestWorker {
        reject: bool,
        inbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
        unregistered: Mutex<Vec<ClientId>>,
    }

    impl ServiceWorker for TestWorker {
        fn register(
            &self,
            _handshake: &Handshake,
            inbox: mpsc::UnboundedSender<String>,
        ) -> ClientResult<()> {
            if self.reject {
                return Err(ClientError::UnsupportedOperation("service worker"));
            }
            *self.inbox.lock() = Some(inbox);
            Ok(())
        }

        fn unregister(&self, client: ClientId) {
            self.unregistered.lock().push(client);
        }
    }

    fn params(worker: Option<Arc<dyn ServiceWorker>>, handler: Arc<Recorder>) -> ChannelParams {
        ChannelParams {
            database: "db".into(),
            client_id: ClientId::generate(),
            // Nothing listens here; websocket attempts fail fast.
            websocket_url: "ws://127.0.0.1:9/".into(),
            reconnect_delay: Duration::from_millis(20),
            worker,
            handler,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_worker_delivers_updates() {
        let worker = Arc::new(TestWorker::default());
        let handler = Arc::new(Recorder::default());
        let mut channel = RealtimeChannel::start(
            params(Some(worker.clone()), handler.clone()),
            &Handle::current(),
        );
        settle().await;

        assert_eq!(channel.state(), ConnectionState::Connected);
        assert_eq!(channel.transport(), Some(TransportKind::Worker));
        assert_eq!(*handler.connects.lock(), vec![TransportKind::Worker]);

        let id = ObjectId::new("c".into(), "PNCounter", "x");
        let frame = UpdateFrame::new(&id, "{}").unwrap();
        let inbox = worker.inbox.lock().clone().unwrap();
        inbox
            .send(WorkerMessage::Update(frame.encode().unwrap()).encode().unwrap())
            .unwrap();
        inbox
            .send(WorkerMessage::ControllerChange.encode().unwrap())
            .unwrap();
        inbox.send("{\"type\":\"bogus\"}".into()).unwrap();
        settle().await;

        assert_eq!(handler.frames.lock().len(), 1);
        assert_eq!(handler.frames.lock()[0].object_id().unwrap(), id);
        assert_eq!(*handler.controller_changes.lock(), 1);

        channel.close();
        settle().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(worker.unregistered.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_stays_disconnected_after_close() {
        for _ in 0..50 {
            let worker = Arc::new(TestWorker::default());
            let handler = Arc::new(Recorder::default());
            let mut channel =
                RealtimeChannel::start(params(Some(worker), handler), &Handle::current());
            tokio::task::yield_now().await;
            channel.close();
            assert_eq!(channel.state(), ConnectionState::Disconnected);

            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(channel.state(), ConnectionState::Disconnected);
            assert_eq!(channel.transport(), None);
        }
    }

    #[test]
    fn test_status_ignores_writes_after_shutdown() {
        let (shutdown, receiver) = watch::channel(false);
        let status = Status {
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            transport: Arc::new(Mutex::new(None)),
            shutdown: receiver,
        };
        status.set(ConnectionState::Connected, Some(TransportKind::Worker));
        assert_eq!(*status.state.lock(), ConnectionState::Connected);

        shutdown.send(true).unwrap();
        status.set(ConnectionState::Reconnecting, Some(TransportKind::WebSocket));
        assert_eq!(*status.state.lock(), ConnectionState::Connected);
        assert_eq!(*status.transport.lock(), Some(TransportKind::Worker));
    }

    #[tokio::test]
    async fn test_rejected_worker_falls_back_to_websocket() {
        let worker = Arc::new(TestWorker {
            reject: true,
            ..Default::default()
        });
        let handler = Arc::new(Recorder::default());
        let mut channel =
            RealtimeChannel::start(params(Some(worker), handler.clone()), &Handle::current());
        settle().await;

        // No server: the websocket keeps cycling through reconnects.
        assert!(matches!(
            channel.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ));
        assert!(handler.connects.lock().is_empty());

        channel.close();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(channel.is_finished());
    }
}
