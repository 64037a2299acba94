//! Integration tests for the realtime channel.
//!
//! A small websocket server runs inside each test and hands every accepted
//! connection (with the handshake it received) back to the test, which then
//! drives frames into it.

use concordant_client::{
    ClientConfig, ConnectionState, ConsistencyLevel, Coordinator, Handshake, LoopbackService,
    ObjectId, PNCounter, ReplicatedObject, RetryPolicy, Session, TransportKind, UpdateFrame,
    ClientId, ClockEnvironment,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

type Connection = (Handshake, mpsc::UnboundedSender<Message>);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Start a websocket server on a free port.
async fn start_ws_server() -> (u16, mpsc::UnboundedReceiver<Connection>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let conn_tx = conn_tx.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut writer, mut reader) = ws.split();
                let handshake: Handshake = match reader.next().await {
                    Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str()).unwrap(),
                    other => panic!("expected handshake, got {other:?}"),
                };

                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
                let _ = conn_tx.send((handshake, out_tx));
                loop {
                    tokio::select! {
                        outgoing = out_rx.recv() => match outgoing {
                            Some(msg) => {
                                let closing = matches!(msg, Message::Close(_));
                                if writer.send(msg).await.is_err() || closing {
                                    break;
                                }
                            }
                            None => break,
                        },
                        incoming = reader.next() => match incoming {
                            Some(Ok(_)) => {}
                            _ => break,
                        },
                    }
                }
            });
        }
    });
    (port, conn_rx)
}

async fn next_connection(conns: &mut mpsc::UnboundedReceiver<Connection>) -> Connection {
    timeout(Duration::from_secs(5), conns.recv())
        .await
        .expect("no connection within 5s")
        .expect("server stopped")
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn websocket_session(service: &Arc<LoopbackService>, port: u16) -> Session {
    let config = ClientConfig::new("db", "http://127.0.0.1:4000")
        .with_websocket(port, "/")
        .with_retry(RetryPolicy::fast())
        .with_reconnect_delay(Duration::from_millis(50))
        .without_service_worker();
    Session::builder(config)
        .http_client(service.clone())
        .service_worker(service.clone())
        .connect(&Arc::new(Coordinator::new()))
        .unwrap()
}

fn remote_increment(amount: u64) -> String {
    let clock = ClockEnvironment::new(ClientId::generate());
    let mut counter = PNCounter::default();
    counter.increment(amount, clock.tick());
    counter.to_wire().unwrap()
}

fn text_frame(id: &ObjectId, document: String) -> Message {
    let frame = UpdateFrame::new(id, document).unwrap();
    Message::Text(frame.encode().unwrap().into())
}

#[tokio::test]
async fn test_websocket_handshake_and_updates() {
    init_logging();
    let (port, mut conns) = start_ws_server().await;
    let service = Arc::new(LoopbackService::new());
    let session = websocket_session(&service, port);

    let collection = session.open_collection("c", false).unwrap();
    let counter = collection.open("x", "PNCounter", false, None).unwrap();
    let (handshake, out) = next_connection(&mut conns).await;
    assert_eq!(handshake.app_name, "db");
    assert_eq!(handshake.user_id, session.client_id());
    wait_for("connected", || {
        session.realtime_state() == Some(ConnectionState::Connected)
    })
    .await;
    assert_eq!(session.realtime_transport(), Some(TransportKind::WebSocket));
    // Worker is configured but disabled.
    assert_eq!(service.registered_workers(), 0);

    let id = session.get_object_uid(&counter).unwrap();
    out.send(text_frame(&id, remote_increment(5))).unwrap();
    out.send(Message::Text("not a frame".to_string().into())).unwrap();
    wait_for("buffered update", || collection.pending_updates() == 1).await;

    collection.pull(ConsistencyLevel::None).unwrap();
    assert_eq!(counter.read(|c: &PNCounter| c.get()).unwrap(), 5);
    // Undecodable text is dropped without tearing down the connection.
    assert_eq!(session.realtime_state(), Some(ConnectionState::Connected));
}

#[tokio::test]
async fn test_reconnects_after_server_close() {
    init_logging();
    let (port, mut conns) = start_ws_server().await;
    let service = Arc::new(LoopbackService::new());
    let session = websocket_session(&service, port);
    let collection = session.open_collection("c", false).unwrap();

    let (_, out) = next_connection(&mut conns).await;
    let subscribes = service.call_count("subscribe");
    out.send(Message::Close(None)).unwrap();

    let (handshake, _out) = next_connection(&mut conns).await;
    assert_eq!(handshake.user_id, session.client_id());
    wait_for("connected again", || {
        session.realtime_state() == Some(ConnectionState::Connected)
    })
    .await;

    // Subscriptions are re-issued on every reconnect.
    wait_for("re-subscribe", || service.call_count("subscribe") > subscribes).await;
    assert!(service.is_subscribed("db", collection.id(), session.client_id()));
}

#[tokio::test]
async fn test_binary_frame_is_a_protocol_violation() {
    init_logging();
    let (port, mut conns) = start_ws_server().await;
    let service = Arc::new(LoopbackService::new());
    let session = websocket_session(&service, port);
    let collection = session.open_collection("c", false).unwrap();
    let counter = collection.open("x", "PNCounter", false, None).unwrap();
    let id = session.get_object_uid(&counter).unwrap();

    let (_, out) = next_connection(&mut conns).await;
    out.send(Message::Binary(vec![1u8, 2, 3].into())).unwrap();

    // The connection is torn down and a fresh one is made.
    let (_, out) = next_connection(&mut conns).await;
    out.send(text_frame(&id, remote_increment(2))).unwrap();
    wait_for("update after reconnect", || collection.pending_updates() == 1).await;
}

#[tokio::test]
async fn test_close_stops_reconnecting() {
    init_logging();
    let (port, mut conns) = start_ws_server().await;
    let service = Arc::new(LoopbackService::new());
    let session = websocket_session(&service, port);
    let collection = session.open_collection("c", false).unwrap();
    let (_, _out) = next_connection(&mut conns).await;

    collection.close();
    assert_eq!(session.realtime_state(), None);
    assert!(timeout(Duration::from_millis(300), conns.recv()).await.is_err());

    // A new collection starts a new channel.
    session.open_collection("d", false).unwrap();
    let (handshake, _out) = next_connection(&mut conns).await;
    assert_eq!(handshake.user_id, session.client_id());
}

#[tokio::test]
async fn test_unreachable_server_keeps_retrying() {
    init_logging();
    // Bind and drop to get a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let service = Arc::new(LoopbackService::new());
    let session = websocket_session(&service, port);
    session.open_collection("c", false).unwrap();

    wait_for("reconnecting", || {
        session.realtime_state() == Some(ConnectionState::Reconnecting)
    })
    .await;
    assert_eq!(session.realtime_transport(), None);
}

#[tokio::test]
async fn test_worker_rejection_falls_back_to_websocket() {
    init_logging();
    let (port, mut conns) = start_ws_server().await;
    let service = Arc::new(LoopbackService::new());
    service.set_reject_workers(true);

    let config = ClientConfig::new("db", "http://127.0.0.1:4000")
        .with_websocket(port, "/")
        .with_retry(RetryPolicy::fast())
        .with_reconnect_delay(Duration::from_millis(50));
    let session = Session::builder(config)
        .http_client(service.clone())
        .service_worker(service.clone())
        .connect(&Arc::new(Coordinator::new()))
        .unwrap();
    session.open_collection("c", false).unwrap();

    let (handshake, _out) = next_connection(&mut conns).await;
    assert_eq!(handshake.user_id, session.client_id());
    wait_for("websocket transport", || {
        session.realtime_transport() == Some(TransportKind::WebSocket)
    })
    .await;
}

#[tokio::test]
async fn test_worker_controller_change_refreshes_subscription() {
    init_logging();
    let service = Arc::new(LoopbackService::new());
    let config = ClientConfig::new("db", "http://127.0.0.1:4000")
        .with_retry(RetryPolicy::fast())
        .with_reconnect_delay(Duration::from_millis(50));
    let session = Session::builder(config)
        .http_client(service.clone())
        .service_worker(service.clone())
        .connect(&Arc::new(Coordinator::new()))
        .unwrap();
    let collection = session.open_collection("c", false).unwrap();
    wait_for("worker transport", || {
        session.realtime_transport() == Some(TransportKind::Worker)
    })
    .await;

    service.controller_change();
    wait_for("unsubscribe + subscribe", || service.call_count("unsubscribe") == 1).await;
    wait_for("subscribed", || {
        service.is_subscribed("db", collection.id(), session.client_id())
    })
    .await;
}

#[tokio::test]
async fn test_lost_worker_falls_back_to_websocket() {
    init_logging();
    let (port, mut conns) = start_ws_server().await;
    let service = Arc::new(LoopbackService::new());
    let config = ClientConfig::new("db", "http://127.0.0.1:4000")
        .with_websocket(port, "/")
        .with_retry(RetryPolicy::fast())
        .with_reconnect_delay(Duration::from_millis(50));
    let session = Session::builder(config)
        .http_client(service.clone())
        .service_worker(service.clone())
        .connect(&Arc::new(Coordinator::new()))
        .unwrap();
    session.open_collection("c", false).unwrap();
    wait_for("worker transport", || {
        session.realtime_transport() == Some(TransportKind::Worker)
    })
    .await;

    service.shutdown_workers();
    let (handshake, _out) = next_connection(&mut conns).await;
    assert_eq!(handshake.user_id, session.client_id());
}
