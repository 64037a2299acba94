//! # concordant-client: Client-side sync engine for replicated objects
//!
//! Keeps a local cache of CRDT objects in step with a remote document
//! service over HTTP, with remote changes streamed back in realtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  transaction()   ┌──────────────┐   update-object   ┌─────────────┐
//! │   Session   │ ───────────────► │NetworkAdapter│ ────────────────► │   Service   │
//! │ (per client)│                  │ (retry, coal)│ ◄──────────────── │   (HTTP)    │
//! └──────┬──────┘                  └──────┬───────┘    get-object     └──────┬──────┘
//!        │ open_collection                │ deliver                          │
//!        ▼                                ▼                                  │
//! ┌─────────────┐   pull()   ┌───────────────────┐  UpdateFrame  ┌───────────┴─────┐
//! │ ObjectRef*  │ ◄───────── │ Collection        │ ◄──────────── │ RealtimeChannel │
//! │ (cached)    │            │ (pending deltas)  │               │ (worker / ws)   │
//! └─────────────┘            └───────────────────┘               └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Session lifecycle, transactions, the coordinator
//! - [`collection`]: Object cache, buffered remote updates, pull
//! - [`transaction`]: Dirty tracking and commit
//! - [`adapter`]: HTTP calls with fetch coalescing and durable pushes
//! - [`realtime`]: Worker bus / websocket channel with reconnect
//! - [`crdt`]: Replicated object contract, registry, bundled types
//! - [`codec`]: Wire formats and payload escaping
//! - [`loopback`]: In-process service for tests and offline use
//!
//! ## Example
//!
//! ```no_run
//! use concordant_client::{ClientConfig, ConsistencyLevel, Coordinator, PNCounter, Session};
//!
//! # async fn demo() -> concordant_client::ClientResult<()> {
//! let session = Session::connect(&Coordinator::global(), ClientConfig::new("mydb", "http://127.0.0.1:4000"))?;
//! let collection = session.open_collection("mycollection", false)?;
//! let counter = collection.open("mycounter", "PNCounter", false, None)?;
//!
//! session.transaction(ConsistencyLevel::None, |tx| {
//!     counter.write(tx, |c: &mut PNCounter, ts| c.increment(12, ts))
//! })?;
//! session.flush().await;
//! session.close();
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod clock;
pub mod codec;
pub mod collection;
pub mod config;
pub mod crdt;
pub mod error;
pub mod http;
pub mod ids;
pub mod loopback;
pub mod realtime;
pub mod session;
pub mod transaction;

// Re-exports for convenience
pub use adapter::{AdapterStats, FetchState, NetworkAdapter, UpdateSink};
pub use clock::ClockEnvironment;
pub use codec::{escape, unescape, Handshake, UpdateFrame, WireCodec, WorkerMessage};
pub use collection::{Collection, ConsistencyLevel, NotificationHandler, ObjectRef};
pub use config::{ClientConfig, RetryPolicy, DEFAULT_WEBSOCKET_PORT};
pub use crdt::{Crdt, CrdtRegistry, LwwRegister, PNCounter, ReplicatedObject};
pub use error::{ClientError, ClientResult};
pub use http::{HttpClient, ReqwestClient};
pub use ids::{ClientId, CollectionId, ObjectId, Timestamp};
pub use loopback::LoopbackService;
pub use realtime::{ConnectionState, RealtimeChannel, RealtimeHandler, ServiceWorker, TransportKind};
pub use session::{Coordinator, Session, SessionBuilder};
pub use transaction::Transaction;
