//! Wire codec for the remote service and the realtime channel.
//!
//! HTTP bodies are JSON. Object documents travel inside them as strings that
//! have already been serialized once, so the service sees a double-encoded
//! payload:
//! ```text
//! {"appName":"db","id":"{\"collectionUId\":\"c\",...}","document":"{\"inc\":{...}}"}
//!                        └──── WireCodec::encode ────┘             └─ escape ─┘
//! ```
//! On push the body serializer performs the [`escape`] step: a `String`
//! field is written as exactly `escape(document)`. `get-object` answers with
//! the escaped document alone, which [`unescape`] turns back into the exact
//! bytes that were pushed.
//!
//! Realtime frames reuse the `update-object` shape (`id` + `document`);
//! worker bus messages wrap a frame in a `{"type":"update","data":...}`
//! envelope.

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};
use crate::ids::{ClientId, CollectionId, ObjectId};

/// Encodes object identifiers for transport.
pub struct WireCodec;

impl WireCodec {
    /// Serialize an identifier to its transport string.
    pub fn encode(id: &ObjectId) -> ClientResult<String> {
        Ok(serde_json::to_string(id)?)
    }

    /// Parse an identifier from its transport string.
    pub fn decode(encoded: &str) -> ClientResult<ObjectId> {
        Ok(serde_json::from_str(encoded)?)
    }
}

/// Escape a payload into a quoted string literal.
pub fn escape(payload: &str) -> String {
    serde_json::Value::String(payload.to_owned()).to_string()
}

/// Exact inverse of [`escape`].
pub fn unescape(escaped: &str) -> ClientResult<String> {
    serde_json::from_str::<String>(escaped.trim())
        .map_err(|e| ClientError::Codec(format!("invalid escaped payload: {e}")))
}

/// Body of `create-app` and `delete-app`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRequest {
    pub app_name: String,
}

/// Body of `get-object`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetObjectRequest {
    pub app_name: String,
    pub id: String,
}

/// Body of `update-object`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateObjectRequest {
    pub app_name: String,
    pub id: String,
    pub document: String,
}

/// Body of `subscribe` and `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub app_name: String,
    #[serde(rename = "collectionUId")]
    pub collection_uid: CollectionId,
    pub user_id: ClientId,
}

/// First frame sent on every realtime (re)connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub app_name: String,
    pub user_id: ClientId,
}

/// A remote update pushed over the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFrame {
    /// Identifier encoded with [`WireCodec`].
    pub id: String,
    /// Object wire format.
    pub document: String,
}

impl UpdateFrame {
    pub fn new(id: &ObjectId, document: impl Into<String>) -> ClientResult<Self> {
        Ok(Self {
            id: WireCodec::encode(id)?,
            document: document.into(),
        })
    }

    pub fn encode(&self) -> ClientResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> ClientResult<Self> {
        serde_json::from_str(text).map_err(|e| ClientError::Protocol(format!("bad frame: {e}")))
    }

    /// Decoded object identifier.
    pub fn object_id(&self) -> ClientResult<ObjectId> {
        WireCodec::decode(&self.id)
    }
}

/// Envelope on the local worker bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// `data` is an [`UpdateFrame`] in text form.
    Update(String),
    /// A new worker took control; subscriptions must be refreshed.
    ControllerChange,
}

impl WorkerMessage {
    pub fn encode(&self) -> ClientResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> ClientResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| ClientError::Protocol(format!("unknown worker message: {e}")))
    }
}
