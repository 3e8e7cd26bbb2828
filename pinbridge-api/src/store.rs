//! The document-store seam.
//!
//! The controller's entire control surface is a set of documents in a
//! remote store; this trait is everything it needs from that store.
//! Documents are `serde_json::Value` maps. Partial updates address
//! nested fields with dotted paths (`gpioState.17.hardware_state`),
//! the way the remote store does.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::Result;

/// Kind of change delivered for a document in a watched collection.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change event from a collection watch.

#[derive(Debug, Clone)]
pub struct DocChange {
    pub kind: ChangeKind,
    /// Document id within the collection.
    pub id: String,
    /// The document body. Empty map for `Removed`.
    pub doc: Value,
}

/// Sentinel written in place of a timestamp field; the store backend
/// replaces it with its own clock when the write is applied. The
/// controller never stamps documents from its local clock.

pub const SERVER_TS: &str = "__server_timestamp__";

/// Convenience for building update payloads with a server-resolved
/// timestamp field.

pub fn server_timestamp() -> Value {
    Value::String(String::from(SERVER_TS))
}

/// Client contract with the remote document store. The connection is
/// shared and internally thread-safe; reconnection with backoff is
/// the client's job, so a watch channel that ends means the
/// subscription is gone and must be re-established by the caller.

#[async_trait]
pub trait Store: Send + Sync {
    /// Writes a whole document. With `merge` set, unspecified fields
    /// of an existing document are preserved.
    async fn set(&self, path: &str, doc: Value, merge: bool) -> Result<()>;

    /// Applies a partial update. `fields` is a flat map whose keys
    /// are dotted field paths.
    async fn update(&self, path: &str, fields: Value) -> Result<()>;

    /// Fetches one document. `None` if it doesn't exist.
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Deletes one document. Deleting a missing document is not an
    /// error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Subscribes to a single document. The current contents are
    /// delivered as the first item, then every subsequent snapshot.
    async fn watch_doc(&self, path: &str) -> Result<mpsc::Receiver<Value>>;

    /// Subscribes to a collection. Existing documents are delivered
    /// first as `Added` events, then live changes follow.
    async fn watch_collection(
        &self,
        path: &str,
    ) -> Result<mpsc::Receiver<DocChange>>;
}

/// Path of the device document for a given hardware serial.

pub fn device_doc(serial: &str) -> String {
    format!("devices/{}", serial)
}

/// Path of the commands subcollection for a given hardware serial.

pub fn commands_path(serial: &str) -> String {
    format!("devices/{}/commands", serial)
}

/// Path of one command-response document.

pub fn response_doc(serial: &str, cmd_id: &str) -> String {
    format!("devices/{}/responses/{}", serial, cmd_id)
}
