//! An in-memory document store.
//!
//! Documents are kept in a flat map keyed by their full path. Watches
//! are lists of channel senders that receive fresh snapshots on every
//! mutation. The semantics mirror the remote store: merges are deep,
//! partial updates address nested fields with dotted paths, and
//! timestamp sentinels are resolved with the store's clock when the
//! write is applied.

use async_trait::async_trait;
use pinbridge_api::{
    store::{ChangeKind, DocChange, Store, SERVER_TS},
    Error, Result,
};
use serde_json::{json, Map, Value};
use std::collections::{hash_map, HashMap};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};
use tokio::sync::mpsc;
use tracing::warn;

const CHAN_SIZE: usize = 64;

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Value>,
    doc_watchers: HashMap<String, Vec<mpsc::Sender<Value>>>,
    coll_watchers: HashMap<String, Vec<mpsc::Sender<DocChange>>>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,

    // When non-zero, the next writes fail with a transient error.
    // Lets tests exercise the per-component retry policies.
    fail_writes: AtomicUsize,
}

// Splits "devices/abc/commands/c1" into ("devices/abc/commands", "c1").

fn split_parent(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once('/')
}

// Replaces every server-timestamp sentinel in the value tree with the
// current time.

fn resolve_server_ts(v: &mut Value) {
    match v {
        Value::String(s) if s == SERVER_TS => {
            *v = Value::String(chrono::Utc::now().to_rfc3339())
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                resolve_server_ts(v)
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                resolve_server_ts(v)
            }
        }
        _ => (),
    }
}

// Deep-merges `src` into `dst`. Maps merge recursively; everything
// else overwrites.

fn merge_into(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst), Value::Object(src)) => {
            for (k, v) in src {
                match dst.get_mut(&k) {
                    Some(slot) => merge_into(slot, v),
                    None => {
                        dst.insert(k, v);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

// Writes `value` at a dotted field path, creating intermediate maps.

fn apply_field(doc: &mut Value, dotted: &str, value: Value) {
    let mut slot = doc;

    for key in dotted.split('.') {
        if !slot.is_object() {
            *slot = Value::Object(Map::new())
        }

        slot = slot
            .as_object_mut()
            .unwrap()
            .entry(String::from(key))
            .or_insert(Value::Null)
    }
    *slot = value
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    /// Makes the next `count` write operations fail with a transient
    /// error.

    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<()> {
        let remaining = self.fail_writes.load(Ordering::SeqCst);

        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            Err(Error::TransientRpc(String::from("injected write failure")))
        } else {
            Ok(())
        }
    }

    // Notifies doc and collection watchers after a mutation. Closed
    // receivers are pruned; a full channel drops the event, which
    // matches the lossy snapshot semantics of the remote client.

    fn notify(inner: &mut Inner, path: &str, kind: ChangeKind) {
        let doc = inner.docs.get(path).cloned().unwrap_or_else(|| json!({}));

        if let Some(watchers) = inner.doc_watchers.get_mut(path) {
            watchers.retain(|tx| match tx.try_send(doc.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("snapshot watcher for {} is lagging", path);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }

        if let Some((parent, id)) = split_parent(path) {
            if let Some(watchers) = inner.coll_watchers.get_mut(parent) {
                let change = DocChange {
                    kind,
                    id: String::from(id),
                    doc,
                };

                watchers.retain(|tx| match tx.try_send(change.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("collection watcher for {} is lagging", parent);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn set(&self, path: &str, doc: Value, merge: bool) -> Result<()> {
        self.check_write()?;

        let mut doc = doc;

        resolve_server_ts(&mut doc);

        let mut inner = self.inner.lock().unwrap();
        let kind = match inner.docs.entry(String::from(path)) {
            hash_map::Entry::Occupied(mut existing) => {
                if merge {
                    merge_into(existing.get_mut(), doc)
                } else {
                    *existing.get_mut() = doc
                }
                ChangeKind::Modified
            }
            hash_map::Entry::Vacant(slot) => {
                slot.insert(doc);
                ChangeKind::Added
            }
        };

        MemStore::notify(&mut inner, path, kind);
        Ok(())
    }

    async fn update(&self, path: &str, fields: Value) -> Result<()> {
        self.check_write()?;

        let mut fields = fields;

        resolve_server_ts(&mut fields);

        let fields = match fields {
            Value::Object(map) => map,
            _ => {
                return Err(Error::Schema(String::from(
                    "update payload should be a map",
                )))
            }
        };

        let mut inner = self.inner.lock().unwrap();

        match inner.docs.get_mut(path) {
            Some(doc) => {
                for (dotted, value) in fields {
                    apply_field(doc, &dotted, value)
                }

                MemStore::notify(&mut inner, path, ChangeKind::Modified);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.inner.lock().unwrap().docs.get(path).cloned())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_write()?;

        let mut inner = self.inner.lock().unwrap();

        if inner.docs.remove(path).is_some() {
            MemStore::notify(&mut inner, path, ChangeKind::Removed);
        }
        Ok(())
    }

    async fn watch_doc(&self, path: &str) -> Result<mpsc::Receiver<Value>> {
        let (tx, rx) = mpsc::channel(CHAN_SIZE);
        let mut inner = self.inner.lock().unwrap();

        // The current contents are the first snapshot; a missing
        // document is delivered as an empty one.

        let doc = inner.docs.get(path).cloned().unwrap_or_else(|| json!({}));

        let _ = tx.try_send(doc);

        inner
            .doc_watchers
            .entry(String::from(path))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn watch_collection(
        &self,
        path: &str,
    ) -> Result<mpsc::Receiver<DocChange>> {
        let (tx, rx) = mpsc::channel(CHAN_SIZE);
        let mut inner = self.inner.lock().unwrap();

        // Existing direct children are delivered up front as Added
        // events, in path order for determinism.

        let prefix = format!("{}/", path);
        let mut existing: Vec<(String, Value)> = inner
            .docs
            .iter()
            .filter_map(|(p, doc)| {
                let id = p.strip_prefix(&prefix)?;

                if id.contains('/') {
                    None
                } else {
                    Some((String::from(id), doc.clone()))
                }
            })
            .collect();

        existing.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, doc) in existing {
            let _ = tx.try_send(DocChange {
                kind: ChangeKind::Added,
                id,
                doc,
            });
        }

        inner
            .coll_watchers
            .entry(String::from(path))
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
