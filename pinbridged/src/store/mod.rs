//! Document-store backends.
//!
//! Deployments link the cloud client behind the
//! `pinbridge_api::store::Store` trait. This tree ships the
//! in-memory backend, which backs simulator runs and every test; it
//! implements the full trait contract, including watches and
//! server-timestamp resolution.

use pinbridge_api::{store::Store, Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::time;

pub mod mem;

pub use mem::MemStore;

/// Constructs the document-store client. Cloud-backed clients
/// implement `pinbridge_api::store::Store` and are selected here when
/// linked in; this tree ships the in-memory backend.

pub async fn open() -> Result<Arc<dyn Store>> {
    Ok(Arc::new(MemStore::new()))
}

/// Bounds a store call with the configured RPC timeout. A timeout is
/// reported as `Error::Timeout` and handled by the caller's failure
/// policy like any other transient fault.

pub async fn rpc<T, F>(limit: time::Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}
