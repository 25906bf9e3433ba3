//! Primitivas de coordenação distribuída sobre um [`KeyValueStore`]:
//! locks com lease, caches com TTL, filas com atraso e retentativa e
//! marcadores de debounce.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stormsync_coord::{Client, LockConfig};
//! use stormsync_storage::MemoryStore;
//!
//! # async fn demo() -> stormsync_coord::SyncResult<()> {
//! let client = Client::new(Arc::new(MemoryStore::new()));
//! let lock = client.lock("report", LockConfig::default());
//! lock.run_exclusive(|| async { /* seção crítica */ }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`KeyValueStore`]: stormsync_storage::KeyValueStore

#![forbid(unsafe_code)]

mod cache;
mod client;
mod codec;
mod config;
mod lock;
mod marker;
mod names;
mod queue;
mod task;
mod time;

pub use cache::Cache;
pub use client::Client;
pub use codec::{Codec, JsonCodec, RawCodec};
pub use config::{
    CacheConfig, ClientConfig, DEFAULT_MARKER_MAP, ErrorHandler, LockConfig, QueueConfig, Retry,
};
pub use lock::Lock;
pub use marker::Markers;
pub use names::Kind;
pub use queue::Queue;
pub use task::{RefreshHandle, WorkerHandle};

pub use stormsync_common::{CodecError, SyncError, SyncResult};
