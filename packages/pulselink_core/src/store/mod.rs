//! Remote store: a hierarchical, append-only key-value log
//!
//! Samples land under `sessions/{sessionId}/heartRate/{pushKey}`. The store
//! boundary is the `RemoteStore` trait: generate a push key, write a value at
//! a path that must not already exist, and observe child-added events under a
//! path through a cancellable listener.
//!
//! Backends: `InMemoryStore` (tests, simulation), `FileStore` (durable
//! JSON-lines log), `RestStore` (HTTP realtime-database service).

pub mod file;
pub mod memory;
pub mod path;
pub mod push_id;
pub mod rest;
pub mod subscriber;
pub mod writer;

pub use file::FileStore;
pub use memory::{InMemoryStore, ObserverOp};
pub use path::StorePath;
pub use push_id::PushIdGenerator;
pub use rest::RestStore;
pub use subscriber::{RemoteStoreSubscriber, SubscriberState, SubscriberView};
pub use writer::{AppendReceipt, RemoteStoreWriter, WriterCache};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const SESSIONS_KEY: &str = "sessions";
pub const HEART_RATE_KEY: &str = "heartRate";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Write failed: {0}")]
    WriteFailure(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailure(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Identifies one registered child-added listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(Uuid);

impl ListenerHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// What a child-added listener receives.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Fired once per child: for existing children when the listener is
    /// registered, then for each newly created one.
    ChildAdded { key: String, value: Value },
    /// The backend ended the listener; no further events follow.
    Cancelled { reason: String },
}

/// A registered listener and its event stream. Dropping the receiver does
/// not unregister; call `RemoteStore::remove_observer` with the handle.
pub struct ChildSubscription {
    pub handle: ListenerHandle,
    pub events: mpsc::UnboundedReceiver<StoreEvent>,
}

/// Per-session summary for inspection tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub sample_count: usize,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// A fresh child key; keys sort in generation order.
    fn push_key(&self) -> String;

    /// Write `value` at `path`. Fails with `AlreadyExists` if the path holds
    /// data: the log never overwrites.
    async fn set_value(&self, path: &StorePath, value: Value) -> Result<(), StoreError>;

    async fn observe_child_added(&self, path: &StorePath) -> Result<ChildSubscription, StoreError>;

    async fn remove_observer(&self, handle: ListenerHandle);
}
