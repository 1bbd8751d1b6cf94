//! RemoteStoreWriter: appends heart-rate records to a session's log
//!
//! `append` returns immediately. A single writer task issues the store writes
//! in call order; outcomes come back through the receipt and are otherwise
//! only logged. Failed writes are not retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::{RemoteStore, StoreError, StorePath};
use crate::observable::Observable;
use crate::types::HeartRateRecord;

/// What the writer believes right after `append`, before any acknowledgement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriterCache {
    pub current_heart_rate: Option<f64>,
    pub is_session_active: bool,
    pub current_session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub queued: u64,
    pub written: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

enum WriteRequest {
    Append {
        path: StorePath,
        value: Value,
        done: oneshot::Sender<Result<(), StoreError>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to one queued write.
#[derive(Debug)]
pub struct AppendReceipt {
    pub key: String,
    pub path: StorePath,
    outcome: oneshot::Receiver<Result<(), StoreError>>,
}

impl AppendReceipt {
    /// Resolves when the store has accepted or rejected the write.
    pub async fn outcome(self) -> Result<(), StoreError> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(StoreError::WriteFailure("writer stopped".to_string())))
    }
}

pub struct RemoteStoreWriter {
    store: Arc<dyn RemoteStore>,
    // Key generation and enqueue happen under this lock so queue order is
    // key order.
    requests: Mutex<mpsc::UnboundedSender<WriteRequest>>,
    cache: Observable<WriterCache>,
    counters: Arc<Counters>,
}

impl RemoteStoreWriter {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn RemoteStore>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        tokio::spawn(Self::run(Arc::clone(&store), rx, Arc::clone(&counters)));

        Arc::new(Self {
            store,
            requests: Mutex::new(tx),
            cache: Observable::default(),
            counters,
        })
    }

    async fn run(
        store: Arc<dyn RemoteStore>,
        mut rx: mpsc::UnboundedReceiver<WriteRequest>,
        counters: Arc<Counters>,
    ) {
        while let Some(request) = rx.recv().await {
            match request {
                WriteRequest::Append { path, value, done } => {
                    let result = store.set_value(&path, value).await;
                    match &result {
                        Ok(()) => {
                            counters.written.fetch_add(1, Ordering::Relaxed);
                            log::debug!("[RemoteStoreWriter] Wrote {}", path);
                        }
                        Err(e) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            log::warn!("[RemoteStoreWriter] Write to {} failed: {}", path, e);
                        }
                    }
                    let _ = done.send(result);
                }
                WriteRequest::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        log::debug!("[RemoteStoreWriter] Writer task finished");
    }

    /// Queue `{heartRate, timestamp}` under a fresh push key in
    /// `sessions/{session_id}/heartRate/`.
    pub fn append(
        &self,
        session_id: &str,
        heart_rate: f64,
        timestamp: i64,
    ) -> Result<AppendReceipt, StoreError> {
        let base = StorePath::session_heart_rate(session_id)?;
        let record = HeartRateRecord {
            heart_rate,
            timestamp,
        };
        let value = serde_json::to_value(record)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let (done, outcome) = oneshot::channel();
        let (key, path) = {
            let requests = self
                .requests
                .lock()
                .map_err(|_| StoreError::WriteFailure("writer lock poisoned".to_string()))?;
            let key = self.store.push_key();
            let path = base.child(&key)?;
            requests
                .send(WriteRequest::Append {
                    path: path.clone(),
                    value,
                    done,
                })
                .map_err(|_| StoreError::WriteFailure("writer stopped".to_string()))?;
            (key, path)
        };
        self.counters.queued.fetch_add(1, Ordering::Relaxed);

        let session = session_id.to_string();
        self.cache.modify(move |cache| {
            cache.current_heart_rate = Some(heart_rate);
            cache.is_session_active = true;
            cache.current_session_id = Some(session);
        });

        Ok(AppendReceipt { key, path, outcome })
    }

    /// Resolves once every write queued before this call has finished.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        let sent = match self.requests.lock() {
            Ok(requests) => requests.send(WriteRequest::Flush(ack)).is_ok(),
            Err(_) => false,
        };
        if sent {
            let _ = done.await;
        }
    }

    pub fn mark_session_ended(&self) {
        self.cache.modify_if(|cache| {
            let changed = cache.is_session_active;
            cache.is_session_active = false;
            changed
        });
    }

    pub fn cache(&self) -> WriterCache {
        self.cache.get().unwrap_or_default()
    }

    pub fn observe(&self) -> &Observable<WriterCache> {
        &self.cache
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }
}
