//! Remote store over a realtime-database REST API
//!
//! Writes are `PUT {base}/{path}.json`. Child-added listeners hold a
//! streaming `GET` with `Accept: text/event-stream`; the server sends `put`
//! and `patch` events carrying `{"path": ..., "data": ...}`, plus
//! `keep-alive`, `cancel` and `auth_revoked`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    ChildSubscription, ListenerHandle, PushIdGenerator, RemoteStore, StoreError, StoreEvent,
    StorePath,
};

pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    auth: Option<String>,
    push_ids: PushIdGenerator,
    observers: Mutex<HashMap<ListenerHandle, JoinHandle<()>>>,
}

impl RestStore {
    pub fn new(base_url: &str, auth: Option<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| StoreError::IoError(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            push_ids: PushIdGenerator::new(),
            observers: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &StorePath) -> String {
        if path.is_root() {
            format!("{}/.json", self.base_url)
        } else {
            format!("{}/{}.json", self.base_url, path)
        }
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(token) => request.query(&[("auth", token.as_str())]),
            None => request,
        }
    }

    async fn exists(&self, path: &StorePath) -> Result<bool, StoreError> {
        let response = self
            .with_auth(self.client.get(self.url(path)))
            .query(&[("shallow", "true")])
            .send()
            .await
            .map_err(|e| StoreError::WriteFailure(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::WriteFailure(format!(
                "existence check returned HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(!body.is_null())
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    fn push_key(&self) -> String {
        self.push_ids.next_id()
    }

    async fn set_value(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        if path.is_root() {
            return Err(StoreError::InvalidPath("cannot write the root".to_string()));
        }
        if value.is_null() {
            return Err(StoreError::InvalidValue(format!("null value at {}", path)));
        }
        // Not atomic with the PUT; push keys are what keep writers apart.
        if self.exists(path).await? {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }

        let response = self
            .with_auth(self.client.put(self.url(path)))
            .json(&value)
            .send()
            .await
            .map_err(|e| StoreError::WriteFailure(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::WriteFailure(format!(
                "PUT {} returned HTTP {}",
                path,
                response.status()
            )));
        }
        log::debug!("[RestStore] Wrote {}", path);
        Ok(())
    }

    async fn observe_child_added(&self, path: &StorePath) -> Result<ChildSubscription, StoreError> {
        let response = self
            .with_auth(self.client.get(self.url(path)))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| StoreError::SubscribeFailure(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::SubscribeFailure(format!(
                "stream {} returned HTTP {}",
                path,
                response.status()
            )));
        }

        let (tx, events) = mpsc::unbounded_channel();
        let handle = ListenerHandle::new();
        let label = path.to_string();
        let task = tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut tracker = ChildTracker::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        log::warn!("[RestStore] Stream for {} failed: {}", label, e);
                        let _ = tx.send(StoreEvent::Cancelled {
                            reason: e.to_string(),
                        });
                        return;
                    }
                };
                for event in decoder.push(&chunk) {
                    for store_event in tracker.handle(&event) {
                        let cancelled = matches!(store_event, StoreEvent::Cancelled { .. });
                        if tx.send(store_event).is_err() {
                            return;
                        }
                        if cancelled {
                            return;
                        }
                    }
                }
            }
            log::info!("[RestStore] Stream for {} closed by server", label);
            let _ = tx.send(StoreEvent::Cancelled {
                reason: "stream closed".to_string(),
            });
        });

        if let Ok(mut observers) = self.observers.lock() {
            observers.insert(handle, task);
        }
        log::debug!("[RestStore] Listening for children of {}", path);
        Ok(ChildSubscription { handle, events })
    }

    async fn remove_observer(&self, handle: ListenerHandle) {
        let task = self
            .observers
            .lock()
            .ok()
            .and_then(|mut observers| observers.remove(&handle));
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for RestStore {
    fn drop(&mut self) {
        if let Ok(mut observers) = self.observers.lock() {
            for (_, task) in observers.drain() {
                task.abort();
            }
        }
    }
}

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Bytes may arrive split anywhere,
/// including inside a multi-byte character, so text is only decoded once a
/// whole event block is buffered. Carriage returns are dropped, which makes
/// CRLF streams parse like LF ones.
pub(crate) struct SseDecoder {
    buffer: BytesMut,
}

fn blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = blank_line(&self.buffer) {
            let raw = self.buffer.split_to(end + 2);
            let block = String::from_utf8_lossy(&raw);
            let mut event = String::from("message");
            let mut data_lines = Vec::new();
            for line in block.lines() {
                if line.starts_with(':') {
                    continue;
                }
                let (field, value) = match line.split_once(':') {
                    Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                    None => (line, ""),
                };
                match field {
                    "event" => event = value.to_string(),
                    "data" => data_lines.push(value.to_string()),
                    _ => {}
                }
            }
            if !data_lines.is_empty() || event != "message" {
                events.push(SseEvent {
                    event,
                    data: data_lines.join("\n"),
                });
            }
        }
        events
    }
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    path: String,
    data: Value,
}

/// Turns put/patch events into child-added events for the listened path.
pub(crate) struct ChildTracker {
    seen: HashSet<String>,
}

impl ChildTracker {
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
        }
    }

    pub fn handle(&mut self, event: &SseEvent) -> Vec<StoreEvent> {
        match event.event.as_str() {
            "put" | "patch" => {
                let payload: StreamPayload = match serde_json::from_str(&event.data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("[RestStore] Skipping unparseable {} event: {}", event.event, e);
                        return Vec::new();
                    }
                };
                self.changes(&payload.path, payload.data)
            }
            "keep-alive" => Vec::new(),
            "cancel" => vec![StoreEvent::Cancelled {
                reason: format!("cancelled by server: {}", event.data),
            }],
            "auth_revoked" => vec![StoreEvent::Cancelled {
                reason: "auth revoked".to_string(),
            }],
            other => {
                log::debug!("[RestStore] Ignoring {} event", other);
                Vec::new()
            }
        }
    }

    fn changes(&mut self, path: &str, data: Value) -> Vec<StoreEvent> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut added = Vec::new();

        match segments.split_first() {
            // Whole listened location (initial snapshot or patch at root).
            None => {
                if let Value::Object(children) = data {
                    let mut keys: Vec<(String, Value)> = children.into_iter().collect();
                    keys.sort_by(|a, b| a.0.cmp(&b.0));
                    for (key, value) in keys {
                        if !value.is_null() && self.seen.insert(key.clone()) {
                            added.push(StoreEvent::ChildAdded { key, value });
                        }
                    }
                }
            }
            Some((key, rest)) => {
                if data.is_null() || self.seen.contains(*key) {
                    return added;
                }
                let mut value = data;
                for segment in rest.iter().rev() {
                    let mut wrapped = Map::new();
                    wrapped.insert(segment.to_string(), value);
                    value = Value::Object(wrapped);
                }
                self.seen.insert(key.to_string());
                added.push(StoreEvent::ChildAdded {
                    key: key.to_string(),
                    value,
                });
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use warp::Filter;

    fn sse(event: &str, data: &str) -> SseEvent {
        SseEvent {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: put\ndata: {\"path\"").is_empty());
        let events = decoder.push(b": \"/\", \"data\": null}\n\nevent: keep-alive\ndata: null\n\n");
        assert_eq!(
            events,
            vec![
                sse("put", "{\"path\": \"/\", \"data\": null}"),
                sse("keep-alive", "null"),
            ]
        );
    }

    #[test]
    fn test_decoder_keeps_characters_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let stream = "event: put\ndata: {\"path\":\"/s\u{e9}\",\"data\":1}\n\n".as_bytes();
        let split = stream.iter().position(|b| *b == 0xC3).unwrap() + 1;

        assert!(decoder.push(&stream[..split]).is_empty());
        let events = decoder.push(&stream[split..]);
        assert_eq!(
            events,
            vec![SseEvent {
                event: "put".to_string(),
                data: "{\"path\":\"/s\u{e9}\",\"data\":1}".to_string(),
            }]
        );
    }

    #[test]
    fn test_decoder_accepts_crlf_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": hello\r\nevent: cancel\r\ndata: gone\r\n\r\n");
        assert_eq!(events, vec![sse("cancel", "gone")]);
    }

    #[test]
    fn test_tracker_initial_snapshot_then_new_children() {
        let mut tracker = ChildTracker::new();
        let initial = tracker.handle(&sse(
            "put",
            r#"{"path":"/","data":{"b":{"heartRate":71.0,"timestamp":2},"a":{"heartRate":70.0,"timestamp":1}}}"#,
        ));
        let keys: Vec<String> = initial
            .into_iter()
            .filter_map(|e| match e {
                StoreEvent::ChildAdded { key, .. } => Some(key),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec!["a", "b"]);

        let next = tracker.handle(&sse(
            "put",
            r#"{"path":"/c","data":{"heartRate":72.0,"timestamp":3}}"#,
        ));
        assert_eq!(
            next,
            vec![StoreEvent::ChildAdded {
                key: "c".to_string(),
                value: json!({"heartRate": 72.0, "timestamp": 3})
            }]
        );

        // Deeper update to a known child is not a new child.
        assert!(tracker
            .handle(&sse("put", r#"{"path":"/c/heartRate","data":73.0}"#))
            .is_empty());
    }

    #[test]
    fn test_tracker_deep_put_creates_nested_child() {
        let mut tracker = ChildTracker::new();
        let events = tracker.handle(&sse(
            "put",
            r#"{"path":"/s1/heartRate/k1","data":{"heartRate":80.0,"timestamp":5}}"#,
        ));
        assert_eq!(
            events,
            vec![StoreEvent::ChildAdded {
                key: "s1".to_string(),
                value: json!({"heartRate": {"k1": {"heartRate": 80.0, "timestamp": 5}}})
            }]
        );
    }

    #[test]
    fn test_tracker_patch_and_cancel() {
        let mut tracker = ChildTracker::new();
        let events = tracker.handle(&sse(
            "patch",
            r#"{"path":"/","data":{"x":{"heartRate":60.0,"timestamp":1}}}"#,
        ));
        assert_eq!(events.len(), 1);
        assert!(tracker.handle(&sse("keep-alive", "null")).is_empty());
        assert!(matches!(
            tracker
                .handle(&sse("auth_revoked", "credential is no longer valid"))
                .as_slice(),
            [StoreEvent::Cancelled { .. }]
        ));
    }

    async fn serve_mock(
        stored: Arc<Mutex<HashMap<String, Value>>>,
        stream_body: &'static str,
    ) -> String {
        let for_get = Arc::clone(&stored);
        let for_put = Arc::clone(&stored);

        let stream = warp::get()
            .and(warp::path("sessions.json"))
            .and(warp::path::end())
            .and(warp::header::exact("accept", "text/event-stream"))
            .map(move || {
                warp::http::Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(stream_body)
            });

        let read = warp::get().and(warp::path::full()).map(move |path: warp::path::FullPath| {
            let value = for_get
                .lock()
                .unwrap()
                .get(path.as_str())
                .cloned()
                .unwrap_or(Value::Null);
            warp::reply::json(&value)
        });

        let write = warp::put()
            .and(warp::path::full())
            .and(warp::query::<HashMap<String, String>>())
            .and(warp::body::json())
            .map(
                move |path: warp::path::FullPath, query: HashMap<String, String>, body: Value| {
                    if query.get("auth").map(|s| s.as_str()) != Some("secret") {
                        return warp::reply::with_status(
                            warp::reply::json(&json!({"error": "Permission denied"})),
                            warp::http::StatusCode::UNAUTHORIZED,
                        );
                    }
                    for_put.lock().unwrap().insert(path.as_str().to_string(), body.clone());
                    warp::reply::with_status(warp::reply::json(&body), warp::http::StatusCode::OK)
                },
            );

        let (addr, server) =
            warp::serve(stream.or(read).or(write)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_put_writes_json_and_rejects_existing() {
        let stored = Arc::new(Mutex::new(HashMap::new()));
        let base = serve_mock(Arc::clone(&stored), "").await;
        let store = RestStore::new(&base, Some("secret".to_string())).unwrap();

        let path = StorePath::parse("sessions/s1/heartRate/k1").unwrap();
        let record = json!({"heartRate": 75.0, "timestamp": 1_700_000_000});
        store.set_value(&path, record.clone()).await.unwrap();
        assert_eq!(
            stored.lock().unwrap().get("/sessions/s1/heartRate/k1.json"),
            Some(&record)
        );

        assert_eq!(
            store.set_value(&path, record).await,
            Err(StoreError::AlreadyExists(path.to_string()))
        );
    }

    #[tokio::test]
    async fn test_put_without_auth_fails() {
        let stored = Arc::new(Mutex::new(HashMap::new()));
        let base = serve_mock(stored, "").await;
        let store = RestStore::new(&base, None).unwrap();
        let path = StorePath::parse("sessions/s1/heartRate/k1").unwrap();
        assert!(matches!(
            store.set_value(&path, json!({"heartRate": 75.0, "timestamp": 1})).await,
            Err(StoreError::WriteFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_yields_children_then_cancelled() {
        let body = concat!(
            "event: put\n",
            "data: {\"path\":\"/\",\"data\":{\"s1\":{\"heartRate\":{}},\"s2\":{\"heartRate\":{}}}}\n\n",
            "event: keep-alive\n",
            "data: null\n\n",
            "event: put\n",
            "data: {\"path\":\"/s3/heartRate/k\",\"data\":{\"heartRate\":90.0,\"timestamp\":9}}\n\n",
        );
        let stored = Arc::new(Mutex::new(HashMap::new()));
        let base = serve_mock(stored, body).await;
        let store = RestStore::new(&base, None).unwrap();

        let mut sub = store.observe_child_added(&StorePath::sessions()).await.unwrap();
        let mut keys = Vec::new();
        loop {
            match sub.events.recv().await {
                Some(StoreEvent::ChildAdded { key, .. }) => keys.push(key),
                Some(StoreEvent::Cancelled { reason }) => {
                    assert_eq!(reason, "stream closed");
                    break;
                }
                None => panic!("stream ended without cancellation"),
            }
        }
        assert_eq!(keys, vec!["s1", "s2", "s3"]);
        store.remove_observer(sub.handle).await;
    }
}
