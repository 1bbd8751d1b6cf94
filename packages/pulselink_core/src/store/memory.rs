//! In-process remote store
//!
//! A hierarchical tree with child-added listeners. Used directly by tests and
//! the simulator, and as the materialised view behind `FileStore`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{
    ChildSubscription, ListenerHandle, PushIdGenerator, RemoteStore, SessionSummary, StoreError,
    StoreEvent, StorePath,
};
use crate::types::HeartRateRecord;

#[derive(Debug, Clone)]
enum Node {
    Leaf(Value),
    Branch(BTreeMap<String, Node>),
}

impl Node {
    fn to_value(&self) -> Value {
        match self {
            Node::Leaf(value) => value.clone(),
            Node::Branch(children) => {
                let mut map = Map::new();
                for (key, child) in children {
                    map.insert(key.clone(), child.to_value());
                }
                Value::Object(map)
            }
        }
    }
}

/// Listener registrations, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverOp {
    Added(StorePath),
    Removed(StorePath),
}

struct Listener {
    path: StorePath,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

struct Inner {
    root: BTreeMap<String, Node>,
    listeners: HashMap<ListenerHandle, Listener>,
    journal: Vec<ObserverOp>,
    write_failure: Option<String>,
    subscribe_failure: Option<String>,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
    push_ids: PushIdGenerator,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                root: BTreeMap::new(),
                listeners: HashMap::new(),
                journal: Vec::new(),
                write_failure: None,
                subscribe_failure: None,
            }),
            push_ids: PushIdGenerator::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every subsequent `set_value` fails with `WriteFailure(reason)` until
    /// cleared with `None`.
    pub fn set_write_failure(&self, reason: Option<String>) {
        self.lock().write_failure = reason;
    }

    /// Every subsequent `observe_child_added` fails until cleared.
    pub fn set_subscribe_failure(&self, reason: Option<String>) {
        self.lock().subscribe_failure = reason;
    }

    /// Server-side cancellation: every listener receives `Cancelled` and is
    /// dropped.
    pub fn cancel_listeners(&self, reason: &str) {
        let mut inner = self.lock();
        let listeners: Vec<(ListenerHandle, Listener)> = inner.listeners.drain().collect();
        for (_, listener) in listeners {
            let _ = listener.tx.send(StoreEvent::Cancelled {
                reason: reason.to_string(),
            });
            inner.journal.push(ObserverOp::Removed(listener.path));
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn observer_journal(&self) -> Vec<ObserverOp> {
        self.lock().journal.clone()
    }

    pub fn get(&self, path: &StorePath) -> Option<Value> {
        let inner = self.lock();
        if path.is_root() {
            return Some(Node::Branch(inner.root.clone()).to_value());
        }
        let mut children = &inner.root;
        let segments = path.segments();
        for (i, segment) in segments.iter().enumerate() {
            let node = children.get(segment)?;
            match node {
                Node::Branch(next) => children = next,
                Node::Leaf(_) if i + 1 == segments.len() => return Some(node.to_value()),
                Node::Leaf(_) => return None,
            }
        }
        Some(Node::Branch(children.clone()).to_value())
    }

    /// Children of `path` in key order.
    pub fn children(&self, path: &StorePath) -> Vec<(String, Value)> {
        let inner = self.lock();
        match find_branch(&inner.root, path) {
            Some(children) => children
                .iter()
                .map(|(key, node)| (key.clone(), node.to_value()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn session_summaries(&self) -> Vec<SessionSummary> {
        self.children(&StorePath::sessions())
            .into_iter()
            .map(|(id, value)| {
                let sample_count = value
                    .get(super::HEART_RATE_KEY)
                    .and_then(|hr| hr.as_object())
                    .map(|samples| samples.len())
                    .unwrap_or(0);
                SessionSummary { id, sample_count }
            })
            .collect()
    }

    /// Decodable samples of one session, in key order. Entries that do not
    /// parse as records are skipped.
    pub fn samples(&self, session_id: &str) -> Result<Vec<(String, HeartRateRecord)>, StoreError> {
        let path = StorePath::session_heart_rate(session_id)?;
        Ok(self
            .children(&path)
            .into_iter()
            .filter_map(|(key, value)| {
                serde_json::from_value::<HeartRateRecord>(value)
                    .ok()
                    .map(|record| (key, record))
            })
            .collect())
    }

    /// Validate a write without applying it.
    pub(crate) fn check_write(&self, path: &StorePath, value: &Value) -> Result<(), StoreError> {
        let inner = self.lock();
        if let Some(reason) = &inner.write_failure {
            return Err(StoreError::WriteFailure(reason.clone()));
        }
        check_write_in(&inner.root, path, value)
    }

    /// Insert `value` at `path` and notify listeners at every level that
    /// gained a child.
    pub(crate) fn apply(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        let mut inner = self.lock();
        check_write_in(&inner.root, path, &value)?;

        let segments = path.segments();
        // Depth of the first segment that does not exist yet.
        let mut created_from = segments.len() - 1;
        {
            let mut children = &mut inner.root;
            for (i, segment) in segments.iter().enumerate() {
                if i + 1 == segments.len() {
                    children.insert(segment.clone(), Node::Leaf(value.clone()));
                    break;
                }
                if !children.contains_key(segment) && i < created_from {
                    created_from = i;
                }
                let node = children
                    .entry(segment.clone())
                    .or_insert_with(|| Node::Branch(BTreeMap::new()));
                children = match node {
                    Node::Branch(next) => next,
                    Node::Leaf(_) => {
                        return Err(StoreError::InvalidPath(format!(
                            "{} is below a leaf",
                            path
                        )))
                    }
                };
            }
        }

        for depth in created_from..segments.len() {
            let parent = path.prefix(depth);
            let key = &segments[depth];
            let added = match find_branch(&inner.root, &parent).and_then(|c| c.get(key)) {
                Some(node) => node.to_value(),
                None => continue,
            };
            for listener in inner.listeners.values() {
                if listener.path == parent {
                    let _ = listener.tx.send(StoreEvent::ChildAdded {
                        key: key.clone(),
                        value: added.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn find_branch<'a>(
    root: &'a BTreeMap<String, Node>,
    path: &StorePath,
) -> Option<&'a BTreeMap<String, Node>> {
    let mut children = root;
    for segment in path.segments() {
        match children.get(segment)? {
            Node::Branch(next) => children = next,
            Node::Leaf(_) => return None,
        }
    }
    Some(children)
}

fn check_write_in(
    root: &BTreeMap<String, Node>,
    path: &StorePath,
    value: &Value,
) -> Result<(), StoreError> {
    if path.is_root() {
        return Err(StoreError::InvalidPath("cannot write the root".to_string()));
    }
    if value.is_null() {
        return Err(StoreError::InvalidValue(format!("null value at {}", path)));
    }
    let segments = path.segments();
    let mut children = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        match children.get(segment) {
            None => return Ok(()),
            Some(_) if last => return Err(StoreError::AlreadyExists(path.to_string())),
            Some(Node::Branch(next)) => children = next,
            Some(Node::Leaf(_)) => {
                return Err(StoreError::InvalidPath(format!(
                    "{} is below a leaf",
                    path
                )))
            }
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    fn push_key(&self) -> String {
        self.push_ids.next_id()
    }

    async fn set_value(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        if let Some(reason) = self.lock().write_failure.clone() {
            return Err(StoreError::WriteFailure(reason));
        }
        self.apply(path, value)
    }

    async fn observe_child_added(&self, path: &StorePath) -> Result<ChildSubscription, StoreError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.subscribe_failure {
            return Err(StoreError::SubscribeFailure(reason.clone()));
        }

        let (tx, events) = mpsc::unbounded_channel();
        if let Some(children) = find_branch(&inner.root, path) {
            for (key, node) in children {
                let _ = tx.send(StoreEvent::ChildAdded {
                    key: key.clone(),
                    value: node.to_value(),
                });
            }
        }

        let handle = ListenerHandle::new();
        inner.listeners.insert(
            handle,
            Listener {
                path: path.clone(),
                tx,
            },
        );
        inner.journal.push(ObserverOp::Added(path.clone()));
        log::debug!("[InMemoryStore] Listening for children of {}", path);
        Ok(ChildSubscription { handle, events })
    }

    async fn remove_observer(&self, handle: ListenerHandle) {
        let mut inner = self.lock();
        if let Some(listener) = inner.listeners.remove(&handle) {
            log::debug!("[InMemoryStore] Removed listener on {}", listener.path);
            inner.journal.push(ObserverOp::Removed(listener.path));
        }
    }
}
