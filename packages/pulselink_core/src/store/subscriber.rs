//! RemoteStoreSubscriber: follows the newest session and its heart rate
//!
//! One actor task owns both listeners. A new child under `sessions/` makes
//! that session the active one: the previous heart-rate listener is removed
//! (and the removal awaited) before the new one is registered, so at most
//! one heart-rate listener exists at any time.
//!
//! Sample keys are push keys, so they order by write time across sessions.
//! When existing sessions are replayed on (re)subscribe, a session whose
//! newest sample is older than the active session's does not take over.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::{ChildSubscription, RemoteStore, StoreEvent, StorePath, HEART_RATE_KEY};
use crate::observable::Observable;
use crate::transport::wire::TIMESTAMP_KEY;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberState {
    #[default]
    Idle,
    WatchingSessions,
    WatchingHeartRate(String),
    Failed(String),
    Disposed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriberView {
    pub current_heart_rate: Option<f64>,
    pub is_session_active: bool,
    pub current_session_id: Option<String>,
    pub last_timestamp: Option<i64>,
    pub samples_seen: u64,
}

enum Command {
    Resubscribe,
    Flush(oneshot::Sender<()>),
    Dispose(oneshot::Sender<()>),
}

pub struct RemoteStoreSubscriber {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<Observable<SubscriberState>>,
    view: Arc<Observable<SubscriberView>>,
}

impl RemoteStoreSubscriber {
    /// Spawn the subscriber and start watching `sessions/`. Must be called
    /// inside a tokio runtime.
    pub fn start(store: Arc<dyn RemoteStore>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Observable::new(SubscriberState::Idle));
        let view = Arc::new(Observable::new(SubscriberView::default()));

        let actor = SubscriberActor {
            store,
            state: Arc::clone(&state),
            view: Arc::clone(&view),
            sessions: None,
            heart_rate: None,
            session_newest: None,
            applied_through: None,
        };
        tokio::spawn(actor.run(rx));

        Self {
            commands,
            state,
            view,
        }
    }

    pub fn state(&self) -> SubscriberState {
        self.state.get().unwrap_or_default()
    }

    pub fn view(&self) -> SubscriberView {
        self.view.get().unwrap_or_default()
    }

    pub fn observe_state(&self) -> &Observable<SubscriberState> {
        &self.state
    }

    pub fn observe_view(&self) -> &Observable<SubscriberView> {
        &self.view
    }

    /// Drop both listeners and start again from `sessions/`.
    pub fn resubscribe(&self) {
        let _ = self.commands.send(Command::Resubscribe);
    }

    /// Resolves once every event already delivered to the subscriber has
    /// been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Remove every listener. The subscriber is unusable afterwards.
    pub async fn dispose(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Dispose(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

struct ActiveSession {
    id: String,
    subscription: ChildSubscription,
}

struct SubscriberActor {
    store: Arc<dyn RemoteStore>,
    state: Arc<Observable<SubscriberState>>,
    view: Arc<Observable<SubscriberView>>,
    sessions: Option<ChildSubscription>,
    heart_rate: Option<ActiveSession>,
    // Newest sample key the active session held when it was announced.
    session_newest: Option<String>,
    // Greatest sample key applied in the active session. Replayed children
    // at or below it are skipped.
    applied_through: Option<String>,
}

/// Greatest sample key inside an announced session's value.
fn newest_sample_key(session: &Value) -> Option<String> {
    session
        .get(HEART_RATE_KEY)
        .and_then(Value::as_object)
        .and_then(|samples| samples.keys().max().cloned())
}

async fn next_session_event(sessions: &mut Option<ChildSubscription>) -> Option<StoreEvent> {
    match sessions {
        Some(sub) => sub.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_heart_rate_event(active: &mut Option<ActiveSession>) -> (String, Option<StoreEvent>) {
    match active {
        Some(active) => {
            let event = active.subscription.events.recv().await;
            (active.id.clone(), event)
        }
        None => std::future::pending().await,
    }
}

impl SubscriberActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.subscribe_sessions().await;

        loop {
            tokio::select! {
                biased;

                (session_id, event) = next_heart_rate_event(&mut self.heart_rate) => {
                    self.on_heart_rate_event(&session_id, event).await;
                }
                event = next_session_event(&mut self.sessions) => {
                    self.on_session_event(event).await;
                }
                command = commands.recv() => match command {
                    Some(Command::Resubscribe) => {
                        log::info!("[RemoteStoreSubscriber] Resubscribing");
                        self.teardown().await;
                        self.subscribe_sessions().await;
                    }
                    Some(Command::Flush(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(Command::Dispose(ack)) => {
                        self.teardown().await;
                        self.state.update(SubscriberState::Disposed);
                        log::info!("[RemoteStoreSubscriber] Disposed");
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
            }
        }
    }

    async fn subscribe_sessions(&mut self) {
        match self.store.observe_child_added(&StorePath::sessions()).await {
            Ok(sub) => {
                self.sessions = Some(sub);
                self.state.update(SubscriberState::WatchingSessions);
            }
            Err(e) => {
                log::warn!("[RemoteStoreSubscriber] Cannot watch sessions: {}", e);
                self.state.update(SubscriberState::Failed(e.to_string()));
            }
        }
    }

    /// Remove both listeners, heart rate first.
    async fn teardown(&mut self) {
        if let Some(active) = self.heart_rate.take() {
            self.store.remove_observer(active.subscription.handle).await;
        }
        if let Some(sub) = self.sessions.take() {
            self.store.remove_observer(sub.handle).await;
        }
        self.session_newest = None;
        self.applied_through = None;
    }

    async fn fail(&mut self, reason: String) {
        log::warn!("[RemoteStoreSubscriber] Listener ended: {}", reason);
        self.teardown().await;
        self.state.update(SubscriberState::Failed(reason));
    }

    async fn on_session_event(&mut self, event: Option<StoreEvent>) {
        match event {
            Some(StoreEvent::ChildAdded { key, value }) => {
                let newest = newest_sample_key(&value);
                if self.is_older_than_active(&key, newest.as_deref()) {
                    log::debug!("[RemoteStoreSubscriber] Staying off older session {}", key);
                    return;
                }
                self.switch_session(key, newest).await;
            }
            Some(StoreEvent::Cancelled { reason }) => self.fail(reason).await,
            None => self.fail("sessions listener closed".to_string()).await,
        }
    }

    /// True when a session is announced whose samples all predate what the
    /// active session already holds.
    fn is_older_than_active(&self, session_id: &str, newest: Option<&str>) -> bool {
        match &self.heart_rate {
            Some(active) if active.id != session_id => {}
            _ => return false,
        }
        let active_newest = std::cmp::max(
            self.session_newest.as_deref(),
            self.applied_through.as_deref(),
        );
        match (newest, active_newest) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(candidate), Some(current)) => candidate < current,
        }
    }

    async fn switch_session(&mut self, session_id: String, newest: Option<String>) {
        if self.heart_rate.as_ref().map(|a| a.id.as_str()) == Some(session_id.as_str()) {
            return;
        }

        let path = match StorePath::session_heart_rate(&session_id) {
            Ok(path) => path,
            Err(e) => {
                log::warn!("[RemoteStoreSubscriber] Ignoring session {:?}: {}", session_id, e);
                return;
            }
        };

        if let Some(previous) = self.heart_rate.take() {
            self.store.remove_observer(previous.subscription.handle).await;
            log::debug!("[RemoteStoreSubscriber] Stopped watching session {}", previous.id);
        }
        self.session_newest = newest;
        self.applied_through = None;

        match self.store.observe_child_added(&path).await {
            Ok(subscription) => {
                log::info!("[RemoteStoreSubscriber] Watching session {}", session_id);
                self.heart_rate = Some(ActiveSession {
                    id: session_id.clone(),
                    subscription,
                });
                let id = session_id.clone();
                self.view.modify(move |view| {
                    view.is_session_active = true;
                    view.current_session_id = Some(id);
                    view.current_heart_rate = None;
                    view.last_timestamp = None;
                    view.samples_seen = 0;
                });
                self.state
                    .update(SubscriberState::WatchingHeartRate(session_id));
            }
            Err(e) => self.fail(e.to_string()).await,
        }
    }

    async fn on_heart_rate_event(&mut self, session_id: &str, event: Option<StoreEvent>) {
        if self.heart_rate.as_ref().map(|a| a.id.as_str()) != Some(session_id) {
            return;
        }
        match event {
            Some(StoreEvent::ChildAdded { key, value }) => self.apply_sample(key, &value),
            Some(StoreEvent::Cancelled { reason }) => self.fail(reason).await,
            None => self.fail("heart-rate listener closed".to_string()).await,
        }
    }

    fn apply_sample(&mut self, key: String, value: &Value) {
        if self.applied_through.as_deref().is_some_and(|through| key.as_str() <= through) {
            log::debug!("[RemoteStoreSubscriber] Already applied {}", key);
            return;
        }
        let heart_rate = match value.get(HEART_RATE_KEY).and_then(Value::as_f64) {
            Some(hr) if hr.is_finite() => hr,
            _ => {
                log::warn!("[RemoteStoreSubscriber] Skipping malformed entry {}: {}", key, value);
                return;
            }
        };
        let timestamp = value.get(TIMESTAMP_KEY).and_then(Value::as_i64);
        self.applied_through = Some(key);

        self.view.modify(move |view| {
            view.current_heart_rate = Some(heart_rate);
            if timestamp.is_some() {
                view.last_timestamp = timestamp;
            }
            view.samples_seen += 1;
        });
    }
}
