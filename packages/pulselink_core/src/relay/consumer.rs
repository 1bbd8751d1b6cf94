//! Companion-side relay: receives heart-rate messages and appends them to
//! the remote store
//!
//! Every transport callback and every local request is turned into a
//! `ConsumerEvent` and handled, in arrival order, by one actor task. The
//! transport only ever holds channel senders, never the consumer itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use crate::link::{LinkMonitor, LinkState};
use crate::session::SessionRegistry;
use crate::store::RemoteStoreWriter;
use crate::transport::{
    ActivationState, CompanionTransport, Message, TransportError, TransportHandlers, WireMessage,
};

enum ConsumerEvent {
    Activate,
    ActivationComplete(Result<ActivationState, TransportError>),
    ReachabilityChanged,
    BecameInactive,
    Deactivated,
    Message(Message),
    CheckConnection(oneshot::Sender<LinkState>),
    EndSession,
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub forwarded: u64,
    pub malformed: u64,
    pub append_failures: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    forwarded: AtomicU64,
    malformed: AtomicU64,
    append_failures: AtomicU64,
}

pub struct RelayConsumer {
    events: mpsc::UnboundedSender<ConsumerEvent>,
    monitor: Arc<LinkMonitor>,
    sessions: Arc<SessionRegistry>,
    writer: Arc<RemoteStoreWriter>,
    counters: Arc<Counters>,
}

impl RelayConsumer {
    /// Install handlers on `transport`, spawn the actor and activate.
    /// Must be called inside a tokio runtime.
    pub fn start(
        transport: Arc<dyn CompanionTransport>,
        writer: Arc<RemoteStoreWriter>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let monitor = LinkMonitor::new(Arc::clone(&transport));
        let (events, rx) = mpsc::unbounded_channel();
        transport.install_handlers(Self::handlers(&events));

        let counters = Arc::new(Counters::default());
        let actor = ConsumerActor {
            monitor: Arc::clone(&monitor),
            sessions: Arc::clone(&sessions),
            writer: Arc::clone(&writer),
            counters: Arc::clone(&counters),
        };
        tokio::spawn(actor.run(rx));
        let _ = events.send(ConsumerEvent::Activate);

        Self {
            events,
            monitor,
            sessions,
            writer,
            counters,
        }
    }

    fn handlers(events: &mpsc::UnboundedSender<ConsumerEvent>) -> TransportHandlers {
        let on_complete = events.clone();
        let on_reachability = events.clone();
        let on_inactive = events.clone();
        let on_deactivated = events.clone();
        let on_message = events.clone();
        TransportHandlers::new()
            .activation_complete(move |result| {
                let _ = on_complete.send(ConsumerEvent::ActivationComplete(result));
            })
            .reachability_changed(move || {
                let _ = on_reachability.send(ConsumerEvent::ReachabilityChanged);
            })
            .became_inactive(move || {
                let _ = on_inactive.send(ConsumerEvent::BecameInactive);
            })
            .deactivated(move || {
                let _ = on_deactivated.send(ConsumerEvent::Deactivated);
            })
            .message(move |message| {
                let _ = on_message.send(ConsumerEvent::Message(message));
            })
    }

    /// Hand a raw inbound message to the actor, as the transport does.
    pub fn on_message_received(&self, message: Message) {
        let _ = self.events.send(ConsumerEvent::Message(message));
    }

    /// Recompute the link state on the actor and return it.
    pub async fn check_connection(&self) -> LinkState {
        let (reply, state) = oneshot::channel();
        if self.events.send(ConsumerEvent::CheckConnection(reply)).is_ok() {
            if let Ok(state) = state.await {
                return state;
            }
        }
        self.monitor.current_state()
    }

    /// Close the current session; the next sample starts a new one.
    pub fn end_session(&self) {
        let _ = self.events.send(ConsumerEvent::EndSession);
    }

    /// Resolves once every event sent before this call, and every store
    /// write those events queued, has been processed.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.events.send(ConsumerEvent::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.monitor.current_state()
    }

    pub fn status_text(&self) -> &'static str {
        self.monitor.status_text()
    }

    pub fn monitor(&self) -> &Arc<LinkMonitor> {
        &self.monitor
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn writer(&self) -> &Arc<RemoteStoreWriter> {
        &self.writer
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            append_failures: self.counters.append_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RelayConsumer {
    fn drop(&mut self) {
        // The transport's handlers hold senders too, so the channel alone
        // would keep the actor alive.
        let _ = self.events.send(ConsumerEvent::Shutdown);
    }
}

struct ConsumerActor {
    monitor: Arc<LinkMonitor>,
    sessions: Arc<SessionRegistry>,
    writer: Arc<RemoteStoreWriter>,
    counters: Arc<Counters>,
}

impl ConsumerActor {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<ConsumerEvent>) {
        // Flush requests wait until the queue is empty, including events the
        // actor itself caused (an inline activation completing, say).
        let mut flushes: Vec<oneshot::Sender<()>> = Vec::new();
        loop {
            let event = if flushes.is_empty() {
                rx.recv().await
            } else {
                match rx.try_recv() {
                    Ok(event) => Some(event),
                    Err(TryRecvError::Empty) => {
                        self.writer.flush().await;
                        for ack in flushes.drain(..) {
                            let _ = ack.send(());
                        }
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => None,
                }
            };

            match event {
                Some(ConsumerEvent::Flush(ack)) => flushes.push(ack),
                Some(ConsumerEvent::Shutdown) | None => break,
                Some(event) => self.handle(event),
            }
        }
        log::debug!("[RelayConsumer] Actor stopped");
    }

    fn handle(&self, event: ConsumerEvent) {
        match event {
            ConsumerEvent::Activate => {
                if let Err(e) = self.monitor.activate() {
                    log::warn!("[RelayConsumer] Link activation failed: {}", e);
                }
            }
            ConsumerEvent::ActivationComplete(result) => self.monitor.on_activation_complete(result),
            ConsumerEvent::ReachabilityChanged => self.monitor.on_reachability_changed(),
            ConsumerEvent::BecameInactive => self.monitor.on_became_inactive(),
            ConsumerEvent::Deactivated => self.monitor.on_deactivated(),
            ConsumerEvent::Message(message) => self.on_message(message),
            ConsumerEvent::CheckConnection(reply) => {
                let _ = reply.send(self.monitor.check_connection());
            }
            ConsumerEvent::EndSession => {
                self.sessions.reset();
                self.writer.mark_session_ended();
            }
            ConsumerEvent::Flush(ack) => {
                let _ = ack.send(());
            }
            ConsumerEvent::Shutdown => {}
        }
    }

    fn on_message(&self, message: Message) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let wire = match WireMessage::from_message(&message) {
            Ok(wire) => wire,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("[RelayConsumer] Discarding message: {}", e);
                return;
            }
        };

        let session_id = self.sessions.current_or_new_id();
        match self
            .writer
            .append(&session_id, wire.heart_rate, wire.timestamp)
        {
            Ok(receipt) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[RelayConsumer] Queued {} bpm as {}",
                    wire.heart_rate,
                    receipt.key
                );
            }
            Err(e) => {
                self.counters.append_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("[RelayConsumer] Could not queue heart rate: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::transport::SimLinkNetwork;
    use serde_json::{json, Value};

    fn message(value: Value) -> Message {
        match value {
            Value::Object(map) => map,
            _ => panic!("test input must be an object"),
        }
    }

    fn consumer_with_store() -> (SimLinkNetwork, Arc<InMemoryStore>, RelayConsumer) {
        let network = SimLinkNetwork::pair();
        let store = Arc::new(InMemoryStore::new());
        let writer = RemoteStoreWriter::new(store.clone());
        let consumer = RelayConsumer::start(
            network.companion(),
            writer,
            Arc::new(SessionRegistry::new()),
        );
        (network, store, consumer)
    }

    #[tokio::test]
    async fn test_activates_through_actor() {
        let (_network, _store, consumer) = consumer_with_store();
        consumer.flush().await;
        assert_eq!(consumer.link_state(), LinkState::PairedReachable);
    }

    #[tokio::test]
    async fn test_valid_message_appended_under_minted_session() {
        let (_network, store, consumer) = consumer_with_store();
        consumer.on_message_received(message(json!({"heartRate": 75.5, "timestamp": 100})));
        consumer.on_message_received(message(json!({"heartRate": 77, "timestamp": 101})));
        consumer.flush().await;

        let session_id = consumer.sessions().current().unwrap();
        let samples = store.samples(&session_id).unwrap();
        let bpms: Vec<f64> = samples.iter().map(|(_, r)| r.heart_rate).collect();
        assert_eq!(bpms, vec![75.5, 77.0]);
        assert_eq!(consumer.writer().cache().current_session_id, Some(session_id));
    }

    #[tokio::test]
    async fn test_malformed_messages_never_reach_writer() {
        let (_network, store, consumer) = consumer_with_store();
        for bad in [
            json!({"heartRate": "fast", "timestamp": 1}),
            json!({"timestamp": 1}),
            json!({"heartRate": 70.0}),
            json!({"heartRate": 70.0, "timestamp": "now"}),
        ] {
            consumer.on_message_received(message(bad));
        }
        consumer.flush().await;

        assert_eq!(consumer.writer().stats().queued, 0);
        assert!(store.session_summaries().is_empty());
        assert!(consumer.sessions().current().is_none());
        assert_eq!(consumer.stats().malformed, 4);
    }

    #[tokio::test]
    async fn test_end_session_starts_new_session() {
        let (_network, store, consumer) = consumer_with_store();
        consumer.on_message_received(message(json!({"heartRate": 70.0, "timestamp": 1})));
        consumer.flush().await;
        let first = consumer.sessions().current().unwrap();

        consumer.end_session();
        consumer.flush().await;
        assert!(consumer.sessions().current().is_none());
        assert!(!consumer.writer().cache().is_session_active);

        consumer.on_message_received(message(json!({"heartRate": 71.0, "timestamp": 2})));
        consumer.flush().await;
        let second = consumer.sessions().current().unwrap();
        assert_ne!(first, second);
        assert_eq!(store.session_summaries().len(), 2);
    }

    #[tokio::test]
    async fn test_check_connection_after_link_change() {
        let (network, _store, consumer) = consumer_with_store();
        consumer.flush().await;
        network.set_app_installed(false);
        assert_eq!(consumer.check_connection().await, LinkState::AppNotInstalled);
        assert_eq!(consumer.status_text(), "Companion app not installed");
    }

    #[tokio::test]
    async fn test_deactivation_reactivates() {
        let (network, _store, consumer) = consumer_with_store();
        consumer.flush().await;
        network.companion().deactivate();
        consumer.flush().await;
        assert_eq!(consumer.link_state(), LinkState::PairedReachable);
    }

    #[tokio::test]
    async fn test_store_failure_is_not_surfaced() {
        let (_network, store, consumer) = consumer_with_store();
        store.set_write_failure(Some("offline".to_string()));
        consumer.on_message_received(message(json!({"heartRate": 70.0, "timestamp": 1})));
        consumer.flush().await;

        assert_eq!(consumer.stats().forwarded, 1);
        assert_eq!(consumer.writer().stats().failed, 1);
        let hr = crate::store::StorePath::session_heart_rate(
            &consumer.sessions().current().unwrap(),
        )
        .unwrap();
        assert!(store.get(&hr).is_none());
        // Cache still reflects the optimistic update.
        assert_eq!(consumer.writer().cache().current_heart_rate, Some(70.0));
    }
}
