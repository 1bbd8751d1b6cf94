//! Sensor-side relay: forwards each heart-rate sample to the companion
//!
//! Samples are sent only while the link monitor reports the companion as
//! reachable. Each send is started on its own task and is best effort: a
//! sample that cannot go out right now is dropped, and a send that fails is
//! logged and dropped. Nothing is queued for later.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::link::{LinkMonitor, LinkState};
use crate::observable::Observable;
use crate::transport::{CompanionTransport, WireMessage};
use crate::types::HeartRateSample;

/// What happened to a sample handed to `on_sample`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDisposition {
    /// Handed to the transport; delivery is not confirmed.
    Dispatched,
    /// The companion was not reachable; the sample is gone.
    DroppedUnreachable,
}

/// Sensor UI state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducerView {
    pub current_heart_rate: Option<f64>,
    pub is_session_active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub dispatched: u64,
    pub dropped_unreachable: u64,
    pub send_failures: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    dropped_unreachable: AtomicU64,
    send_failures: AtomicU64,
}

/// Sends started and not yet finished.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct RelayProducer {
    transport: Arc<dyn CompanionTransport>,
    monitor: Arc<LinkMonitor>,
    view: Observable<ProducerView>,
    counters: Arc<Counters>,
    in_flight: Arc<InFlight>,
}

impl RelayProducer {
    /// Attach to `transport`, install the link handlers and activate.
    ///
    /// Sends are spawned, so this must be called from within a Tokio
    /// runtime. An unsupported transport is not an error here: the producer
    /// stays in `LinkState::Unsupported` and drops every sample.
    pub fn start(transport: Arc<dyn CompanionTransport>) -> Arc<Self> {
        let monitor = LinkMonitor::new(Arc::clone(&transport));
        transport.install_handlers(monitor.link_handlers());

        if let Err(e) = monitor.activate() {
            log::warn!("[RelayProducer] Link activation failed: {}", e);
        }

        Arc::new(Self {
            transport,
            monitor,
            view: Observable::default(),
            counters: Arc::new(Counters::default()),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    /// Forward one sample if the companion is reachable. Never blocks: the
    /// send runs on its own task and its outcome is only logged.
    pub fn on_sample(&self, sample: HeartRateSample) -> SampleDisposition {
        let bpm = sample.value();
        self.view.modify(move |view| view.current_heart_rate = Some(bpm));

        let state = self.monitor.current_state();
        if !state.is_reachable() {
            self.counters
                .dropped_unreachable
                .fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "[RelayProducer] Dropping {} bpm: {}",
                bpm,
                state.status_text()
            );
            return SampleDisposition::DroppedUnreachable;
        }

        let message = WireMessage::from_sample(&sample).to_message();
        let transport = Arc::clone(&self.transport);
        let counters = Arc::clone(&self.counters);
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.begin();
        tokio::spawn(async move {
            if let Err(e) = transport.send_message(message).await {
                counters.send_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("[RelayProducer] Error sending heart rate: {}", e);
            }
            in_flight.end();
        });
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        SampleDisposition::Dispatched
    }

    /// Resolves once no send is outstanding: every sample dispatched before
    /// this call has been delivered or has failed.
    pub async fn flush(&self) {
        self.in_flight.wait_idle().await;
    }

    pub fn start_session(&self) {
        self.view.modify(|view| view.is_session_active = true);
    }

    pub fn end_session(&self) {
        self.view.modify(|view| view.is_session_active = false);
    }

    pub fn view(&self) -> ProducerView {
        self.view.get().unwrap_or_default()
    }

    pub fn observe(&self) -> &Observable<ProducerView> {
        &self.view
    }

    pub fn link_state(&self) -> LinkState {
        self.monitor.current_state()
    }

    pub fn monitor(&self) -> &Arc<LinkMonitor> {
        &self.monitor
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            dropped_unreachable: self.counters.dropped_unreachable.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Message, SimLinkNetwork, TransportHandlers};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sample(bpm: f64, ts: i64) -> HeartRateSample {
        HeartRateSample::new(bpm, ts).unwrap()
    }

    fn companion_inbox(network: &SimLinkNetwork) -> mpsc::UnboundedReceiver<Message> {
        let companion = network.companion();
        let (tx, rx) = mpsc::unbounded_channel();
        companion.install_handlers(TransportHandlers::new().message(move |m| {
            let _ = tx.send(m);
        }));
        companion.activate().unwrap();
        rx
    }

    #[tokio::test]
    async fn test_reachable_sample_is_sent() {
        let network = SimLinkNetwork::pair();
        let mut inbox = companion_inbox(&network);
        let producer = RelayProducer::start(network.sensor());
        assert_eq!(producer.link_state(), LinkState::PairedReachable);

        assert_eq!(
            producer.on_sample(sample(72.0, 1_700_000_000)),
            SampleDisposition::Dispatched
        );
        producer.flush().await;
        network.wait_idle().await;

        let message = inbox.try_recv().unwrap();
        let wire = WireMessage::from_message(&message).unwrap();
        assert_eq!(wire.heart_rate, 72.0);
        assert_eq!(wire.timestamp, 1_700_000_000);
        assert_eq!(producer.view().current_heart_rate, Some(72.0));
    }

    #[tokio::test]
    async fn test_unreachable_sample_is_dropped() {
        let network = SimLinkNetwork::pair();
        let mut inbox = companion_inbox(&network);
        let producer = RelayProducer::start(network.sensor());
        network.set_reachable(false);
        assert_eq!(producer.link_state(), LinkState::PairedUnreachable);

        assert_eq!(
            producer.on_sample(sample(80.0, 1)),
            SampleDisposition::DroppedUnreachable
        );
        producer.flush().await;
        network.wait_idle().await;

        assert!(inbox.try_recv().is_err());
        assert_eq!(
            producer.stats(),
            RelayStats {
                dispatched: 0,
                dropped_unreachable: 1,
                send_failures: 0
            }
        );
        // The sensor UI still shows the reading.
        assert_eq!(producer.view().current_heart_rate, Some(80.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_is_counted_not_retried() {
        let network = SimLinkNetwork::pair();
        let mut inbox = companion_inbox(&network);
        network.set_latency(Duration::from_millis(100));
        let producer = RelayProducer::start(network.sensor());

        assert_eq!(producer.on_sample(sample(90.0, 1)), SampleDisposition::Dispatched);
        tokio::time::sleep(Duration::from_millis(50)).await;
        network.set_reachable(false);
        producer.flush().await;
        network.set_reachable(true);
        producer.flush().await;
        network.wait_idle().await;

        assert!(inbox.try_recv().is_err());
        assert_eq!(producer.stats().send_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_overlap_within_latency() {
        let network = SimLinkNetwork::pair();
        let mut inbox = companion_inbox(&network);
        network.set_latency(Duration::from_millis(100));
        let producer = RelayProducer::start(network.sensor());

        // Five samples 10 ms apart, all taken while reachable, each needing
        // 100 ms on the link. The link drops only after the last has landed.
        for ts in 0..5 {
            assert_eq!(
                producer.on_sample(sample(70.0 + ts as f64, ts)),
                SampleDisposition::Dispatched
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        network.set_reachable(false);
        producer.flush().await;
        network.wait_idle().await;

        let mut timestamps = Vec::new();
        while let Ok(message) = inbox.try_recv() {
            timestamps.push(WireMessage::from_message(&message).unwrap().timestamp);
        }
        timestamps.sort();
        assert_eq!(timestamps, vec![0, 1, 2, 3, 4]);
        assert_eq!(producer.stats().send_failures, 0);
        assert_eq!(producer.stats().dispatched, 5);
    }

    #[tokio::test]
    async fn test_unsupported_transport_drops_everything() {
        let producer = RelayProducer::start(SimLinkNetwork::unsupported_endpoint());
        assert_eq!(producer.link_state(), LinkState::Unsupported);
        assert_eq!(
            producer.on_sample(sample(70.0, 1)),
            SampleDisposition::DroppedUnreachable
        );
    }

    #[tokio::test]
    async fn test_session_toggle() {
        let network = SimLinkNetwork::pair();
        let producer = RelayProducer::start(network.sensor());
        producer.start_session();
        assert!(producer.view().is_session_active);
        producer.end_session();
        assert!(!producer.view().is_session_active);
    }
}
