//! In-process companion link simulator
//!
//! Provides a simulated sensor ↔ companion link where the two endpoints share
//! pairing, install and reachability facts and exchange CBOR frames over
//! tokio channels. Used for integration testing and the CLI `simulate`
//! command without real hardware.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use super::companion::{CompanionTransport, TransportHandlers};
use super::wire::{decode_frame, encode_frame};
use super::{ActivationState, Message, TransportError};

/// Facts both endpoints of a pair observe identically.
struct LinkFacts {
    paired: AtomicBool,
    app_installed: AtomicBool,
    reachable: AtomicBool,
    /// Simulated link latency applied to each send.
    latency: Mutex<Duration>,
    /// Frames handed to the link and not yet dispatched by the receiver.
    in_flight: AtomicUsize,
    idle: Notify,
}

impl LinkFacts {
    fn new(connected: bool) -> Self {
        Self {
            paired: AtomicBool::new(connected),
            app_installed: AtomicBool::new(connected),
            reachable: AtomicBool::new(connected),
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn latency(&self) -> Duration {
        self.latency.lock().map(|l| *l).unwrap_or(Duration::ZERO)
    }

    fn frame_done(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// A simulated sensor/companion pair.
pub struct SimLinkNetwork {
    facts: Arc<LinkFacts>,
    sensor: Arc<SimLinkEndpoint>,
    companion: Arc<SimLinkEndpoint>,
}

impl SimLinkNetwork {
    /// Create a paired, installed, reachable link. Neither endpoint is
    /// activated yet.
    ///
    /// Spawns one receive task per endpoint, so this must be called from
    /// within a Tokio runtime.
    pub fn pair() -> Self {
        let facts = Arc::new(LinkFacts::new(true));

        let (to_companion, companion_rx) = mpsc::channel::<Bytes>(64);
        let (to_sensor, sensor_rx) = mpsc::channel::<Bytes>(64);

        let sensor = Arc::new(SimLinkEndpoint::new("sensor", Arc::clone(&facts), to_companion));
        let companion = Arc::new(SimLinkEndpoint::new("companion", Arc::clone(&facts), to_sensor));

        sensor.spawn_receiver(sensor_rx);
        companion.spawn_receiver(companion_rx);

        Self {
            facts,
            sensor,
            companion,
        }
    }

    /// A lone endpoint on a device with no companion transport.
    pub fn unsupported_endpoint() -> Arc<SimLinkEndpoint> {
        let facts = Arc::new(LinkFacts::new(false));
        let (tx, _rx) = mpsc::channel(1);
        let endpoint = SimLinkEndpoint::new("unsupported", facts, tx);
        endpoint.supported.store(false, Ordering::SeqCst);
        Arc::new(endpoint)
    }

    pub fn sensor(&self) -> Arc<SimLinkEndpoint> {
        Arc::clone(&self.sensor)
    }

    pub fn companion(&self) -> Arc<SimLinkEndpoint> {
        Arc::clone(&self.companion)
    }

    /// Change reachability; both endpoints are told when it actually changes.
    pub fn set_reachable(&self, reachable: bool) {
        let previous = self.facts.reachable.swap(reachable, Ordering::SeqCst);
        if previous != reachable {
            log::debug!("[SimLink] reachable: {} -> {}", previous, reachable);
            self.sensor.handlers().fire_reachability_changed();
            self.companion.handlers().fire_reachability_changed();
        }
    }

    pub fn set_paired(&self, paired: bool) {
        let previous = self.facts.paired.swap(paired, Ordering::SeqCst);
        if previous != paired {
            self.sensor.handlers().fire_reachability_changed();
            self.companion.handlers().fire_reachability_changed();
        }
    }

    pub fn set_app_installed(&self, installed: bool) {
        let previous = self.facts.app_installed.swap(installed, Ordering::SeqCst);
        if previous != installed {
            self.sensor.handlers().fire_reachability_changed();
            self.companion.handlers().fire_reachability_changed();
        }
    }

    /// Resolves once every frame already handed to the link has been
    /// delivered to the receiving endpoint's message handler.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.facts.idle.notified();
            if self.facts.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Set the link latency. Each send sleeps this long before delivery and
    /// re-checks reachability afterwards. Uses tokio time, so paused clocks
    /// advance instantly in tests.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut guard) = self.facts.latency.lock() {
            *guard = latency;
        }
    }
}

/// One side of a simulated link.
pub struct SimLinkEndpoint {
    label: &'static str,
    facts: Arc<LinkFacts>,
    supported: AtomicBool,
    activation: Arc<AtomicU8>,
    activation_delay: Mutex<Duration>,
    fail_next_activation: Mutex<Option<String>>,
    handlers: Arc<Mutex<TransportHandlers>>,
    outbound: mpsc::Sender<Bytes>,
}

impl SimLinkEndpoint {
    fn new(label: &'static str, facts: Arc<LinkFacts>, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            label,
            facts,
            supported: AtomicBool::new(true),
            activation: Arc::new(AtomicU8::new(ActivationState::NotActivated.as_u8())),
            activation_delay: Mutex::new(Duration::ZERO),
            fail_next_activation: Mutex::new(None),
            handlers: Arc::new(Mutex::new(TransportHandlers::new())),
            outbound,
        }
    }

    fn handlers(&self) -> TransportHandlers {
        self.handlers
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    fn spawn_receiver(&self, mut rx: mpsc::Receiver<Bytes>) {
        let handlers = Arc::clone(&self.handlers);
        let facts = Arc::clone(&self.facts);
        let label = self.label;
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match decode_frame(&frame) {
                    Ok(message) => {
                        let current = handlers.lock().map(|h| h.clone()).unwrap_or_default();
                        current.fire_message(message);
                    }
                    Err(e) => {
                        log::warn!("[SimLink:{}] Dropping undecodable frame: {}", label, e);
                    }
                }
                facts.frame_done();
            }
            log::debug!("[SimLink:{}] Receive loop ended", label);
        });
    }

    fn set_activation(&self, state: ActivationState) {
        self.activation.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Delay before activation completes. Zero completes inline.
    pub fn set_activation_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.activation_delay.lock() {
            *guard = delay;
        }
    }

    /// Make the next activation attempt report an error.
    pub fn fail_next_activation(&self, reason: impl Into<String>) {
        if let Ok(mut guard) = self.fail_next_activation.lock() {
            *guard = Some(reason.into());
        }
    }

    /// The platform deactivated the session (e.g. the companion switched
    /// sensor devices). The owner is expected to re-activate.
    pub fn deactivate(&self) {
        self.set_activation(ActivationState::NotActivated);
        self.handlers().fire_deactivated();
    }

    /// The session is winding down and can no longer send.
    pub fn make_inactive(&self) {
        self.set_activation(ActivationState::Inactive);
        self.handlers().fire_became_inactive();
    }

    fn complete_activation(
        handlers: &Mutex<TransportHandlers>,
        activation: &AtomicU8,
        failure: Option<String>,
    ) {
        let current = handlers.lock().map(|h| h.clone()).unwrap_or_default();
        match failure {
            Some(reason) => current.fire_activation_complete(Err(TransportError::ActivationFailed(reason))),
            None => {
                activation.store(ActivationState::Activated.as_u8(), Ordering::SeqCst);
                current.fire_activation_complete(Ok(ActivationState::Activated));
            }
        }
    }
}

#[async_trait]
impl CompanionTransport for SimLinkEndpoint {
    fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    fn activate(&self) -> Result<(), TransportError> {
        if !self.is_supported() {
            return Err(TransportError::Unsupported);
        }
        let failure = self
            .fail_next_activation
            .lock()
            .ok()
            .and_then(|mut f| f.take());
        let delay = self
            .activation_delay
            .lock()
            .map(|d| *d)
            .unwrap_or(Duration::ZERO);

        if delay.is_zero() {
            Self::complete_activation(&self.handlers, &self.activation, failure);
            return Ok(());
        }

        let handlers = Arc::clone(&self.handlers);
        let activation = Arc::clone(&self.activation);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::complete_activation(&handlers, &activation, failure);
        });
        Ok(())
    }

    fn activation_state(&self) -> ActivationState {
        ActivationState::from_u8(self.activation.load(Ordering::SeqCst))
    }

    fn is_paired(&self) -> bool {
        self.facts.paired.load(Ordering::SeqCst)
    }

    fn is_app_installed(&self) -> bool {
        self.facts.app_installed.load(Ordering::SeqCst)
    }

    fn is_reachable(&self) -> bool {
        self.activation_state() == ActivationState::Activated
            && self.facts.reachable.load(Ordering::SeqCst)
    }

    fn install_handlers(&self, handlers: TransportHandlers) {
        if let Ok(mut guard) = self.handlers.lock() {
            *guard = handlers;
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        if self.activation_state() != ActivationState::Activated {
            return Err(TransportError::NotActivated);
        }
        if !self.is_reachable() {
            return Err(TransportError::Unreachable);
        }
        let frame = encode_frame(&message)?;

        let latency = self.facts.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
            // The link may have dropped while the frame was in flight.
            if !self.is_reachable() {
                return Err(TransportError::Unreachable);
            }
        }

        self.facts.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.outbound.send(frame).await.is_err() {
            self.facts.frame_done();
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}
