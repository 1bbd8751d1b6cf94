//! Authoritative link state for one device
//!
//! Derives a `LinkState` from the transport's activation, pairing, install
//! and reachability facts whenever the transport reports a change, and
//! publishes each distinct transition to observers.
//!
//! Transport callbacks may fire on any thread. Deriving, storing and
//! publishing a state happen under one lock, so observers see transitions in
//! the order they were stored. Observer callbacks run under that lock and
//! must not drive the monitor themselves.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::observable::Observable;
use crate::transport::{ActivationState, CompanionTransport, TransportError, TransportHandlers};

/// Connectivity between this device and its sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// No companion transport on this device. Terminal.
    Unsupported,
    NotActivated,
    Inactive,
    NotPaired,
    AppNotInstalled,
    PairedUnreachable,
    PairedReachable,
}

impl LinkState {
    fn as_u8(self) -> u8 {
        match self {
            LinkState::Unsupported => 0,
            LinkState::NotActivated => 1,
            LinkState::Inactive => 2,
            LinkState::NotPaired => 3,
            LinkState::AppNotInstalled => 4,
            LinkState::PairedUnreachable => 5,
            LinkState::PairedReachable => 6,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LinkState::Unsupported,
            2 => LinkState::Inactive,
            3 => LinkState::NotPaired,
            4 => LinkState::AppNotInstalled,
            5 => LinkState::PairedUnreachable,
            6 => LinkState::PairedReachable,
            _ => LinkState::NotActivated,
        }
    }

    pub fn is_reachable(self) -> bool {
        self == LinkState::PairedReachable
    }

    /// One-line status for a connection indicator.
    pub fn status_text(self) -> &'static str {
        match self {
            LinkState::Unsupported => "Companion connectivity not supported on this device",
            LinkState::NotActivated => "Companion connectivity not activated",
            LinkState::Inactive => "Companion connectivity inactive",
            LinkState::NotPaired => "No companion device paired",
            LinkState::AppNotInstalled => "Companion app not installed",
            LinkState::PairedUnreachable => "Companion app not reachable. Please open the app",
            LinkState::PairedReachable => "Companion connected and reachable",
        }
    }
}

pub struct LinkMonitor {
    transport: Arc<dyn CompanionTransport>,
    state: AtomicU8,
    /// Set while an activation handshake is outstanding.
    activating: AtomicBool,
    transitions: Mutex<()>,
    observers: Observable<LinkState>,
}

impl LinkMonitor {
    pub fn new(transport: Arc<dyn CompanionTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            state: AtomicU8::new(LinkState::NotActivated.as_u8()),
            activating: AtomicBool::new(false),
            transitions: Mutex::new(()),
            observers: Observable::new(LinkState::NotActivated),
        })
    }

    pub fn transport(&self) -> &Arc<dyn CompanionTransport> {
        &self.transport
    }

    /// Callback slots that route transport link events into this monitor.
    ///
    /// The slots hold a weak handle, so a transport keeping its handlers
    /// alive does not keep the monitor alive. Callers may add an
    /// `on_message` slot before installing.
    pub fn link_handlers(self: &Arc<Self>) -> TransportHandlers {
        let on_complete = Arc::downgrade(self);
        let on_reachability = Arc::downgrade(self);
        let on_inactive = Arc::downgrade(self);
        let on_deactivated = Arc::downgrade(self);
        TransportHandlers::new()
            .activation_complete(move |result| {
                if let Some(monitor) = Weak::upgrade(&on_complete) {
                    monitor.on_activation_complete(result);
                }
            })
            .reachability_changed(move || {
                if let Some(monitor) = Weak::upgrade(&on_reachability) {
                    monitor.on_reachability_changed();
                }
            })
            .became_inactive(move || {
                if let Some(monitor) = Weak::upgrade(&on_inactive) {
                    monitor.on_became_inactive();
                }
            })
            .deactivated(move || {
                if let Some(monitor) = Weak::upgrade(&on_deactivated) {
                    monitor.on_deactivated();
                }
            })
    }

    /// Start the transport handshake. Idempotent: does nothing while a
    /// handshake is outstanding and only recomputes when already activated.
    pub fn activate(&self) -> Result<(), TransportError> {
        if self.current_state() == LinkState::Unsupported || !self.transport.is_supported() {
            self.mark_unsupported();
            return Err(TransportError::Unsupported);
        }
        if self.transport.activation_state() == ActivationState::Activated {
            self.recompute();
            return Ok(());
        }
        if self.activating.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        log::debug!("[LinkMonitor] Activating transport");
        match self.transport.activate() {
            Ok(()) => Ok(()),
            Err(TransportError::Unsupported) => {
                self.activating.store(false, Ordering::SeqCst);
                self.mark_unsupported();
                Err(TransportError::Unsupported)
            }
            Err(e) => {
                self.activating.store(false, Ordering::SeqCst);
                log::warn!("[LinkMonitor] Activation could not start: {}", e);
                Err(e)
            }
        }
    }

    pub fn on_activation_complete(&self, result: Result<ActivationState, TransportError>) {
        self.activating.store(false, Ordering::SeqCst);
        match result {
            Ok(state) => {
                log::info!("[LinkMonitor] Activation complete: {:?}", state);
                self.recompute();
            }
            Err(e) => {
                log::warn!("[LinkMonitor] Activation failed, keeping {:?}: {}", self.current_state(), e);
            }
        }
    }

    pub fn on_reachability_changed(&self) {
        self.recompute();
    }

    pub fn on_became_inactive(&self) {
        self.recompute();
    }

    /// The platform tore the session down; recompute and reconnect.
    pub fn on_deactivated(&self) {
        self.recompute();
        if self.current_state() == LinkState::Unsupported {
            return;
        }
        log::info!("[LinkMonitor] Transport deactivated, re-activating");
        if let Err(e) = self.activate() {
            log::warn!("[LinkMonitor] Re-activation failed: {}", e);
        }
    }

    /// Recompute from current facts, e.g. on a user-triggered check.
    pub fn check_connection(&self) -> LinkState {
        self.recompute();
        self.current_state()
    }

    pub fn current_state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn status_text(&self) -> &'static str {
        self.current_state().status_text()
    }

    pub fn subscribe(&self, callback: Box<dyn Fn(&LinkState) + Send + Sync>) -> Uuid {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.observers.unsubscribe(id);
    }

    pub fn watch(&self) -> broadcast::Receiver<LinkState> {
        self.observers.watch()
    }

    fn derive_state(&self) -> LinkState {
        let transport = &self.transport;
        if !transport.is_supported() {
            return LinkState::Unsupported;
        }
        match transport.activation_state() {
            ActivationState::NotActivated => LinkState::NotActivated,
            ActivationState::Inactive => LinkState::Inactive,
            ActivationState::Activated => {
                if !transport.is_paired() {
                    LinkState::NotPaired
                } else if !transport.is_app_installed() {
                    LinkState::AppNotInstalled
                } else if transport.is_reachable() {
                    LinkState::PairedReachable
                } else {
                    LinkState::PairedUnreachable
                }
            }
        }
    }

    fn lock_transitions(&self) -> MutexGuard<'_, ()> {
        self.transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn recompute(&self) {
        let _serial = self.lock_transitions();
        let next = self.derive_state();
        self.transition(next);
    }

    fn mark_unsupported(&self) {
        let _serial = self.lock_transitions();
        self.store_unsupported();
    }

    /// Caller holds the transition lock.
    fn store_unsupported(&self) {
        let previous = self.state.swap(LinkState::Unsupported.as_u8(), Ordering::SeqCst);
        if previous != LinkState::Unsupported.as_u8() {
            log::warn!("[LinkMonitor] Companion transport unsupported");
            self.observers.update(LinkState::Unsupported);
        }
    }

    /// Apply a transition unless it is a no-op or the state is terminal.
    /// Caller holds the transition lock.
    fn transition(&self, next: LinkState) -> bool {
        if next == LinkState::Unsupported {
            self.store_unsupported();
            return true;
        }
        let current = self.state.load(Ordering::SeqCst);
        if current == LinkState::Unsupported.as_u8() || current == next.as_u8() {
            return false;
        }
        self.state.store(next.as_u8(), Ordering::SeqCst);
        log::info!(
            "[LinkMonitor] {:?} -> {:?}: {}",
            LinkState::from_u8(current),
            next,
            next.status_text()
        );
        self.observers.update(next);
        true
    }
}
