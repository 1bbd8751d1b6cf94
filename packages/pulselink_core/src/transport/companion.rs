//! Companion transport trait and callback slots
//!
//! Platform links report activation, reachability and inbound messages
//! through callbacks. Instead of a delegate object, the relay installs a
//! `TransportHandlers` value: one optional slot per event.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ActivationState, Message, TransportError};

pub type ActivationHandler = Arc<dyn Fn(Result<ActivationState, TransportError>) + Send + Sync>;
pub type SignalHandler = Arc<dyn Fn() + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Named callback slots a transport invokes. Unset slots are ignored.
#[derive(Clone, Default)]
pub struct TransportHandlers {
    pub on_activation_complete: Option<ActivationHandler>,
    pub on_reachability_changed: Option<SignalHandler>,
    pub on_became_inactive: Option<SignalHandler>,
    pub on_deactivated: Option<SignalHandler>,
    pub on_message: Option<MessageHandler>,
}

impl TransportHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activation_complete(
        mut self,
        f: impl Fn(Result<ActivationState, TransportError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_activation_complete = Some(Arc::new(f));
        self
    }

    pub fn reachability_changed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reachability_changed = Some(Arc::new(f));
        self
    }

    pub fn became_inactive(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_became_inactive = Some(Arc::new(f));
        self
    }

    pub fn deactivated(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_deactivated = Some(Arc::new(f));
        self
    }

    pub fn message(mut self, f: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub(crate) fn fire_activation_complete(&self, result: Result<ActivationState, TransportError>) {
        if let Some(handler) = &self.on_activation_complete {
            handler(result);
        }
    }

    pub(crate) fn fire_reachability_changed(&self) {
        if let Some(handler) = &self.on_reachability_changed {
            handler();
        }
    }

    pub(crate) fn fire_became_inactive(&self) {
        if let Some(handler) = &self.on_became_inactive {
            handler();
        }
    }

    pub(crate) fn fire_deactivated(&self) {
        if let Some(handler) = &self.on_deactivated {
            handler();
        }
    }

    pub(crate) fn fire_message(&self, message: Message) {
        if let Some(handler) = &self.on_message {
            handler(message);
        }
    }
}

/// The platform connectivity layer between a sensor device and its companion.
///
/// Fact queries (`is_paired`, `is_reachable`, ...) are synchronous and cheap.
/// `activate` only starts the handshake; its result arrives through
/// `on_activation_complete`.
#[async_trait]
pub trait CompanionTransport: Send + Sync {
    /// Whether this device has a companion transport at all.
    fn is_supported(&self) -> bool;

    /// Start the activation handshake.
    fn activate(&self) -> Result<(), TransportError>;

    fn activation_state(&self) -> ActivationState;

    fn is_paired(&self) -> bool;

    /// Whether the counterpart app is installed on the sibling device.
    fn is_app_installed(&self) -> bool;

    fn is_reachable(&self) -> bool;

    /// Replace the callback slots.
    fn install_handlers(&self, handlers: TransportHandlers);

    /// Deliver one message to the counterpart.
    async fn send_message(&self, message: Message) -> Result<(), TransportError>;
}
