//! Companion transport layer
//!
//! The sensor device and its companion exchange small string-keyed messages
//! over a platform link that is only sometimes reachable. This module holds
//! the abstract contract (`CompanionTransport`), the heart-rate wire
//! schema and CBOR framing, and an in-process simulator used by tests and
//! the CLI.

pub mod companion;
pub mod simulated;
pub mod wire;

pub use companion::{CompanionTransport, TransportHandlers};
pub use simulated::{SimLinkEndpoint, SimLinkNetwork};
pub use wire::WireMessage;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message as the platform link carries it: a mapping of string to value.
pub type Message = serde_json::Map<String, serde_json::Value>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Companion transport not supported")]
    Unsupported,

    #[error("Transport not activated")]
    NotActivated,

    #[error("Counterpart not reachable")]
    Unreachable,

    #[error("Link disconnected")]
    Disconnected,

    #[error("Activation failed: {0}")]
    ActivationFailed(String),

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Activation state as reported by the platform link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationState {
    NotActivated,
    Inactive,
    Activated,
}

impl ActivationState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ActivationState::NotActivated => 0,
            ActivationState::Inactive => 1,
            ActivationState::Activated => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            2 => ActivationState::Activated,
            1 => ActivationState::Inactive,
            _ => ActivationState::NotActivated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_state_u8_round_trip() {
        for state in [
            ActivationState::NotActivated,
            ActivationState::Inactive,
            ActivationState::Activated,
        ] {
            assert_eq!(ActivationState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ActivationState::from_u8(200), ActivationState::NotActivated);
    }
}
