//! Relay-wide error taxonomy
//!
//! Every failure in the relay is terminal for the event that caused it.
//! Module errors (`TransportError`, `StoreError`, `ConfigError`) fold into
//! `RelayError` so callers that only care about the class of failure can
//! match on one enum.

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    /// The device has no companion transport; no further link activity.
    #[error("Companion transport is not supported on this device")]
    TransportUnsupported,

    /// Transient: the current message is dropped, the link may come back.
    #[error("Companion unreachable: {0}")]
    TransportUnreachable(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Store write failed: {0}")]
    StoreWriteFailure(String),

    #[error("Store subscription failed: {0}")]
    StoreSubscribeFailure(String),

    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<TransportError> for RelayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unsupported => RelayError::TransportUnsupported,
            TransportError::Malformed(reason) => RelayError::MalformedMessage(reason),
            other => RelayError::TransportUnreachable(other.to_string()),
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SubscribeFailure(reason) => RelayError::StoreSubscribeFailure(reason),
            other => RelayError::StoreWriteFailure(other.to_string()),
        }
    }
}

impl From<ConfigError> for RelayError {
    fn from(err: ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_classify() {
        assert_eq!(
            RelayError::from(TransportError::Unsupported),
            RelayError::TransportUnsupported
        );
        assert!(matches!(
            RelayError::from(TransportError::Unreachable),
            RelayError::TransportUnreachable(_)
        ));
        assert!(matches!(
            RelayError::from(TransportError::Malformed("no heartRate".into())),
            RelayError::MalformedMessage(_)
        ));
    }

    #[test]
    fn test_store_errors_classify() {
        assert!(matches!(
            RelayError::from(StoreError::SubscribeFailure("denied".into())),
            RelayError::StoreSubscribeFailure(_)
        ));
        assert!(matches!(
            RelayError::from(StoreError::WriteFailure("offline".into())),
            RelayError::StoreWriteFailure(_)
        ));
    }
}
