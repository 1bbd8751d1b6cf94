//! Heart-rate wire schema and link framing
//!
//! Producer → consumer messages are `{ "heartRate": <float>, "timestamp":
//! <int> }` with no version field. Extra keys are ignored on receipt. On the
//! simulated link a message travels as one CBOR-encoded map per frame.

use bytes::Bytes;
use serde_json::Value;

use super::{Message, TransportError};
use crate::types::HeartRateSample;

pub const HEART_RATE_KEY: &str = "heartRate";
pub const TIMESTAMP_KEY: &str = "timestamp";

/// A validated heart-rate message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WireMessage {
    pub heart_rate: f64,
    pub timestamp: i64,
}

impl WireMessage {
    pub fn from_sample(sample: &HeartRateSample) -> Self {
        Self {
            heart_rate: sample.value(),
            timestamp: sample.captured_at(),
        }
    }

    pub fn to_message(&self) -> Message {
        let mut message = Message::new();
        message.insert(HEART_RATE_KEY.to_string(), Value::from(self.heart_rate));
        message.insert(TIMESTAMP_KEY.to_string(), Value::from(self.timestamp));
        message
    }

    /// Validate an inbound message.
    ///
    /// `heartRate` must be a positive, finite number (integers are accepted);
    /// `timestamp` must be an integer that fits in i64.
    pub fn from_message(message: &Message) -> Result<Self, TransportError> {
        let heart_rate = match message.get(HEART_RATE_KEY) {
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| {
                TransportError::Malformed(format!("{} is not representable as f64", HEART_RATE_KEY))
            })?,
            Some(other) => {
                return Err(TransportError::Malformed(format!(
                    "{} has wrong type: {}",
                    HEART_RATE_KEY, other
                )))
            }
            None => {
                return Err(TransportError::Malformed(format!("missing {}", HEART_RATE_KEY)))
            }
        };
        if !heart_rate.is_finite() || heart_rate <= 0.0 {
            return Err(TransportError::Malformed(format!(
                "{} out of range: {}",
                HEART_RATE_KEY, heart_rate
            )));
        }

        let timestamp = match message.get(TIMESTAMP_KEY) {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                TransportError::Malformed(format!("{} is not an integer: {}", TIMESTAMP_KEY, n))
            })?,
            Some(other) => {
                return Err(TransportError::Malformed(format!(
                    "{} has wrong type: {}",
                    TIMESTAMP_KEY, other
                )))
            }
            None => return Err(TransportError::Malformed(format!("missing {}", TIMESTAMP_KEY))),
        };

        Ok(Self {
            heart_rate,
            timestamp,
        })
    }
}

/// Encode a message as one CBOR frame.
pub fn encode_frame(message: &Message) -> Result<Bytes, TransportError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| TransportError::Frame(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode one CBOR frame. Anything other than a string-keyed map is rejected.
pub fn decode_frame(data: &[u8]) -> Result<Message, TransportError> {
    let value: Value = ciborium::from_reader(data).map_err(|e| TransportError::Frame(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(TransportError::Malformed(format!(
            "frame is not a map: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_message(value: Value) -> Message {
        match value {
            Value::Object(map) => map,
            _ => panic!("test input must be an object"),
        }
    }

    #[test]
    fn test_message_shape() {
        let sample = HeartRateSample::new(72.0, 1_700_000_000).unwrap();
        let message = WireMessage::from_sample(&sample).to_message();
        assert_eq!(
            Value::Object(message),
            json!({"heartRate": 72.0, "timestamp": 1_700_000_000})
        );
    }

    #[test]
    fn test_extra_keys_ignored() {
        let message = as_message(json!({
            "heartRate": 88.5,
            "timestamp": 1_700_000_123,
            "device": "left-wrist",
            "v": 2
        }));
        let decoded = WireMessage::from_message(&message).unwrap();
        assert_eq!(decoded.heart_rate, 88.5);
        assert_eq!(decoded.timestamp, 1_700_000_123);
    }

    #[test]
    fn test_integer_heart_rate_accepted() {
        let message = as_message(json!({"heartRate": 64, "timestamp": 10}));
        assert_eq!(WireMessage::from_message(&message).unwrap().heart_rate, 64.0);
    }

    #[test]
    fn test_malformed_messages_rejected() {
        let cases = [
            json!({"timestamp": 10}),
            json!({"heartRate": 70.0}),
            json!({"heartRate": "70", "timestamp": 10}),
            json!({"heartRate": 70.0, "timestamp": "10"}),
            json!({"heartRate": 70.0, "timestamp": 10.5}),
            json!({"heartRate": null, "timestamp": 10}),
            json!({"heartRate": -3.0, "timestamp": 10}),
            json!({"heartRate": 0, "timestamp": 10}),
        ];
        for case in cases {
            let message = as_message(case.clone());
            assert!(
                matches!(WireMessage::from_message(&message), Err(TransportError::Malformed(_))),
                "expected rejection for {}",
                case
            );
        }
    }

    #[test]
    fn test_frame_carries_message() {
        let message = as_message(json!({"heartRate": 101.25, "timestamp": 1_700_000_000}));
        let frame = encode_frame(&message).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(WireMessage::from_message(&decoded).unwrap().heart_rate, 101.25);
        assert_eq!(WireMessage::from_message(&decoded).unwrap().timestamp, 1_700_000_000);
    }

    #[test]
    fn test_non_map_frame_rejected() {
        let mut buf = Vec::new();
        ciborium::into_writer(&vec![1u8, 2, 3], &mut buf).unwrap();
        assert!(decode_frame(&buf).is_err());
        assert!(decode_frame(&[0xff, 0x00]).is_err());
    }
}
