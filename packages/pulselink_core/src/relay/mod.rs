//! The two halves of the relay
//!
//! `RelayProducer` runs next to the sensor and pushes samples over the
//! companion link. `RelayConsumer` runs on the companion, validates what
//! arrives and hands it to the store writer.

pub mod consumer;
pub mod producer;

pub use consumer::{ConsumerStats, RelayConsumer};
pub use producer::{ProducerView, RelayProducer, RelayStats, SampleDisposition};
