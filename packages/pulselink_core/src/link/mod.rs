//! Link state tracking between a sensor device and its companion.

pub mod monitor;

pub use monitor::{LinkMonitor, LinkState};
