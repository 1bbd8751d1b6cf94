// Pulselink - Heart-rate telemetry relay

pub mod config;
pub mod error;
pub mod link;
pub mod observable;
pub mod pipeline;
pub mod relay;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use config::{ConfigError, LinkConfig, RelayConfig, StoreConfig};
pub use error::RelayError;
pub use link::{LinkMonitor, LinkState};
pub use observable::Observable;
pub use pipeline::RelayPipeline;
pub use relay::{RelayConsumer, RelayProducer, SampleDisposition};
pub use session::SessionRegistry;
pub use store::{
    FileStore, InMemoryStore, RemoteStore, RemoteStoreSubscriber, RemoteStoreWriter, RestStore,
    StoreError, StorePath,
};
pub use transport::{CompanionTransport, SimLinkNetwork, TransportError, TransportHandlers};
pub use types::{HeartRateRecord, HeartRateSample};
