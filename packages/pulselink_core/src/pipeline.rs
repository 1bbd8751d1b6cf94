//! End-to-end wiring over the simulated link
//!
//! sensor sample → `RelayProducer` → simulated link → `RelayConsumer` →
//! `RemoteStoreWriter` → store → `RemoteStoreSubscriber`.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::{RelayConsumer, RelayProducer, SampleDisposition};
use crate::session::SessionRegistry;
use crate::store::{RemoteStore, RemoteStoreSubscriber, RemoteStoreWriter};
use crate::transport::SimLinkNetwork;
use crate::types::HeartRateSample;

pub struct RelayPipeline {
    network: SimLinkNetwork,
    store: Arc<dyn RemoteStore>,
    producer: Arc<RelayProducer>,
    consumer: RelayConsumer,
    subscriber: RemoteStoreSubscriber,
}

impl RelayPipeline {
    /// Build every component over the store `config` names. Must be called
    /// inside a tokio runtime.
    pub fn simulated(config: &RelayConfig) -> Result<Self, RelayError> {
        let store = config.open_store()?;
        Ok(Self::with_store(config, store))
    }

    /// Same, over an already opened store.
    pub fn with_store(config: &RelayConfig, store: Arc<dyn RemoteStore>) -> Self {
        let network = SimLinkNetwork::pair();
        network.set_latency(config.link.latency());
        network.sensor().set_activation_delay(config.link.activation_delay());
        network.companion().set_activation_delay(config.link.activation_delay());

        let writer = RemoteStoreWriter::new(Arc::clone(&store));
        let consumer = RelayConsumer::start(
            network.companion(),
            writer,
            Arc::new(SessionRegistry::new()),
        );
        let producer = RelayProducer::start(network.sensor());
        let subscriber = RemoteStoreSubscriber::start(Arc::clone(&store));

        Self {
            network,
            store,
            producer,
            consumer,
            subscriber,
        }
    }

    pub fn send(&self, bpm: f64, captured_at: i64) -> Result<SampleDisposition, RelayError> {
        let sample = HeartRateSample::new(bpm, captured_at)?;
        Ok(self.producer.on_sample(sample))
    }

    /// Wait until everything already sent has travelled the whole pipeline.
    pub async fn settle(&self) {
        self.producer.flush().await;
        self.network.wait_idle().await;
        self.consumer.flush().await;
        self.subscriber.flush().await;
    }

    pub fn network(&self) -> &SimLinkNetwork {
        &self.network
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn producer(&self) -> &Arc<RelayProducer> {
        &self.producer
    }

    pub fn consumer(&self) -> &RelayConsumer {
        &self.consumer
    }

    pub fn subscriber(&self) -> &RemoteStoreSubscriber {
        &self.subscriber
    }

    /// Dispose the subscriber and let the relay tasks wind down.
    pub async fn shutdown(self) {
        self.settle().await;
        self.subscriber.dispose().await;
    }
}
