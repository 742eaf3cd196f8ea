//! Outbound event publishing.

use async_trait::async_trait;
use fulcrum_protocol::Envelope;
use parking_lot::Mutex;
use registry_store::StoreError;
use tracing::debug;

use crate::error::RegistryResult;

/// Sink for outbound registry events. The service is written against this
/// trait so tests can capture traffic without a broker.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(&self, channel: &str, envelope: &Envelope) -> RegistryResult<()>;
}

/// Publishes envelopes as JSON over Redis PUBLISH.
pub struct RedisPublisher {
    conn: redis::aio::ConnectionManager,
}

impl RedisPublisher {
    /// Connect with the connection-manager so publishes survive broker
    /// restarts via its internal reconnect handling.
    pub async fn connect(url: &str) -> RegistryResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish(&self, channel: &str, envelope: &Envelope) -> RegistryResult<()> {
        let payload = serde_json::to_string(envelope).map_err(StoreError::from)?;
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        debug!(channel, correlation_id = %envelope.correlation_id, "Published envelope");
        Ok(())
    }
}

/// Captures published envelopes in memory. For tests.
#[derive(Default)]
pub struct CollectingPublisher {
    published: Mutex<Vec<(String, Envelope)>>,
}

impl CollectingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(String, Envelope)> {
        std::mem::take(&mut self.published.lock())
    }

    pub fn on_channel(&self, channel: &str) -> Vec<Envelope> {
        self.published
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for CollectingPublisher {
    async fn publish(&self, channel: &str, envelope: &Envelope) -> RegistryResult<()> {
        self.published
            .lock()
            .push((channel.to_string(), envelope.clone()));
        Ok(())
    }
}
