//! Inbound message subscription and dispatch.
//!
//! One task owns the pub/sub connection; every decoded envelope is handed
//! to the handler on a spawned task gated by a semaphore, so a slow store
//! round trip in one handler never stalls message delivery. The
//! subscription reconnects with exponential backoff when the connection
//! drops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fulcrum_protocol::{channels, Envelope};
use futures_util::StreamExt;
use rand::Rng;
use registry_store::StoreError;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::RegistryResult;
use crate::observability::metrics;

const RECONNECT_BACKOFF_MS_INITIAL: u64 = 500;
const RECONNECT_BACKOFF_MS_MAX: u64 = 30_000;

/// Receiver side of the registry bus.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, channel: &str, envelope: Envelope);
}

pub struct BusSubscriber {
    url: String,
    identity: String,
    handler: Arc<dyn MessageHandler>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl BusSubscriber {
    pub fn new(
        url: impl Into<String>,
        identity: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        worker_permits: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            url: url.into(),
            identity: identity.into(),
            handler,
            permits: Arc::new(Semaphore::new(worker_permits)),
            cancel,
        }
    }

    /// Run the subscription until cancelled, reconnecting on failure.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff_ms = RECONNECT_BACKOFF_MS_INITIAL;
            loop {
                if self.cancel.is_cancelled() {
                    break;
                }
                match self.listen().await {
                    Ok(()) => break, // cancelled from inside the listen loop
                    Err(e) => {
                        // Jitter keeps a fleet of subscribers from
                        // reconnecting in lockstep after a broker restart.
                        let jitter_ms = rand::rng().random_range(0..250);
                        error!(error = %e, backoff_ms, "Bus subscription lost, reconnecting");
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)) => {}
                        }
                        backoff_ms = (backoff_ms * 2).min(RECONNECT_BACKOFF_MS_MAX);
                    }
                }
            }
            debug!("Bus subscriber shut down");
        })
    }

    async fn listen(&self) -> RegistryResult<()> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        for channel in [channels::REGISTRATION, channels::HEARTBEAT, channels::ROUTE] {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
        }
        debug!("Subscribed to registry channels");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                message = stream.next() => {
                    let Some(message) = message else {
                        return Err(StoreError::Connection(
                            "pub/sub stream ended".to_string(),
                        ).into());
                    };
                    self.dispatch(message).await;
                }
            }
        }
    }

    async fn dispatch(&self, message: redis::Msg) {
        let channel = message.get_channel_name().to_string();
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%channel, error = %e, "Dropping non-text bus payload");
                return;
            }
        };
        let envelope: Envelope = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%channel, error = %e, "Dropping undecodable bus payload");
                return;
            }
        };
        if envelope.is_from(&self.identity) {
            return;
        }
        metrics::bus_message(channel_label(&channel));

        // Bounded dispatch: waiting for a permit applies backpressure to
        // the receive loop instead of growing an unbounded task set.
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed during shutdown
        };
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            handler.handle(&channel, envelope).await;
            drop(permit);
        });
    }
}

fn channel_label(channel: &str) -> &'static str {
    match channel {
        channels::REGISTRATION => "registration",
        channels::HEARTBEAT => "heartbeat",
        channels::ROUTE => "route",
        channels::EVENTS => "events",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_labels_cover_known_channels() {
        assert_eq!(channel_label(channels::REGISTRATION), "registration");
        assert_eq!(channel_label(channels::ROUTE), "route");
        assert_eq!(channel_label("fulcrum:somewhere:else"), "other");
    }
}
