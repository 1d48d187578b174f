//! NATS JetStream implementation of the EventBus trait.
//!
//! Plain `publish` uses core NATS (fire-and-forget, at-most-once). Every
//! topic the outbox worker writes to is in practice a JetStream stream, so
//! `publish_durable` goes through the JetStream context instead: it blocks
//! on the broker's ack, a synchronous full-replica acknowledgement, and
//! carries a `Nats-Msg-Id` header so a retried send with the same dedup
//! key is deduplicated by the server's dedup window rather than the
//! queue-level idempotent-producer semantics a Kafka-based deployment
//! would configure instead.

use crate::{BusError, BusMessage, BusResult, EventBus};
use async_nats::jetstream::{self, context::Context as JetStreamContext};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

/// EventBus implementation using NATS JetStream
///
/// This is the production implementation that connects to a NATS server.
/// It wraps an `async_nats::Client` and implements the `EventBus` trait.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client);
///
/// // Use the bus
/// bus.publish("my.subject", b"hello".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: JetStreamContext,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    ///
    /// # Arguments
    /// * `client` - An already-connected `async_nats::Client`
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    /// Get a reference to the underlying NATS client
    ///
    /// This is useful for advanced use cases that need direct access to NATS features
    /// not exposed through the EventBus trait.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        // Convert NATS messages to BusMessages
        let stream = subscriber.map(|nats_msg| {
            let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

            // Extract reply-to if present
            if let Some(reply) = nats_msg.reply {
                msg = msg.with_reply_to(reply.to_string());
            }

            // Extract headers if present
            if let Some(nats_headers) = nats_msg.headers {
                let mut headers = std::collections::HashMap::new();
                for (key, values) in nats_headers.iter() {
                    // Take the first value for each header
                    if let Some(value) = values.first() {
                        headers.insert(key.to_string(), value.to_string());
                    }
                }
                if !headers.is_empty() {
                    msg = msg.with_headers(headers);
                }
            }

            msg
        });

        Ok(stream.boxed())
    }

    async fn publish_durable(
        &self,
        subject: &str,
        dedup_key: &str,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        let mut headers = HeaderMap::new();
        headers.insert("Nats-Msg-Id", dedup_key);

        let ack_future = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        // Block until the stream's configured replicas have acked durably:
        // this is the full replica acknowledgement requirement.
        ack_future
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running NATS server
    // For CI, use InMemoryBus tests instead
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_publish_subscribe() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let bus = NatsBus::new(client);

        // Subscribe first
        let mut stream = bus.subscribe("test.nats.>").await.unwrap();

        // Publish a message
        let payload = b"test message".to_vec();
        bus.publish("test.nats.hello", payload.clone())
            .await
            .unwrap();

        // Receive the message
        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(msg.subject, "test.nats.hello");
        assert_eq!(msg.payload, payload);
    }
}
