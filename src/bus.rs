use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::Message;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tokio::sync::broadcast;

use crate::events::{PresenceEvent, USER_STATUS_TOPIC};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("bus channel closed")]
    Closed,
}

/// Publishes presence transitions onto the bus, keyed by user id so events
/// for one user stay totally ordered.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &PresenceEvent) -> Result<(), BusError>;

    /// Flush in-flight events and release the transport. Called once during
    /// shutdown, after the consumer has disconnected.
    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, event: &PresenceEvent) -> Result<(), BusError> {
        let payload = serde_json::to_vec(event)?;
        let record = FutureRecord::to(USER_STATUS_TOPIC)
            .key(&event.user_id)
            .payload(&payload);
        self.producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
            .map_err(|(e, _)| BusError::Kafka(e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.producer.flush(Timeout::After(Duration::from_secs(5)))?;
        Ok(())
    }
}

/// Consuming side of the bus. Every presence node subscribes under its own
/// consumer group (`beacon-node-<instanceId>`) so each node sees every
/// message; that group-per-node fan-out is the broadcast mechanism.
pub struct KafkaEventStream {
    consumer: StreamConsumer,
}

impl KafkaEventStream {
    pub fn new(brokers: &str, instance_id: &str) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", format!("beacon-node-{instance_id}"))
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "true")
            .set("session.timeout.ms", "6000")
            .create()?;
        consumer.subscribe(&[USER_STATUS_TOPIC])?;
        Ok(Self { consumer })
    }

    /// Leave the consumer group. Dropping the stream afterwards tears the
    /// broker connection down cleanly.
    pub fn disconnect(&self) {
        self.consumer.unsubscribe();
    }

    /// Next presence event from the topic. Returns `Ok(None)` for messages
    /// that carry no usable event (empty or malformed payload); delivery is
    /// at-least-once, so skipping is always safe for the consumer.
    pub async fn next_event(&self) -> Result<Option<PresenceEvent>, BusError> {
        let message = self.consumer.recv().await?;
        let Some(payload) = message.payload() else {
            return Ok(None);
        };
        match serde_json::from_slice(payload) {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    partition = message.partition(),
                    offset = message.offset(),
                    "skipping malformed presence event"
                );
                Ok(None)
            }
        }
    }
}

/// Loopback bus for tests: a broadcast channel with the same at-least-once,
/// per-publish-order semantics the consumers rely on.
pub struct MemoryBus {
    tx: broadcast::Sender<PresenceEvent>,
    // Keeps the channel open while no test subscriber exists yet.
    _keepalive: broadcast::Receiver<PresenceEvent>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, keepalive) = broadcast::channel(capacity);
        Self {
            tx,
            _keepalive: keepalive,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventPublisher for MemoryBus {
    async fn publish(&self, event: &PresenceEvent) -> Result<(), BusError> {
        self.tx
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PresenceAction;

    #[tokio::test]
    async fn test_memory_bus_delivers_in_publish_order() {
        let bus = MemoryBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(&PresenceEvent::online("u1", "node-a")).await.unwrap();
        bus.publish(&PresenceEvent::offline("u1", "node-a")).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.action, PresenceAction::Online);
        assert_eq!(second.action, PresenceAction::Offline);
        assert_eq!(second.user_id, "u1");
    }

    #[tokio::test]
    async fn test_memory_bus_fans_out_to_all_subscribers() {
        let bus = MemoryBus::new(16);
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(&PresenceEvent::online("u2", "node-a")).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().user_id, "u2");
        assert_eq!(rx_b.recv().await.unwrap().user_id, "u2");
    }

    #[tokio::test]
    async fn test_memory_bus_publish_without_subscribers() {
        let bus = MemoryBus::new(16);
        bus.publish(&PresenceEvent::online("u3", "node-a")).await.unwrap();
    }
}
