//! Broker abstraction: queue topology, the client trait and deliveries.
//!
//! The seven logical queues and their durability/TTL/dead-letter policy live
//! here as data, so the AMQP client and the in-memory test double declare
//! identical topologies. Deliveries settle themselves (`ack`/`nack`) through
//! an acker owned by the delivery, matching the transport's model.

pub mod amqp;
pub mod memory;
pub mod pool;

use std::time::Duration;

use async_trait::async_trait;
use strum_macros::{Display, EnumIter, EnumString};
use tokio_util::sync::CancellationToken;

use crate::error::MontebusResult;
use crate::message::Headers;

/// The stable queue identifiers of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum Queue {
    #[strum(serialize = "cola_modelo")]
    Model,
    #[strum(serialize = "cola_escenarios")]
    Scenarios,
    #[strum(serialize = "cola_resultados")]
    Results,
    #[strum(serialize = "cola_dlq_escenarios")]
    ScenariosDlq,
    #[strum(serialize = "cola_dlq_resultados")]
    ResultsDlq,
    #[strum(serialize = "cola_stats_productor")]
    ProducerStats,
    #[strum(serialize = "cola_stats_consumidores")]
    ConsumerStats,
}

/// Declaration-time policy of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub durable: bool,
    pub message_ttl: Option<Duration>,
    pub dead_letter: Option<Queue>,
    pub max_length: Option<u32>,
}

impl Queue {
    pub fn spec(&self) -> QueueSpec {
        match self {
            Self::Model => QueueSpec {
                durable: true,
                message_ttl: None,
                dead_letter: None,
                // Replacement semantics: at most one model resident.
                max_length: Some(1),
            },
            Self::Scenarios => QueueSpec {
                durable: true,
                message_ttl: None,
                dead_letter: Some(Self::ScenariosDlq),
                max_length: Some(100_000),
            },
            Self::Results => QueueSpec {
                durable: true,
                message_ttl: None,
                dead_letter: Some(Self::ResultsDlq),
                max_length: None,
            },
            Self::ScenariosDlq | Self::ResultsDlq => QueueSpec {
                durable: true,
                message_ttl: None,
                dead_letter: None,
                max_length: None,
            },
            Self::ProducerStats => QueueSpec {
                durable: false,
                message_ttl: Some(Duration::from_secs(60)),
                dead_letter: None,
                max_length: Some(100),
            },
            Self::ConsumerStats => QueueSpec {
                durable: false,
                message_ttl: Some(Duration::from_secs(60)),
                dead_letter: None,
                max_length: Some(1_000),
            },
        }
    }
}

/// Settles a delivery with the broker it came from.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> MontebusResult<()>;
    async fn nack(&self, requeue: bool) -> MontebusResult<()>;
}

/// One message handed to a consumer, together with its envelope headers and
/// the means to settle it.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub headers: Headers,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, headers: Headers, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            headers,
            acker,
        }
    }

    pub async fn ack(&self) -> MontebusResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> MontebusResult<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}

/// A live subscription feeding deliveries through a channel. Dropping the
/// subscription or calling [`Subscription::cancel`] stops delivery.
pub struct Subscription {
    receiver: async_channel::Receiver<Delivery>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(receiver: async_channel::Receiver<Delivery>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// Next delivery, or `None` once the subscription is cancelled and
    /// drained.
    pub async fn recv(&self) -> Option<Delivery> {
        self.receiver.recv().await.ok()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The broker client surface shared by the AMQP implementation and the
/// in-memory double.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declares all seven queues with their policy table. Idempotent.
    async fn declare_topology(&self) -> MontebusResult<()>;

    async fn publish(
        &self,
        queue: Queue,
        payload: &[u8],
        persistent: bool,
        headers: &Headers,
    ) -> MontebusResult<()>;

    /// Single-message pull with manual acknowledgement.
    async fn get(&self, queue: Queue) -> MontebusResult<Option<Delivery>>;

    /// Push subscription with the given prefetch window (0 = unlimited).
    async fn subscribe(
        &self,
        queue: Queue,
        prefetch: u16,
        consumer_tag: &str,
    ) -> MontebusResult<Subscription>;

    /// Drops all ready messages, returning how many were removed.
    async fn purge(&self, queue: Queue) -> MontebusResult<u64>;

    /// Count of ready messages.
    async fn queue_size(&self, queue: Queue) -> MontebusResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn queue_names_are_stable_identifiers() {
        assert_eq!(Queue::Model.to_string(), "cola_modelo");
        assert_eq!(Queue::Scenarios.to_string(), "cola_escenarios");
        assert_eq!(Queue::Results.to_string(), "cola_resultados");
        assert_eq!(Queue::ScenariosDlq.to_string(), "cola_dlq_escenarios");
        assert_eq!(Queue::ResultsDlq.to_string(), "cola_dlq_resultados");
        assert_eq!(Queue::ProducerStats.to_string(), "cola_stats_productor");
        assert_eq!(Queue::ConsumerStats.to_string(), "cola_stats_consumidores");
    }

    #[test]
    fn topology_policy_matches_the_operational_table() {
        assert_eq!(Queue::Model.spec().max_length, Some(1));
        assert!(Queue::Model.spec().durable);

        let scenarios = Queue::Scenarios.spec();
        assert_eq!(scenarios.dead_letter, Some(Queue::ScenariosDlq));
        assert_eq!(scenarios.max_length, Some(100_000));

        let results = Queue::Results.spec();
        assert_eq!(results.dead_letter, Some(Queue::ResultsDlq));
        assert_eq!(results.max_length, None);

        for queue in [Queue::ProducerStats, Queue::ConsumerStats] {
            let spec = queue.spec();
            assert!(!spec.durable);
            assert_eq!(spec.message_ttl, Some(Duration::from_secs(60)));
        }
    }

    #[test]
    fn queue_names_round_trip_through_strum() {
        for queue in Queue::iter() {
            let name = queue.to_string();
            assert_eq!(name.parse::<Queue>().unwrap(), queue);
        }
    }
}
