//! AMQP implementation of the broker client over lapin.
//!
//! Connections come from the shared [`Pool`]; each `AmqpBroker` holds one
//! pooled connection and one channel for its lifetime. Connect attempts
//! retry a fixed number of times before reporting the broker unreachable.

use std::sync::OnceLock;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::pool::{ConnectionFactory, Pool, PooledConnection, PooledResource};
use crate::broker::{Acker, Broker, Delivery, Queue, Subscription};
use crate::config::{BrokerConfig, PoolConfig};
use crate::error::{BrokerError, MontebusResult};
use crate::message::{HEADER_CONSUMER_ID, HEADER_LAST_ERROR, HEADER_RETRY_COUNT, Headers};

impl PooledResource for Connection {
    fn is_healthy(&self) -> bool {
        self.status().connected()
    }
}

/// Dials the broker with bounded retry.
pub struct AmqpFactory {
    cfg: BrokerConfig,
}

impl AmqpFactory {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl ConnectionFactory for AmqpFactory {
    type Conn = Connection;

    async fn connect(&self) -> MontebusResult<Connection> {
        let uri = self.cfg.amqp_uri();
        let mut last_error = String::new();
        for attempt in 1..=self.cfg.connection_attempts {
            match Connection::connect(&uri, ConnectionProperties::default()).await {
                Ok(connection) => {
                    info!(host = %self.cfg.host, port = self.cfg.port, attempt, "AMQP connection established");
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "AMQP connect attempt failed");
                    last_error = e.to_string();
                    if attempt < self.cfg.connection_attempts {
                        tokio::time::sleep(self.cfg.retry_delay).await;
                    }
                }
            }
        }
        Err(BrokerError::Unreachable {
            attempts: self.cfg.connection_attempts,
            last: last_error,
        }
        .into())
    }
}

/// Process-wide connection pool, initialized on first use.
static GLOBAL_POOL: OnceLock<Pool<AmqpFactory>> = OnceLock::new();

pub fn global_pool(broker: &BrokerConfig, pool: &PoolConfig) -> Pool<AmqpFactory> {
    GLOBAL_POOL
        .get_or_init(|| Pool::new(AmqpFactory::new(broker.clone()), pool.clone()))
        .clone()
}

pub struct AmqpBroker {
    conn: PooledConnection<AmqpFactory>,
    channel: Channel,
}

impl AmqpBroker {
    /// Checks a connection out of the pool and opens a dedicated channel.
    /// The connection returns to the pool when the broker handle drops.
    pub async fn connect(pool: &Pool<AmqpFactory>) -> MontebusResult<Self> {
        let conn = pool.checkout().await?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        debug!(use_count = conn.use_count(), "channel opened on pooled connection");
        Ok(Self { conn, channel })
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_healthy()
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_topology(&self) -> MontebusResult<()> {
        for queue in Queue::iter() {
            let spec = queue.spec();
            let mut args = FieldTable::default();
            if let Some(dlq) = spec.dead_letter {
                args.insert(
                    "x-dead-letter-exchange".into(),
                    AMQPValue::LongString("".into()),
                );
                args.insert(
                    "x-dead-letter-routing-key".into(),
                    AMQPValue::LongString(dlq.to_string().into()),
                );
            }
            if let Some(max_length) = spec.max_length {
                args.insert("x-max-length".into(), AMQPValue::LongInt(max_length as i32));
            }
            if let Some(ttl) = spec.message_ttl {
                args.insert(
                    "x-message-ttl".into(),
                    AMQPValue::LongInt(ttl.as_millis() as i32),
                );
            }
            self.channel
                .queue_declare(
                    &queue.to_string(),
                    QueueDeclareOptions {
                        durable: spec.durable,
                        ..Default::default()
                    },
                    args,
                )
                .await
                .map_err(|e| BrokerError::Connection(format!("declare '{queue}': {e}")))?;
        }
        info!("broker topology declared");
        Ok(())
    }

    async fn publish(
        &self,
        queue: Queue,
        payload: &[u8],
        persistent: bool,
        headers: &Headers,
    ) -> MontebusResult<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(if persistent { 2 } else { 1 })
            .with_headers(headers_to_table(headers));
        self.channel
            .basic_publish(
                "",
                &queue.to_string(),
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish {
                queue: queue.to_string(),
                msg: e.to_string(),
            })?
            .await
            .map_err(|e| BrokerError::Publish {
                queue: queue.to_string(),
                msg: e.to_string(),
            })?;
        Ok(())
    }

    async fn get(&self, queue: Queue) -> MontebusResult<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(&queue.to_string(), BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                msg: e.to_string(),
            })?;
        Ok(message.map(|m| {
            let headers = headers_from_properties(&m.delivery.properties);
            Delivery::new(
                m.delivery.data.clone(),
                headers,
                Box::new(AmqpAcker {
                    acker: m.delivery.acker.clone(),
                }),
            )
        }))
    }

    async fn subscribe(
        &self,
        queue: Queue,
        prefetch: u16,
        consumer_tag: &str,
    ) -> MontebusResult<Subscription> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                msg: e.to_string(),
            })?;
        let mut consumer = self
            .channel
            .basic_consume(
                &queue.to_string(),
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                msg: e.to_string(),
            })?;

        let cancel = CancellationToken::new();
        let (tx, rx) = async_channel::bounded(usize::from(prefetch.max(1)) * 2);
        let channel = self.channel.clone();
        let tag = consumer_tag.to_string();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        if let Err(e) = channel
                            .basic_cancel(&tag, BasicCancelOptions::default())
                            .await
                        {
                            warn!(error = %e, "failed to cancel consumer");
                        }
                        break;
                    }
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => {
                            let headers = headers_from_properties(&delivery.properties);
                            let out = Delivery::new(
                                delivery.data.clone(),
                                headers,
                                Box::new(AmqpAcker {
                                    acker: delivery.acker.clone(),
                                }),
                            );
                            if tx.send(out).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "consumer stream error");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(Subscription::new(rx, cancel))
    }

    async fn purge(&self, queue: Queue) -> MontebusResult<u64> {
        let count = self
            .channel
            .queue_purge(&queue.to_string(), QueuePurgeOptions::default())
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                msg: e.to_string(),
            })?;
        Ok(u64::from(count))
    }

    async fn queue_size(&self, queue: Queue) -> MontebusResult<u64> {
        let declared = self
            .channel
            .queue_declare(
                &queue.to_string(),
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                msg: e.to_string(),
            })?;
        Ok(u64::from(declared.message_count()))
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> MontebusResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()).into())
    }

    async fn nack(&self, requeue: bool) -> MontebusResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()).into())
    }
}

// ================================================================================================
// Header conversion
// ================================================================================================

fn headers_to_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        HEADER_RETRY_COUNT.into(),
        AMQPValue::LongUInt(headers.retry_count),
    );
    if let Some(last_error) = &headers.last_error {
        table.insert(
            HEADER_LAST_ERROR.into(),
            AMQPValue::LongString(last_error.as_str().into()),
        );
    }
    if let Some(consumer_id) = &headers.consumer_id {
        table.insert(
            HEADER_CONSUMER_ID.into(),
            AMQPValue::LongString(consumer_id.as_str().into()),
        );
    }
    table
}

fn headers_from_properties(properties: &BasicProperties) -> Headers {
    let mut headers = Headers::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            match (key.as_str(), value) {
                (HEADER_RETRY_COUNT, AMQPValue::LongUInt(n)) => headers.retry_count = *n,
                (HEADER_RETRY_COUNT, AMQPValue::LongInt(n)) => {
                    headers.retry_count = (*n).max(0) as u32;
                }
                (HEADER_LAST_ERROR, AMQPValue::LongString(s)) => {
                    headers.last_error =
                        Some(String::from_utf8_lossy(s.as_bytes()).into_owned());
                }
                (HEADER_CONSUMER_ID, AMQPValue::LongString(s)) => {
                    headers.consumer_id =
                        Some(String::from_utf8_lossy(s.as_bytes()).into_owned());
                }
                _ => {}
            }
        }
    }
    headers
}
