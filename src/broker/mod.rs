//! Durable work queue carrying `TaskEnvelope` messages with at-least-once
//! delivery and manual ack. Backed by AMQP (RabbitMQ), matching the
//! original system's transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::TaskEnvelope;
use crate::error::SubstrateError;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};
use crate::Result;

/// A single delivered envelope, carrying the means to ack or nack it.
pub struct Delivery {
    pub envelope: TaskEnvelope,
    channel: Channel,
    delivery_tag: u64,
}

impl Delivery {
    pub async fn ack(self) -> Result<()> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| SubstrateError::BrokerUnavailable(e.to_string()))
    }

    pub async fn nack_requeue(self) -> Result<()> {
        self.channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SubstrateError::BrokerUnavailable(e.to_string()))
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn is_ready(&self) -> bool;
    async fn reconnect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn publish_task(&self, envelope: &TaskEnvelope) -> Result<()>;
    async fn queue_depth(&self) -> Result<u32>;
}

/// AMQP-backed broker. Holds a single connection/channel pair guarded by a
/// lock; the reconnect path replaces both under write access.
pub struct AmqpBroker {
    amqp_url: String,
    queue_name: String,
    connection: RwLock<Option<(Connection, Channel)>>,
    circuit: Arc<CircuitBreaker>,
}

impl AmqpBroker {
    pub async fn connect(amqp_url: impl Into<String>, queue_name: impl Into<String>) -> Self {
        let broker = Self {
            amqp_url: amqp_url.into(),
            queue_name: queue_name.into(),
            connection: RwLock::new(None),
            circuit: Arc::new(CircuitBreaker::new(
                "broker",
                CircuitBreakerConfig::recovery(Duration::from_secs(30)),
            )),
        };
        if let Err(err) = broker.reconnect().await {
            warn!(%err, "initial broker connect failed; will retry via reconnect loop");
        }
        broker
    }

    /// The circuit breaker guarding published sends, exposed for health
    /// reporting.
    pub fn circuit_breaker(&self) -> Arc<CircuitBreaker> {
        self.circuit.clone()
    }

    async fn declare_queue(channel: &Channel, queue_name: &str) -> Result<()> {
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubstrateError::BrokerUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Opens a long-lived consumer, invoking `handler` once per delivery.
    /// Returns when the consumer stream ends (connection dropped); callers
    /// should loop this inside the reconnect task.
    pub async fn consume<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Delivery) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let channel = {
            let guard = self.connection.read().await;
            match guard.as_ref() {
                Some((_, ch)) => ch.clone(),
                None => return Err(SubstrateError::BrokerUnavailable("not connected".into())),
            }
        };

        Self::declare_queue(&channel, &self.queue_name).await?;

        let mut consumer = channel
            .basic_consume(
                &self.queue_name,
                "worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubstrateError::BrokerUnavailable(e.to_string()))?;

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(err) => {
                    warn!(%err, "consumer stream error, stopping");
                    break;
                }
            };
            let envelope: TaskEnvelope = match serde_json::from_slice(&delivery.data) {
                Ok(env) => env,
                Err(err) => {
                    warn!(%err, "dropping malformed envelope");
                    let _ = delivery
                        .ack(BasicAckOptions::default())
                        .await;
                    continue;
                }
            };
            handler(Delivery {
                envelope,
                channel: channel.clone(),
                delivery_tag: delivery.delivery_tag,
            })
            .await;
        }

        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn is_ready(&self) -> bool {
        let guard = self.connection.read().await;
        matches!(&*guard, Some((conn, ch)) if conn.status().connected() && ch.status().connected())
    }

    async fn reconnect(&self) -> Result<()> {
        let conn = Connection::connect(&self.amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| SubstrateError::BrokerUnavailable(e.to_string()))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| SubstrateError::BrokerUnavailable(e.to_string()))?;
        Self::declare_queue(&channel, &self.queue_name).await?;

        let mut guard = self.connection.write().await;
        *guard = Some((conn, channel));
        info!("broker reconnected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.write().await;
        if let Some((conn, channel)) = guard.take() {
            if let Err(err) = channel.close(200, "worker shutdown").await {
                warn!(%err, "error closing broker channel");
            }
            if let Err(err) = conn.close(200, "worker shutdown").await {
                warn!(%err, "error closing broker connection");
            }
        }
        info!("broker disconnected");
        Ok(())
    }

    async fn publish_task(&self, envelope: &TaskEnvelope) -> Result<()> {
        if !self.is_ready().await {
            self.reconnect().await?;
        }

        let payload = serde_json::to_vec(envelope)?;
        let queue_name = self.queue_name.clone();

        let result = self
            .circuit
            .call(|| async {
                let guard = self.connection.read().await;
                let (_, channel) = guard
                    .as_ref()
                    .ok_or_else(|| SubstrateError::BrokerUnavailable("not connected".into()))?;
                channel
                    .basic_publish(
                        "",
                        &queue_name,
                        BasicPublishOptions::default(),
                        &payload,
                        BasicProperties::default().with_delivery_mode(2),
                    )
                    .await
                    .map_err(|e| SubstrateError::BrokerUnavailable(e.to_string()))?
                    .await
                    .map_err(|e| SubstrateError::BrokerUnavailable(e.to_string()))?;
                Ok::<(), SubstrateError>(())
            })
            .await;

        match result {
            Some(inner) => inner,
            None => Err(SubstrateError::BrokerUnavailable(
                "broker circuit open".into(),
            )),
        }
    }

    async fn queue_depth(&self) -> Result<u32> {
        let guard = self.connection.read().await;
        let (_, channel) = guard
            .as_ref()
            .ok_or_else(|| SubstrateError::BrokerUnavailable("not connected".into()))?;
        let declared = channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubstrateError::BrokerUnavailable(e.to_string()))?;
        Ok(declared.message_count())
    }
}
