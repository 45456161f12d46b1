//! Broker access for both run loops.
//!
//! [`BrokerConnection`] owns one logical connection and channel, retries the
//! initial connect with a constant delay and reconnects lazily whenever the
//! channel is found closed. Loops talk to it through [`MessageBroker`], which
//! lets tests substitute an in-memory broker.

pub mod redis;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// How long one blocking receive waits before the consume loop re-checks shutdown.
pub const CONSUME_WAIT: Duration = Duration::from_secs(1);

/// Pause after a failed delivery or receive before taking the next one.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Opaque handle for one unacknowledged delivery.
#[derive(Clone, PartialEq, Eq)]
pub struct DeliveryTag {
    queue: String,
    raw: Vec<u8>,
}

impl DeliveryTag {
    pub fn new(queue: impl Into<String>, raw: Vec<u8>) -> Self {
        Self {
            queue: queue.into(),
            raw,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

impl fmt::Debug for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryTag")
            .field("queue", &self.queue)
            .field("len", &self.raw.len())
            .finish()
    }
}

/// A message handed to a consumer, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
}

/// Queue operations used by the pipeline and the feedback loop.
#[async_trait]
pub trait MessageBroker: Send {
    /// Publish once on the current channel. No internal retry.
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Take one message if one is waiting, without blocking.
    async fn poll_once(&mut self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Wait up to `wait` for the next message.
    async fn next_delivery(
        &mut self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Remove a delivery from the broker for good.
    async fn ack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Return a delivery to its queue for redelivery.
    async fn nack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Move a delivery that can never succeed to the queue's dead-letter list.
    async fn reject(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Requeue deliveries this consumer took but never settled. Returns how many.
    async fn recover(&mut self, queue: &str) -> Result<usize, BrokerError>;
}

/// An open channel to the broker.
pub trait Channel: MessageBroker {
    fn is_open(&self) -> bool;
}

/// Opens channels. Holds whatever parameters the last connect used.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Channel: Channel + 'static;

    async fn open(&self) -> Result<Self::Channel, BrokerError>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

/// Bounded connection retry: `max_retries` attempts separated by a constant delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    retry_delay: Duration,
}

impl RetryPolicy {
    /// `max_retries` below one still makes a single attempt.
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Connection manager owned by a single run loop.
pub struct BrokerConnection<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    channel: Option<C::Channel>,
    retry_count: u32,
}

impl<C: Connector> BrokerConnection<C> {
    /// Connect with retries. Failing here is fatal for the caller; nothing is left open.
    pub async fn connect(connector: C, policy: RetryPolicy) -> Result<Self, BrokerError> {
        let mut connection = Self {
            connector,
            policy,
            channel: None,
            retry_count: 0,
        };
        connection.reconnect().await?;
        Ok(connection)
    }

    pub fn is_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    /// Failed attempts made by the most recent connect.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// The cached channel if it is still open, otherwise a fresh one from the
    /// last-used parameters.
    pub async fn get_or_reconnect(&mut self) -> Result<&mut C::Channel, BrokerError> {
        if !self.is_open() {
            tracing::info!(
                target_broker = %self.connector.describe(),
                "Broker channel missing or closed, establishing a new connection"
            );
            self.reconnect().await?;
        }
        self.channel.as_mut().ok_or(BrokerError::Closed)
    }

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        self.channel = None;
        let attempts = self.policy.max_retries;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            tracing::info!(
                target_broker = %self.connector.describe(),
                attempt,
                max_retries = attempts,
                "Attempting to connect to broker"
            );
            match self.connector.open().await {
                Ok(channel) => {
                    self.retry_count = attempt - 1;
                    self.channel = Some(channel);
                    tracing::info!(attempt, "Connected to broker");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        tracing::warn!(
                            error = %e,
                            retry_in_secs = self.policy.retry_delay.as_secs_f64(),
                            "Broker connection failed, retrying"
                        );
                        sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        self.retry_count = attempts;
        tracing::error!(
            attempts,
            error = %last_error,
            "Failed to connect to broker after all retries"
        );
        Err(BrokerError::Connection {
            attempts,
            last_error,
        })
    }

    /// Drop the channel after a connection-class failure so the next call reconnects.
    fn observe<T>(&mut self, result: Result<T, BrokerError>) -> Result<T, BrokerError> {
        if let Err(e) = &result {
            if e.is_connection_lost() {
                tracing::warn!(error = %e, "Broker connection lost");
                self.channel = None;
            }
        }
        result
    }
}

#[async_trait]
impl<C: Connector> MessageBroker for BrokerConnection<C> {
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let result = self.get_or_reconnect().await?.publish(queue, payload).await;
        self.observe(result)
    }

    async fn poll_once(&mut self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let result = self.get_or_reconnect().await?.poll_once(queue).await;
        self.observe(result)
    }

    async fn next_delivery(
        &mut self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let result = self
            .get_or_reconnect()
            .await?
            .next_delivery(queue, wait)
            .await;
        self.observe(result)
    }

    async fn ack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let result = self.get_or_reconnect().await?.ack(tag).await;
        self.observe(result)
    }

    async fn nack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let result = self.get_or_reconnect().await?.nack(tag).await;
        self.observe(result)
    }

    async fn reject(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let result = self.get_or_reconnect().await?.reject(tag).await;
        self.observe(result)
    }

    async fn recover(&mut self, queue: &str) -> Result<usize, BrokerError> {
        let result = self.get_or_reconnect().await?.recover(queue).await;
        self.observe(result)
    }
}

/// Push-style consumer callback. Handlers settle each delivery themselves.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    type Error: fmt::Display + Send;

    async fn handle(
        &self,
        broker: &mut dyn MessageBroker,
        delivery: Delivery,
    ) -> Result<(), Self::Error>;
}

/// Run loop: hand each delivery from `queue` to `handler`, one at a time.
///
/// Returns `Ok` once `shutdown` is cancelled, or the connection error once
/// reconnecting has exhausted its retries. Handler failures never end the loop.
pub async fn consume<H: DeliveryHandler>(
    broker: &mut dyn MessageBroker,
    queue: &str,
    handler: &H,
    shutdown: &CancellationToken,
) -> Result<(), BrokerError> {
    tracing::info!(queue, "Waiting for messages");

    loop {
        if shutdown.is_cancelled() {
            tracing::info!(queue, "Consumer shutting down");
            return Ok(());
        }

        let delivery = match broker.next_delivery(queue, CONSUME_WAIT).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e @ BrokerError::Connection { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(queue, error = %e, "Failed to receive delivery, will retry");
                pause(shutdown, ERROR_BACKOFF).await;
                continue;
            }
        };

        if let Err(e) = handler.handle(broker, delivery).await {
            tracing::error!(queue, error = %e, "Delivery failed, left for redelivery");
            pause(shutdown, ERROR_BACKOFF).await;
        }
    }
}

/// Sleep for `duration` unless shutdown arrives first. Returns true when cancelled.
pub async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unreachable after {attempts} attempts: {last_error}")]
    Connection { attempts: u32, last_error: String },

    #[error("Broker connection lost: {0}")]
    Disconnected(String),

    #[error("Broker channel is closed")]
    Closed,

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl BrokerError {
    /// True when the channel can no longer be used and must be replaced.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BrokerError::Disconnected(_) | BrokerError::Closed)
    }
}
