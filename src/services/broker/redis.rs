//! Redis lists as a reliable queue.
//!
//! A delivery is moved atomically from the queue into this consumer's
//! processing list and stays there until it is acked (removed), nacked
//! (moved back to the queue) or rejected (moved to the dead-letter list).

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use std::time::Duration;

use super::{BrokerConnection, BrokerError, Channel, Connector, Delivery, DeliveryTag, MessageBroker, RetryPolicy};

/// Moves one entry between lists, only if it was still present in the source.
const MOVE_ENTRY: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed > 0 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
end
return removed
"#;

pub fn processing_key(queue: &str, consumer_id: &str) -> String {
    format!("{queue}:processing:{consumer_id}")
}

pub fn dead_letter_key(queue: &str) -> String {
    format!("{queue}:dead")
}

/// Connect to the broker at `host:port`, retrying per `policy`.
pub async fn connect(
    host: &str,
    port: u16,
    consumer_id: &str,
    policy: RetryPolicy,
) -> Result<BrokerConnection<RedisConnector>, BrokerError> {
    let connector = RedisConnector::new(host, port, consumer_id)?;
    BrokerConnection::connect(connector, policy).await
}

#[derive(Clone)]
pub struct RedisConnector {
    client: redis::Client,
    address: String,
    consumer_id: String,
}

impl RedisConnector {
    pub fn new(host: &str, port: u16, consumer_id: &str) -> Result<Self, BrokerError> {
        let address = format!("redis://{host}:{port}/");
        let client = redis::Client::open(address.as_str())?;
        Ok(Self {
            client,
            address,
            consumer_id: consumer_id.to_string(),
        })
    }

    /// Check broker connectivity on a short-lived connection (for health checks).
    pub async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Channel = RedisChannel;

    async fn open(&self) -> Result<RedisChannel, BrokerError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(classify)?;

        Ok(RedisChannel {
            conn,
            consumer_id: self.consumer_id.clone(),
            move_entry: Script::new(MOVE_ENTRY),
            open: true,
        })
    }

    fn describe(&self) -> String {
        self.address.clone()
    }
}

pub struct RedisChannel {
    conn: MultiplexedConnection,
    consumer_id: String,
    move_entry: Script,
    open: bool,
}

impl RedisChannel {
    fn processing_key(&self, queue: &str) -> String {
        processing_key(queue, &self.consumer_id)
    }

    fn settle<T>(&mut self, result: RedisResult<T>) -> Result<T, BrokerError> {
        result.map_err(|e| {
            let e = classify(e);
            if e.is_connection_lost() {
                self.open = false;
            }
            e
        })
    }

    fn delivery(queue: &str, payload: Option<Vec<u8>>) -> Option<Delivery> {
        payload.map(|payload| Delivery {
            tag: DeliveryTag::new(queue, payload.clone()),
            payload,
        })
    }

    async fn move_from_processing(
        &mut self,
        tag: &DeliveryTag,
        destination: &str,
    ) -> Result<bool, BrokerError> {
        let processing = self.processing_key(tag.queue());
        let result: RedisResult<i64> = self
            .move_entry
            .key(&processing)
            .key(destination)
            .arg(tag.raw())
            .invoke_async(&mut self.conn)
            .await;
        Ok(self.settle(result)? > 0)
    }
}

#[async_trait]
impl MessageBroker for RedisChannel {
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let result = self.conn.lpush::<_, _, ()>(queue, payload).await;
        self.settle(result)?;
        tracing::debug!(queue, bytes = payload.len(), "Published message");
        Ok(())
    }

    async fn poll_once(&mut self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let processing = self.processing_key(queue);
        let result: RedisResult<Option<Vec<u8>>> = self.conn.rpoplpush(queue, &processing).await;
        Ok(Self::delivery(queue, self.settle(result)?))
    }

    async fn next_delivery(
        &mut self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let processing = self.processing_key(queue);
        let result: RedisResult<Option<Vec<u8>>> = self
            .conn
            .brpoplpush(queue, &processing, wait.as_secs_f64())
            .await;
        Ok(Self::delivery(queue, self.settle(result)?))
    }

    async fn ack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let processing = self.processing_key(tag.queue());
        let result: RedisResult<i64> = self.conn.lrem(&processing, 1, tag.raw()).await;
        if self.settle(result)? == 0 {
            tracing::warn!(queue = tag.queue(), "Acked delivery was no longer in flight");
        }
        Ok(())
    }

    async fn nack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let queue = tag.queue().to_string();
        if !self.move_from_processing(tag, &queue).await? {
            tracing::warn!(queue = %queue, "Nacked delivery was no longer in flight");
        }
        Ok(())
    }

    async fn reject(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let dead = dead_letter_key(tag.queue());
        if self.move_from_processing(tag, &dead).await? {
            tracing::warn!(queue = tag.queue(), dead_letter = %dead, "Delivery dead-lettered");
        }
        Ok(())
    }

    async fn recover(&mut self, queue: &str) -> Result<usize, BrokerError> {
        let processing = self.processing_key(queue);
        let mut recovered = 0;
        loop {
            let result: RedisResult<Option<Vec<u8>>> =
                self.conn.rpoplpush(&processing, queue).await;
            match self.settle(result)? {
                Some(_) => recovered += 1,
                None => break,
            }
        }
        if recovered > 0 {
            tracing::info!(queue, recovered, "Requeued unsettled deliveries");
        }
        Ok(recovered)
    }
}

impl Channel for RedisChannel {
    fn is_open(&self) -> bool {
        self.open
    }
}

fn classify(e: RedisError) -> BrokerError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        BrokerError::Disconnected(e.to_string())
    } else {
        BrokerError::Redis(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(processing_key("api-to-inf", "worker-1"), "api-to-inf:processing:worker-1");
        assert_eq!(dead_letter_key("api-to-inf"), "api-to-inf:dead");
    }

    #[test]
    fn test_connection_errors_mark_disconnect() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(classify(RedisError::from(io)).is_connection_lost());

        let protocol = RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        assert!(!classify(protocol).is_connection_lost());
    }

    #[test]
    fn test_connector_describes_address() {
        let connector = RedisConnector::new("broker", 6379, "worker").unwrap();
        assert_eq!(connector.describe(), "redis://broker:6379/");
    }
}
