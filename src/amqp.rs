use crate::config::AckMode;
use crate::error::IngestError;
use crate::ingest::{InboundMessage, Settlement};
use anyhow::Result;
use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, BasicRejectOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use std::fmt::Display;
use std::future::Future;
use tokio::time::{sleep, Duration};

/// Calls `dial` until it succeeds, sleeping `delay` after every failure. There is no attempt cap.
pub async fn connect_with_retry<F, Fut, T, E>(target: &str, delay: Duration, mut dial: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match dial().await {
            Ok(connection) => {
                tracing::info!(target_addr = %target, attempt, "connected to broker");
                return connection;
            }
            Err(err) => {
                tracing::warn!(
                    target_addr = %target,
                    error = %err,
                    attempt,
                    retry_in_secs = delay.as_secs_f64(),
                    "broker unavailable; retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Dials the broker until it answers. `target` is only used for logging.
pub async fn connect(url: &str, target: &str, delay: Duration) -> Connection {
    connect_with_retry(target, delay, || {
        Connection::connect(url, ConnectionProperties::default())
    })
    .await
}

/// One channel on one connection, with the ingest queue declared.
pub struct BrokerSession {
    connection: Connection,
    channel: Channel,
    queue: String,
}

impl BrokerSession {
    pub async fn open(connection: Connection, queue: &str) -> Result<Self, IngestError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(IngestError::broker_setup("open a channel"))?;

        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(IngestError::broker_setup("declare the queue"))?;
        tracing::info!(
            queue = %queue,
            messages = declared.message_count(),
            consumers = declared.consumer_count(),
            "queue declared"
        );

        Ok(Self {
            connection,
            channel,
            queue: queue.to_string(),
        })
    }

    pub async fn subscribe(
        &self,
        consumer_tag: &str,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<Consumer, IngestError> {
        if ack_mode == AckMode::AfterWrite {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(IngestError::broker_setup("set the prefetch window"))?;
        }

        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: ack_mode == AckMode::Auto,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(IngestError::broker_setup("start consuming"))?;
        tracing::info!(queue = %self.queue, consumer_tag, %ack_mode, "subscribed to weather feed");
        Ok(consumer)
    }

    pub async fn close(self) {
        if let Err(err) = self.channel.close(200, "worker shutting down").await {
            tracing::debug!(error = %err, "failed to close broker channel");
        }
        if let Err(err) = self.connection.close(200, "worker shutting down").await {
            tracing::debug!(error = %err, "failed to close broker connection");
        }
    }
}

#[async_trait]
impl InboundMessage for Delivery {
    fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    async fn settle(&mut self, settlement: Settlement) -> Result<()> {
        match settlement {
            Settlement::Ack => self
                .acker
                .ack(BasicAckOptions::default())
                .await
                .map(|_| ())?,
            Settlement::Reject => self
                .acker
                .reject(BasicRejectOptions { requeue: false })
                .await
                .map(|_| ())?,
            Settlement::Requeue => self
                .acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
                .map(|_| ())?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::connect_with_retry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, Instant};

    #[tokio::test(start_paused = true)]
    async fn retries_with_fixed_delay_until_dial_succeeds() {
        let failures = 3;
        let delay = Duration::from_secs(5);
        let attempts = AtomicUsize::new(0);
        let started = Instant::now();

        let connection = connect_with_retry("broker:5672", delay, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= failures {
                    Err(format!("connection refused (attempt {attempt})"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), failures + 1);
        assert_eq!(connection, failures + 1);
        assert_eq!(started.elapsed(), delay * failures as u32);
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_does_not_sleep() {
        let started = Instant::now();
        let value =
            connect_with_retry("broker:5672", Duration::from_secs(5), || async { Ok::<_, String>(7) })
                .await;
        assert_eq!(value, 7);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
