
use crate::config::AckMode;
use crate::stats::WorkerStats;
use crate::store::RecordSink;
use crate::telemetry::decode_payload;
use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A delivered queue message, as far as the consumer loop cares.
#[async_trait]
pub trait InboundMessage: Send {
    fn body_mut(&mut self) -> &mut [u8];

    /// Only called when the subscription uses explicit acknowledgements.
    async fn settle(&mut self, settlement: Settlement) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject,
    Requeue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Persisted,
    Malformed,
    WriteFailed,
}

impl Outcome {
    pub fn settlement(self) -> Settlement {
        match self {
            Outcome::Persisted => Settlement::Ack,
            Outcome::Malformed => Settlement::Reject,
            Outcome::WriteFailed => Settlement::Requeue,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ConsumerOptions {
    pub ack_mode: AckMode,
    pub concurrency: usize,
    /// Pause before a failed write is requeued, so a store outage doesn't turn into a
    /// redelivery spin. The message keeps its in-flight slot while waiting.
    pub requeue_delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerExit {
    /// The shutdown token fired; in-flight messages were finished first.
    Cancelled,
    /// The broker closed the delivery stream.
    StreamClosed,
}

/// Decode then persist a single message. Errors stay inside the message.
pub async fn handle_message<M, S>(message: &mut M, sink: &S, stats: &WorkerStats) -> Outcome
where
    M: InboundMessage + ?Sized,
    S: RecordSink + ?Sized,
{
    stats.record_received();

    let record = match decode_payload(message.body_mut()) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(error = %err, "discarding undecodable weather message");
            stats.record_malformed(err.to_string());
            return Outcome::Malformed;
        }
    };

    match sink.insert(&record).await {
        Ok(()) => {
            stats.record_persisted();
            tracing::info!(
                latitude = %record.latitude,
                longitude = %record.longitude,
                timestamp = record.timestamp,
                "saved: {}",
                record.summary()
            );
            Outcome::Persisted
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to persist weather record; dropping it");
            stats.record_write_failure(err.to_string());
            Outcome::WriteFailed
        }
    }
}

/// Drains `deliveries` until the stream ends or `shutdown` fires, with at most
/// `options.concurrency` messages in flight.
pub async fn run_consumer<St, M, E, S>(
    deliveries: St,
    sink: &S,
    stats: &WorkerStats,
    options: ConsumerOptions,
    shutdown: &CancellationToken,
) -> ConsumerExit
where
    St: Stream<Item = Result<M, E>>,
    M: InboundMessage,
    E: Display,
    S: RecordSink + ?Sized,
{
    deliveries
        .take_until(shutdown.cancelled())
        .for_each_concurrent(options.concurrency.max(1), |delivery| async move {
            let mut message = match delivery {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(error = %err, "broker delivery failed");
                    stats.record_delivery_error(err.to_string());
                    return;
                }
            };

            let outcome = handle_message(&mut message, sink, stats).await;
            if options.ack_mode == AckMode::AfterWrite {
                let settlement = outcome.settlement();
                if settlement == Settlement::Requeue && !options.requeue_delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(options.requeue_delay) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
                if let Err(err) = message.settle(settlement).await {
                    tracing::warn!(error = %err, ?settlement, "failed to settle message");
                    stats.record_settle_failure(err.to_string());
                }
            }
        })
        .await;

    if shutdown.is_cancelled() {
        ConsumerExit::Cancelled
    } else {
        ConsumerExit::StreamClosed
    }
}
