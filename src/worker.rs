use crate::amqp::{self, BrokerSession};
use crate::config::Config;
use crate::error::IngestError;
use crate::ingest::{run_consumer, ConsumerExit, ConsumerOptions};
use crate::stats::{spawn_reporter, WorkerStats};
use crate::store::{connect_store, PgRecordSink, RecordSink};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Store first, fail fast; then the broker, retried forever; then consume until `shutdown`.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), IngestError> {
    let pool = connect_store(
        &config.database_url,
        config.db_pool_size,
        config.store_connect_timeout(),
    )
    .await?;
    tracing::info!(pool_size = config.db_pool_size, "connected to store");

    let sink = PgRecordSink::new(pool.clone());
    let stats = Arc::new(WorkerStats::new());
    let reporter = config
        .stats_interval()
        .map(|interval| spawn_reporter(stats.clone(), interval));

    let result = consume(&config, &sink, &stats, &shutdown).await;

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    stats.snapshot().log("weather worker stopped");
    pool.close().await;
    result
}

async fn consume<S>(
    config: &Config,
    sink: &S,
    stats: &WorkerStats,
    shutdown: &CancellationToken,
) -> Result<(), IngestError>
where
    S: RecordSink + ?Sized,
{
    let target = config.amqp_target();
    let options = ConsumerOptions {
        ack_mode: config.ack_mode,
        concurrency: config.concurrency,
        requeue_delay: config.retry_delay(),
    };

    reconnect_until_cancelled(&target, || {
        consume_session(config, &target, sink, stats, options, shutdown)
    })
    .await
}

/// Runs broker sessions back to back. A closed delivery stream starts a new session; only
/// cancellation or a fatal setup error ends the loop.
async fn reconnect_until_cancelled<F, Fut>(target: &str, mut session: F) -> Result<(), IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ConsumerExit, IngestError>>,
{
    loop {
        match session().await? {
            ConsumerExit::Cancelled => return Ok(()),
            ConsumerExit::StreamClosed => {
                tracing::warn!(target_addr = %target, "delivery stream closed; reconnecting to broker");
            }
        }
    }
}

async fn consume_session<S>(
    config: &Config,
    target: &str,
    sink: &S,
    stats: &WorkerStats,
    options: ConsumerOptions,
    shutdown: &CancellationToken,
) -> Result<ConsumerExit, IngestError>
where
    S: RecordSink + ?Sized,
{
    let connection = tokio::select! {
        connection = amqp::connect(&config.amqp_url, target, config.retry_delay()) => connection,
        _ = shutdown.cancelled() => {
            tracing::info!("shutdown requested before the broker came up");
            return Ok(ConsumerExit::Cancelled);
        }
    };

    let session = BrokerSession::open(connection, &config.queue_name).await?;
    let deliveries = session
        .subscribe(&config.consumer_tag, config.ack_mode, config.prefetch)
        .await?;
    stats.set_broker_connected(true);
    tracing::info!(
        queue = %config.queue_name,
        concurrency = config.concurrency,
        "worker started; waiting for messages"
    );

    let exit = run_consumer(deliveries, sink, stats, options, shutdown).await;
    stats.set_broker_connected(false);
    session.close().await;

    if exit == ConsumerExit::Cancelled {
        tracing::info!("shutdown signal received; consumer drained");
    }
    Ok(exit)
}
