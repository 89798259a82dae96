mod amqp;
mod config;
mod error;
mod ingest;
mod stats;
mod store;
mod telemetry;
mod worker;

use crate::config::Config;
use anyhow::Result;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,weather_worker=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);
    let otel_layer = match config.otlp_endpoint.as_deref().and_then(otlp_traces_url) {
        Some(url) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(url)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

fn otlp_tracer(traces_url: String) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as TraceConfig, Resource};

    let resource = Resource::new(vec![KeyValue::new("service.name", "weather-worker")]);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http().with_endpoint(traces_url))
        .with_trace_config(TraceConfig::default().with_resource(resource))
        .install_batch(Tokio)?;
    Ok(tracer)
}

/// OTLP/HTTP wants the full traces path; collectors are usually configured by base URL.
fn otlp_traces_url(endpoint: &str) -> Option<String> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        None
    } else if endpoint.ends_with("/v1/traces") {
        Some(endpoint.to_string())
    } else {
        Some(format!("{endpoint}/v1/traces"))
    }
}

/// Resolves on SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = term.recv() => tracing::info!("received SIGTERM"),
        _ = int.recv() => tracing::info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    tracing::info!(?config, "starting weather worker");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = wait_for_signal().await {
            tracing::error!(error = %err, "failed to install signal handlers");
            return;
        }
        signal_token.cancel();
    });

    if let Err(err) = worker::run(config, shutdown).await {
        tracing::error!(error = %err, "weather worker exited");
        opentelemetry::global::shutdown_tracer_provider();
        return Err(err.into());
    }

    opentelemetry::global::shutdown_tracer_provider();
    Ok(())
}
