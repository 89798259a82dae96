use thiserror::Error;

/// Failures the ingest path distinguishes between.
///
/// Startup failures (`StoreUnreachable`, `BrokerSetup`) end the process; per-message failures
/// (`MalformedPayload`, `StoreWrite`) are logged and the message is dropped. Broker dial failures
/// never surface here: the connection manager retries them forever.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("store unreachable: {0}")]
    StoreUnreachable(#[source] sqlx::Error),

    #[error("broker setup failed while trying to {stage}: {source}")]
    BrokerSetup {
        stage: &'static str,
        #[source]
        source: lapin::Error,
    },

    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] simd_json::Error),

    #[error("store write failed: {0}")]
    StoreWrite(#[from] sqlx::Error),
}

impl IngestError {
    pub(crate) fn broker_setup(stage: &'static str) -> impl FnOnce(lapin::Error) -> Self {
        move |source| IngestError::BrokerSetup { stage, source }
    }
}
