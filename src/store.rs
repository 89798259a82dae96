use crate::error::IngestError;
use crate::telemetry::WeatherRecord;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub const WEATHER_TABLE: &str = "weather";

/// Where decoded records end up. One call, one independent write.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn insert(&self, record: &WeatherRecord) -> Result<(), IngestError>;
}

/// Opens the pool and pings it. Both steps share `timeout`; the store is required, so any failure
/// is `StoreUnreachable`.
pub async fn connect_store(
    database_url: &str,
    max_connections: u32,
    timeout: Duration,
) -> Result<PgPool, IngestError> {
    let connect = async {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok::<_, sqlx::Error>(pool)
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(pool)) => Ok(pool),
        Ok(Err(err)) => Err(IngestError::StoreUnreachable(err)),
        Err(_) => Err(IngestError::StoreUnreachable(sqlx::Error::PoolTimedOut)),
    }
}

#[derive(Clone)]
pub struct PgRecordSink {
    pool: PgPool,
    insert_sql: String,
}

impl PgRecordSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            insert_sql: format!(
                r#"INSERT INTO {WEATHER_TABLE} (temperature, windspeed, latitude, longitude, "timestamp") VALUES ($1, $2, $3, $4, $5)"#
            ),
        }
    }
}

#[async_trait]
impl RecordSink for PgRecordSink {
    async fn insert(&self, record: &WeatherRecord) -> Result<(), IngestError> {
        sqlx::query(&self.insert_sql)
            .bind(record.temperature)
            .bind(record.windspeed)
            .bind(&record.latitude)
            .bind(&record.longitude)
            .bind(record.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
