use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use oilwatch_core::{
    AlertConfig, DeviceId, DeviceRecord, DeviceState, LevelReading, LocationReading,
    LocationSource, ReadingId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Error as SqlxError, Row, SqlitePool};
use thiserror::Error;
use ulid::Ulid;

use crate::storage::{DeviceStorage, HistoryQuery};

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

#[derive(Debug, Error)]
pub enum SqliteStorageError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] SqlxError),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid ulid: {0}")]
    InvalidUlid(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("invalid device state: {0}")]
    InvalidState(String),
    #[error("invalid location source")]
    InvalidSource,
}

impl SqliteStorage {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, SqliteStorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        // enable WAL for better concurrency
        sqlx::query("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .execute(&pool)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteStorageError> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }
}

fn timestamp_from_ms(ms: i64) -> Result<jiff::Timestamp, SqliteStorageError> {
    jiff::Timestamp::from_millisecond(ms).map_err(|_| SqliteStorageError::InvalidTimestamp(ms))
}

fn reading_id(raw: &str) -> Result<ReadingId, SqliteStorageError> {
    Ulid::from_str(raw)
        .map(ReadingId)
        .map_err(|_| SqliteStorageError::InvalidUlid(raw.to_string()))
}

fn device_from_row(row: &SqliteRow) -> Result<DeviceRecord, SqliteStorageError> {
    let state: String = row.try_get("state")?;
    let state = DeviceState::parse(&state).ok_or(SqliteStorageError::InvalidState(state))?;

    Ok(DeviceRecord {
        id: DeviceId::new(row.try_get::<String, _>("device_id")?),
        state,
        alerts: AlertConfig {
            low_level_alert: row.try_get("low_level_alert")?,
            high_level_alert: row.try_get("high_level_alert")?,
            tank_height: row.try_get("tank_height")?,
        },
        created_at: timestamp_from_ms(row.try_get("created_at")?)?,
        updated_at: timestamp_from_ms(row.try_get("updated_at")?)?,
    })
}

fn location_from_row(row: &SqliteRow) -> Result<LocationReading, SqliteStorageError> {
    let source: String = row.try_get("source")?;

    Ok(LocationReading {
        id: reading_id(&row.try_get::<String, _>("id")?)?,
        device_id: DeviceId::new(row.try_get::<String, _>("device_id")?),
        longitude: row.try_get("longitude")?,
        latitude: row.try_get("latitude")?,
        source: LocationSource::parse(&source).ok_or(SqliteStorageError::InvalidSource)?,
        timestamp: timestamp_from_ms(row.try_get("timestamp_ms")?)?,
    })
}

fn level_from_row(row: &SqliteRow) -> Result<LevelReading, SqliteStorageError> {
    Ok(LevelReading {
        id: reading_id(&row.try_get::<String, _>("id")?)?,
        device_id: DeviceId::new(row.try_get::<String, _>("device_id")?),
        level: row.try_get("level")?,
        distance: row.try_get("distance")?,
        confidence: row.try_get("confidence")?,
        timestamp: timestamp_from_ms(row.try_get("timestamp_ms")?)?,
    })
}

#[async_trait]
impl DeviceStorage for SqliteStorage {
    type Error = SqliteStorageError;

    async fn create_device_if_absent(&self, id: &DeviceId) -> Result<(), Self::Error> {
        let now = jiff::Timestamp::now().as_millisecond();

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO devices (device_id, state, created_at, updated_at)
            VALUES (?, 'offline', ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_state(&self, id: &DeviceId, state: DeviceState) -> Result<(), Self::Error> {
        sqlx::query("UPDATE devices SET state = ?, updated_at = ? WHERE device_id = ?")
            .bind(state.as_str())
            .bind(jiff::Timestamp::now().as_millisecond())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn save_location(&self, reading: LocationReading) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO locations (id, device_id, longitude, latitude, source, timestamp_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(reading.id.0.to_string())
        .bind(reading.device_id.as_str())
        .bind(reading.longitude)
        .bind(reading.latitude)
        .bind(reading.source.as_str())
        .bind(reading.timestamp.as_millisecond())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_level(&self, reading: LevelReading) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO level_readings (id, device_id, level, distance, confidence, timestamp_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(reading.id.0.to_string())
        .bind(reading.device_id.as_str())
        .bind(reading.level)
        .bind(reading.distance)
        .bind(reading.confidence)
        .bind(reading.timestamp.as_millisecond())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_alert_config(
        &self,
        id: &DeviceId,
        config: AlertConfig,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            UPDATE devices
            SET low_level_alert = ?, high_level_alert = ?, tank_height = ?, updated_at = ?
            WHERE device_id = ?
            "#,
        )
        .bind(config.low_level_alert)
        .bind(config.high_level_alert)
        .bind(config.tank_height)
        .bind(jiff::Timestamp::now().as_millisecond())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_online_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error> {
        let rows = sqlx::query("SELECT * FROM devices WHERE state = 'online'")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(device_from_row).collect()
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error> {
        let rows = sqlx::query("SELECT * FROM devices ORDER BY device_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(device_from_row).collect()
    }

    async fn latest_reading_timestamp(
        &self,
        id: &DeviceId,
    ) -> Result<Option<jiff::Timestamp>, Self::Error> {
        let latest: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(ts) FROM (
                SELECT MAX(timestamp_ms) AS ts FROM locations WHERE device_id = ?
                UNION ALL
                SELECT MAX(timestamp_ms) AS ts FROM level_readings WHERE device_id = ?
            )
            "#,
        )
        .bind(id.as_str())
        .bind(id.as_str())
        .fetch_one(&self.pool)
        .await?;

        latest.map(timestamp_from_ms).transpose()
    }

    async fn get_device(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, Self::Error> {
        let row = sqlx::query("SELECT * FROM devices WHERE device_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(device_from_row).transpose()
    }

    async fn latest_location(
        &self,
        id: &DeviceId,
    ) -> Result<Option<LocationReading>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT * FROM locations
            WHERE device_id = ?
            ORDER BY (source = 'gps') DESC, timestamp_ms DESC
            LIMIT 1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(location_from_row).transpose()
    }

    async fn latest_level(&self, id: &DeviceId) -> Result<Option<LevelReading>, Self::Error> {
        let row = sqlx::query(
            "SELECT * FROM level_readings WHERE device_id = ? ORDER BY timestamp_ms DESC LIMIT 1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(level_from_row).transpose()
    }

    async fn level_history(
        &self,
        id: &DeviceId,
        query: &HistoryQuery,
    ) -> Result<Vec<LevelReading>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM level_readings
            WHERE device_id = ? AND timestamp_ms >= ? AND timestamp_ms <= ?
            ORDER BY timestamp_ms ASC
            LIMIT ?
            "#,
        )
        .bind(id.as_str())
        .bind(query.start.map_or(i64::MIN, |ts| ts.as_millisecond()))
        .bind(query.end.map_or(i64::MAX, |ts| ts.as_millisecond()))
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(level_from_row).collect()
    }

    async fn location_history(
        &self,
        id: &DeviceId,
        query: &HistoryQuery,
    ) -> Result<Vec<LocationReading>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM locations
            WHERE device_id = ? AND timestamp_ms >= ? AND timestamp_ms <= ?
            ORDER BY timestamp_ms ASC
            LIMIT ?
            "#,
        )
        .bind(id.as_str())
        .bind(query.start.map_or(i64::MIN, |ts| ts.as_millisecond()))
        .bind(query.end.map_or(i64::MAX, |ts| ts.as_millisecond()))
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(location_from_row).collect()
    }
}
