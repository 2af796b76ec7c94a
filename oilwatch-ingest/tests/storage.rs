use jiff::{SignedDuration, Timestamp};
use oilwatch_core::{
    AlertConfig, DeviceId, DeviceState, LevelReading, LocationReading, LocationSource, ReadingId,
};
use oilwatch_ingest::storage::{DeviceStorage, HistoryQuery};
use oilwatch_ingest::storage::memory::MemoryStorage;
use oilwatch_ingest::storage::sqlite::{SqliteStorage, SqliteStorageError};
use tempfile::NamedTempFile;

fn location(id: &DeviceId, source: LocationSource, timestamp: Timestamp) -> LocationReading {
    LocationReading {
        id: ReadingId::generate(),
        device_id: id.clone(),
        longitude: 12.5,
        latitude: 55.1,
        source,
        timestamp,
    }
}

fn level(id: &DeviceId, value: f64, timestamp: Timestamp) -> LevelReading {
    LevelReading {
        id: ReadingId::generate(),
        device_id: id.clone(),
        level: value,
        distance: 100.0 - value,
        confidence: 0.9,
        timestamp,
    }
}

/// Only millisecond precision survives SQLite.
fn now_ms() -> Timestamp {
    Timestamp::from_millisecond(Timestamp::now().as_millisecond()).unwrap()
}

async fn device_lifecycle<S: DeviceStorage>(storage: &S) -> Result<(), S::Error> {
    let id = DeviceId::new("868488079671754");

    storage.create_device_if_absent(&id).await?;
    let record = storage.get_device(&id).await?.unwrap();
    assert_eq!(record.state, DeviceState::Offline);
    assert_eq!(record.alerts, AlertConfig::default());

    storage.set_state(&id, DeviceState::Online).await?;
    let alerts = AlertConfig {
        low_level_alert: 10.0,
        high_level_alert: 90.0,
        tank_height: 120.0,
    };
    storage.update_alert_config(&id, alerts).await?;

    // A second create leaves the existing record alone.
    storage.create_device_if_absent(&id).await?;
    let record = storage.get_device(&id).await?.unwrap();
    assert_eq!(record.state, DeviceState::Online);
    assert_eq!(record.alerts, alerts);

    let online = storage.list_online_devices().await?;
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].id, id);

    storage.set_state(&id, DeviceState::Offline).await?;
    assert!(storage.list_online_devices().await?.is_empty());
    Ok(())
}

async fn unknown_device_updates_are_ignored<S: DeviceStorage>(storage: &S) -> Result<(), S::Error> {
    let id = DeviceId::new("ghost");

    storage.set_state(&id, DeviceState::Online).await?;
    storage
        .update_alert_config(&id, AlertConfig::default())
        .await?;

    assert!(storage.get_device(&id).await?.is_none());
    assert!(storage.list_online_devices().await?.is_empty());
    Ok(())
}

async fn latest_reading_spans_both_kinds<S: DeviceStorage>(storage: &S) -> Result<(), S::Error> {
    let id = DeviceId::new("dev-1");
    let now = now_ms();

    assert_eq!(storage.latest_reading_timestamp(&id).await?, None);

    storage
        .save_level(level(&id, 40.0, now - SignedDuration::from_mins(10)))
        .await?;
    assert_eq!(
        storage.latest_reading_timestamp(&id).await?,
        Some(now - SignedDuration::from_mins(10))
    );

    storage
        .save_location(location(&id, LocationSource::Lbs, now - SignedDuration::from_mins(2)))
        .await?;
    // Written last but older than what is stored.
    storage
        .save_level(level(&id, 38.0, now - SignedDuration::from_mins(20)))
        .await?;

    assert_eq!(
        storage.latest_reading_timestamp(&id).await?,
        Some(now - SignedDuration::from_mins(2))
    );
    assert_eq!(storage.latest_level(&id).await?.unwrap().level, 40.0);

    let other = DeviceId::new("dev-2");
    assert_eq!(storage.latest_reading_timestamp(&other).await?, None);
    Ok(())
}

async fn gps_fix_preferred<S: DeviceStorage>(storage: &S) -> Result<(), S::Error> {
    let id = DeviceId::new("dev-1");
    let now = now_ms();

    storage
        .save_location(location(&id, LocationSource::Lbs, now - SignedDuration::from_mins(1)))
        .await?;
    assert_eq!(
        storage.latest_location(&id).await?.unwrap().source,
        LocationSource::Lbs
    );

    storage
        .save_location(location(&id, LocationSource::Gps, now - SignedDuration::from_mins(30)))
        .await?;
    storage
        .save_location(location(&id, LocationSource::Gps, now - SignedDuration::from_mins(5)))
        .await?;

    let latest = storage.latest_location(&id).await?.unwrap();
    assert_eq!(latest.source, LocationSource::Gps);
    assert_eq!(latest.timestamp, now - SignedDuration::from_mins(5));
    Ok(())
}

async fn level_history_window<S: DeviceStorage>(storage: &S) -> Result<(), S::Error> {
    let id = DeviceId::new("tank-1");
    let other = DeviceId::new("tank-2");
    let now = now_ms();

    // Stored out of order on purpose.
    for mins in [10, 40, 20, 50, 30] {
        storage
            .save_level(level(&id, mins as f64, now - SignedDuration::from_mins(mins)))
            .await?;
    }
    storage.save_level(level(&other, 99.0, now)).await?;

    let all = storage.level_history(&id, &HistoryQuery::default()).await?;
    let levels: Vec<_> = all.iter().map(|r| r.level).collect();
    assert_eq!(levels, vec![50.0, 40.0, 30.0, 20.0, 10.0]);

    // Bounds are inclusive.
    let window = HistoryQuery {
        limit: 10,
        start: Some(now - SignedDuration::from_mins(40)),
        end: Some(now - SignedDuration::from_mins(20)),
    };
    let levels: Vec<_> = storage
        .level_history(&id, &window)
        .await?
        .iter()
        .map(|r| r.level)
        .collect();
    assert_eq!(levels, vec![40.0, 30.0, 20.0]);

    let since = HistoryQuery {
        limit: 2,
        start: Some(now - SignedDuration::from_mins(30)),
        end: None,
    };
    let levels: Vec<_> = storage
        .level_history(&id, &since)
        .await?
        .iter()
        .map(|r| r.level)
        .collect();
    assert_eq!(levels, vec![30.0, 20.0]);

    let missing = DeviceId::new("tank-3");
    assert!(storage.level_history(&missing, &HistoryQuery::default()).await?.is_empty());
    Ok(())
}

async fn location_history_keeps_every_source<S: DeviceStorage>(
    storage: &S,
) -> Result<(), S::Error> {
    let id = DeviceId::new("truck-1");
    let now = now_ms();

    storage
        .save_location(location(&id, LocationSource::Gps, now - SignedDuration::from_mins(5)))
        .await?;
    storage
        .save_location(location(&id, LocationSource::Lbs, now - SignedDuration::from_mins(15)))
        .await?;
    storage
        .save_location(location(&id, LocationSource::Gps, now - SignedDuration::from_mins(25)))
        .await?;

    let window = HistoryQuery {
        limit: 10,
        start: None,
        end: Some(now - SignedDuration::from_mins(5)),
    };
    let sources: Vec<_> = storage
        .location_history(&id, &window)
        .await?
        .into_iter()
        .map(|r| r.source)
        .collect();
    assert_eq!(
        sources,
        vec![LocationSource::Gps, LocationSource::Lbs, LocationSource::Gps]
    );

    let newest_excluded = HistoryQuery {
        limit: 1,
        start: Some(now - SignedDuration::from_mins(20)),
        end: Some(now - SignedDuration::from_mins(6)),
    };
    let track = storage.location_history(&id, &newest_excluded).await?;
    assert_eq!(track.len(), 1);
    assert_eq!(track[0].source, LocationSource::Lbs);
    Ok(())
}

async fn list_devices_includes_offline<S: DeviceStorage>(storage: &S) -> Result<(), S::Error> {
    let b = DeviceId::new("b");
    let a = DeviceId::new("a");
    storage.create_device_if_absent(&b).await?;
    storage.create_device_if_absent(&a).await?;
    storage.set_state(&b, DeviceState::Online).await?;

    let devices = storage.list_devices().await?;
    let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(devices[0].state, DeviceState::Offline);
    assert_eq!(devices[1].state, DeviceState::Online);
    Ok(())
}

#[tokio::test]
async fn memory_level_history_window() -> Result<(), Box<dyn std::error::Error>> {
    level_history_window(&MemoryStorage::new()).await?;
    Ok(())
}

#[tokio::test]
async fn memory_location_history_keeps_every_source() -> Result<(), Box<dyn std::error::Error>> {
    location_history_keeps_every_source(&MemoryStorage::new()).await?;
    Ok(())
}

#[tokio::test]
async fn memory_list_devices_includes_offline() -> Result<(), Box<dyn std::error::Error>> {
    list_devices_includes_offline(&MemoryStorage::new()).await?;
    Ok(())
}

#[tokio::test]
async fn memory_device_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    device_lifecycle(&MemoryStorage::new()).await?;
    Ok(())
}

#[tokio::test]
async fn memory_unknown_device_updates_are_ignored() -> Result<(), Box<dyn std::error::Error>> {
    unknown_device_updates_are_ignored(&MemoryStorage::new()).await?;
    Ok(())
}

#[tokio::test]
async fn memory_latest_reading_spans_both_kinds() -> Result<(), Box<dyn std::error::Error>> {
    latest_reading_spans_both_kinds(&MemoryStorage::new()).await?;
    Ok(())
}

#[tokio::test]
async fn memory_gps_fix_preferred() -> Result<(), Box<dyn std::error::Error>> {
    gps_fix_preferred(&MemoryStorage::new()).await?;
    Ok(())
}

async fn sqlite() -> Result<(SqliteStorage, NamedTempFile), SqliteStorageError> {
    let file = NamedTempFile::new().map_err(|e| SqliteStorageError::Sqlx(e.into()))?;
    let storage = SqliteStorage::new(file.path()).await?;
    Ok((storage, file))
}

#[tokio::test]
async fn sqlite_device_lifecycle() -> Result<(), SqliteStorageError> {
    let (storage, _file) = sqlite().await?;
    device_lifecycle(&storage).await
}

#[tokio::test]
async fn sqlite_unknown_device_updates_are_ignored() -> Result<(), SqliteStorageError> {
    let (storage, _file) = sqlite().await?;
    unknown_device_updates_are_ignored(&storage).await
}

#[tokio::test]
async fn sqlite_latest_reading_spans_both_kinds() -> Result<(), SqliteStorageError> {
    let (storage, _file) = sqlite().await?;
    latest_reading_spans_both_kinds(&storage).await
}

#[tokio::test]
async fn sqlite_gps_fix_preferred() -> Result<(), SqliteStorageError> {
    let (storage, _file) = sqlite().await?;
    gps_fix_preferred(&storage).await
}

#[tokio::test]
async fn sqlite_level_history_window() -> Result<(), SqliteStorageError> {
    let (storage, _file) = sqlite().await?;
    level_history_window(&storage).await
}

#[tokio::test]
async fn sqlite_location_history_keeps_every_source() -> Result<(), SqliteStorageError> {
    let (storage, _file) = sqlite().await?;
    location_history_keeps_every_source(&storage).await
}

#[tokio::test]
async fn sqlite_list_devices_includes_offline() -> Result<(), SqliteStorageError> {
    let (storage, _file) = sqlite().await?;
    list_devices_includes_offline(&storage).await
}

#[tokio::test]
async fn sqlite_round_trips_reading_fields() -> Result<(), SqliteStorageError> {
    let (storage, _file) = sqlite().await?;
    let id = DeviceId::new("dev-9");
    let now = now_ms();

    let reading = location(&id, LocationSource::Other("wifi".into()), now);
    storage.save_location(reading.clone()).await?;
    assert_eq!(storage.latest_location(&id).await?, Some(reading));

    let reading = level(&id, 42.3, now);
    storage.save_level(reading.clone()).await?;
    assert_eq!(storage.latest_level(&id).await?, Some(reading));
    Ok(())
}

#[tokio::test]
async fn sqlite_data_survives_reopen() -> Result<(), SqliteStorageError> {
    let file = NamedTempFile::new().map_err(|e| SqliteStorageError::Sqlx(e.into()))?;
    let id = DeviceId::new("persistent");

    {
        let storage = SqliteStorage::new(file.path()).await?;
        storage.create_device_if_absent(&id).await?;
        storage.set_state(&id, DeviceState::Online).await?;
    }

    let storage = SqliteStorage::new(file.path()).await?;
    let record = storage.get_device(&id).await?.unwrap();
    assert_eq!(record.state, DeviceState::Online);
    Ok(())
}
