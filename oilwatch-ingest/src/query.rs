//! Read-side views over stored devices and readings.

use jiff::Timestamp;
use oilwatch_core::{AlertConfig, DeviceId, DeviceRecord, DeviceState, LocationReading};
use serde::Serialize;

use crate::storage::{DeviceStorage, HistoryQuery};

/// A device with its latest level and preferred position fix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub device_id: DeviceId,
    pub state: DeviceState,
    pub alerts: AlertConfig,
    pub level: Option<f64>,
    pub remaining_percent: Option<f64>,
    pub confidence: Option<f64>,
    pub location: Option<LocationReading>,
    /// Time of the latest level reading, or of the last record change when
    /// the device has never reported a level.
    pub last_update: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub level: f64,
    pub remaining_percent: Option<f64>,
    pub confidence: f64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHistory {
    pub device_id: DeviceId,
    pub alerts: AlertConfig,
    pub location: Option<LocationReading>,
    pub history: Vec<HistoryPoint>,
    /// Position fixes inside the same window.
    pub track: Vec<LocationReading>,
}

async fn summarize<S: DeviceStorage>(
    storage: &S,
    record: DeviceRecord,
) -> Result<DeviceSummary, S::Error> {
    let level = storage.latest_level(&record.id).await?;
    let location = storage.latest_location(&record.id).await?;

    Ok(DeviceSummary {
        level: level.as_ref().map(|l| l.level),
        remaining_percent: level
            .as_ref()
            .and_then(|l| record.remaining_percent(l.level)),
        confidence: level.as_ref().map(|l| l.confidence),
        last_update: level.map_or(record.updated_at, |l| l.timestamp),
        location,
        device_id: record.id,
        state: record.state,
        alerts: record.alerts,
    })
}

pub async fn device_summaries<S: DeviceStorage>(
    storage: &S,
) -> Result<Vec<DeviceSummary>, S::Error> {
    let mut summaries = Vec::new();
    for record in storage.list_devices().await? {
        summaries.push(summarize(storage, record).await?);
    }
    Ok(summaries)
}

/// `None` when the device is unknown.
pub async fn device_history<S: DeviceStorage>(
    storage: &S,
    id: &DeviceId,
    query: &HistoryQuery,
) -> Result<Option<DeviceHistory>, S::Error> {
    let Some(record) = storage.get_device(id).await? else {
        return Ok(None);
    };

    let history = storage
        .level_history(id, query)
        .await?
        .into_iter()
        .map(|reading| HistoryPoint {
            level: reading.level,
            remaining_percent: record.remaining_percent(reading.level),
            confidence: reading.confidence,
            timestamp: reading.timestamp,
        })
        .collect();

    Ok(Some(DeviceHistory {
        location: storage.latest_location(id).await?,
        track: storage.location_history(id, query).await?,
        device_id: record.id,
        alerts: record.alerts,
        history,
    }))
}
